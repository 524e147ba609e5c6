//! SOCKS5 CONNECT client (RFC 1928, no-authentication only)

use super::io::{recv_exact, send_all};
use crate::config::Timeouts;
use crate::error::Socks5Error;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::time::Instant;
use tracing::debug;

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const RESERVED: u8 = 0x00;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;

/// Progress through one handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    Init,
    AuthSent,
    AuthAckReceived,
    ConnectRequestSent,
    ReplyHeaderReceived,
    BoundAddressConsumed,
    Done,
    Failed,
}

/// One SOCKS5 negotiation over an already-connected stream
pub struct Socks5Handshake<'a, S: Read + Write + ?Sized> {
    stream: &'a mut S,
    timeouts: &'a Timeouts,
    state: Socks5State,
}

impl<'a, S: Read + Write + ?Sized> Socks5Handshake<'a, S> {
    pub fn new(stream: &'a mut S, timeouts: &'a Timeouts) -> Self {
        Self {
            stream,
            timeouts,
            state: Socks5State::Init,
        }
    }

    pub fn state(&self) -> Socks5State {
        self.state
    }

    fn advance(&mut self, next: Socks5State) {
        debug!("SOCKS5 {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Socks5Error> {
        let deadline = Instant::now() + self.timeouts.send;
        send_all(&mut *self.stream, bytes, deadline).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => Socks5Error::Timeout,
            _ => Socks5Error::Send(e),
        })
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<(), Socks5Error> {
        let deadline = Instant::now() + self.timeouts.recv;
        // Short reads and timeouts are indistinguishable to the caller
        recv_exact(&mut *self.stream, buf, deadline).map_err(|_| Socks5Error::Timeout)
    }

    /// Run the negotiation to completion
    pub fn run(&mut self, host: &str, port: u16) -> Result<(), Socks5Error> {
        let result = self.negotiate(host, port);
        match &result {
            Ok(()) => self.advance(Socks5State::Done),
            Err(_) => self.advance(Socks5State::Failed),
        }
        result
    }

    fn negotiate(&mut self, host: &str, port: u16) -> Result<(), Socks5Error> {
        // Build the request up front so an oversized name fails before any I/O
        let request = encode_connect_request(host, port)?;

        self.send(&[VERSION, 0x01, AUTH_NONE])?;
        self.advance(Socks5State::AuthSent);

        let mut auth_reply = [0u8; 2];
        self.recv(&mut auth_reply)?;
        if auth_reply != [VERSION, AUTH_NONE] {
            return Err(Socks5Error::UnsupportedAuth);
        }
        self.advance(Socks5State::AuthAckReceived);

        self.send(&request)?;
        self.advance(Socks5State::ConnectRequestSent);

        let mut header = [0u8; 4];
        self.recv(&mut header)?;
        self.advance(Socks5State::ReplyHeaderReceived);

        let [version, reply, _, atyp] = header;
        if version != VERSION {
            return Err(Socks5Error::BadVersion(version));
        }
        if reply != REPLY_SUCCESS {
            return Err(Socks5Error::from_reply(reply));
        }

        // Bound address and port are discarded; reading them keeps the stream framed
        let addr_len = match atyp {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                self.recv(&mut len)?;
                usize::from(len[0])
            }
            other => return Err(Socks5Error::BadAddressType(other)),
        };
        let mut bound = vec![0u8; addr_len + 2];
        self.recv(&mut bound)?;
        self.advance(Socks5State::BoundAddressConsumed);

        Ok(())
    }
}

/// Encode the CONNECT request, choosing the address type from the host text
pub fn encode_connect_request(host: &str, port: u16) -> Result<Vec<u8>, Socks5Error> {
    let mut request = vec![VERSION, CMD_CONNECT, RESERVED];

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| Socks5Error::DomainTooLong(host.len()))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }

    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::io::testing::ScriptedStream;
    use std::time::Duration;

    fn timeouts() -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(200),
            send: Duration::from_millis(200),
            recv: Duration::from_millis(200),
        }
    }

    fn run(reply: &[u8], host: &str, port: u16) -> (Result<(), Socks5Error>, Socks5State, Vec<u8>) {
        let mut stream = ScriptedStream::new(reply);
        let t = timeouts();
        let mut hs = Socks5Handshake::new(&mut stream, &t);
        let result = hs.run(host, port);
        let state = hs.state();
        (result, state, stream.written)
    }

    #[test]
    fn test_domain_request_encoding() {
        let req = encode_connect_request("example.com", 443).unwrap();
        let mut expected = vec![5, 1, 0, 3, 11];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x01, 0xBB]);
        assert_eq!(req, expected);
    }

    #[test]
    fn test_literal_request_encoding() {
        let v4 = encode_connect_request("1.2.3.4", 80).unwrap();
        assert_eq!(v4, vec![5, 1, 0, 1, 1, 2, 3, 4, 0, 80]);

        let v6 = encode_connect_request("2001:db8::1", 8080).unwrap();
        assert_eq!(v6[3], ATYP_IPV6);
        assert_eq!(v6.len(), 4 + 16 + 2);
        assert_eq!(&v6[20..], &8080u16.to_be_bytes());
    }

    #[test]
    fn test_domain_too_long() {
        let host = "a".repeat(256);
        let (result, state, written) = run(&[], &host, 443);
        assert!(matches!(result, Err(Socks5Error::DomainTooLong(256))));
        assert_eq!(state, Socks5State::Failed);
        assert!(written.is_empty());
    }

    #[test]
    fn test_successful_handshake_ipv4_bound() {
        let reply = [5, 0, 5, 0, 0, 1, 10, 0, 0, 1, 0x1F, 0x90];
        let (result, state, written) = run(&reply, "example.com", 443);

        assert!(result.is_ok());
        assert_eq!(state, Socks5State::Done);
        assert_eq!(&written[..3], &[5, 1, 0]);
        assert_eq!(&written[3..], encode_connect_request("example.com", 443).unwrap().as_slice());
    }

    #[test]
    fn test_domain_bound_address_is_consumed() {
        // Bound address "proxy" followed by tunnel data that must stay unread
        let mut reply = vec![5, 0, 5, 0, 0, 3, 5];
        reply.extend_from_slice(b"proxy");
        reply.extend_from_slice(&[0, 80]);
        reply.extend_from_slice(b"HELLO");

        let mut stream = ScriptedStream::new(&reply);
        let t = timeouts();
        Socks5Handshake::new(&mut stream, &t).run("example.com", 80).unwrap();

        let rest: Vec<u8> = stream.reply.iter().copied().collect();
        assert_eq!(rest, b"HELLO");
    }

    #[test]
    fn test_auth_method_rejected() {
        let (result, state, _) = run(&[5, 0xFF], "example.com", 443);
        assert!(matches!(result, Err(Socks5Error::UnsupportedAuth)));
        assert_eq!(state, Socks5State::Failed);
    }

    #[test]
    fn test_connection_refused_reply() {
        let reply = [5, 0, 5, 5, 0, 1, 0, 0, 0, 0, 0, 0];
        let (result, _, _) = run(&reply, "example.com", 443);
        assert!(matches!(result, Err(Socks5Error::ConnectionRefused)));
    }

    #[test]
    fn test_truncated_reply_is_timeout() {
        let (result, _, _) = run(&[5, 0, 5, 0], "example.com", 443);
        assert!(matches!(result, Err(Socks5Error::Timeout)));
    }

    #[test]
    fn test_unknown_bound_address_type() {
        let (result, _, _) = run(&[5, 0, 5, 0, 0, 9], "example.com", 443);
        assert!(matches!(result, Err(Socks5Error::BadAddressType(9))));
    }
}
