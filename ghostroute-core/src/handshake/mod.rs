//! Proxy handshake clients
//!
//! Both clients run over an already-connected `Read + Write` stream and leave the
//! stream positioned at the first tunnelled byte on success.

pub mod http_connect;
pub mod io;
pub mod socks5;

pub use socks5::{Socks5Handshake, Socks5State};

use crate::config::Timeouts;
use crate::error::HandshakeError;
use std::fmt;
use std::io::{Read, Write};

/// Negotiates a tunnel to `host:port` with the proxy on the other end of `stream`
pub trait Handshake {
    fn handshake<S: Read + Write + ?Sized>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
        timeouts: &Timeouts,
    ) -> Result<(), HandshakeError>;
}

/// SOCKS5 with no authentication
#[derive(Debug, Clone, Copy, Default)]
pub struct Socks5Client;

impl Handshake for Socks5Client {
    fn handshake<S: Read + Write + ?Sized>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
        timeouts: &Timeouts,
    ) -> Result<(), HandshakeError> {
        Socks5Handshake::new(stream, timeouts).run(host, port)?;
        Ok(())
    }
}

/// HTTP/1.1 CONNECT
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnectClient;

impl Handshake for HttpConnectClient {
    fn handshake<S: Read + Write + ?Sized>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
        timeouts: &Timeouts,
    ) -> Result<(), HandshakeError> {
        http_connect::handshake(stream, host, port, timeouts)?;
        Ok(())
    }
}

/// The proxy protocol selected once when the policy snapshot is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProtocol {
    #[default]
    Socks5,
    Http,
}

impl ProxyProtocol {
    /// Parse a protocol name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socks5" => Some(ProxyProtocol::Socks5),
            "http" => Some(ProxyProtocol::Http),
            _ => None,
        }
    }
}

impl Handshake for ProxyProtocol {
    fn handshake<S: Read + Write + ?Sized>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
        timeouts: &Timeouts,
    ) -> Result<(), HandshakeError> {
        match self {
            ProxyProtocol::Socks5 => Socks5Client.handshake(stream, host, port, timeouts),
            ProxyProtocol::Http => HttpConnectClient.handshake(stream, host, port, timeouts),
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Socks5 => write!(f, "socks5"),
            ProxyProtocol::Http => write!(f, "http"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::io::testing::ScriptedStream;
    use super::*;
    use crate::error::{HttpConnectError, Socks5Error};
    use std::time::Duration;

    fn timeouts() -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(100),
            send: Duration::from_millis(100),
            recv: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_parse_protocol() {
        assert_eq!(ProxyProtocol::parse("SOCKS5"), Some(ProxyProtocol::Socks5));
        assert_eq!(ProxyProtocol::parse(" http "), Some(ProxyProtocol::Http));
        assert_eq!(ProxyProtocol::parse("https"), None);
    }

    #[test]
    fn test_dispatch_by_protocol() {
        let mut socks = ScriptedStream::new(&[5, 0xFF]);
        let err = ProxyProtocol::Socks5
            .handshake(&mut socks, "example.com", 443, &timeouts())
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Socks5(Socks5Error::UnsupportedAuth)));

        let mut http = ScriptedStream::new(b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
        let err = ProxyProtocol::Http
            .handshake(&mut http, "example.com", 443, &timeouts())
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Http(HttpConnectError::HandshakeRejected { status: Some(502), .. })
        ));
    }
}
