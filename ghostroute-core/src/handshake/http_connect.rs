//! HTTP CONNECT client for tunnelling through HTTP proxies

use super::io::{recv_exact, send_all};
use crate::config::Timeouts;
use crate::error::HttpConnectError;
use std::io::{self, Read, Write};
use std::net::Ipv6Addr;
use std::time::Instant;

/// Upper bound on the proxy's response header block
pub const MAX_RESPONSE_HEADER: usize = 8192;

/// Characters of the response kept for diagnostics
const EXCERPT_LEN: usize = 100;

/// Format `host:port`, bracketing IPv6 literals
pub fn authority(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Build the CONNECT request
///
/// Format: CONNECT host:port HTTP/1.1\r\nHost: host:port\r\n\r\n
pub fn build_request(host: &str, port: u16) -> String {
    let target = authority(host, port);
    format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n")
}

/// Run a CONNECT handshake over an already-connected stream
pub fn handshake<S: Read + Write + ?Sized>(
    stream: &mut S,
    host: &str,
    port: u16,
    timeouts: &Timeouts,
) -> Result<(), HttpConnectError> {
    let request = build_request(host, port);
    let deadline = Instant::now() + timeouts.send;
    send_all(stream, request.as_bytes(), deadline).map_err(|e| match e.kind() {
        io::ErrorKind::TimedOut => HttpConnectError::Timeout,
        _ => HttpConnectError::Send(e),
    })?;

    let response = read_response_head(stream, Instant::now() + timeouts.recv)?;
    let text = String::from_utf8_lossy(&response);

    match parse_status_code(&text) {
        Some(200) => {
            tracing::debug!("HTTP CONNECT established to {}", authority(host, port));
            Ok(())
        }
        status => Err(HttpConnectError::HandshakeRejected {
            status,
            excerpt: excerpt(&text),
        }),
    }
}

/// Read one byte at a time until the blank line ending the header block
///
/// Reading byte-wise leaves any tunnelled data that follows the header unread.
fn read_response_head<S: Read + ?Sized>(stream: &mut S, deadline: Instant) -> Result<Vec<u8>, HttpConnectError> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEADER {
            return Err(HttpConnectError::ProtocolError(format!(
                "response header exceeds {MAX_RESPONSE_HEADER} bytes"
            )));
        }

        match recv_exact(stream, &mut byte, deadline) {
            Ok(()) => head.push(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(HttpConnectError::Timeout),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(HttpConnectError::ProtocolError(
                    "connection closed before end of response header".to_string(),
                ))
            }
            Err(e) => return Err(HttpConnectError::ProtocolError(e.to_string())),
        }
    }

    Ok(head)
}

/// Parse the 3-digit code from a status line such as "HTTP/1.1 200 Connection established"
pub fn parse_status_code(response: &str) -> Option<u16> {
    let status_line = response.lines().next()?;
    let mut parts = status_line.split_whitespace();

    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }

    let code = parts.next()?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    code.parse().ok()
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_LEN).collect()
}
