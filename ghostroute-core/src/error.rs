//! Error types for configuration and the connection path

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GhostrouteError>;

#[derive(Debug, Error)]
pub enum GhostrouteError {
    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid CIDR notation: {cidr}")]
    InvalidCidr { cidr: String },

    #[error("Invalid port specification: {spec}")]
    InvalidPorts { spec: String },

    #[error("Invalid rule action: {action}")]
    InvalidAction { action: String },

    #[error("Invalid wildcard pattern: {pattern}")]
    InvalidPattern { pattern: String },

    #[error("Duplicate routing rule name: {name}")]
    DuplicateRule { name: String },
}

/// Failure categories surfaced to the interception layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidArgument,
    UnsupportedAddressFamily,
    PolicyRejected,
    ProxyResolutionFailed,
    ConnectFailed,
    HandshakeFailed,
    Timeout,
}

/// Why a routing decision refused a connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("malformed or truncated destination")]
    InvalidArgument,

    #[error("address family not supported")]
    AddressFamilyUnsupported,

    #[error("network unreachable by policy")]
    NetworkUnreachable,

    #[error("blocked by routing rule {0}")]
    RuleBlocked(String),
}

impl RejectReason {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RejectReason::InvalidArgument => ErrorCategory::InvalidArgument,
            RejectReason::AddressFamilyUnsupported => ErrorCategory::UnsupportedAddressFamily,
            RejectReason::NetworkUnreachable | RejectReason::RuleBlocked(_) => {
                ErrorCategory::PolicyRejected
            }
        }
    }

    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            RejectReason::InvalidArgument => io::ErrorKind::InvalidInput,
            RejectReason::AddressFamilyUnsupported => io::ErrorKind::Unsupported,
            RejectReason::NetworkUnreachable | RejectReason::RuleBlocked(_) => {
                io::ErrorKind::NetworkUnreachable
            }
        }
    }
}

/// SOCKS5 handshake failures
#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("proxy did not accept the no-authentication method")]
    UnsupportedAuth,

    #[error("unexpected protocol version {0:#04x} in reply")]
    BadVersion(u8),

    #[error("domain name too long for SOCKS5 ({0} bytes)")]
    DomainTooLong(usize),

    #[error("unknown bound address type {0:#04x}")]
    BadAddressType(u8),

    #[error("general SOCKS server failure")]
    GeneralFailure,

    #[error("connection not allowed by ruleset")]
    RuleDenied,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("TTL expired")]
    TtlExpired,

    #[error("command not supported")]
    CommandUnsupported,

    #[error("address type not supported")]
    AddressTypeUnsupported,

    #[error("unassigned reply code {0:#04x}")]
    UnknownReply(u8),

    #[error("timed out or short read")]
    Timeout,

    #[error("send failed: {0}")]
    Send(#[source] io::Error),
}

impl Socks5Error {
    /// Map a non-zero reply code to its failure
    pub fn from_reply(code: u8) -> Self {
        match code {
            0x01 => Socks5Error::GeneralFailure,
            0x02 => Socks5Error::RuleDenied,
            0x03 => Socks5Error::NetworkUnreachable,
            0x04 => Socks5Error::HostUnreachable,
            0x05 => Socks5Error::ConnectionRefused,
            0x06 => Socks5Error::TtlExpired,
            0x07 => Socks5Error::CommandUnsupported,
            0x08 => Socks5Error::AddressTypeUnsupported,
            other => Socks5Error::UnknownReply(other),
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Socks5Error::NetworkUnreachable => io::ErrorKind::NetworkUnreachable,
            Socks5Error::HostUnreachable => io::ErrorKind::HostUnreachable,
            Socks5Error::TtlExpired | Socks5Error::Timeout => io::ErrorKind::TimedOut,
            Socks5Error::Send(e) => e.kind(),
            _ => io::ErrorKind::ConnectionRefused,
        }
    }
}

/// HTTP CONNECT handshake failures
#[derive(Debug, Error)]
pub enum HttpConnectError {
    #[error("malformed or oversized response: {0}")]
    ProtocolError(String),

    #[error("proxy rejected CONNECT with status {status:?}: {excerpt}")]
    HandshakeRejected {
        status: Option<u16>,
        excerpt: String,
    },

    #[error("timed out waiting for response")]
    Timeout,

    #[error("send failed: {0}")]
    Send(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("SOCKS5: {0}")]
    Socks5(#[from] Socks5Error),

    #[error("HTTP CONNECT: {0}")]
    Http(#[from] HttpConnectError),
}

impl HandshakeError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HandshakeError::Socks5(Socks5Error::Timeout) | HandshakeError::Http(HttpConnectError::Timeout)
        )
    }

    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            HandshakeError::Socks5(e) => e.io_kind(),
            HandshakeError::Http(HttpConnectError::Timeout) => io::ErrorKind::TimedOut,
            HandshakeError::Http(HttpConnectError::Send(e)) => e.kind(),
            HandshakeError::Http(_) => io::ErrorKind::ConnectionRefused,
        }
    }
}

/// Failures while executing a redirect
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("could not resolve proxy host {host}")]
    ProxyResolutionFailed { host: String },

    #[error("connect to proxy {addr} failed: {source}")]
    ConnectFailed {
        addr: std::net::SocketAddr,
        source: io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("timed out connecting to proxy {0}")]
    Timeout(std::net::SocketAddr),

    #[error("failed to flush first write: {0}")]
    Flush(#[source] io::Error),
}

impl TunnelError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TunnelError::ProxyResolutionFailed { .. } => ErrorCategory::ProxyResolutionFailed,
            TunnelError::ConnectFailed { .. } | TunnelError::Flush(_) => ErrorCategory::ConnectFailed,
            TunnelError::Handshake(e) if e.is_timeout() => ErrorCategory::Timeout,
            TunnelError::Handshake(_) => ErrorCategory::HandshakeFailed,
            TunnelError::Timeout(_) => ErrorCategory::Timeout,
        }
    }

    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            TunnelError::ProxyResolutionFailed { .. } => io::ErrorKind::HostUnreachable,
            TunnelError::ConnectFailed { source, .. } => source.kind(),
            TunnelError::Handshake(e) => e.io_kind(),
            TunnelError::Timeout(_) => io::ErrorKind::TimedOut,
            TunnelError::Flush(e) => e.kind(),
        }
    }
}

/// What the interception layer receives when a connection is not allowed through
#[derive(Debug, Error)]
pub enum EngineFailure {
    #[error("rejected: {0}")]
    Rejected(RejectReason),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl EngineFailure {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineFailure::Rejected(r) => r.category(),
            EngineFailure::Tunnel(e) => e.category(),
        }
    }

    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            EngineFailure::Rejected(r) => r.io_kind(),
            EngineFailure::Tunnel(e) => e.io_kind(),
        }
    }

    /// Convert into an `io::Error` suitable for returning to the application
    pub fn into_io_error(self) -> io::Error {
        io::Error::new(self.io_kind(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_maps_to_connection_refused() {
        let err = TunnelError::Handshake(Socks5Error::from_reply(5).into());
        assert_eq!(err.io_kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(err.category(), ErrorCategory::HandshakeFailed);
    }

    #[test]
    fn test_policy_block_maps_to_network_unreachable() {
        let err = EngineFailure::Rejected(RejectReason::NetworkUnreachable);
        assert_eq!(err.io_kind(), io::ErrorKind::NetworkUnreachable);
        assert_eq!(err.category(), ErrorCategory::PolicyRejected);
    }

    #[test]
    fn test_handshake_timeout_category() {
        let err = TunnelError::Handshake(Socks5Error::Timeout.into());
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert_eq!(err.io_kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_reply_code_mapping() {
        assert!(matches!(Socks5Error::from_reply(2), Socks5Error::RuleDenied));
        assert!(matches!(Socks5Error::from_reply(8), Socks5Error::AddressTypeUnsupported));
        assert!(matches!(Socks5Error::from_reply(0x42), Socks5Error::UnknownReply(0x42)));
    }
}
