//! Transparent proxy routing engine: virtual addresses, routing decisions and
//! SOCKS5 / HTTP CONNECT tunnels for intercepted connections

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod filter;
pub mod handshake;
pub mod resolve;
pub mod tunnel;
pub mod virtual_addr;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, PolicySnapshot, Timeouts};
pub use engine::{ConnectOutcome, ConnectRequest, ConnectStyle, Engine};
pub use error::{EngineFailure, ErrorCategory, GhostrouteError, RejectReason, Result, TunnelError};
pub use filter::{AddressFamily, Decision, Destination, SocketType, Target};
pub use handshake::ProxyProtocol;
pub use tunnel::{Completion, OperationKey, ProxyTransport, SocketHandle, SocketTransport};
pub use virtual_addr::VirtualAddressAllocator;
