//! Tunnel establishment through the upstream proxy

pub mod establish;
pub mod pending;
pub mod transport;

pub use establish::{Completion, Establisher, StartOutcome};
pub use pending::{OperationKey, PendingContext, PendingTable, DEFAULT_PENDING_TTL};
pub use transport::{ConnectProgress, IoState, ProxyTransport, SocketHandle, SocketTransport};
