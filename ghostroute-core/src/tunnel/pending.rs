//! In-flight asynchronous connects awaiting their completion trigger

use super::transport::{IoState, SocketHandle};
use crate::filter::Target;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Contexts older than this are discarded uncompleted
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(60);

/// Identifies one asynchronous operation
///
/// The generation distinguishes a reused operation handle from an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub operation: u64,
    pub generation: u64,
}

/// State saved between issuing a connect and its completion
#[derive(Debug, Clone)]
pub struct PendingContext {
    pub socket: SocketHandle,
    pub target: Target,
    pub proxy_addr: SocketAddr,
    pub payload: Option<Vec<u8>>,
    /// Socket mode before the connect was issued
    pub io_state: Option<IoState>,
    pub created: Instant,
}

impl PendingContext {
    pub fn new(socket: SocketHandle, target: Target, proxy_addr: SocketAddr, payload: Option<Vec<u8>>) -> Self {
        Self {
            socket,
            target,
            proxy_addr,
            payload,
            io_state: None,
            created: Instant::now(),
        }
    }

    pub fn with_io_state(mut self, io_state: IoState) -> Self {
        self.io_state = Some(io_state);
        self
    }
}

/// Pending contexts keyed by operation, each consumed at most once
#[derive(Debug)]
pub struct PendingTable {
    ttl: Duration,
    generation: AtomicU64,
    entries: Mutex<HashMap<OperationKey, PendingContext>>,
}

impl PendingTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            generation: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store a context, sweeping expired ones first
    pub fn insert(&self, operation: u64, context: PendingContext) -> OperationKey {
        let key = OperationKey {
            operation,
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
        };

        let now = Instant::now();
        if let Ok(mut entries) = self.entries.lock() {
            Self::sweep_locked(&mut entries, now, self.ttl);
            entries.insert(key, context);
        }
        key
    }

    /// Remove and return the context for `key`
    pub fn take(&self, key: &OperationKey) -> Option<PendingContext> {
        self.entries.lock().ok()?.remove(key)
    }

    /// Discard contexts older than the TTL as of `now`
    pub fn sweep_expired(&self, now: Instant) -> usize {
        match self.entries.lock() {
            Ok(mut entries) => Self::sweep_locked(&mut entries, now, self.ttl),
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep_locked(entries: &mut HashMap<OperationKey, PendingContext>, now: Instant, ttl: Duration) -> usize {
        let before = entries.len();
        entries.retain(|key, ctx| {
            let live = now.saturating_duration_since(ctx.created) < ttl;
            if !live {
                debug!(
                    "pending: discarding expired connect {:?} for socket {} to {}",
                    key, ctx.socket, ctx.target
                );
            }
            live
        });
        before - entries.len()
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TTL)
    }
}
