//! Bounded observability caches: socket targets and first-seen rejections

use crate::filter::Target;
use crate::tunnel::SocketHandle;
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use std::sync::{Arc, Mutex};
use tracing::info;

pub const SOCKET_TARGET_CAPACITY: usize = 4096;
pub const REJECTION_CAPACITY: usize = 1024;

/// Where a tunnelled socket really goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRecord {
    pub target: Target,
    pub established: DateTime<Utc>,
}

/// Counters for `stats()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticStats {
    pub open_tunnels: usize,
    pub distinct_rejections: usize,
    pub evicted_records: u64,
}

/// Shared diagnostic state, each table behind its own lock
#[derive(Clone)]
pub struct Diagnostics {
    sockets: Arc<Mutex<IndexMap<SocketHandle, TunnelRecord>>>,
    rejections: Arc<Mutex<IndexSet<String>>>,
    evicted: Arc<Mutex<u64>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            sockets: Arc::new(Mutex::new(IndexMap::new())),
            rejections: Arc::new(Mutex::new(IndexSet::new())),
            evicted: Arc::new(Mutex::new(0)),
        }
    }

    /// Remember the original target of a freshly established tunnel
    pub fn record_tunnel(&self, handle: SocketHandle, target: Target) {
        let record = TunnelRecord {
            target,
            established: Utc::now(),
        };

        let mut dropped = 0;
        if let Ok(mut sockets) = self.sockets.lock() {
            // Re-inserting moves the handle to the newest position
            sockets.shift_remove(&handle);
            while sockets.len() >= SOCKET_TARGET_CAPACITY {
                sockets.shift_remove_index(0);
                dropped += 1;
            }
            sockets.insert(handle, record);
        }

        if dropped > 0 {
            if let Ok(mut evicted) = self.evicted.lock() {
                *evicted += dropped;
            }
        }
    }

    pub fn socket_target(&self, handle: SocketHandle) -> Option<Target> {
        let sockets = self.sockets.lock().ok()?;
        sockets.get(&handle).map(|r| r.target.clone())
    }

    pub fn tunnel_record(&self, handle: SocketHandle) -> Option<TunnelRecord> {
        let sockets = self.sockets.lock().ok()?;
        sockets.get(&handle).cloned()
    }

    /// Drop the record for a closed socket, logging where it went
    pub fn forget_socket(&self, handle: SocketHandle) -> Option<TunnelRecord> {
        let record = self.sockets.lock().ok()?.shift_remove(&handle)?;
        let lifetime = Utc::now().signed_duration_since(record.established);
        info!(
            "close: socket {} -> {} after {}ms",
            handle,
            record.target,
            lifetime.num_milliseconds()
        );
        Some(record)
    }

    /// Returns true the first time `key` is seen, so noisy rejections log once
    pub fn note_rejection(&self, key: &str) -> bool {
        let Ok(mut seen) = self.rejections.lock() else {
            return false;
        };
        if seen.contains(key) {
            return false;
        }
        if seen.len() >= REJECTION_CAPACITY {
            seen.shift_remove_index(0);
        }
        seen.insert(key.to_string())
    }

    pub fn stats(&self) -> DiagnosticStats {
        DiagnosticStats {
            open_tunnels: self.sockets.lock().map(|s| s.len()).unwrap_or(0),
            distinct_rejections: self.rejections.lock().map(|r| r.len()).unwrap_or(0),
            evicted_records: self.evicted.lock().map(|e| *e).unwrap_or(0),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_forget() {
        let diag = Diagnostics::new();
        diag.record_tunnel(5, Target::new("example.com", 443));

        assert_eq!(diag.socket_target(5), Some(Target::new("example.com", 443)));
        assert_eq!(diag.stats().open_tunnels, 1);

        let record = diag.forget_socket(5).unwrap();
        assert_eq!(record.target.host, "example.com");
        assert_eq!(diag.socket_target(5), None);
        assert!(diag.forget_socket(5).is_none());
    }

    #[test]
    fn test_socket_table_is_bounded() {
        let diag = Diagnostics::new();
        for handle in 0..(SOCKET_TARGET_CAPACITY as u64 + 10) {
            diag.record_tunnel(handle, Target::new("h", 80));
        }

        let stats = diag.stats();
        assert_eq!(stats.open_tunnels, SOCKET_TARGET_CAPACITY);
        assert_eq!(stats.evicted_records, 10);
        assert_eq!(diag.socket_target(0), None);
        assert!(diag.socket_target(SOCKET_TARGET_CAPACITY as u64 + 9).is_some());
    }

    #[test]
    fn test_rejection_first_seen() {
        let diag = Diagnostics::new();
        assert!(diag.note_rejection("udp 8.8.8.8:443"));
        assert!(!diag.note_rejection("udp 8.8.8.8:443"));
        assert!(diag.note_rejection("udp 1.1.1.1:443"));
        assert_eq!(diag.stats().distinct_rejections, 2);
    }

    #[test]
    fn test_rejection_set_is_bounded() {
        let diag = Diagnostics::new();
        for i in 0..(REJECTION_CAPACITY + 1) {
            diag.note_rejection(&format!("key{i}"));
        }
        assert_eq!(diag.stats().distinct_rejections, REJECTION_CAPACITY);
        // The oldest key was evicted and counts as new again
        assert!(diag.note_rejection("key0"));
    }
}
