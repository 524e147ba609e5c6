//! Entry points for the interception layer
//!
//! An [`Engine`] is built once from a policy snapshot and shared by every
//! intercepted call. Each call runs on the caller's thread; no lock is held
//! across network I/O.

use crate::config::{Config, PolicySnapshot};
use crate::diagnostics::Diagnostics;
use crate::error::{EngineFailure, RejectReason, Result, TunnelError};
use crate::filter::{AddressFamily, Decision, Destination, Router, SocketType, Target};
use crate::resolve::NameResolver;
use crate::tunnel::{
    Completion, Establisher, OperationKey, PendingContext, PendingTable, ProxyTransport, SocketHandle,
    StartOutcome,
};
use crate::virtual_addr::VirtualAddressAllocator;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Whether the application issued a blocking or an overlapped connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectStyle {
    #[default]
    Blocking,
    /// Completion arrives later for `operation`
    Overlapped { operation: u64 },
}

/// One intercepted connection attempt
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest<'a> {
    /// `None` when the application passed no usable address
    pub destination: Option<Destination>,
    pub socket_type: SocketType,
    /// First write to send once the tunnel is up
    pub payload: Option<&'a [u8]>,
    pub style: ConnectStyle,
}

impl<'a> ConnectRequest<'a> {
    pub fn blocking(destination: Destination) -> Self {
        Self {
            destination: Some(destination),
            ..Self::default()
        }
    }

    pub fn overlapped(destination: Destination, operation: u64) -> Self {
        Self {
            destination: Some(destination),
            style: ConnectStyle::Overlapped { operation },
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_socket_type(mut self, socket_type: SocketType) -> Self {
        self.socket_type = socket_type;
        self
    }
}

/// What the interception layer should do with the attempt
#[derive(Debug)]
pub enum ConnectOutcome {
    /// Connect to the original destination unchanged
    Passthrough,
    Rejected(EngineFailure),
    /// Tunnel is up; `bytes_sent` of the payload were already written
    RedirectedSuccess { bytes_sent: usize },
    /// Deliver the completion for this key via [`Engine::complete_if_pending`]
    RedirectedPending(OperationKey),
}

pub struct Engine {
    snapshot: Arc<PolicySnapshot>,
    router: Router,
    resolver: NameResolver,
    establisher: Establisher,
    pending: PendingTable,
    diagnostics: Diagnostics,
}

impl Engine {
    /// Build an engine; the allocator is constructed from the finished snapshot
    pub fn new(snapshot: PolicySnapshot) -> Self {
        let snapshot = Arc::new(snapshot);
        let allocator = Arc::new(VirtualAddressAllocator::new(&snapshot.fake_ip.cidr));

        Self {
            router: Router::new(Arc::clone(&snapshot), Arc::clone(&allocator)),
            resolver: NameResolver::new(Arc::clone(&snapshot), allocator),
            establisher: Establisher::new(Arc::clone(&snapshot)),
            pending: PendingTable::default(),
            diagnostics: Diagnostics::new(),
            snapshot,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(PolicySnapshot::from_config(config)?))
    }

    pub fn snapshot(&self) -> &PolicySnapshot {
        &self.snapshot
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Route one attempt without touching the network
    pub fn decide(&self, destination: Option<&Destination>, socket_type: SocketType) -> Decision {
        self.router.decide(destination, socket_type)
    }

    pub fn resolve(&self, name: &str, family: Option<AddressFamily>) -> io::Result<Vec<IpAddr>> {
        self.resolver.resolve(name, family)
    }

    /// Domain behind a virtual address, if still bound
    pub fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        self.resolver.reverse(ip)
    }

    /// Handle an intercepted connect
    pub fn on_connect<T: ProxyTransport + ?Sized>(
        &self,
        request: &ConnectRequest<'_>,
        transport: &mut T,
    ) -> ConnectOutcome {
        let destination = request.destination.as_ref();
        let target = match self.router.decide(destination, request.socket_type) {
            Decision::Passthrough => return ConnectOutcome::Passthrough,
            Decision::Reject(reason) => {
                self.log_rejection(&reason, destination, request.socket_type);
                return ConnectOutcome::Rejected(EngineFailure::Rejected(reason));
            }
            Decision::Redirect(target) => target,
        };

        // A redirect always carries a decoded destination
        let family = destination.map_or(AddressFamily::Inet, |d| d.family);
        let handle = transport.handle();

        let result = match request.style {
            ConnectStyle::Blocking => self
                .establisher
                .establish(transport, family, &target, request.payload)
                .map(|bytes_sent| StartOutcome::Established { bytes_sent }),
            ConnectStyle::Overlapped { .. } => {
                self.establisher
                    .start(transport, family, &target, request.payload)
            }
        };

        match result {
            Ok(StartOutcome::Established { bytes_sent }) => {
                self.diagnostics.record_tunnel(handle, target);
                ConnectOutcome::RedirectedSuccess { bytes_sent }
            }
            Ok(StartOutcome::Pending { proxy_addr, io_state }) => {
                let operation = match request.style {
                    ConnectStyle::Overlapped { operation } => operation,
                    ConnectStyle::Blocking => handle,
                };
                let context = PendingContext::new(
                    handle,
                    target,
                    proxy_addr,
                    request.payload.map(<[u8]>::to_vec),
                )
                .with_io_state(io_state);
                ConnectOutcome::RedirectedPending(self.pending.insert(operation, context))
            }
            Err(e) => {
                warn!("tunnel: socket {} to {} failed: {}", handle, target, e);
                ConnectOutcome::Rejected(e.into())
            }
        }
    }

    /// Finish a pending redirect
    ///
    /// Returns `None` when `key` is unknown or already expired, which is not an error.
    pub fn complete_if_pending<T: ProxyTransport + ?Sized>(
        &self,
        key: OperationKey,
        transport: &mut T,
    ) -> Option<std::result::Result<Completion, TunnelError>> {
        let Some(context) = self.pending.take(&key) else {
            debug!("complete: no pending connect for {:?}", key);
            return None;
        };

        let result = self.establisher.complete(transport, &context);
        match &result {
            Ok(done) => {
                if self.snapshot.traffic_logging {
                    info!(
                        "traffic: socket {} completed, sent {} of {} payload bytes",
                        context.socket, done.bytes_sent, done.requested
                    );
                } else {
                    debug!(
                        "complete: socket {} sent {} of {} payload bytes",
                        context.socket, done.bytes_sent, done.requested
                    );
                }
                self.diagnostics.record_tunnel(context.socket, context.target.clone());
            }
            Err(e) => warn!(
                "tunnel: socket {} to {} failed on completion: {}",
                context.socket, context.target, e
            ),
        }
        Some(result)
    }

    /// Forget a closed socket
    pub fn on_close(&self, handle: SocketHandle) {
        self.diagnostics.forget_socket(handle);
    }

    pub fn socket_target(&self, handle: SocketHandle) -> Option<Target> {
        self.diagnostics.socket_target(handle)
    }

    /// Drop pending connects past their TTL
    pub fn sweep_pending(&self) -> usize {
        self.pending.sweep_expired(Instant::now())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn log_rejection(&self, reason: &RejectReason, destination: Option<&Destination>, socket_type: SocketType) {
        let dest = destination.map_or_else(|| "<none>".to_string(), ToString::to_string);
        let key = format!("{socket_type:?} {dest} {reason}");
        if self.diagnostics.note_rejection(&key) {
            info!("reject: {:?} {} ({})", socket_type, dest, reason);
        } else {
            debug!("reject: {:?} {} ({})", socket_type, dest, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, HandshakeError, Socks5Error};
    use crate::handshake::ProxyProtocol;
    use crate::tunnel::establish::testing::socks5_proxy;
    use crate::tunnel::{SocketTransport, DEFAULT_PENDING_TTL};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    fn engine_for(proxy: SocketAddr) -> Engine {
        let mut snapshot = PolicySnapshot::default();
        snapshot.proxy.host = proxy.ip().to_string();
        snapshot.proxy.port = proxy.port();
        snapshot.proxy.protocol = ProxyProtocol::Socks5;
        Engine::new(snapshot)
    }

    fn virtual_dest(engine: &Engine, name: &str, port: u16) -> Destination {
        let ip = engine.resolve(name, None).unwrap()[0];
        Destination::from(SocketAddr::new(ip, port))
    }

    #[test]
    fn test_blocking_redirect_records_target() {
        let (proxy, trailing) = socks5_proxy(0);
        let engine = engine_for(proxy);
        let dest = virtual_dest(&engine, "example.com", 443);
        let mut transport = SocketTransport::tcp_for(&proxy, 11).unwrap();

        let request = ConnectRequest::blocking(dest).with_payload(b"hello");
        match engine.on_connect(&request, &mut transport) {
            ConnectOutcome::RedirectedSuccess { bytes_sent } => assert_eq!(bytes_sent, 5),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(engine.socket_target(11), Some(Target::new("example.com", 443)));

        engine.on_close(11);
        assert_eq!(engine.socket_target(11), None);
        drop(transport);
        assert_eq!(trailing.join().unwrap(), b"hello");
    }

    #[test]
    fn test_refused_tunnel_surfaces_connection_refused() {
        let (proxy, trailing) = socks5_proxy(5);
        let engine = engine_for(proxy);
        let dest = virtual_dest(&engine, "example.com", 443);
        let mut transport = SocketTransport::tcp_for(&proxy, 12).unwrap();

        let request = ConnectRequest::blocking(dest).with_payload(b"never");
        let failure = match engine.on_connect(&request, &mut transport) {
            ConnectOutcome::Rejected(failure) => failure,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert!(matches!(
            failure,
            EngineFailure::Tunnel(TunnelError::Handshake(HandshakeError::Socks5(
                Socks5Error::ConnectionRefused
            )))
        ));
        assert_eq!(failure.category(), ErrorCategory::HandshakeFailed);
        assert_eq!(failure.into_io_error().kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(engine.socket_target(12), None);

        drop(transport);
        assert!(trailing.join().unwrap().is_empty());
    }

    #[test]
    fn test_passthrough_and_rejection_do_no_io() {
        let engine = Engine::new(PolicySnapshot::default());
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut transport = SocketTransport::tcp_for(&addr, 13).unwrap();

        let ssh = ConnectRequest::blocking(Destination::from(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            22,
        )));
        assert!(matches!(engine.on_connect(&ssh, &mut transport), ConnectOutcome::Passthrough));

        let quic = ConnectRequest::blocking(Destination::from(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            443,
        )))
        .with_socket_type(SocketType::Datagram);
        for _ in 0..2 {
            match engine.on_connect(&quic, &mut transport) {
                ConnectOutcome::Rejected(failure) => {
                    assert_eq!(failure.category(), ErrorCategory::PolicyRejected);
                    assert_eq!(failure.io_kind(), io::ErrorKind::NetworkUnreachable);
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(engine.diagnostics().stats().distinct_rejections, 1);

        let missing = ConnectRequest::default();
        match engine.on_connect(&missing, &mut transport) {
            ConnectOutcome::Rejected(failure) => {
                assert_eq!(failure.category(), ErrorCategory::InvalidArgument)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_overlapped_redirect_completes() {
        let (proxy, trailing) = socks5_proxy(0);
        let engine = engine_for(proxy);
        let dest = virtual_dest(&engine, "example.com", 80);
        let mut transport = SocketTransport::tcp_for(&proxy, 14).unwrap();

        let request = ConnectRequest::overlapped(dest, 900).with_payload(b"GET");
        match engine.on_connect(&request, &mut transport) {
            ConnectOutcome::RedirectedSuccess { bytes_sent } => assert_eq!(bytes_sent, 3),
            ConnectOutcome::RedirectedPending(key) => {
                assert_eq!(key.operation, 900);
                assert_eq!(engine.pending_len(), 1);
                std::thread::sleep(Duration::from_millis(100));

                let done = engine.complete_if_pending(key, &mut transport).unwrap().unwrap();
                assert_eq!(done, Completion { bytes_sent: 3, requested: 3 });

                // A second notification for the same key is a no-op
                assert!(engine.complete_if_pending(key, &mut transport).is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(engine.socket_target(14), Some(Target::new("example.com", 80)));

        drop(transport);
        assert_eq!(trailing.join().unwrap(), b"GET");
    }

    #[test]
    fn test_expired_pending_completion_is_noop() {
        let engine = Engine::new(PolicySnapshot::default());
        let key = engine.pending.insert(
            77,
            PendingContext::new(
                15,
                Target::new("example.com", 443),
                "127.0.0.1:7890".parse().unwrap(),
                None,
            ),
        );

        let later = Instant::now() + DEFAULT_PENDING_TTL + Duration::from_secs(1);
        assert_eq!(engine.pending.sweep_expired(later), 1);

        let addr: SocketAddr = "127.0.0.1:7890".parse().unwrap();
        let mut transport = SocketTransport::tcp_for(&addr, 15).unwrap();
        assert!(engine.complete_if_pending(key, &mut transport).is_none());
        assert_eq!(engine.socket_target(15), None);
    }

    #[test]
    fn test_failed_pending_connect_is_consumed_without_tunnel() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let engine = engine_for(closed);
        let mut transport = SocketTransport::tcp_for(&closed, 16).unwrap();
        let _ = transport.start_connect(closed);
        std::thread::sleep(Duration::from_millis(100));

        let key = engine.pending.insert(
            78,
            PendingContext::new(16, Target::new("example.com", 443), closed, Some(b"x".to_vec())),
        );
        let result = engine.complete_if_pending(key, &mut transport).unwrap();
        assert!(matches!(result, Err(TunnelError::ConnectFailed { .. })));

        assert!(engine.complete_if_pending(key, &mut transport).is_none());
        assert_eq!(engine.socket_target(16), None);
    }

    #[test]
    fn test_from_config_rejects_bad_rules() {
        let mut config = Config::default();
        config.routing.default_action = "teleport".to_string();
        assert!(Engine::from_config(&config).is_err());
    }
}
