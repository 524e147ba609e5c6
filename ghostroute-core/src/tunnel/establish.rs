//! Connects a socket to the proxy and negotiates the tunnel

use super::pending::PendingContext;
use super::transport::{ConnectProgress, IoState, ProxyTransport};
use crate::config::PolicySnapshot;
use crate::error::TunnelError;
use crate::filter::{AddressFamily, Target};
use crate::handshake::io::send_all;
use crate::handshake::Handshake;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of starting an asynchronous tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The connect finished immediately and the tunnel is up
    Established { bytes_sent: usize },
    /// The connect is in flight towards `proxy_addr`
    ///
    /// `io_state` is the socket's mode before the connect; completion restores it.
    Pending { proxy_addr: SocketAddr, io_state: IoState },
}

/// Result of completing a pending tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Payload bytes actually written after the handshake
    pub bytes_sent: usize,
    /// Payload bytes the application originally asked to send
    pub requested: usize,
}

/// Executes redirect decisions against the configured proxy
#[derive(Debug, Clone)]
pub struct Establisher {
    snapshot: Arc<PolicySnapshot>,
}

impl Establisher {
    pub fn new(snapshot: Arc<PolicySnapshot>) -> Self {
        Self { snapshot }
    }

    /// Proxy socket address in the family of the original destination
    ///
    /// An IPv6 socket reaches an IPv4 proxy through the mapped form.
    pub fn proxy_addr(&self, family: AddressFamily) -> Result<SocketAddr, TunnelError> {
        let proxy = &self.snapshot.proxy;
        let want_v6 = family == AddressFamily::Inet6;
        let failed = || TunnelError::ProxyResolutionFailed {
            host: proxy.host.clone(),
        };

        let candidates: Vec<IpAddr> = match proxy.host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => (proxy.host.as_str(), proxy.port)
                .to_socket_addrs()
                .map_err(|e| {
                    debug!("tunnel: resolving proxy {} failed: {}", proxy.host, e);
                    failed()
                })?
                .map(|addr| addr.ip())
                .collect(),
        };

        let ip = if want_v6 {
            candidates
                .iter()
                .find(|ip| ip.is_ipv6())
                .copied()
                .or_else(|| candidates.iter().find_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(IpAddr::V6(v4.to_ipv6_mapped())),
                    IpAddr::V6(_) => None,
                }))
        } else {
            candidates.iter().find_map(|ip| match ip {
                IpAddr::V4(_) => Some(*ip),
                IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
            })
        };

        ip.map(|ip| SocketAddr::new(ip, proxy.port)).ok_or_else(failed)
    }

    /// Blocking flow: connect, negotiate, then flush the first write
    ///
    /// Returns the number of payload bytes sent.
    pub fn establish<T: ProxyTransport + ?Sized>(
        &self,
        transport: &mut T,
        family: AddressFamily,
        target: &Target,
        payload: Option<&[u8]>,
    ) -> Result<usize, TunnelError> {
        let proxy_addr = self.proxy_addr(family)?;
        let timeouts = &self.snapshot.timeouts;
        let saved = transport.io_state().map_err(|e| connect_error(proxy_addr, e))?;

        if let Err(e) = transport.connect(proxy_addr, timeouts.connect) {
            restore(transport, &saved);
            return Err(connect_error(proxy_addr, e));
        }

        self.negotiate(transport, proxy_addr, target, payload, &saved)
    }

    /// Asynchronous flow: issue the connect and negotiate only if it finished at once
    pub fn start<T: ProxyTransport + ?Sized>(
        &self,
        transport: &mut T,
        family: AddressFamily,
        target: &Target,
        payload: Option<&[u8]>,
    ) -> Result<StartOutcome, TunnelError> {
        let proxy_addr = self.proxy_addr(family)?;
        let saved = transport.io_state().map_err(|e| connect_error(proxy_addr, e))?;

        let progress = transport.start_connect(proxy_addr).map_err(|e| {
            restore(transport, &saved);
            connect_error(proxy_addr, e)
        })?;

        match progress {
            ConnectProgress::Connected => {
                let bytes_sent = self.negotiate(transport, proxy_addr, target, payload, &saved)?;
                Ok(StartOutcome::Established { bytes_sent })
            }
            ConnectProgress::Pending => {
                debug!(
                    "tunnel: socket {} connect to {} pending for {}",
                    transport.handle(),
                    proxy_addr,
                    target
                );
                Ok(StartOutcome::Pending {
                    proxy_addr,
                    io_state: saved,
                })
            }
        }
    }

    /// Finish a tunnel whose connect was pending
    pub fn complete<T: ProxyTransport + ?Sized>(
        &self,
        transport: &mut T,
        context: &PendingContext,
    ) -> Result<Completion, TunnelError> {
        let saved = match context.io_state {
            Some(state) => state,
            None => transport
                .io_state()
                .map_err(|e| connect_error(context.proxy_addr, e))?,
        };

        if let Err(e) = transport.finish_connect() {
            restore(transport, &saved);
            return Err(connect_error(context.proxy_addr, e));
        }

        let payload = context.payload.as_deref();
        let bytes_sent = self.negotiate(transport, context.proxy_addr, &context.target, payload, &saved)?;

        Ok(Completion {
            bytes_sent,
            requested: payload.map_or(0, <[u8]>::len),
        })
    }

    /// Handshake and flush, then hand the socket back in the `saved` mode
    fn negotiate<T: ProxyTransport + ?Sized>(
        &self,
        transport: &mut T,
        proxy_addr: SocketAddr,
        target: &Target,
        payload: Option<&[u8]>,
        saved: &IoState,
    ) -> Result<usize, TunnelError> {
        let result = self.handshake_and_flush(transport, proxy_addr, target, payload);
        match result {
            Ok(bytes_sent) => {
                transport
                    .restore_io_state(saved)
                    .map_err(|e| connect_error(proxy_addr, e))?;
                Ok(bytes_sent)
            }
            Err(e) => {
                restore(transport, saved);
                Err(e)
            }
        }
    }

    fn handshake_and_flush<T: ProxyTransport + ?Sized>(
        &self,
        transport: &mut T,
        proxy_addr: SocketAddr,
        target: &Target,
        payload: Option<&[u8]>,
    ) -> Result<usize, TunnelError> {
        let policy = &*self.snapshot;
        let timeouts = &policy.timeouts;

        transport
            .set_io_timeouts(timeouts.send, timeouts.recv)
            .map_err(|e| connect_error(proxy_addr, e))?;

        policy
            .proxy
            .protocol
            .handshake(transport, &target.host, target.port, timeouts)?;

        let mut bytes_sent = 0;
        if let Some(data) = payload.filter(|d| !d.is_empty()) {
            send_all(transport, data, Instant::now() + timeouts.send).map_err(TunnelError::Flush)?;
            bytes_sent = data.len();
        }

        info!("tunnel: socket {} -> {} via {}", transport.handle(), target, policy.proxy);
        if policy.traffic_logging {
            info!("traffic: socket {} flushed {} bytes to {}", transport.handle(), bytes_sent, target);
        } else {
            debug!("traffic: socket {} flushed {} bytes to {}", transport.handle(), bytes_sent, target);
        }

        Ok(bytes_sent)
    }
}

/// Best-effort restore on a path that is already failing
fn restore<T: ProxyTransport + ?Sized>(transport: &mut T, saved: &IoState) {
    if let Err(e) = transport.restore_io_state(saved) {
        debug!("tunnel: socket {} mode not restored: {}", transport.handle(), e);
    }
}

fn connect_error(addr: SocketAddr, e: io::Error) -> TunnelError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TunnelError::Timeout(addr),
        _ => TunnelError::ConnectFailed { addr, source: e },
    }
}
