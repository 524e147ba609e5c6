//! Routing decisions for intercepted connection attempts

use super::rules::RuleAction;
use crate::config::{DnsMode, Ipv6Mode, PolicySnapshot, UdpMode};
use crate::error::RejectReason;
use crate::handshake::http_connect::authority;
use crate::virtual_addr::VirtualAddressAllocator;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::trace;

const DNS_PORT: u16 = 53;

/// Address family as reported by the interception layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Other(u16),
}

/// Transport type of the socket issuing the attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketType {
    #[default]
    Stream,
    Datagram,
}

/// Raw destination of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub family: AddressFamily,
    /// Network-order address bytes (4 for `Inet`, 16 for `Inet6`)
    pub address: Vec<u8>,
    pub port: u16,
}

impl Destination {
    pub fn new(family: AddressFamily, address: impl Into<Vec<u8>>, port: u16) -> Self {
        Self {
            family,
            address: address.into(),
            port,
        }
    }

    /// Decode the address bytes; `None` for truncated input
    fn ip(&self) -> Option<IpAddr> {
        match self.family {
            AddressFamily::Inet => {
                let octets: [u8; 4] = self.address.get(..4)?.try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            AddressFamily::Inet6 => {
                let octets: [u8; 16] = self.address.get(..16)?.try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            AddressFamily::Other(_) => None,
        }
    }

    fn is_truncated(&self) -> bool {
        match self.family {
            AddressFamily::Inet => self.address.len() < 4,
            AddressFamily::Inet6 => self.address.len() < 16,
            AddressFamily::Other(_) => false,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ip(), self.family) {
            (Some(ip), _) => write!(f, "{}", SocketAddr::new(ip, self.port)),
            (None, AddressFamily::Other(n)) => write!(f, "<family {}>:{}", n, self.port),
            (None, _) => write!(f, "<truncated>:{}", self.port),
        }
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(v4) => Self::new(AddressFamily::Inet, v4.octets(), addr.port()),
            IpAddr::V6(v6) => Self::new(AddressFamily::Inet6, v6.octets(), addr.port()),
        }
    }
}

/// The original host and port a redirected connection tunnels to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&authority(&self.host, self.port))
    }
}

/// Outcome of routing one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Proceed with the original destination untouched
    Passthrough,
    Reject(RejectReason),
    /// Tunnel through the proxy to the original host
    Redirect(Target),
}

/// Applies the policy snapshot to connection attempts
#[derive(Debug, Clone)]
pub struct Router {
    snapshot: Arc<PolicySnapshot>,
    allocator: Arc<VirtualAddressAllocator>,
}

impl Router {
    pub fn new(snapshot: Arc<PolicySnapshot>, allocator: Arc<VirtualAddressAllocator>) -> Self {
        Self { snapshot, allocator }
    }

    pub fn snapshot(&self) -> &PolicySnapshot {
        &self.snapshot
    }

    /// Decide what to do with one attempt
    ///
    /// The checks run in a fixed order; the first one that applies wins.
    pub fn decide(&self, destination: Option<&Destination>, socket_type: SocketType) -> Decision {
        let decision = self.evaluate(destination, socket_type);
        trace!("route {:?} {:?} -> {:?}", destination, socket_type, decision);
        decision
    }

    fn evaluate(&self, destination: Option<&Destination>, socket_type: SocketType) -> Decision {
        let policy = &*self.snapshot;
        let enabled = policy.proxy_enabled();

        let dest = match destination {
            Some(d) if !d.is_truncated() => d,
            _ => return Decision::Reject(RejectReason::InvalidArgument),
        };
        let port = dest.port;

        // Mapped addresses are handled as their IPv4 form from here on
        let ip = dest.ip().map(|ip| ip.to_canonical());

        if enabled && socket_type == SocketType::Datagram && policy.udp_mode == UdpMode::Block {
            let loopback = ip.is_some_and(|ip| ip.is_loopback());
            if !loopback && !policy.udp_exempt_ports.contains(&port) {
                return Decision::Reject(RejectReason::NetworkUnreachable);
            }
        }

        let Some(ip) = ip else {
            return if enabled {
                Decision::Reject(RejectReason::AddressFamilyUnsupported)
            } else {
                Decision::Passthrough
            };
        };

        if ip.is_ipv6() {
            match policy.ipv6_mode {
                Ipv6Mode::Direct => return Decision::Passthrough,
                Ipv6Mode::Block => return Decision::Reject(RejectReason::AddressFamilyUnsupported),
                Ipv6Mode::Proxy => {}
            }
        }

        let (host, is_virtual) = self.original_host(ip);

        if ip.is_loopback() || self.is_proxy_endpoint(ip, &host, port) {
            return Decision::Passthrough;
        }

        if port == DNS_PORT && policy.dns_mode == DnsMode::Direct {
            return Decision::Passthrough;
        }

        if !policy.is_port_allowed(port) {
            return Decision::Passthrough;
        }

        // Only streams are tunnelled; unblocked datagrams go out directly
        if !enabled || socket_type == SocketType::Datagram {
            return Decision::Passthrough;
        }

        // Address criteria never match a synthetic address
        let literal = if is_virtual { None } else { Some(ip) };
        match policy.routing.evaluate(&host, literal, port) {
            None | Some((RuleAction::Proxy, _)) => Decision::Redirect(Target::new(host, port)),
            Some((RuleAction::Direct, _)) => Decision::Passthrough,
            Some((RuleAction::Block, rule)) => Decision::Reject(RejectReason::RuleBlocked(rule.to_string())),
        }
    }

    /// Recover the host the application asked for
    ///
    /// A stale virtual address (slot evicted) falls back to its literal text.
    fn original_host(&self, ip: IpAddr) -> (String, bool) {
        if let IpAddr::V4(v4) = ip {
            if self.allocator.is_virtual(v4) {
                let host = self.allocator.reverse_lookup(v4).unwrap_or_else(|| {
                    trace!("fake_ip: {} has no binding, using literal", v4);
                    v4.to_string()
                });
                return (host, true);
            }
        }
        (ip.to_string(), false)
    }

    fn is_proxy_endpoint(&self, ip: IpAddr, host: &str, port: u16) -> bool {
        let proxy = &self.snapshot.proxy;
        if port != proxy.port {
            return false;
        }
        match proxy.host.parse::<IpAddr>() {
            Ok(proxy_ip) => proxy_ip.to_canonical() == ip,
            Err(_) => proxy
                .host
                .trim_end_matches('.')
                .eq_ignore_ascii_case(host.trim_end_matches('.')),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{RoutingSection, RuleSpec};
    use crate::filter::rules::RuleSet;

    fn router_with(snapshot: PolicySnapshot) -> Router {
        let allocator = Arc::new(VirtualAddressAllocator::new(&snapshot.fake_ip.cidr));
        Router::new(Arc::new(snapshot), allocator)
    }

    fn router() -> Router {
        router_with(PolicySnapshot::default())
    }

    fn v4(a: [u8; 4], port: u16) -> Destination {
        Destination::new(AddressFamily::Inet, a, port)
    }

    fn stream(router: &Router, dest: &Destination) -> Decision {
        router.decide(Some(dest), SocketType::Stream)
    }

    #[test]
    fn test_virtual_address_redirects_to_domain() {
        let router = router();
        let addr = router.allocator.allocate("example.com").unwrap();

        let decision = stream(&router, &v4(addr.octets(), 443));
        assert_eq!(decision, Decision::Redirect(Target::new("example.com", 443)));
    }

    #[test]
    fn test_port_not_allowlisted_passes_through() {
        let router = router();
        assert_eq!(stream(&router, &v4([1, 2, 3, 4], 22)), Decision::Passthrough);
        assert_eq!(
            stream(&router, &v4([1, 2, 3, 4], 443)),
            Decision::Redirect(Target::new("1.2.3.4", 443))
        );
    }

    #[test]
    fn test_proxy_endpoint_bypass() {
        let mut snapshot = PolicySnapshot::default();
        snapshot.proxy.host = "10.1.1.1".to_string();
        snapshot.proxy.port = 443;
        let router = router_with(snapshot);

        assert_eq!(stream(&router, &v4([10, 1, 1, 1], 443)), Decision::Passthrough);
        assert!(matches!(stream(&router, &v4([10, 1, 1, 2], 443)), Decision::Redirect(_)));
    }

    #[test]
    fn test_proxy_endpoint_by_name() {
        let mut snapshot = PolicySnapshot::default();
        snapshot.proxy.host = "proxy.corp".to_string();
        snapshot.proxy.port = 443;
        let router = router_with(snapshot);
        let addr = router.allocator.allocate("proxy.corp").unwrap();
        assert_eq!(stream(&router, &v4(addr.octets(), 443)), Decision::Passthrough);

        // Rebound under a different spelling of the same name
        router.allocator.allocate("Proxy.Corp.").unwrap();
        assert_eq!(stream(&router, &v4(addr.octets(), 443)), Decision::Passthrough);
    }

    #[test]
    fn test_loopback_bypass() {
        let router = router();
        assert_eq!(stream(&router, &v4([127, 0, 0, 1], 443)), Decision::Passthrough);

        let v6 = Destination::new(AddressFamily::Inet6, Ipv6Addr::LOCALHOST.octets(), 443);
        assert_eq!(stream(&router, &v6), Decision::Passthrough);
    }

    #[test]
    fn test_udp_block() {
        let router = router();
        let udp = |d: &Destination| router.decide(Some(d), SocketType::Datagram);

        assert_eq!(
            udp(&v4([8, 8, 8, 8], 443)),
            Decision::Reject(RejectReason::NetworkUnreachable)
        );
        assert_eq!(udp(&v4([127, 0, 0, 1], 9999)), Decision::Passthrough);
        assert_eq!(udp(&v4([8, 8, 8, 8], 53)), Decision::Passthrough);
    }

    #[test]
    fn test_udp_direct_mode_is_not_blocked() {
        let mut snapshot = PolicySnapshot::default();
        snapshot.udp_mode = UdpMode::Direct;
        let router = router_with(snapshot);

        assert_eq!(
            router.decide(Some(&v4([8, 8, 8, 8], 80)), SocketType::Datagram),
            Decision::Passthrough
        );
    }

    #[test]
    fn test_udp_exempt_ports_are_configurable() {
        let mut snapshot = PolicySnapshot::default();
        snapshot.udp_exempt_ports.insert(123);
        let router = router_with(snapshot);

        assert_eq!(
            router.decide(Some(&v4([8, 8, 8, 8], 123)), SocketType::Datagram),
            Decision::Passthrough
        );
    }

    #[test]
    fn test_malformed_input() {
        let router = router();
        assert_eq!(
            router.decide(None, SocketType::Stream),
            Decision::Reject(RejectReason::InvalidArgument)
        );
        assert_eq!(
            stream(&router, &Destination::new(AddressFamily::Inet, vec![1, 2], 80)),
            Decision::Reject(RejectReason::InvalidArgument)
        );
        assert_eq!(
            stream(&router, &Destination::new(AddressFamily::Inet6, vec![0; 8], 80)),
            Decision::Reject(RejectReason::InvalidArgument)
        );
    }

    #[test]
    fn test_unknown_family() {
        let unix = Destination::new(AddressFamily::Other(1), Vec::new(), 0);
        assert_eq!(
            stream(&router(), &unix),
            Decision::Reject(RejectReason::AddressFamilyUnsupported)
        );

        let mut snapshot = PolicySnapshot::default();
        snapshot.proxy.port = 0;
        assert_eq!(stream(&router_with(snapshot), &unix), Decision::Passthrough);
    }

    #[test]
    fn test_ipv6_modes() {
        let dest = Destination::new(
            AddressFamily::Inet6,
            "2001:db8::1".parse::<Ipv6Addr>().unwrap().octets(),
            443,
        );

        assert_eq!(
            stream(&router(), &dest),
            Decision::Redirect(Target::new("2001:db8::1", 443))
        );

        let mut snapshot = PolicySnapshot::default();
        snapshot.ipv6_mode = Ipv6Mode::Direct;
        assert_eq!(stream(&router_with(snapshot), &dest), Decision::Passthrough);

        let mut snapshot = PolicySnapshot::default();
        snapshot.ipv6_mode = Ipv6Mode::Block;
        assert_eq!(
            stream(&router_with(snapshot), &dest),
            Decision::Reject(RejectReason::AddressFamilyUnsupported)
        );
    }

    #[test]
    fn test_mapped_ipv6_is_treated_as_ipv4() {
        let mut snapshot = PolicySnapshot::default();
        snapshot.ipv6_mode = Ipv6Mode::Block;
        let router = router_with(snapshot);
        let addr = router.allocator.allocate("example.com").unwrap();

        let dest = Destination::new(AddressFamily::Inet6, addr.to_ipv6_mapped().octets(), 443);
        assert_eq!(stream(&router, &dest), Decision::Redirect(Target::new("example.com", 443)));
    }

    #[test]
    fn test_evicted_virtual_address_uses_literal() {
        let mut snapshot = PolicySnapshot::default();
        snapshot.fake_ip.cidr = "10.99.0.0/24".to_string();
        let router = router_with(snapshot);

        assert_eq!(
            stream(&router, &v4([10, 99, 0, 77], 443)),
            Decision::Redirect(Target::new("10.99.0.77", 443))
        );
    }

    #[test]
    fn test_dns_modes() {
        let mut snapshot = PolicySnapshot::default();
        snapshot.allowed_ports.clear();
        assert_eq!(stream(&router_with(snapshot.clone()), &v4([9, 9, 9, 9], 53)), Decision::Passthrough);

        snapshot.dns_mode = DnsMode::Proxy;
        assert_eq!(
            stream(&router_with(snapshot), &v4([9, 9, 9, 9], 53)),
            Decision::Redirect(Target::new("9.9.9.9", 53))
        );
    }

    #[test]
    fn test_proxy_disabled_passes_through() {
        let mut snapshot = PolicySnapshot::default();
        snapshot.proxy.port = 0;
        let router = router_with(snapshot);

        assert_eq!(stream(&router, &v4([1, 2, 3, 4], 443)), Decision::Passthrough);
        assert_eq!(
            router.decide(Some(&v4([8, 8, 8, 8], 443)), SocketType::Datagram),
            Decision::Passthrough
        );
    }

    #[test]
    fn test_rule_layer_refines_redirects() {
        let mut direct = RuleSpec::new("corp", "direct");
        direct.domains = vec![".corp.example".to_string()];
        let mut block = RuleSpec::new("ads", "block");
        block.domains = vec!["ads.*".to_string()];

        let mut snapshot = PolicySnapshot::default();
        snapshot.routing = RuleSet::from_section(&RoutingSection {
            enabled: true,
            rules: vec![direct, block],
            ..RoutingSection::default()
        })
        .unwrap();
        let router = router_with(snapshot);

        let corp = router.allocator.allocate("git.corp.example").unwrap();
        assert_eq!(stream(&router, &v4(corp.octets(), 443)), Decision::Passthrough);

        let ads = router.allocator.allocate("ads.tracker.net").unwrap();
        assert_eq!(
            stream(&router, &v4(ads.octets(), 443)),
            Decision::Reject(RejectReason::RuleBlocked("ads".to_string()))
        );

        // Private ranges go direct through the built-in rule
        assert_eq!(stream(&router, &v4([192, 168, 1, 10], 443)), Decision::Passthrough);

        let other = router.allocator.allocate("example.com").unwrap();
        assert!(matches!(stream(&router, &v4(other.octets(), 443)), Decision::Redirect(_)));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::new("example.com", 443).to_string(), "example.com:443");
        assert_eq!(Target::new("2001:db8::1", 443).to_string(), "[2001:db8::1]:443");
    }
}
