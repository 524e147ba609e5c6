//! Immutable routing policy built once from the loaded configuration

use super::schema::{default_fake_ip_cidr, default_timeout_ms, Config};
use super::validator::ConfigValidator;
use crate::error::Result;
use crate::filter::rules::RuleSet;
use crate::handshake::ProxyProtocol;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tracing::warn;

const FALLBACK_PROXY_HOST: &str = "127.0.0.1";
const FALLBACK_PROXY_PORT: u16 = 7890;

/// How DNS (port 53) connections are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsMode {
    #[default]
    Direct,
    Proxy,
}

/// How genuine IPv6 destinations are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ipv6Mode {
    #[default]
    Proxy,
    Direct,
    Block,
}

/// How datagram sockets are treated while proxying is enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdpMode {
    /// Refuse datagrams so applications fall back to TCP
    #[default]
    Block,
    Direct,
}

/// Upstream proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
}

impl ProxyEndpoint {
    /// Redirection is active only when a proxy port is configured
    pub fn is_enabled(&self) -> bool {
        self.port != 0
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Per-phase timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub send: Duration,
    pub recv: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        let ms = Duration::from_millis(default_timeout_ms() as u64);
        Self {
            connect: ms,
            send: ms,
            recv: ms,
        }
    }
}

/// Virtual address settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeIpSettings {
    pub enabled: bool,
    pub cidr: String,
}

impl Default for FakeIpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cidr: default_fake_ip_cidr(),
        }
    }
}

/// Read-only view of every rule the engine consults
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub proxy: ProxyEndpoint,
    pub fake_ip: FakeIpSettings,
    pub timeouts: Timeouts,
    /// Empty means every port is eligible for proxying
    pub allowed_ports: BTreeSet<u16>,
    pub dns_mode: DnsMode,
    pub ipv6_mode: Ipv6Mode,
    pub udp_mode: UdpMode,
    pub udp_exempt_ports: BTreeSet<u16>,
    pub routing: RuleSet,
    pub traffic_logging: bool,
}

impl PolicySnapshot {
    /// Validate and normalise a configuration into a snapshot
    ///
    /// Rule-layer errors are fatal; scalar fields with bad values fall back to their
    /// defaults with a warning.
    pub fn from_config(config: &Config) -> Result<Self> {
        ConfigValidator::validate(config)?;

        let protocol = ProxyProtocol::parse(&config.proxy.kind).unwrap_or_else(|| {
            warn!("config: proxy.type invalid ({}), using socks5 (socks5/http)", config.proxy.kind);
            ProxyProtocol::Socks5
        });

        let host = config.proxy.host.trim();
        let host = if host.is_empty() {
            warn!("config: proxy.host empty, using {}", FALLBACK_PROXY_HOST);
            FALLBACK_PROXY_HOST.to_string()
        } else {
            host.to_string()
        };

        let port = u16::try_from(config.proxy.port).unwrap_or_else(|_| {
            warn!(
                "config: proxy.port out of range ({}), using {}",
                config.proxy.port, FALLBACK_PROXY_PORT
            );
            FALLBACK_PROXY_PORT
        });

        let timeouts = Timeouts {
            connect: positive_ms("timeout.connect", config.timeout.connect),
            send: positive_ms("timeout.send", config.timeout.send),
            recv: positive_ms("timeout.recv", config.timeout.recv),
        };

        let rules = &config.proxy_rules;
        let dns_mode = choose("proxy_rules.dns_mode", &rules.dns_mode, DnsMode::Direct, |s| match s {
            "direct" => Some(DnsMode::Direct),
            "proxy" => Some(DnsMode::Proxy),
            _ => None,
        });
        let ipv6_mode = choose("proxy_rules.ipv6_mode", &rules.ipv6_mode, Ipv6Mode::Proxy, |s| match s {
            "proxy" => Some(Ipv6Mode::Proxy),
            "direct" => Some(Ipv6Mode::Direct),
            "block" => Some(Ipv6Mode::Block),
            _ => None,
        });
        let udp_mode = choose("proxy_rules.udp_mode", &rules.udp_mode, UdpMode::Block, |s| match s {
            "block" => Some(UdpMode::Block),
            "direct" => Some(UdpMode::Direct),
            _ => None,
        });

        let snapshot = Self {
            proxy: ProxyEndpoint { host, port, protocol },
            fake_ip: FakeIpSettings {
                enabled: config.fake_ip.enabled,
                cidr: config.fake_ip.cidr.trim().to_string(),
            },
            timeouts,
            allowed_ports: rules.allowed_ports.iter().copied().collect(),
            dns_mode,
            ipv6_mode,
            udp_mode,
            udp_exempt_ports: rules.udp_exempt_ports.iter().copied().collect(),
            routing: RuleSet::from_section(&config.routing)?,
            traffic_logging: config.common.traffic_logging,
        };

        tracing::info!(
            "policy: proxy={} allowed_ports={} dns_mode={:?} ipv6_mode={:?} udp_mode={:?} fake_ip={} routing={}",
            snapshot.proxy,
            snapshot.allowed_ports.len(),
            snapshot.dns_mode,
            snapshot.ipv6_mode,
            snapshot.udp_mode,
            snapshot.fake_ip.enabled,
            snapshot.routing.is_enabled()
        );

        Ok(snapshot)
    }

    /// Check the port allowlist (empty list = every port allowed)
    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.is_empty() || self.allowed_ports.contains(&port)
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy.is_enabled()
    }
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            proxy: ProxyEndpoint {
                host: FALLBACK_PROXY_HOST.to_string(),
                port: FALLBACK_PROXY_PORT,
                protocol: ProxyProtocol::Socks5,
            },
            fake_ip: FakeIpSettings::default(),
            timeouts: Timeouts::default(),
            allowed_ports: [80, 443].into_iter().collect(),
            dns_mode: DnsMode::Direct,
            ipv6_mode: Ipv6Mode::Proxy,
            udp_mode: UdpMode::Block,
            udp_exempt_ports: [53].into_iter().collect(),
            routing: RuleSet::disabled(),
            traffic_logging: false,
        }
    }
}

fn positive_ms(field: &str, value: i64) -> Duration {
    if value > 0 {
        Duration::from_millis(value as u64)
    } else {
        warn!("config: {} invalid ({}), using {}", field, value, default_timeout_ms());
        Duration::from_millis(default_timeout_ms() as u64)
    }
}

fn choose<T: fmt::Debug>(field: &str, raw: &str, default: T, parse: impl Fn(&str) -> Option<T>) -> T {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return default;
    }
    parse(&normalized).unwrap_or_else(|| {
        warn!("config: {} invalid ({}), using {:?}", field, raw, default);
        default
    })
}
