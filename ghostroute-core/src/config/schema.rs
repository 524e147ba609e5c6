//! Configuration schema types

use serde::{Deserialize, Serialize};

/// Complete configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub fake_ip: FakeIpSection,
    #[serde(default)]
    pub timeout: TimeoutSection,
    #[serde(default)]
    pub proxy_rules: ProxyRulesSection,
    #[serde(default)]
    pub routing: RoutingSection,
}

/// Settings that are not part of the routing policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log every first-write flush and completion at info level
    #[serde(default)]
    pub traffic_logging: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            traffic_logging: false,
        }
    }
}

impl CommonConfig {
    /// Parse `log_level`, accepting short forms; unknown values mean info
    pub fn level(&self) -> tracing::Level {
        parse_log_level(&self.log_level).unwrap_or_else(|| {
            tracing::warn!(
                "config: log_level invalid ({}), using info (debug/info/warn/error)",
                self.log_level
            );
            tracing::Level::INFO
        })
    }
}

pub fn parse_log_level(s: &str) -> Option<tracing::Level> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" | "d" | "verbose" => Some(tracing::Level::DEBUG),
        "info" | "i" => Some(tracing::Level::INFO),
        "warn" | "warning" | "w" => Some(tracing::Level::WARN),
        "error" | "err" | "e" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

/// Upstream proxy endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySection {
    #[serde(default = "default_proxy_host")]
    pub host: String,
    /// Kept wide so out-of-range values can be reported and replaced
    #[serde(default = "default_proxy_port")]
    pub port: i64,
    #[serde(default = "default_proxy_type", rename = "type")]
    pub kind: String,
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> i64 {
    7890
}

fn default_proxy_type() -> String {
    "socks5".to_string()
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
            kind: default_proxy_type(),
        }
    }
}

/// Virtual address block used for synthesized name resolution
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FakeIpSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fake_ip_cidr")]
    pub cidr: String,
}

fn default_true() -> bool {
    true
}

pub(crate) fn default_fake_ip_cidr() -> String {
    "198.18.0.0/15".to_string()
}

impl Default for FakeIpSection {
    fn default() -> Self {
        Self {
            enabled: true,
            cidr: default_fake_ip_cidr(),
        }
    }
}

/// Per-phase timeouts in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutSection {
    #[serde(default = "default_timeout_ms")]
    pub connect: i64,
    #[serde(default = "default_timeout_ms")]
    pub send: i64,
    #[serde(default = "default_timeout_ms")]
    pub recv: i64,
}

pub(crate) fn default_timeout_ms() -> i64 {
    5000
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect: default_timeout_ms(),
            send: default_timeout_ms(),
            recv: default_timeout_ms(),
        }
    }
}

/// Port allowlist and per-traffic-class handling modes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyRulesSection {
    /// Destination ports eligible for proxying (empty = all ports)
    #[serde(default = "default_allowed_ports")]
    pub allowed_ports: Vec<u16>,
    #[serde(default = "default_dns_mode")]
    pub dns_mode: String,
    #[serde(default = "default_ipv6_mode")]
    pub ipv6_mode: String,
    #[serde(default = "default_udp_mode")]
    pub udp_mode: String,
    /// Datagram destination ports still allowed while UDP is blocked
    #[serde(default = "default_udp_exempt_ports")]
    pub udp_exempt_ports: Vec<u16>,
}

fn default_allowed_ports() -> Vec<u16> {
    vec![80, 443]
}

fn default_dns_mode() -> String {
    "direct".to_string()
}

fn default_ipv6_mode() -> String {
    "proxy".to_string()
}

fn default_udp_mode() -> String {
    "block".to_string()
}

fn default_udp_exempt_ports() -> Vec<u16> {
    vec![53]
}

impl Default for ProxyRulesSection {
    fn default() -> Self {
        Self {
            allowed_ports: default_allowed_ports(),
            dns_mode: default_dns_mode(),
            ipv6_mode: default_ipv6_mode(),
            udp_mode: default_udp_mode(),
            udp_exempt_ports: default_udp_exempt_ports(),
        }
    }
}

/// Optional rule layer refining redirects
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_action")]
    pub default_action: String,
    /// "order" (file order) or "number" (ascending priority)
    #[serde(default = "default_priority_mode")]
    pub priority_mode: String,
    /// Send private, link-local and loopback ranges direct before user rules
    #[serde(default = "default_true")]
    pub use_default_private: bool,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

fn default_action() -> String {
    "proxy".to_string()
}

fn default_priority_mode() -> String {
    "order".to_string()
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            default_action: default_action(),
            priority_mode: default_priority_mode(),
            use_default_private: true,
            rules: Vec::new(),
        }
    }
}

/// A single routing rule as written in the config file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub ip_cidrs_v4: Vec<String>,
    #[serde(default)]
    pub ip_cidrs_v6: Vec<String>,
    /// Wildcard host patterns; a leading "." also matches the bare domain
    #[serde(default)]
    pub domains: Vec<String>,
    /// "443" or "10000-20000"
    #[serde(default)]
    pub ports: Vec<String>,
}

impl RuleSpec {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            action: action.into(),
            priority: 0,
            ip_cidrs_v4: Vec::new(),
            ip_cidrs_v6: Vec::new(),
            domains: Vec::new(),
            ports: Vec::new(),
        }
    }
}
