//! Ordered routing rules applied to connections that would otherwise be redirected

use super::matcher::HostMatcher;
use crate::config::schema::{RoutingSection, RuleSpec};
use crate::error::{Result, ValidationError};
use ipnet::{Ipv4Net, Ipv6Net};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Name reported when no rule matched and the default action applied
pub const DEFAULT_RULE_NAME: &str = "default";

/// Name of the built-in rule sending private ranges direct
pub const DEFAULT_PRIVATE_RULE_NAME: &str = "default-private";

const DEFAULT_PRIVATE_V4: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
];

const DEFAULT_PRIVATE_V6: &[&str] = &["fc00::/7", "fe80::/10", "::1/128"];

/// What a matching rule does with the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Proxy,
    Direct,
    Block,
}

impl RuleAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proxy" => Some(RuleAction::Proxy),
            "direct" => Some(RuleAction::Direct),
            "block" => Some(RuleAction::Block),
            _ => None,
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Proxy => write!(f, "proxy"),
            RuleAction::Direct => write!(f, "direct"),
            RuleAction::Block => write!(f, "block"),
        }
    }
}

/// Inclusive destination port range, written as "443" or "10000-20000"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

impl FromStr for PortRange {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidPorts { spec: s.to_string() };
        let s = s.trim();

        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (
                a.trim().parse::<u16>().map_err(|_| invalid())?,
                b.trim().parse::<u16>().map_err(|_| invalid())?,
            ),
            None => {
                let port = s.parse::<u16>().map_err(|_| invalid())?;
                (port, port)
            }
        };

        if start > end {
            return Err(invalid());
        }

        Ok(PortRange { start, end })
    }
}

/// A compiled routing rule
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    pub action: RuleAction,
    pub priority: i32,
    matcher: HostMatcher,
}

impl RoutingRule {
    fn from_spec(spec: &RuleSpec) -> Result<Self> {
        let action = RuleAction::parse(&spec.action).ok_or_else(|| ValidationError::InvalidAction {
            action: spec.action.clone(),
        })?;

        let mut matcher = HostMatcher::new();
        for pattern in &spec.domains {
            matcher.add_pattern(pattern);
        }
        for cidr in &spec.ip_cidrs_v4 {
            let range = cidr
                .trim()
                .parse::<Ipv4Net>()
                .map_err(|_| ValidationError::InvalidCidr { cidr: cidr.clone() })?;
            matcher.add_ipv4_range(range);
        }
        for cidr in &spec.ip_cidrs_v6 {
            let range = cidr
                .trim()
                .parse::<Ipv6Net>()
                .map_err(|_| ValidationError::InvalidCidr { cidr: cidr.clone() })?;
            matcher.add_ipv6_range(range);
        }
        for ports in &spec.ports {
            matcher.add_ports(ports.parse()?);
        }

        Ok(Self {
            name: spec.name.clone(),
            action,
            priority: spec.priority,
            matcher,
        })
    }

    fn default_private() -> Self {
        let mut matcher = HostMatcher::new();
        for cidr in DEFAULT_PRIVATE_V4 {
            if let Ok(range) = cidr.parse::<Ipv4Net>() {
                matcher.add_ipv4_range(range);
            }
        }
        for cidr in DEFAULT_PRIVATE_V6 {
            if let Ok(range) = cidr.parse::<Ipv6Net>() {
                matcher.add_ipv6_range(range);
            }
        }

        Self {
            name: DEFAULT_PRIVATE_RULE_NAME.to_string(),
            action: RuleAction::Direct,
            priority: i32::MIN,
            matcher,
        }
    }

    pub fn matches(&self, host: &str, ip: Option<IpAddr>, port: u16) -> bool {
        self.matcher.matches(host, ip, port)
    }
}

/// The ordered rule list plus its fallback action
#[derive(Debug, Clone)]
pub struct RuleSet {
    enabled: bool,
    default_action: RuleAction,
    rules: Vec<RoutingRule>,
}

impl RuleSet {
    /// A rule set that never alters a redirect
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            default_action: RuleAction::Proxy,
            rules: Vec::new(),
        }
    }

    /// Compile the `[routing]` section
    pub fn from_section(section: &RoutingSection) -> Result<Self> {
        let default_action =
            RuleAction::parse(&section.default_action).ok_or_else(|| ValidationError::InvalidAction {
                action: section.default_action.clone(),
            })?;

        let mut rules = section
            .rules
            .iter()
            .filter(|spec| spec.enabled)
            .map(RoutingRule::from_spec)
            .collect::<Result<Vec<_>>>()?;

        if section.priority_mode.trim().eq_ignore_ascii_case("number") {
            // Stable sort keeps file order for equal priorities
            rules.sort_by_key(|r| r.priority);
        }

        if section.use_default_private {
            rules.insert(0, RoutingRule::default_private());
        }

        Ok(Self {
            enabled: section.enabled,
            default_action,
            rules,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Evaluate the rules for one destination
    ///
    /// Returns `None` when the layer is disabled, otherwise the action and the name of
    /// the rule that produced it.
    pub fn evaluate(&self, host: &str, ip: Option<IpAddr>, port: u16) -> Option<(RuleAction, &str)> {
        if !self.enabled {
            return None;
        }

        let verdict = self
            .rules
            .iter()
            .find(|rule| rule.matches(host, ip, port))
            .map(|rule| (rule.action, rule.name.as_str()))
            .unwrap_or((self.default_action, DEFAULT_RULE_NAME));

        Some(verdict)
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::disabled()
    }
}
