//! Host, IP and port matching logic for routing rules

use super::rules::PortRange;
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::IpAddr;
use wildmatch::WildMatch;

/// Matcher for hosts, IP ranges and destination ports
///
/// Each criterion that has entries must match; empty criteria are ignored.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    patterns: Vec<WildMatch>,
    ipv4_ranges: Vec<Ipv4Net>,
    ipv6_ranges: Vec<Ipv6Net>,
    ports: Vec<PortRange>,
}

impl HostMatcher {
    /// Create a new empty matcher
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
            ipv4_ranges: Vec::new(),
            ipv6_ranges: Vec::new(),
            ports: Vec::new(),
        }
    }

    /// Add a wildcard pattern for host matching
    ///
    /// A leading dot (".corp.example") matches the bare domain and every subdomain.
    pub fn add_pattern(&mut self, pattern: &str) {
        let pattern = pattern.trim().to_ascii_lowercase();
        if let Some(bare) = pattern.strip_prefix('.') {
            self.patterns.push(WildMatch::new(bare));
            self.patterns.push(WildMatch::new(&format!("*.{bare}")));
        } else {
            self.patterns.push(WildMatch::new(&pattern));
        }
    }

    /// Add an IPv4 CIDR range
    pub fn add_ipv4_range(&mut self, range: Ipv4Net) {
        self.ipv4_ranges.push(range);
    }

    /// Add an IPv6 CIDR range
    pub fn add_ipv6_range(&mut self, range: Ipv6Net) {
        self.ipv6_ranges.push(range);
    }

    /// Add a destination port range
    pub fn add_ports(&mut self, range: PortRange) {
        self.ports.push(range);
    }

    /// Check if a hostname matches any pattern
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.patterns.iter().any(|p| p.matches(&host))
    }

    /// Check if an IP address matches any range
    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ipv4) => self.ipv4_ranges.iter().any(|net| net.contains(&ipv4)),
            IpAddr::V6(ipv6) => self.ipv6_ranges.iter().any(|net| net.contains(&ipv6)),
        }
    }

    pub fn matches_port(&self, port: u16) -> bool {
        self.ports.iter().any(|r| r.contains(port))
    }

    fn has_address_criteria(&self) -> bool {
        !self.patterns.is_empty() || !self.ipv4_ranges.is_empty() || !self.ipv6_ranges.is_empty()
    }

    /// Check a destination against every configured criterion
    ///
    /// Host patterns and IP ranges together form the address criterion: either may
    /// satisfy it. `ip` is `None` when the destination was a virtual address.
    pub fn matches(&self, host: &str, ip: Option<IpAddr>, port: u16) -> bool {
        if self.has_address_criteria() {
            let by_host = self.matches_host(host);
            let by_ip = ip.map(|a| self.matches_ip(a)).unwrap_or(false);
            if !by_host && !by_ip {
                return false;
            }
        }

        self.ports.is_empty() || self.matches_port(port)
    }

    /// Check if matcher has any criteria at all
    pub fn is_empty(&self) -> bool {
        !self.has_address_criteria() && self.ports.is_empty()
    }
}

impl Default for HostMatcher {
    fn default() -> Self {
        Self::new()
    }
}
