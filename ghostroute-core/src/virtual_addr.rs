//! Ring allocator handing out synthetic IPv4 addresses for domain names
//!
//! Each domain gets one address from the configured block. When the cursor wraps
//! onto a slot that is still bound, the previous owner is evicted; its reverse
//! lookup then returns nothing and callers fall back to the literal address.

use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Block used when the configured CIDR does not parse
pub const DEFAULT_VIRTUAL_CIDR: &str = "198.18.0.0/15";

#[derive(Debug, Default)]
struct Bindings {
    /// Keyed by the normalised domain
    by_domain: HashMap<String, u32>,
    /// The spelling of the most recent caller
    by_offset: HashMap<u32, String>,
    cursor: u32,
}

/// Bidirectional domain/address table over one CIDR block
#[derive(Debug)]
pub struct VirtualAddressAllocator {
    network: Ipv4Net,
    size: u64,
    bindings: Mutex<Bindings>,
}

impl VirtualAddressAllocator {
    /// Build an allocator for `cidr`, falling back to the default block on parse failure
    pub fn new(cidr: &str) -> Self {
        let network = match cidr.trim().parse::<Ipv4Net>() {
            Ok(net) => net.trunc(),
            Err(_) => {
                warn!(
                    "fake_ip: invalid cidr {:?}, using {}",
                    cidr, DEFAULT_VIRTUAL_CIDR
                );
                default_network()
            }
        };
        let size = 1u64 << (32 - u32::from(network.prefix_len()));

        debug!("fake_ip: block {} ({} addresses)", network, size);

        Self {
            network,
            size,
            bindings: Mutex::new(Bindings::default()),
        }
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Number of addresses in the block, including the reserved first and last
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_virtual(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
    }

    /// Like [`is_virtual`](Self::is_virtual), also accepting IPv4-mapped IPv6
    pub fn is_virtual_ip(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.is_virtual(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(|v4| self.is_virtual(v4)),
        }
    }

    /// Return the domain's address, binding a new slot if it has none
    ///
    /// Spellings differing only in case or a trailing dot share one address;
    /// reverse lookup returns the spelling of the latest call.
    /// Returns `None` when the block has no usable addresses.
    pub fn allocate(&self, domain: &str) -> Option<Ipv4Addr> {
        if self.size <= 2 {
            return None;
        }
        let key = normalize(domain);

        let mut bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&offset) = bindings.by_domain.get(&key) {
            if bindings.by_offset.get(&offset).map(String::as_str) != Some(domain) {
                bindings.by_offset.insert(offset, domain.to_string());
            }
            return Some(self.address_at(offset));
        }

        // Usable offsets are 1..=size-2
        let usable = (self.size - 2) as u32;
        let offset = bindings.cursor % usable + 1;
        bindings.cursor = offset;

        if let Some(evicted) = bindings.by_offset.remove(&offset) {
            debug!("fake_ip: slot {} reused, evicting {}", self.address_at(offset), evicted);
            bindings.by_domain.remove(&normalize(&evicted));
        }
        let addr = self.address_at(offset);
        info!("fake_ip: {} -> {}", domain, addr);
        bindings.by_offset.insert(offset, domain.to_string());
        bindings.by_domain.insert(key, offset);

        Some(addr)
    }

    /// Domain currently bound to `addr`, if any
    pub fn reverse_lookup(&self, addr: Ipv4Addr) -> Option<String> {
        if !self.is_virtual(addr) {
            return None;
        }
        let offset = u32::from(addr) - u32::from(self.network.network());

        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        bindings.by_offset.get(&offset).cloned()
    }

    /// Number of live bindings
    pub fn len(&self) -> usize {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_domain
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn address_at(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network.network()) + offset)
    }
}

impl Default for VirtualAddressAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_CIDR)
    }
}

fn default_network() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(198, 18, 0, 0), 15).unwrap_or_default()
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}
