//! Name resolution boundary: synthesises virtual addresses for domain names

use crate::config::PolicySnapshot;
use crate::filter::AddressFamily;
use crate::virtual_addr::VirtualAddressAllocator;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, warn};

/// Answers name lookups, with virtual addresses when enabled
#[derive(Debug, Clone)]
pub struct NameResolver {
    snapshot: Arc<PolicySnapshot>,
    allocator: Arc<VirtualAddressAllocator>,
}

impl NameResolver {
    pub fn new(snapshot: Arc<PolicySnapshot>, allocator: Arc<VirtualAddressAllocator>) -> Self {
        Self { snapshot, allocator }
    }

    /// Resolve `name` for the requested family (`None` = any)
    pub fn resolve(&self, name: &str, family: Option<AddressFamily>) -> io::Result<Vec<IpAddr>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty host name"));
        }

        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        if !self.snapshot.fake_ip.enabled || is_localhost(name) {
            return real_resolve(name, family);
        }

        match self.allocator.allocate(name) {
            Some(v4) => {
                debug!("resolve: {} -> {} (virtual)", name, v4);
                let ip = match family {
                    Some(AddressFamily::Inet6) => IpAddr::V6(v4.to_ipv6_mapped()),
                    _ => IpAddr::V4(v4),
                };
                Ok(vec![ip])
            }
            None => {
                warn!(
                    "resolve: virtual block {} has no free addresses, resolving {} normally",
                    self.allocator.network(),
                    name
                );
                real_resolve(name, family)
            }
        }
    }

    /// Domain a virtual address stands for, if still bound
    pub fn reverse(&self, ip: IpAddr) -> Option<String> {
        match ip.to_canonical() {
            IpAddr::V4(v4) => self.allocator.reverse_lookup(v4),
            IpAddr::V6(_) => None,
        }
    }
}

fn is_localhost(name: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    name == "localhost" || name.ends_with(".localhost")
}

fn real_resolve(name: &str, family: Option<AddressFamily>) -> io::Result<Vec<IpAddr>> {
    let addrs = (name, 0)
        .to_socket_addrs()?
        .map(|addr| addr.ip())
        .filter(|ip| match family {
            Some(AddressFamily::Inet) => ip.is_ipv4(),
            Some(AddressFamily::Inet6) => ip.is_ipv6(),
            _ => true,
        })
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {name}"),
        ));
    }
    Ok(addrs)
}
