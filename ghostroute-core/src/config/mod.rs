//! Configuration management and the policy snapshot

pub mod loader;
pub mod schema;
pub mod snapshot;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::{Config, RuleSpec};
pub use snapshot::{DnsMode, FakeIpSettings, Ipv6Mode, PolicySnapshot, ProxyEndpoint, Timeouts, UdpMode};
pub use validator::ConfigValidator;
