//! Routing decisions and the optional rule layer

pub mod matcher;
pub mod policy;
pub mod rules;

pub use matcher::HostMatcher;
pub use policy::{AddressFamily, Decision, Destination, Router, SocketType, Target};
pub use rules::{PortRange, RuleAction, RuleSet};
