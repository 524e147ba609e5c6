//! Configuration validation for the routing rule layer

use super::schema::{Config, RoutingSection};
use crate::error::{Result, ValidationError};
use crate::filter::rules::{PortRange, RuleAction};
use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::HashSet;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the parts of a configuration that cannot be repaired with a fallback
    pub fn validate(config: &Config) -> Result<()> {
        Self::validate_routing(&config.routing)?;
        Ok(())
    }

    fn validate_routing(routing: &RoutingSection) -> Result<()> {
        if RuleAction::parse(&routing.default_action).is_none() {
            return Err(ValidationError::InvalidAction {
                action: format!("{} (routing.default_action)", routing.default_action),
            }
            .into());
        }

        let mut names = HashSet::new();
        for rule in &routing.rules {
            if !names.insert(rule.name.as_str()) {
                return Err(ValidationError::DuplicateRule {
                    name: rule.name.clone(),
                }
                .into());
            }

            if RuleAction::parse(&rule.action).is_none() {
                return Err(ValidationError::InvalidAction {
                    action: format!("{} in rule {}", rule.action, rule.name),
                }
                .into());
            }

            for cidr in &rule.ip_cidrs_v4 {
                if cidr.trim().parse::<Ipv4Net>().is_err() {
                    return Err(ValidationError::InvalidCidr {
                        cidr: format!("{} in rule {}", cidr, rule.name),
                    }
                    .into());
                }
            }

            for cidr in &rule.ip_cidrs_v6 {
                if cidr.trim().parse::<Ipv6Net>().is_err() {
                    return Err(ValidationError::InvalidCidr {
                        cidr: format!("{} in rule {}", cidr, rule.name),
                    }
                    .into());
                }
            }

            for spec in &rule.ports {
                if spec.parse::<PortRange>().is_err() {
                    return Err(ValidationError::InvalidPorts {
                        spec: format!("{} in rule {}", spec, rule.name),
                    }
                    .into());
                }
            }

            Self::validate_patterns(&rule.name, &rule.domains)?;
        }

        Ok(())
    }

    /// Validate wildcard patterns
    fn validate_patterns(rule_name: &str, patterns: &[String]) -> Result<()> {
        for pattern in patterns {
            // Basic validation: no double wildcards, no empty patterns
            if pattern.trim().is_empty() || pattern.contains("**") {
                return Err(ValidationError::InvalidPattern {
                    pattern: format!("{} in rule {}", pattern, rule_name),
                }
                .into());
            }

            if pattern.contains('\0') || pattern.contains('\n') {
                return Err(ValidationError::InvalidPattern {
                    pattern: format!("{:?} in rule {}", pattern, rule_name),
                }
                .into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RuleSpec;
    use crate::error::GhostrouteError;

    fn config_with(rule: RuleSpec) -> Config {
        let mut config = Config::default();
        config.routing.rules.push(rule);
        config
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_invalid_cidr() {
        let mut rule = RuleSpec::new("lan", "direct");
        rule.ip_cidrs_v4 = vec!["10.0.0.0/33".to_string()];

        let err = ConfigValidator::validate(&config_with(rule)).unwrap_err();
        assert!(matches!(
            err,
            GhostrouteError::Validation(ValidationError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn test_inverted_port_range() {
        let mut rule = RuleSpec::new("ports", "proxy");
        rule.ports = vec!["2000-1000".to_string()];

        assert!(ConfigValidator::validate(&config_with(rule)).is_err());
    }

    #[test]
    fn test_unknown_action() {
        let rule = RuleSpec::new("weird", "reroute");
        assert!(ConfigValidator::validate(&config_with(rule)).is_err());
    }

    #[test]
    fn test_duplicate_rule_names() {
        let mut config = Config::default();
        config.routing.rules.push(RuleSpec::new("same", "direct"));
        config.routing.rules.push(RuleSpec::new("same", "block"));

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(matches!(
            err,
            GhostrouteError::Validation(ValidationError::DuplicateRule { .. })
        ));
    }

    #[test]
    fn test_double_wildcard_rejected() {
        let mut rule = RuleSpec::new("wild", "direct");
        rule.domains = vec!["**.example.com".to_string()];

        assert!(ConfigValidator::validate(&config_with(rule)).is_err());
    }
}
