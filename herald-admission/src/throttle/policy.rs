//! Throttle policy resolution
//!
//! Maps a recipient domain to its throttle unit and resolves the caps that
//! apply to it. Caps are resolved field by field, most specific first:
//!
//! 1. domain rule
//! 2. ISP group rule
//! 3. organization ceiling
//! 4. global default

use ahash::AHashMap;
use herald_common::Domain;

use super::config::{Limits, OrgLimits, ThrottleConfig};
use crate::error::ConfigError;

/// Resolved caps for one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub unit: Limits,
    pub org_totals: Limits,
}

#[derive(Debug, Clone)]
pub struct ThrottlePolicy {
    defaults: Limits,
    organizations: AHashMap<String, OrgLimits>,
    domains: AHashMap<Domain, Limits>,
    /// domain -> (group key, group limits)
    isp_index: AHashMap<Domain, (String, Limits)>,
}

impl ThrottlePolicy {
    /// Build the lookup tables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidThrottle`] if a domain belongs to two ISP
    /// groups or a group key is empty.
    pub fn new(config: &ThrottleConfig) -> Result<Self, ConfigError> {
        let mut isp_index = AHashMap::new();
        for group in &config.isp_groups {
            let key = group.key.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(ConfigError::InvalidThrottle(
                    "ISP group key must not be empty".to_string(),
                ));
            }

            for domain in &group.domains {
                let domain = Domain::new(domain);
                if let Some((existing, _)) =
                    isp_index.insert(domain.clone(), (key.clone(), group.limits()))
                {
                    return Err(ConfigError::InvalidThrottle(format!(
                        "domain {domain} is in ISP groups {existing} and {key}"
                    )));
                }
            }
        }

        let domains = config
            .domains
            .iter()
            .map(|(domain, limits)| (Domain::new(domain), *limits))
            .collect();

        Ok(Self {
            defaults: config.default_limits,
            organizations: config.organizations.clone(),
            domains,
            isp_index,
        })
    }

    /// The key a domain is throttled under: its ISP group if mapped, else the
    /// domain itself.
    #[must_use]
    pub fn unit_for<'a>(&'a self, domain: &'a Domain) -> &'a str {
        self.isp_index
            .get(domain)
            .map_or(domain.as_str(), |(key, _)| key.as_str())
    }

    /// The key a domain's window counters are kept under. A domain with a
    /// rule of its own counts against that rule alone, even inside an ISP
    /// group; every other domain shares its unit's counters.
    #[must_use]
    pub fn counter_unit<'a>(&'a self, domain: &'a Domain) -> &'a str {
        if self.domains.contains_key(domain) {
            domain.as_str()
        } else {
            self.unit_for(domain)
        }
    }

    #[must_use]
    pub fn isp_group(&self, domain: &Domain) -> Option<&str> {
        self.isp_index.get(domain).map(|(key, _)| key.as_str())
    }

    #[must_use]
    pub fn limits_for(&self, org: &str, domain: &Domain) -> ResolvedLimits {
        let org_limits = self.organizations.get(org).copied().unwrap_or_default();
        let domain_rule = self.domains.get(domain).copied().unwrap_or_default();
        let isp_rule = self
            .isp_index
            .get(domain)
            .map(|(_, limits)| *limits)
            .unwrap_or_default();

        ResolvedLimits {
            unit: domain_rule
                .or(isp_rule)
                .or(org_limits.per_unit())
                .or(self.defaults),
            org_totals: org_limits.totals(),
        }
    }
}
