use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Allowed drift of the quota sum from 100
const SUM_TOLERANCE: f64 = 0.01;

/// Share of a campaign's volume routed through one ESP profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EspQuota {
    pub profile: String,
    pub percentage: f64,
}

impl EspQuota {
    #[must_use]
    pub fn new(profile: impl Into<String>, percentage: f64) -> Self {
        Self {
            profile: profile.into(),
            percentage,
        }
    }
}

/// Check that a quota set is usable.
///
/// ```
/// use herald_admission::distribution::{EspQuota, validate_quotas};
///
/// let ok = [EspQuota::new("a", 40.0), EspQuota::new("b", 30.0), EspQuota::new("c", 30.0)];
/// assert!(validate_quotas(&ok).is_ok());
///
/// let short = [EspQuota::new("a", 40.0), EspQuota::new("b", 30.0), EspQuota::new("c", 20.0)];
/// assert!(validate_quotas(&short).is_err());
/// ```
///
/// # Errors
///
/// Rejects an empty set, empty or duplicate profile ids, non-positive or
/// non-finite percentages and sums other than 100.
pub fn validate_quotas(quotas: &[EspQuota]) -> Result<(), ConfigError> {
    if quotas.is_empty() {
        return Err(ConfigError::EmptyQuotas);
    }

    let mut seen = AHashSet::with_capacity(quotas.len());
    for quota in quotas {
        if quota.profile.trim().is_empty() {
            return Err(ConfigError::EmptyProfile);
        }
        if !seen.insert(quota.profile.as_str()) {
            return Err(ConfigError::DuplicateProfile(quota.profile.clone()));
        }
        if !quota.percentage.is_finite() || quota.percentage <= 0.0 {
            return Err(ConfigError::InvalidPercentage {
                profile: quota.profile.clone(),
                value: quota.percentage,
            });
        }
    }

    let sum: f64 = quotas.iter().map(|quota| quota.percentage).sum();
    if (sum - 100.0).abs() > SUM_TOLERANCE {
        return Err(ConfigError::QuotaSum(sum));
    }

    Ok(())
}
