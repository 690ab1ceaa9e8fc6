//! Throttle configuration
//!
//! ```ron
//! throttle: (
//!     default_limits: (hourly: 50000, daily: 500000),
//!     organizations: {
//!         "acme": (hourly: 2000, daily: 20000, total_daily: 100000),
//!     },
//!     domains: {
//!         "comcast.net": (hourly: 500),
//!     },
//!     isp_groups: [
//!         (key: "microsoft", domains: ["outlook.com", "hotmail.com", "live.com", "msn.com"], hourly: 1000),
//!     ],
//!     backoff: (bounce_threshold: 0.05, backoff_secs: 3600),
//! )
//! ```

use std::time::Duration;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Hourly and daily caps, `None` meaning unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub hourly: Option<u64>,
    #[serde(default)]
    pub daily: Option<u64>,
}

impl Limits {
    #[must_use]
    pub const fn new(hourly: Option<u64>, daily: Option<u64>) -> Self {
        Self { hourly, daily }
    }

    /// Fill unset caps from `fallback`.
    #[must_use]
    pub const fn or(self, fallback: Self) -> Self {
        Self {
            hourly: match self.hourly {
                Some(limit) => Some(limit),
                None => fallback.hourly,
            },
            daily: match self.daily {
                Some(limit) => Some(limit),
                None => fallback.daily,
            },
        }
    }
}

/// Per-organization ceilings.
///
/// `hourly`/`daily` cap each throttle unit of the organization;
/// `total_hourly`/`total_daily` cap the organization across all units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgLimits {
    #[serde(default)]
    pub hourly: Option<u64>,
    #[serde(default)]
    pub daily: Option<u64>,
    #[serde(default)]
    pub total_hourly: Option<u64>,
    #[serde(default)]
    pub total_daily: Option<u64>,
}

impl OrgLimits {
    #[must_use]
    pub const fn per_unit(&self) -> Limits {
        Limits::new(self.hourly, self.daily)
    }

    #[must_use]
    pub const fn totals(&self) -> Limits {
        Limits::new(self.total_hourly, self.total_daily)
    }
}

/// Domains that share one provider's filtering and so one throttle unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IspGroup {
    pub key: String,
    pub domains: Vec<String>,
    #[serde(default)]
    pub hourly: Option<u64>,
    #[serde(default)]
    pub daily: Option<u64>,
}

impl IspGroup {
    fn unlimited(key: &str, domains: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            domains: domains.iter().map(ToString::to_string).collect(),
            hourly: None,
            daily: None,
        }
    }

    #[must_use]
    pub const fn limits(&self) -> Limits {
        Limits::new(self.hourly, self.daily)
    }
}

/// The large consumer mailbox providers.
#[must_use]
pub fn default_isp_groups() -> Vec<IspGroup> {
    vec![
        IspGroup::unlimited(
            "microsoft",
            &["outlook.com", "hotmail.com", "live.com", "msn.com"],
        ),
        IspGroup::unlimited("google", &["gmail.com", "googlemail.com"]),
        IspGroup::unlimited(
            "yahoo",
            &["yahoo.com", "ymail.com", "rocketmail.com", "aol.com"],
        ),
        IspGroup::unlimited("apple", &["icloud.com", "me.com", "mac.com"]),
    ]
}

const fn default_bounce_threshold() -> f64 {
    0.05
}

const fn default_backoff_secs() -> u64 {
    3600
}

const fn default_min_samples() -> u64 {
    100
}

const fn default_stats_window_secs() -> u64 {
    3600
}

const fn default_backoff_multiplier() -> f64 {
    1.0
}

const fn default_max_backoff_secs() -> u64 {
    86_400
}

const fn default_breach_memory_secs() -> u64 {
    86_400
}

/// When a throttle unit is suspended after bounces, and for how long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Bounce rate (0, 1] above which a backoff is written
    #[serde(default = "default_bounce_threshold")]
    pub bounce_threshold: f64,

    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,

    /// Sends required in the stats window before the rate is evaluated
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,

    #[serde(default = "default_stats_window_secs")]
    pub stats_window_secs: u64,

    /// Factor applied per repeated breach, 1.0 disables escalation
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// How long a breach counts towards escalation
    #[serde(default = "default_breach_memory_secs")]
    pub breach_memory_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            bounce_threshold: default_bounce_threshold(),
            backoff_secs: default_backoff_secs(),
            min_samples: default_min_samples(),
            stats_window_secs: default_stats_window_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_secs: default_max_backoff_secs(),
            breach_memory_secs: default_breach_memory_secs(),
        }
    }
}

impl BackoffPolicy {
    /// Backoff length for the `breach`-th breach (1-based) within memory.
    #[must_use]
    pub fn duration_for(&self, breach: u32) -> Duration {
        let exponent = i32::try_from(breach.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let secs = self.backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = secs.min(self.max_backoff_secs as f64);
        Duration::from_secs_f64(capped.max(1.0))
    }

    #[must_use]
    pub const fn stats_window(&self) -> Duration {
        Duration::from_secs(self.stats_window_secs)
    }

    #[must_use]
    pub const fn breach_memory(&self) -> Duration {
        Duration::from_secs(self.breach_memory_secs)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBackoff`] for out of range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.bounce_threshold > 0.0 && self.bounce_threshold <= 1.0) {
            return Err(ConfigError::InvalidBackoff(format!(
                "bounce_threshold must be in (0, 1], got {}",
                self.bounce_threshold
            )));
        }
        if self.backoff_secs == 0 {
            return Err(ConfigError::InvalidBackoff(
                "backoff_secs must be positive".to_string(),
            ));
        }
        if self.stats_window_secs == 0 {
            return Err(ConfigError::InvalidBackoff(
                "stats_window_secs must be positive".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_backoff_secs < self.backoff_secs {
            return Err(ConfigError::InvalidBackoff(format!(
                "max_backoff_secs ({}) is below backoff_secs ({})",
                self.max_backoff_secs, self.backoff_secs
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Caps used when nothing more specific applies
    #[serde(default)]
    pub default_limits: Limits,

    #[serde(default)]
    pub organizations: AHashMap<String, OrgLimits>,

    /// Rules for individual recipient domains
    #[serde(default)]
    pub domains: AHashMap<String, Limits>,

    #[serde(default = "default_isp_groups")]
    pub isp_groups: Vec<IspGroup>,

    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            default_limits: Limits::default(),
            organizations: AHashMap::default(),
            domains: AHashMap::default(),
            isp_groups: default_isp_groups(),
            backoff: BackoffPolicy::default(),
        }
    }
}
