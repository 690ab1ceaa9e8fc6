//! Quota-weighted ESP selection with failure-driven failover
//!
//! Each campaign keeps one hash of running tallies in the shared store
//! (`<profile>:sent` / `<profile>:failed`) and one hash of failures in the
//! current failure window. Selection picks the healthy profile that is
//! furthest behind its share, i.e. the smallest `sent / percentage`, which
//! makes the realized split converge on the configured one.
//!
//! A profile whose failures in the current window reach the threshold is
//! skipped until the window rolls over or an operator resets it. When every
//! profile is unhealthy the least unhealthy one is used rather than refusing
//! to send.

mod quota;

use std::{cmp::Ordering, collections::BTreeMap, sync::Arc, time::Duration};

use ahash::AHashMap;
use herald_common::SharedClock;
use herald_store::SharedStore;
use serde::{Deserialize, Serialize};

pub use self::quota::{EspQuota, validate_quotas};
use crate::error::{ConfigError, Result};

const SENT: &str = "sent";
const FAILED: &str = "failed";

const fn default_failure_threshold() -> u64 {
    10
}

const fn default_failure_window_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    /// Failures within one window that mark a profile unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,

    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
        }
    }
}

impl DistributionConfig {
    #[must_use]
    pub const fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDistribution`] for a zero threshold or
    /// window.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidDistribution(
                "failure_threshold must be positive".to_string(),
            ));
        }
        if self.failure_window_secs == 0 {
            return Err(ConfigError::InvalidDistribution(
                "failure_window_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tallies for one profile of a campaign
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileStats {
    pub profile: String,
    pub sent: u64,
    pub failed: u64,
    /// Failures in the current failure window
    pub recent_failures: u64,
}

/// The chosen profile and whether an unhealthy profile was passed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub profile: String,
    pub failover: bool,
}

#[derive(Debug)]
struct Candidate<'a> {
    profile: &'a str,
    percentage: f64,
    order: usize,
    ratio: f64,
    recent_failures: u64,
}

impl Candidate<'_> {
    /// Furthest behind its share first, then the larger share, then
    /// configuration order.
    fn by_share(&self, other: &Self) -> Ordering {
        self.ratio
            .total_cmp(&other.ratio)
            .then_with(|| other.percentage.total_cmp(&self.percentage))
            .then_with(|| self.order.cmp(&other.order))
    }

    fn by_health(&self, other: &Self) -> Ordering {
        self.recent_failures
            .cmp(&other.recent_failures)
            .then_with(|| self.by_share(other))
    }
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[derive(Debug)]
pub struct EspDistributor {
    store: Arc<dyn SharedStore>,
    clock: SharedClock,
    config: DistributionConfig,
}

impl EspDistributor {
    /// # Errors
    ///
    /// Returns a configuration error if the failover settings are invalid.
    pub fn new(
        config: DistributionConfig,
        store: Arc<dyn SharedStore>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            config,
        })
    }

    fn totals_key(campaign: &str) -> String {
        format!("dist:{campaign}")
    }

    fn recent_key(&self, campaign: &str) -> String {
        let len = i64::try_from(self.config.failure_window_secs)
            .unwrap_or(i64::MAX)
            .max(1);
        let window = self.clock.now().timestamp().div_euclid(len);
        format!("dist:{campaign}:recent:{window}")
    }

    /// Choose the profile for the next message of `campaign`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid quota set, or a store
    /// error if the shared store is unavailable.
    #[tracing::instrument(level = "debug", skip(self, quotas))]
    pub async fn select(&self, campaign: &str, quotas: &[EspQuota]) -> Result<Selection> {
        validate_quotas(quotas)?;

        let totals: AHashMap<String, i64> = self
            .store
            .hash_get_all(&Self::totals_key(campaign))
            .await?
            .into_iter()
            .collect();
        let recent: AHashMap<String, i64> = self
            .store
            .hash_get_all(&self.recent_key(campaign))
            .await?
            .into_iter()
            .collect();

        let candidates: Vec<_> = quotas
            .iter()
            .enumerate()
            .map(|(order, quota)| {
                let sent = totals
                    .get(&format!("{}:{SENT}", quota.profile))
                    .copied()
                    .map_or(0, to_count);
                #[allow(clippy::cast_precision_loss)]
                let ratio = sent as f64 / quota.percentage;

                Candidate {
                    profile: &quota.profile,
                    percentage: quota.percentage,
                    order,
                    ratio,
                    recent_failures: recent.get(&quota.profile).copied().map_or(0, to_count),
                }
            })
            .collect();

        let threshold = self.config.failure_threshold;
        let healthy = candidates
            .iter()
            .filter(|candidate| candidate.recent_failures < threshold)
            .min_by(|a, b| a.by_share(b));
        let any_unhealthy = candidates
            .iter()
            .any(|candidate| candidate.recent_failures >= threshold);

        let chosen = match healthy {
            Some(candidate) => candidate,
            None => {
                let fallback = candidates.iter().min_by(|a, b| a.by_health(b));
                let Some(candidate) = fallback else {
                    return Err(ConfigError::EmptyQuotas.into());
                };
                tracing::warn!(
                    campaign,
                    profile = candidate.profile,
                    recent_failures = candidate.recent_failures,
                    "Every ESP profile is unhealthy, using the least unhealthy"
                );
                candidate
            }
        };

        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics
                .admission
                .record_selection(chosen.profile, any_unhealthy);
        }

        Ok(Selection {
            profile: chosen.profile.to_string(),
            failover: any_unhealthy,
        })
    }

    /// Count one message sent through `profile`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unavailable.
    pub async fn record_send(&self, campaign: &str, profile: &str) -> Result<()> {
        let field = format!("{profile}:{SENT}");
        self.store
            .hash_incr(&Self::totals_key(campaign), &[(field.as_str(), 1)], None)
            .await?;
        Ok(())
    }

    /// Count one provider failure for `profile`, in the running tally and in
    /// the current failure window.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unavailable.
    pub async fn record_failure(&self, campaign: &str, profile: &str) -> Result<()> {
        let field = format!("{profile}:{FAILED}");
        self.store
            .hash_incr(&Self::totals_key(campaign), &[(field.as_str(), 1)], None)
            .await?;

        let recent = self
            .store
            .hash_incr(
                &self.recent_key(campaign),
                &[(profile, 1)],
                Some(self.config.failure_window()),
            )
            .await?;

        if recent.first().copied().map_or(0, to_count) == self.config.failure_threshold {
            tracing::warn!(
                campaign,
                profile,
                threshold = self.config.failure_threshold,
                "ESP profile marked unhealthy"
            );
        }
        Ok(())
    }

    /// Per-profile tallies, ordered by profile id.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unavailable.
    pub async fn stats(&self, campaign: &str) -> Result<Vec<ProfileStats>> {
        let mut stats: BTreeMap<String, ProfileStats> = BTreeMap::new();

        for (field, value) in self.store.hash_get_all(&Self::totals_key(campaign)).await? {
            let Some((profile, kind)) = field.rsplit_once(':') else {
                continue;
            };
            let entry = stats
                .entry(profile.to_string())
                .or_insert_with(|| ProfileStats {
                    profile: profile.to_string(),
                    ..ProfileStats::default()
                });
            match kind {
                SENT => entry.sent = to_count(value),
                FAILED => entry.failed = to_count(value),
                _ => {}
            }
        }

        for (profile, value) in self.store.hash_get_all(&self.recent_key(campaign)).await? {
            stats
                .entry(profile.clone())
                .or_insert_with(|| ProfileStats {
                    profile,
                    ..ProfileStats::default()
                })
                .recent_failures = to_count(value);
        }

        Ok(stats.into_values().collect())
    }

    /// Reset every tally of `campaign`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unavailable.
    pub async fn clear_stats(&self, campaign: &str) -> Result<()> {
        self.store
            .delete(&[Self::totals_key(campaign), self.recent_key(campaign)])
            .await?;
        tracing::info!(campaign, "Distribution stats cleared");
        Ok(())
    }

    /// Forget the recent failures of one profile, making it healthy again.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unavailable.
    pub async fn reset_failures(&self, campaign: &str, profile: &str) -> Result<()> {
        self.store
            .hash_remove(&self.recent_key(campaign), &[profile])
            .await?;
        tracing::info!(campaign, profile, "ESP profile failures reset");
        Ok(())
    }
}
