//! Per-domain / per-ISP / per-organization send admission
//!
//! Window counters live in the shared store keyed by the window index, so a
//! new hour or day is simply a new key and the old one expires on its own.
//! A domain with a rule of its own keeps its own counters; other domains count
//! against their ISP group. Key segments are escaped, so `:` cannot alias and
//! `*` stays reserved for organization totals.
//! The admission check and every increment it implies are one
//! [`SharedStore::incr_within_limits`] call.
//!
//! Bounce feedback accumulates per throttle unit in a fixed stats window. When
//! the bounce rate crosses the threshold a backoff marker holding its expiry is
//! written with a matching TTL, suspending the unit until it lapses.

mod config;
mod policy;

use std::{borrow::Cow, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use herald_common::{Domain, SharedClock};
use herald_store::{LimitCheck, SharedStore, StoreError, WindowCounter};

pub use self::{
    config::{BackoffPolicy, IspGroup, Limits, OrgLimits, ThrottleConfig, default_isp_groups},
    policy::{ResolvedLimits, ThrottlePolicy},
};
use crate::error::{ConfigError, Result};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Key used in place of a unit for organization-wide totals
const ALL_UNITS: &str = "*";

/// Why a send was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    Backoff { unit: String, until: DateTime<Utc> },
    HourlyLimit { unit: String, limit: u64 },
    DailyLimit { unit: String, limit: u64 },
    OrgHourlyLimit { org: String, limit: u64 },
    OrgDailyLimit { org: String, limit: u64 },
}

impl DenyReason {
    /// Stable label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Backoff { .. } => "backoff",
            Self::HourlyLimit { .. } => "hourly_limit",
            Self::DailyLimit { .. } => "daily_limit",
            Self::OrgHourlyLimit { .. } => "org_hourly_limit",
            Self::OrgDailyLimit { .. } => "org_daily_limit",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backoff { until, .. } => write!(f, "backoff until {}", until.to_rfc3339()),
            Self::HourlyLimit { unit, limit } => {
                write!(f, "hourly limit of {limit} reached for {unit}")
            }
            Self::DailyLimit { unit, limit } => {
                write!(f, "daily limit of {limit} reached for {unit}")
            }
            Self::OrgHourlyLimit { org, limit } => {
                write!(f, "hourly total of {limit} reached for organization {org}")
            }
            Self::OrgDailyLimit { org, limit } => {
                write!(f, "daily total of {limit} reached for organization {org}")
            }
        }
    }
}

/// The window counters a check may involve
#[derive(Debug, Clone, Copy)]
enum Cap {
    UnitHourly,
    UnitDaily,
    OrgHourly,
    OrgDaily,
}

impl Cap {
    fn deny(self, org: &str, unit: &str, limit: u64) -> DenyReason {
        match self {
            Self::UnitHourly => DenyReason::HourlyLimit {
                unit: unit.to_string(),
                limit,
            },
            Self::UnitDaily => DenyReason::DailyLimit {
                unit: unit.to_string(),
                limit,
            },
            Self::OrgHourly => DenyReason::OrgHourlyLimit {
                org: org.to_string(),
                limit,
            },
            Self::OrgDaily => DenyReason::OrgDailyLimit {
                org: org.to_string(),
                limit,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    Denied(DenyReason),
}

impl ThrottleDecision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    #[must_use]
    pub const fn reason(&self) -> Option<&DenyReason> {
        match self {
            Self::Allowed => None,
            Self::Denied(reason) => Some(reason),
        }
    }
}

/// Current window counts for an (organization, domain) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    pub unit: String,
    pub hourly: u64,
    pub daily: u64,
    pub limits: ResolvedLimits,
    pub backoff_until: Option<DateTime<Utc>>,
}

fn window_index(now: DateTime<Utc>, window: Duration) -> i64 {
    let len = i64::try_from(window.as_secs()).unwrap_or(i64::MAX).max(1);
    now.timestamp().div_euclid(len)
}

/// Percent-encode the characters that structure a key.
fn segment(part: &str) -> Cow<'_, str> {
    if !part.contains([':', '%', '*']) {
        return Cow::Borrowed(part);
    }

    let mut escaped = String::with_capacity(part.len() + 8);
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            '*' => escaped.push_str("%2A"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

fn counter_key(org: &str, unit: &str, span: char, index: i64) -> String {
    format!("throttle:{}:{}:{span}:{index}", segment(org), segment(unit))
}

fn org_total_key(org: &str, span: char, index: i64) -> String {
    format!("throttle:{}:{ALL_UNITS}:{span}:{index}", segment(org))
}

fn backoff_key(unit: &str) -> String {
    format!("backoff:{}", segment(unit))
}

fn breaches_key(unit: &str) -> String {
    format!("backoff:breaches:{}", segment(unit))
}

fn bounce_key(unit: &str, index: i64) -> String {
    format!("bounce:{}:{index}", segment(unit))
}

fn parse_count(key: &str, value: Option<String>) -> Result<u64, StoreError> {
    value.map_or(Ok(0), |value| {
        value.parse().map_err(|_| StoreError::UnexpectedValue {
            key: key.to_string(),
            expected: "counter",
        })
    })
}

#[derive(Debug)]
pub struct DomainThrottleController {
    store: Arc<dyn SharedStore>,
    clock: SharedClock,
    policy: ThrottlePolicy,
    backoff: BackoffPolicy,
}

impl DomainThrottleController {
    /// # Errors
    ///
    /// Returns a configuration error for an invalid backoff policy or ISP
    /// group layout.
    pub fn new(
        config: &ThrottleConfig,
        store: Arc<dyn SharedStore>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.backoff.validate()?;

        Ok(Self {
            store,
            clock,
            policy: ThrottlePolicy::new(config)?,
            backoff: config.backoff.clone(),
        })
    }

    #[must_use]
    pub const fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// Decide whether `org` may send one message to `domain` now, consuming
    /// window capacity when it may.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unavailable.
    #[tracing::instrument(level = "debug", skip(self), fields(unit))]
    pub async fn can_send(&self, org: &str, domain: &Domain) -> Result<ThrottleDecision> {
        let unit = self.policy.unit_for(domain);
        tracing::Span::current().record("unit", unit);

        let decision = self.decide(org, unit, domain).await?;

        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics
                .admission
                .record_throttle_decision(decision.reason().map_or("allowed", DenyReason::kind));
        }

        if let ThrottleDecision::Denied(reason) = &decision {
            tracing::debug!(org, unit, reason = %reason, "Send deferred");
        }

        Ok(decision)
    }

    async fn decide(&self, org: &str, unit: &str, domain: &Domain) -> Result<ThrottleDecision> {
        if let Some(until) = self.active_backoff(unit).await? {
            return Ok(ThrottleDecision::Denied(DenyReason::Backoff {
                unit: unit.to_string(),
                until,
            }));
        }

        let now = self.clock.now();
        let hour = window_index(now, HOUR);
        let day = window_index(now, DAY);
        let limits = self.policy.limits_for(org, domain);
        let counted = self.policy.counter_unit(domain);

        let caps = [
            (Cap::UnitHourly, limits.unit.hourly, counter_key(org, counted, 'h', hour), HOUR),
            (Cap::UnitDaily, limits.unit.daily, counter_key(org, counted, 'd', day), DAY),
            (Cap::OrgHourly, limits.org_totals.hourly, org_total_key(org, 'h', hour), HOUR),
            (Cap::OrgDaily, limits.org_totals.daily, org_total_key(org, 'd', day), DAY),
        ];

        let (counters, caps): (Vec<_>, Vec<_>) = caps
            .into_iter()
            .filter_map(|(cap, limit, key, ttl)| {
                limit.map(|limit| (WindowCounter::new(key, limit, ttl), (cap, limit)))
            })
            .unzip();

        if counters.is_empty() {
            return Ok(ThrottleDecision::Allowed);
        }

        match self.store.incr_within_limits(&counters).await? {
            LimitCheck::Admitted => Ok(ThrottleDecision::Allowed),
            LimitCheck::Exceeded { index, .. } => match caps.get(index) {
                Some(&(cap, limit)) => {
                    Ok(ThrottleDecision::Denied(cap.deny(org, counted, limit)))
                }
                None => Err(StoreError::UnexpectedValue {
                    key: counters[0].key.clone(),
                    expected: "counter index",
                }
                .into()),
            },
        }
    }

    async fn active_backoff(&self, unit: &str) -> Result<Option<DateTime<Utc>>> {
        let key = backoff_key(unit);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let millis: i64 = value.parse().map_err(|_| StoreError::UnexpectedValue {
            key,
            expected: "unix millis",
        })?;

        Ok((millis > self.clock.now_millis())
            .then(|| DateTime::from_timestamp_millis(millis))
            .flatten())
    }

    /// Feed delivery results for `domain` into the bounce-rate evaluation.
    ///
    /// Returns the expiry of a backoff written by this call. A unit that is
    /// already suspended keeps its existing backoff.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unavailable.
    #[tracing::instrument(level = "debug", skip(self), fields(unit))]
    pub async fn report_outcome(
        &self,
        domain: &Domain,
        sent: u64,
        bounced: u64,
    ) -> Result<Option<DateTime<Utc>>> {
        let unit = self.policy.unit_for(domain);
        tracing::Span::current().record("unit", unit);

        if sent == 0 && bounced == 0 {
            return Ok(None);
        }

        if self.active_backoff(unit).await?.is_some() {
            return Ok(None);
        }

        let window = bounce_key(unit, window_index(self.clock.now(), self.backoff.stats_window()));
        let totals = self
            .store
            .hash_incr(
                &window,
                &[
                    ("sent", i64::try_from(sent).unwrap_or(i64::MAX)),
                    ("bounced", i64::try_from(bounced).unwrap_or(i64::MAX)),
                ],
                Some(self.backoff.stats_window()),
            )
            .await?;

        let &[total_sent, total_bounced] = totals.as_slice() else {
            return Err(StoreError::UnexpectedValue {
                key: window,
                expected: "sent and bounced totals",
            }
            .into());
        };
        let total_sent = u64::try_from(total_sent).unwrap_or(0);
        let total_bounced = u64::try_from(total_bounced).unwrap_or(0);

        if total_sent == 0 || total_sent < self.backoff.min_samples {
            return Ok(None);
        }

        #[allow(clippy::cast_precision_loss)]
        let rate = total_bounced as f64 / total_sent as f64;
        if rate <= self.backoff.bounce_threshold {
            return Ok(None);
        }

        self.start_backoff(unit, &window, rate).await
    }

    async fn start_backoff(
        &self,
        unit: &str,
        window: &str,
        rate: f64,
    ) -> Result<Option<DateTime<Utc>>> {
        let breaches = breaches_key(unit);
        let prior = parse_count(&breaches, self.store.get(&breaches).await?)?;
        let breach = u32::try_from(prior.saturating_add(1)).unwrap_or(u32::MAX);

        let duration = self.backoff.duration_for(breach);
        let until = self.clock.now() + TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);

        let written = self
            .store
            .set_nx(
                &backoff_key(unit),
                &until.timestamp_millis().to_string(),
                duration,
            )
            .await?;
        if !written {
            // Another worker suspended the unit first
            return Ok(None);
        }

        self.store
            .incr(&breaches, 1, Some(self.backoff.breach_memory()))
            .await?;
        self.store.delete(&[window.to_string()]).await?;

        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.admission.record_backoff(unit);
        }

        tracing::warn!(
            unit,
            bounce_rate = rate,
            breach,
            until = %until.to_rfc3339(),
            "Bounce rate above threshold, unit suspended"
        );

        Ok(Some(until))
    }

    /// Expiry of the backoff currently suspending `domain`'s unit.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unavailable.
    pub async fn backoff(&self, domain: &Domain) -> Result<Option<DateTime<Utc>>> {
        self.active_backoff(self.policy.unit_for(domain)).await
    }

    /// Lift a backoff and forget past breaches for `domain`'s unit.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unavailable.
    pub async fn clear_backoff(&self, domain: &Domain) -> Result<()> {
        let unit = self.policy.unit_for(domain);
        self.store
            .delete(&[backoff_key(unit), breaches_key(unit)])
            .await?;
        tracing::info!(unit, "Backoff cleared");
        Ok(())
    }

    /// Window counts without consuming capacity. The reported unit is the one
    /// counted against; backoff is looked up for the domain's ISP group.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unavailable.
    pub async fn usage(&self, org: &str, domain: &Domain) -> Result<Usage> {
        let unit = self.policy.counter_unit(domain);
        let now = self.clock.now();

        let hourly_key = counter_key(org, unit, 'h', window_index(now, HOUR));
        let daily_key = counter_key(org, unit, 'd', window_index(now, DAY));
        let hourly = parse_count(&hourly_key, self.store.get(&hourly_key).await?)?;
        let daily = parse_count(&daily_key, self.store.get(&daily_key).await?)?;

        Ok(Usage {
            unit: unit.to_string(),
            hourly,
            daily,
            limits: self.policy.limits_for(org, domain),
            backoff_until: self.active_backoff(self.policy.unit_for(domain)).await?,
        })
    }
}
