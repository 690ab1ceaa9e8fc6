//! Send-worker entry point
//!
//! One call per candidate message runs suppression, then throttling, then
//! profile selection. Store outages while throttling or selecting defer the
//! candidate instead of letting it through.

use std::{fmt, sync::Arc};

use herald_common::{Domain, decision};

use crate::{
    distribution::{EspDistributor, EspQuota, Selection, validate_quotas},
    error::{AdmissionError, Result},
    suppression::SuppressionEngine,
    throttle::{DenyReason, DomainThrottleController, ThrottleDecision},
};

/// A message about to be sent
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub org: &'a str,
    pub campaign: &'a str,
    pub email: &'a str,
    /// Suppression lists that apply in addition to the global list
    pub lists: &'a [String],
    pub quotas: &'a [EspQuota],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    Throttled(DenyReason),
    /// The shared store could not be reached
    Unavailable(String),
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throttled(reason) => write!(f, "throttled: {reason}"),
            Self::Unavailable(reason) => write!(f, "store unavailable: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Never send to this recipient in this context
    Suppressed,
    /// Try again later
    Deferred(DeferReason),
    Send(Selection),
}

impl Verdict {
    #[must_use]
    pub const fn is_send(&self) -> bool {
        matches!(self, Self::Send(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    /// Accepted by the provider, bounced by the destination
    Bounced,
    /// The provider itself failed to take the message
    Failed,
}

/// What happened to a message after [`AdmissionPipeline::admit`] sent it
#[derive(Debug, Clone, Copy)]
pub struct Outcome<'a> {
    pub campaign: &'a str,
    pub profile: &'a str,
    pub email: &'a str,
    pub result: DeliveryResult,
}

#[derive(Debug, Clone)]
pub struct AdmissionPipeline {
    suppression: Arc<SuppressionEngine>,
    throttle: Arc<DomainThrottleController>,
    distributor: Arc<EspDistributor>,
}

fn defer_if_transient<T>(result: Result<T>, stage: &str) -> Result<Result<T, Verdict>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(err) if err.is_transient() => {
            tracing::warn!(stage, error = %err, "Deferring, shared store unavailable");
            Ok(Err(Verdict::Deferred(DeferReason::Unavailable(
                err.to_string(),
            ))))
        }
        Err(err) => Err(err),
    }
}

impl AdmissionPipeline {
    #[must_use]
    pub const fn new(
        suppression: Arc<SuppressionEngine>,
        throttle: Arc<DomainThrottleController>,
        distributor: Arc<EspDistributor>,
    ) -> Self {
        Self {
            suppression,
            throttle,
            distributor,
        }
    }

    #[must_use]
    pub const fn suppression(&self) -> &Arc<SuppressionEngine> {
        &self.suppression
    }

    #[must_use]
    pub const fn throttle(&self) -> &Arc<DomainThrottleController> {
        &self.throttle
    }

    #[must_use]
    pub const fn distributor(&self) -> &Arc<EspDistributor> {
        &self.distributor
    }

    /// Decide what to do with one candidate.
    ///
    /// A `Send` verdict has already consumed one unit of throttle headroom.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid quota set and
    /// [`AdmissionError::InvalidRecipient`] for an address without a domain.
    /// Store outages are reported as [`Verdict::Deferred`], not as errors.
    pub async fn admit(&self, candidate: &Candidate<'_>) -> Result<Verdict> {
        validate_quotas(candidate.quotas)?;

        if self
            .suppression
            .is_suppressed(candidate.email, candidate.lists)
        {
            decision!("Suppressed candidate for campaign {}", candidate.campaign);
            return Ok(Verdict::Suppressed);
        }

        let domain = Domain::from_address(candidate.email).ok_or(AdmissionError::InvalidRecipient)?;

        let throttled = self.throttle.can_send(candidate.org, &domain).await;
        match defer_if_transient(throttled, "throttle")? {
            Ok(ThrottleDecision::Allowed) => {}
            Ok(ThrottleDecision::Denied(reason)) => {
                decision!("Deferred {domain}: {reason}");
                return Ok(Verdict::Deferred(DeferReason::Throttled(reason)));
            }
            Err(verdict) => return Ok(verdict),
        }

        let selected = self
            .distributor
            .select(candidate.campaign, candidate.quotas)
            .await;
        match defer_if_transient(selected, "distribution")? {
            Ok(selection) => {
                decision!(
                    "Routing {domain} for campaign {} via {}",
                    candidate.campaign,
                    selection.profile
                );
                Ok(Verdict::Send(selection))
            }
            Err(verdict) => Ok(verdict),
        }
    }

    /// Feed a delivery result back into distribution stats and bounce
    /// tracking.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidRecipient`] for an address without a
    /// domain, or a store error if the shared store is unavailable.
    pub async fn report(&self, outcome: &Outcome<'_>) -> Result<()> {
        let domain = Domain::from_address(outcome.email).ok_or(AdmissionError::InvalidRecipient)?;

        match outcome.result {
            DeliveryResult::Delivered => {
                self.distributor
                    .record_send(outcome.campaign, outcome.profile)
                    .await?;
                self.throttle.report_outcome(&domain, 1, 0).await?;
            }
            DeliveryResult::Bounced => {
                self.distributor
                    .record_send(outcome.campaign, outcome.profile)
                    .await?;
                self.throttle.report_outcome(&domain, 1, 1).await?;
            }
            DeliveryResult::Failed => {
                self.distributor
                    .record_failure(outcome.campaign, outcome.profile)
                    .await?;
            }
        }

        Ok(())
    }
}
