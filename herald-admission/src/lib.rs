//! Outbound send admission for bulk email
//!
//! For every candidate message herald decides, in order:
//!
//! 1. [`suppression`]: is the recipient forbidden, globally or by one of the
//!    lists the caller names?
//! 2. [`throttle`]: does the destination domain, its ISP group and the sending
//!    organization have headroom right now, and is the destination not in
//!    bounce backoff?
//! 3. [`distribution`]: which provider profile should carry it, given the
//!    campaign's quota split and recent provider failures?
//!
//! [`pipeline::AdmissionPipeline`] runs the three in that order. Fleet-wide
//! periodic work is coordinated with [`lock::DistLock`] through the
//! [`scheduler::ExclusiveScheduler`].
//!
//! Counters, backoff markers and cache locks live in a
//! [`herald_store::SharedStore`] so that every worker process sees the same
//! state.

pub mod distribution;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod scheduler;
pub mod suppression;
pub mod throttle;

pub use distribution::{DistributionConfig, EspDistributor, EspQuota, ProfileStats, Selection};
pub use error::{AdmissionError, ConfigError, LockError, Result};
pub use lock::{DistLock, LockConfig, LockService};
pub use pipeline::{AdmissionPipeline, Candidate, DeferReason, DeliveryResult, Outcome, Verdict};
pub use scheduler::{ExclusiveScheduler, Job, JobOutcome, SchedulerConfig};
pub use suppression::{Scope, SuppressionConfig, SuppressionEngine};
pub use throttle::{DenyReason, DomainThrottleController, ThrottleConfig, ThrottleDecision};
