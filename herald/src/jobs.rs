//! Fleet-wide jobs run under the exclusive scheduler

use std::sync::Arc;

use async_trait::async_trait;
use herald_admission::{EspDistributor, Job, Result};
use herald_common::tracing;

/// Logs per-profile distribution tallies for every configured campaign, once
/// per tick across the fleet.
#[derive(Debug)]
pub struct DistributionSnapshot {
    distributor: Arc<EspDistributor>,
    campaigns: Vec<String>,
}

impl DistributionSnapshot {
    #[must_use]
    pub const fn new(distributor: Arc<EspDistributor>, campaigns: Vec<String>) -> Self {
        Self {
            distributor,
            campaigns,
        }
    }
}

#[async_trait]
impl Job for DistributionSnapshot {
    fn name(&self) -> &str {
        "distribution-snapshot"
    }

    async fn run(&self) -> Result<()> {
        for campaign in &self.campaigns {
            for stats in self.distributor.stats(campaign).await? {
                tracing::info!(
                    campaign = %campaign,
                    profile = %stats.profile,
                    sent = stats.sent,
                    failed = stats.failed,
                    recent_failures = stats.recent_failures,
                    "Distribution snapshot"
                );
            }
        }
        Ok(())
    }
}
