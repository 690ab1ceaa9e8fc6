//! Wires configuration into running components
//!
//! [`Engine::build`] opens the shared store and constructs the admission
//! pipeline; [`Engine::run`] keeps the process-local and fleet-wide
//! maintenance going until a shutdown signal.

use std::{sync::Arc, sync::LazyLock, time::Duration};

use herald_admission::{
    AdmissionPipeline, DomainThrottleController, EspDistributor, ExclusiveScheduler, LockService,
    SuppressionEngine,
};
use herald_common::{Signal, SharedClock, SystemClock, internal, logging, tracing};
use herald_store::{OpenedStore, SharedStore};
use tokio::sync::broadcast;

use crate::{HeraldConfig, jobs::DistributionSnapshot};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

/// Run `task` every `period` until a shutdown signal. The first run happens
/// one period after start.
async fn every<F, Fut>(period: Duration, mut shutdown: broadcast::Receiver<Signal>, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => task().await,
            sig = shutdown.recv() => {
                match sig {
                    Ok(Signal::Shutdown | Signal::Finalised)
                    | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }
    }
}

/// A configured herald instance
#[derive(Debug)]
pub struct Engine {
    config: HeraldConfig,
    store: OpenedStore,
    pipeline: AdmissionPipeline,
    locks: LockService,
}

impl Engine {
    /// Build every component from `config` using the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid store, throttle, distribution or lock
    /// settings.
    pub fn build(config: HeraldConfig) -> anyhow::Result<Self> {
        Self::build_with_clock(config, SystemClock::shared())
    }

    /// # Errors
    ///
    /// See [`Engine::build`].
    pub fn build_with_clock(config: HeraldConfig, clock: SharedClock) -> anyhow::Result<Self> {
        for (campaign, quotas) in &config.campaigns {
            herald_admission::distribution::validate_quotas(quotas)
                .map_err(|e| anyhow::anyhow!("Campaign {campaign}: {e}"))?;
        }

        let store = config.store.open(clock.clone())?;
        let shared: Arc<dyn SharedStore> = store.shared();

        let throttle = DomainThrottleController::new(&config.throttle, shared.clone(), clock.clone())?;
        let distributor =
            EspDistributor::new(config.distribution.clone(), shared.clone(), clock)?;
        let locks = LockService::open(&config.lock, shared)?;

        let pipeline = AdmissionPipeline::new(
            Arc::new(SuppressionEngine::new()),
            Arc::new(throttle),
            Arc::new(distributor),
        );

        Ok(Self {
            config,
            store,
            pipeline,
            locks,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &HeraldConfig {
        &self.config
    }

    #[must_use]
    pub const fn pipeline(&self) -> &AdmissionPipeline {
        &self.pipeline
    }

    #[must_use]
    pub const fn locks(&self) -> &LockService {
        &self.locks
    }

    /// Load every configured suppression source. Returns how many loaded.
    pub async fn load_suppression(&self) -> usize {
        let sources = &self.config.suppression.sources;
        let loaded = self.pipeline.suppression().load_sources(sources).await;
        internal!(
            level = INFO,
            "Loaded {loaded} of {} suppression sources",
            sources.len()
        );
        loaded
    }

    /// The scheduler with every fleet-wide job registered.
    #[must_use]
    pub fn scheduler(&self) -> ExclusiveScheduler {
        let mut scheduler = ExclusiveScheduler::new(self.locks.clone());
        if !self.config.campaigns.is_empty() {
            scheduler.register(
                Arc::new(DistributionSnapshot::new(
                    self.pipeline.distributor().clone(),
                    self.config.campaigns.keys().cloned().collect(),
                )),
                self.config.jobs.interval(),
            );
        }
        scheduler
    }

    /// Run this engine, and everything it controls, until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics cannot be initialised or the signal
    /// handlers cannot be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        herald_metrics::init_metrics(&self.config.metrics)?;

        internal!(level = INFO, "Herald starting");

        self.load_suppression().await;

        // Subscribe before anything can broadcast
        let reload_shutdown = SHUTDOWN_BROADCAST.subscribe();
        let purge_shutdown = SHUTDOWN_BROADCAST.subscribe();
        let jobs_shutdown = SHUTDOWN_BROADCAST.subscribe();

        let signalled = async {
            let result = shutdown().await;
            if result.is_err() {
                let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
            }
            result
        };

        let reload = async {
            let Some(period) = self.config.suppression.reload_interval() else {
                return;
            };
            every(period, reload_shutdown, || async {
                self.load_suppression().await;
            })
            .await;
        };

        let purge = async {
            let (OpenedStore::Memory(memory), Some(period)) =
                (&self.store, self.config.store.purge_interval())
            else {
                return;
            };
            every(period, purge_shutdown, || async {
                let purged = memory.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "Purged expired store entries");
                }
            })
            .await;
        };

        let scheduler = self.scheduler();
        let jobs = scheduler.serve(jobs_shutdown);

        let (signalled, (), (), ()) = tokio::join!(signalled, reload, purge, jobs);

        internal!(level = INFO, "Herald stopped");
        signalled
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use herald_admission::EspQuota;

    use super::*;

    #[test]
    fn test_invalid_campaign_quotas_rejected_at_build() {
        let mut config = HeraldConfig::default();
        config
            .campaigns
            .insert("broken".into(), vec![EspQuota::new("a", 50.0)]);

        let err = Engine::build(config).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_scheduler_only_has_jobs_with_campaigns() {
        let engine = Engine::build(HeraldConfig::default()).unwrap();
        assert!(engine.scheduler().is_empty());

        let mut config = HeraldConfig::default();
        config
            .campaigns
            .insert("spring".into(), vec![EspQuota::new("a", 100.0)]);
        let engine = Engine::build(config).unwrap();
        assert_eq!(engine.scheduler().len(), 1);
    }
}
