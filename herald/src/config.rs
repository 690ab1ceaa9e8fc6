use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use herald_admission::{
    DistributionConfig, EspQuota, LockConfig, SchedulerConfig, SuppressionConfig, ThrottleConfig,
};
use herald_metrics::MetricsConfig;
use herald_store::StoreConfig;
use ron::extensions::Extensions;
use serde::Deserialize;

const CONFIG_ENV: &str = "HERALD_CONFIG";

/// Everything a herald process is configured with. Documents may name the
/// structure `Herald (..)` or leave it anonymous.
#[derive(Debug, Default, Deserialize)]
#[serde(rename = "Herald")]
pub struct HeraldConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub suppression: SuppressionConfig,

    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub distribution: DistributionConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub jobs: SchedulerConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Quota split per campaign
    #[serde(default)]
    pub campaigns: BTreeMap<String, Vec<EspQuota>>,
}

impl HeraldConfig {
    /// Parse a RON document. `Option` fields may be written without `Some`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid RON for this structure.
    pub fn from_ron(contents: &str) -> anyhow::Result<Self> {
        Ok(ron::Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME)
            .from_str(contents)?)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;
        Self::from_ron(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {}", path.display(), e))
    }

    /// # Errors
    ///
    /// Returns an error if `campaign` has no quota split configured.
    pub fn quotas(&self, campaign: &str) -> anyhow::Result<&[EspQuota]> {
        self.campaigns
            .get(campaign)
            .map(Vec::as_slice)
            .ok_or_else(|| anyhow::anyhow!("No quotas configured for campaign {campaign}"))
    }
}

/// Find the configuration file using the following precedence:
/// 1. `HERALD_CONFIG` environment variable
/// 2. ./herald.config.ron (current working directory)
/// 3. /etc/herald/herald.config.ron (system-wide config)
///
/// # Errors
///
/// Returns an error if `HERALD_CONFIG` names a missing file or no candidate
/// exists.
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    resolve_config_file(
        std::env::var(CONFIG_ENV).ok(),
        &[
            PathBuf::from("./herald.config.ron"),
            PathBuf::from("/etc/herald/herald.config.ron"),
        ],
    )
}

fn resolve_config_file(from_env: Option<String>, default_paths: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if let Some(env_path) = from_env {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use herald_admission::lock::LockBackendConfig;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HeraldConfig::from_ron("()").unwrap();
        assert!(matches!(config.store, StoreConfig::Memory(_)));
        assert_eq!(config.distribution.failure_threshold, 10);
        assert_eq!(config.jobs.interval(), Duration::from_secs(60));
        assert!(!config.metrics.enabled);
        assert!(config.campaigns.is_empty());
    }

    #[test]
    fn test_full_document() {
        let config = HeraldConfig::from_ron(
            r#"Herald (
                store: (type: "Redis", url: "redis://cache:6379", timeout_ms: 250),
                throttle: (
                    default_limits: (hourly: 5000),
                    organizations: {
                        "acme": (hourly: 1000, total_daily: 200000),
                    },
                    domains: {
                        "example.net": (hourly: 10, daily: 100),
                    },
                    backoff: (bounce_threshold: 0.08, backoff_multiplier: 2.0),
                ),
                distribution: (failure_threshold: 3),
                lock: (ttl_secs: 30, backend: (type: "Advisory", host: "db", dbname: "herald")),
                jobs: (interval_secs: 15),
                campaigns: {
                    "spring": [
                        (profile: "ses", percentage: 60.0),
                        (profile: "sendgrid", percentage: 40.0),
                    ],
                },
            )"#,
        )
        .unwrap();

        assert!(matches!(config.store, StoreConfig::Redis(_)));
        assert_eq!(config.throttle.default_limits.hourly, Some(5000));
        assert_eq!(config.throttle.organizations["acme"].total_daily, Some(200_000));
        assert_eq!(config.throttle.domains["example.net"].daily, Some(100));
        assert!((config.throttle.backoff.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(matches!(config.lock.backend, LockBackendConfig::Advisory(_)));
        assert_eq!(config.quotas("spring").unwrap().len(), 2);
        assert!(config.quotas("autumn").is_err());
    }

    #[test]
    fn test_named_and_anonymous_documents() {
        let named = HeraldConfig::from_ron("Herald (jobs: (interval_secs: 5))").unwrap();
        let anonymous = HeraldConfig::from_ron("(jobs: (interval_secs: 5))").unwrap();
        assert_eq!(named.jobs.interval(), anonymous.jobs.interval());
        assert!(HeraldConfig::from_ron("Config (jobs: (interval_secs: 5))").is_err());
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../herald.config.ron");
        let config = HeraldConfig::load(&path).unwrap();
        assert!(!config.suppression.sources.is_empty());
        assert!(config.quotas("spring-sale").is_ok());
    }

    #[test]
    fn test_default_config_builds_lock_service() {
        let config = HeraldConfig::default();
        let store = std::sync::Arc::new(herald_store::MemoryStore::default());
        let service = herald_admission::LockService::open(&config.lock, store).unwrap();
        assert_eq!(service.ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_env_path_must_exist() {
        let err = resolve_config_file(Some("/definitely/not/here.ron".into()), &[]).unwrap_err();
        assert!(err.to_string().contains(CONFIG_ENV));
    }

    #[test]
    fn test_first_existing_default_wins() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("herald.config.ron");
        std::fs::write(&present, "()").unwrap();

        let found = resolve_config_file(
            None,
            &[dir.path().join("missing.ron"), present.clone()],
        )
        .unwrap();
        assert_eq!(found, present);

        let err = resolve_config_file(None, &[dir.path().join("missing.ron")]).unwrap_err();
        assert!(err.to_string().contains("missing.ron"));
    }
}
