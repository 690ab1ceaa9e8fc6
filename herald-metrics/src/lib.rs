//! OpenTelemetry metrics for herald
//!
//! Admission decisions are counted with OpenTelemetry instruments and pushed
//! via OTLP to a collector.
//!
//! ```text
//! herald → OTLP/HTTP → OpenTelemetry Collector → Prometheus (scrape) → Grafana
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use herald_metrics::{init_metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MetricsConfig {
//!     enabled: true,
//!     endpoint: "http://localhost:4318/v1/metrics".to_string(),
//!     max_label_cardinality: 100,
//! };
//!
//! init_metrics(&config)?;
//!
//! if let Some(metrics) = herald_metrics::try_metrics() {
//!     metrics.admission.record_suppression_check(false);
//! }
//! # Ok(())
//! # }
//! ```

mod admission;
mod config;
mod error;
mod exporter;

pub use admission::{AdmissionMetrics, LockOutcome};
pub use config::MetricsConfig;
pub use error::MetricsError;
use once_cell::sync::OnceCell;

/// Global metrics instance
static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub admission: AdmissionMetrics,
}

/// Initialize the metrics system
///
/// This must be called once at startup before any metrics are recorded.
/// If metrics are disabled in the config, this is a no-op.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or if called twice.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    if METRICS_INSTANCE.get().is_some() {
        return Err(MetricsError::AlreadyInitialized);
    }

    if !(config.endpoint.starts_with("http://") || config.endpoint.starts_with("https://")) {
        return Err(MetricsError::InvalidEndpoint(config.endpoint.clone()));
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    let provider = exporter::init_otlp_exporter(&config.endpoint)?;
    opentelemetry::global::set_meter_provider(provider);

    let metrics = Metrics {
        admission: AdmissionMetrics::new(config.max_label_cardinality),
    };

    METRICS_INSTANCE
        .set(metrics)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// The global metrics instance, if metrics are enabled
#[must_use]
pub fn try_metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

/// Check if metrics are enabled
#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
