use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metrics already initialized")]
    AlreadyInitialized,

    /// The OTLP endpoint is not an http(s) URL
    #[error("Invalid OTLP endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("OpenTelemetry error: {0}")]
    OpenTelemetry(String),
}
