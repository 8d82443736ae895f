use std::time::Duration;

/// Telemetry signal category, used to label per-pipeline failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Trace,
    Metric,
    Log,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Trace => f.write_str("trace"),
            Signal::Metric => f.write_str("metric"),
            Signal::Log => f.write_str("log"),
        }
    }
}

/// Errors returned from telemetry startup and lifecycle operations.
///
/// Steady-state recording calls (metrics, spans, logs) never return errors;
/// anomalies on those paths are logged and swallowed so that observability
/// cannot break the observed request path.
///
/// The type is `Clone` because the idempotent shutdown guard caches its first
/// outcome and hands the same result to every later caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TelemetryError {
    /// A required configuration field was neither set explicitly nor
    /// available from its environment fallback.
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// The transport protocol token (config or environment) was not one of
    /// the recognized values.
    #[error("unrecognized transport protocol {0:?} (expected \"grpc\" or \"http\")")]
    InvalidProtocol(String),

    /// TLS settings were invalid or certificate material could not be
    /// loaded. Never retried.
    #[error("invalid TLS configuration: {0}")]
    Tls(String),

    /// A single exporter construction attempt failed.
    #[error("failed to build {signal} exporter: {message}")]
    ExporterBuild { signal: Signal, message: String },

    /// Exporter construction failed after exhausting its retry budget.
    #[error("{signal} exporter failed after {attempts} attempts")]
    RetriesExhausted {
        signal: Signal,
        attempts: u32,
        #[source]
        source: Box<TelemetryError>,
    },

    /// Startup was cancelled while waiting out a retry backoff.
    #[error("startup cancelled during exporter construction")]
    Cancelled,

    /// One or more pipelines failed to shut down. Pipelines that succeeded
    /// were still drained; `failures` names only the ones that did not.
    #[error("telemetry shutdown failed: {}", .failures.join("; "))]
    ShutdownFailed { failures: Vec<String> },

    /// One or more pipelines failed to flush.
    #[error("telemetry flush failed: {}", .failures.join("; "))]
    FlushFailed { failures: Vec<String> },

    /// A shutdown or flush did not complete within its deadline.
    #[error("telemetry operation timed out after {0:?}")]
    Timeout(Duration),

    /// Global registration (process-wide subscriber) failed, typically
    /// because another subscriber was already installed.
    #[error("global telemetry registration failed: {0}")]
    GlobalInit(String),
}
