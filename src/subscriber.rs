use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::TelemetryError;

/// Compose and globally register a tracing subscriber bridging into the OTLP
/// pipelines.
///
/// Layers added:
/// - [`EnvFilter`] — respects `RUST_LOG` (defaults to `info`)
/// - `fmt` — formatted output to stdout
/// - `OpenTelemetryLayer` — bridges tracing spans to OTel traces
/// - `OpenTelemetryTracingBridge` — bridges tracing events to OTel logs
///
/// # Errors
///
/// Returns an error if a global subscriber has already been set.
pub(crate) fn install_global_subscriber(
    tracer_provider: &SdkTracerProvider,
    logger_provider: &SdkLoggerProvider,
) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let otel_trace_layer = {
        use opentelemetry::trace::TracerProvider as _;
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("heron-otel"))
    };

    let otel_log_layer =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(logger_provider);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_trace_layer)
        .with(otel_log_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| TelemetryError::GlobalInit(e.to_string()))
}
