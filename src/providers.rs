use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::logs::{BatchLogProcessor, SdkLoggerProvider};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tokio_util::sync::CancellationToken;

use crate::env::ValidatedConfig;
use crate::error::{Signal, TelemetryError};
use crate::exporter::{
    build_log_exporter, build_metric_exporter, build_span_exporter, retry_with_backoff,
    ExporterSettings,
};

/// The three OTLP pipelines behind one handle.
///
/// Cloning is cheap; all three SDK providers are internally reference-counted
/// and every clone controls the same pipelines.
#[derive(Clone)]
pub(crate) struct Providers {
    pub(crate) tracer: SdkTracerProvider,
    pub(crate) meter: SdkMeterProvider,
    pub(crate) logger: SdkLoggerProvider,
}

pub(crate) fn build_resource(config: &ValidatedConfig) -> Resource {
    let attributes: Vec<KeyValue> = config
        .global_attributes
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();
    Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes(attributes)
        .build()
}

/// Build one exporter with the configured retry budget. Construction runs on
/// the blocking pool because the HTTP transport builds a blocking client.
async fn build_exporter<E, F>(
    cancel: &CancellationToken,
    signal: Signal,
    attempts: u32,
    settings: &ExporterSettings,
    build: F,
) -> Result<E, TelemetryError>
where
    E: Send + 'static,
    F: Fn(&ExporterSettings) -> Result<E, TelemetryError> + Send + Clone + 'static,
{
    retry_with_backoff(cancel, signal, attempts, || {
        let settings = settings.clone();
        let build = build.clone();
        async move {
            tokio::task::spawn_blocking(move || build(&settings))
                .await
                .map_err(|e| TelemetryError::ExporterBuild {
                    signal,
                    message: format!("exporter build task failed: {e}"),
                })?
        }
    })
    .await
}

fn discard_provider(what: &str, result: OTelSdkResult) {
    if let Err(e) = result {
        tracing::warn!(target: "heron_otel", error = %e, "failed to tear down partially built {what} pipeline");
    }
}

/// Construct all three pipelines, in signal order: traces, metrics, logs.
///
/// If a later pipeline fails its retry budget, the pipelines already built
/// are shut down before the error is returned so no orphaned batch workers
/// outlive a failed startup.
pub(crate) async fn build_providers(
    config: &ValidatedConfig,
    cancel: &CancellationToken,
) -> Result<Providers, TelemetryError> {
    let settings = ExporterSettings::from_config(config)?;
    let resource = build_resource(config);
    let attempts = config.retry_attempts;

    let span_exporter =
        build_exporter(cancel, Signal::Trace, attempts, &settings, build_span_exporter).await?;
    let tracer = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(span_exporter).build())
        .with_resource(resource.clone())
        .build();

    let metric_exporter = match build_exporter(
        cancel,
        Signal::Metric,
        attempts,
        &settings,
        build_metric_exporter,
    )
    .await
    {
        Ok(exporter) => exporter,
        Err(e) => {
            discard_provider("trace", tracer.shutdown());
            return Err(e);
        }
    };
    let meter = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(metric_exporter).build())
        .with_resource(resource.clone())
        .build();

    let log_exporter = match build_exporter(
        cancel,
        Signal::Log,
        attempts,
        &settings,
        build_log_exporter,
    )
    .await
    {
        Ok(exporter) => exporter,
        Err(e) => {
            discard_provider("trace", tracer.shutdown());
            discard_provider("metric", meter.shutdown());
            return Err(e);
        }
    };
    let logger = SdkLoggerProvider::builder()
        .with_log_processor(BatchLogProcessor::builder(log_exporter).build())
        .with_resource(resource)
        .build();

    Ok(Providers {
        tracer,
        meter,
        logger,
    })
}

/// Collect failure descriptions from per-pipeline results. Every pipeline's
/// result is inspected; one failure never short-circuits the others.
fn collect_failures(results: Vec<(Signal, OTelSdkResult)>) -> Vec<String> {
    results
        .into_iter()
        .filter_map(|(signal, result)| result.err().map(|e| format!("{signal}: {e}")))
        .collect()
}

impl Providers {
    /// Register these pipelines as the process-wide OpenTelemetry defaults.
    pub(crate) fn register_global(&self) {
        opentelemetry::global::set_tracer_provider(self.tracer.clone());
        opentelemetry::global::set_meter_provider(self.meter.clone());
    }

    /// Shut down all three pipelines, draining buffered data first.
    ///
    /// Each pipeline is shut down even when an earlier one fails; failures
    /// are aggregated into a single [`TelemetryError::ShutdownFailed`]. The
    /// whole operation is bounded by `deadline`.
    pub(crate) async fn shutdown_all(&self, deadline: Duration) -> Result<(), TelemetryError> {
        let providers = self.clone();
        let work = tokio::task::spawn_blocking(move || {
            vec![
                (Signal::Trace, providers.tracer.shutdown()),
                (Signal::Metric, providers.meter.shutdown()),
                (Signal::Log, providers.logger.shutdown()),
            ]
        });
        match tokio::time::timeout(deadline, work).await {
            Err(_) => Err(TelemetryError::Timeout(deadline)),
            Ok(Err(join_err)) => Err(TelemetryError::ShutdownFailed {
                failures: vec![format!("shutdown task failed: {join_err}")],
            }),
            Ok(Ok(results)) => {
                let failures = collect_failures(results);
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(TelemetryError::ShutdownFailed { failures })
                }
            }
        }
    }

    /// Flush buffered data on all three pipelines without tearing them down.
    pub(crate) async fn flush_all(&self, deadline: Duration) -> Result<(), TelemetryError> {
        let providers = self.clone();
        let work = tokio::task::spawn_blocking(move || {
            vec![
                (Signal::Trace, providers.tracer.force_flush()),
                (Signal::Metric, providers.meter.force_flush()),
                (Signal::Log, providers.logger.force_flush()),
            ]
        });
        match tokio::time::timeout(deadline, work).await {
            Err(_) => Err(TelemetryError::Timeout(deadline)),
            Ok(Err(join_err)) => Err(TelemetryError::FlushFailed {
                failures: vec![format!("flush task failed: {join_err}")],
            }),
            Ok(Ok(results)) => {
                let failures = collect_failures(results);
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(TelemetryError::FlushFailed { failures })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry_sdk::error::OTelSdkError;

    use super::*;

    fn plain_providers() -> Providers {
        // No processors or readers attached, so lifecycle calls are local.
        Providers {
            tracer: SdkTracerProvider::builder().build(),
            meter: SdkMeterProvider::builder().build(),
            logger: SdkLoggerProvider::builder().build(),
        }
    }

    #[test]
    fn failure_collection_inspects_every_pipeline() {
        let failures = collect_failures(vec![
            (
                Signal::Trace,
                Err(OTelSdkError::InternalFailure("span queue stuck".into())),
            ),
            (Signal::Metric, Ok(())),
            (
                Signal::Log,
                Err(OTelSdkError::InternalFailure("drain refused".into())),
            ),
        ]);
        assert_eq!(failures.len(), 2);
        assert!(failures[0].starts_with("trace:"));
        assert!(failures[1].starts_with("log:"));
    }

    #[test]
    fn no_failures_yields_empty_collection() {
        let failures = collect_failures(vec![
            (Signal::Trace, Ok(())),
            (Signal::Metric, Ok(())),
            (Signal::Log, Ok(())),
        ]);
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn shutdown_all_succeeds_on_idle_pipelines() {
        let providers = plain_providers();
        providers
            .shutdown_all(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn flush_all_succeeds_on_idle_pipelines() {
        let providers = plain_providers();
        providers.flush_all(Duration::from_secs(5)).await.unwrap();
    }

    #[test]
    fn resource_carries_service_name_and_global_attributes() {
        let config = ValidatedConfig::for_resource_tests(
            "checkout",
            [("team".to_string(), "payments".to_string())],
        );
        let resource = build_resource(&config);
        let team = resource.get(&opentelemetry::Key::from_static_str("team"));
        assert_eq!(team.map(|v| v.to_string()), Some("payments".to_string()));
        let name = resource.get(&opentelemetry::Key::from_static_str("service.name"));
        assert_eq!(name.map(|v| v.to_string()), Some("checkout".to_string()));
    }
}
