use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{Protocol, TlsConfig};
use crate::env::ValidatedConfig;
use crate::error::{Signal, TelemetryError};

#[cfg(feature = "grpc")]
use opentelemetry_otlp::tonic_types::transport::{Certificate, ClientTlsConfig, Identity};
#[cfg(feature = "http")]
use opentelemetry_otlp::WithHttpConfig;
#[cfg(feature = "grpc")]
use opentelemetry_otlp::WithTonicConfig;
use opentelemetry_otlp::WithExportConfig;

const BACKOFF_INITIAL_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 1600;

/// Transport settings with TLS material already loaded from disk.
///
/// Certificate and key files are read exactly once, before any retry loop:
/// a broken certificate is a configuration mistake, not transient collector
/// unavailability, so it fails startup immediately.
#[derive(Clone)]
pub(crate) struct ExporterSettings {
    config: ValidatedConfig,
    tls: Option<TlsMaterial>,
}

impl ExporterSettings {
    pub fn from_config(config: &ValidatedConfig) -> Result<Self, TelemetryError> {
        let tls = match &config.tls {
            Some(tls_config) => Some(TlsMaterial::load(tls_config)?),
            None => None,
        };
        Ok(ExporterSettings {
            config: config.clone(),
            tls,
        })
    }
}

/// PEM bytes for the collector connection, held in memory after a single
/// load from the configured paths.
#[derive(Clone, Debug)]
struct TlsMaterial {
    ca_pem: Option<Vec<u8>>,
    identity_pem: Option<(Vec<u8>, Vec<u8>)>,
    #[cfg_attr(not(feature = "http"), allow(dead_code))]
    skip_verify: bool,
}

impl TlsMaterial {
    fn load(config: &TlsConfig) -> Result<Self, TelemetryError> {
        let ca_pem = config
            .ca_file
            .as_deref()
            .map(|path| read_pem(path, "CA certificate"))
            .transpose()?;
        let identity_pem = match (config.cert_file.as_deref(), config.key_file.as_deref()) {
            (Some(cert), Some(key)) => Some((
                read_pem(cert, "client certificate")?,
                read_pem(key, "client key")?,
            )),
            _ => None,
        };
        Ok(TlsMaterial {
            ca_pem,
            identity_pem,
            skip_verify: config.insecure_skip_verify,
        })
    }

    #[cfg(feature = "grpc")]
    fn tonic_tls(&self) -> ClientTlsConfig {
        let mut tls = ClientTlsConfig::new().with_native_roots();
        if let Some(ca) = &self.ca_pem {
            tls = tls.ca_certificate(Certificate::from_pem(ca.clone()));
        }
        if let Some((cert, key)) = &self.identity_pem {
            tls = tls.identity(Identity::from_pem(cert.clone(), key.clone()));
        }
        tls
    }

    #[cfg(feature = "http")]
    fn http_client(&self, signal: Signal) -> Result<reqwest::blocking::Client, TelemetryError> {
        let mut builder = reqwest::blocking::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30));
        if self.skip_verify {
            // Escape hatch for test collectors with self-signed certs.
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca) = &self.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca)
                .map_err(|e| TelemetryError::Tls(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some((cert, key)) = &self.identity_pem {
            let mut pem = cert.clone();
            pem.extend_from_slice(key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| TelemetryError::Tls(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        builder.build().map_err(|e| TelemetryError::ExporterBuild {
            signal,
            message: format!("failed to build HTTP client: {e}"),
        })
    }
}

fn read_pem(path: &str, what: &str) -> Result<Vec<u8>, TelemetryError> {
    std::fs::read(path)
        .map_err(|e| TelemetryError::Tls(format!("failed to read {what} {path:?}: {e}")))
}

fn build_err(signal: Signal, e: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::ExporterBuild {
        signal,
        message: e.to_string(),
    }
}

#[cfg(not(feature = "grpc"))]
fn grpc_disabled(signal: Signal) -> TelemetryError {
    TelemetryError::ExporterBuild {
        signal,
        message: "gRPC transport requested but the `grpc` feature is not enabled".into(),
    }
}

#[cfg(not(feature = "http"))]
fn http_disabled(signal: Signal) -> TelemetryError {
    TelemetryError::ExporterBuild {
        signal,
        message: "HTTP transport requested but the `http` feature is not enabled".into(),
    }
}

pub(crate) fn build_span_exporter(
    settings: &ExporterSettings,
) -> Result<opentelemetry_otlp::SpanExporter, TelemetryError> {
    let signal = Signal::Trace;
    match settings.config.protocol {
        Protocol::Grpc => {
            #[cfg(feature = "grpc")]
            {
                let mut builder = opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(settings.config.grpc_endpoint());
                if let Some(tls) = &settings.tls {
                    builder = builder.with_tls_config(tls.tonic_tls());
                }
                builder.build().map_err(|e| build_err(signal, e))
            }
            #[cfg(not(feature = "grpc"))]
            {
                Err(grpc_disabled(signal))
            }
        }
        Protocol::Http => {
            #[cfg(feature = "http")]
            {
                let mut builder = opentelemetry_otlp::SpanExporter::builder()
                    .with_http()
                    .with_endpoint(settings.config.http_endpoint("/v1/traces"));
                if let Some(tls) = &settings.tls {
                    builder = builder.with_http_client(tls.http_client(signal)?);
                }
                builder.build().map_err(|e| build_err(signal, e))
            }
            #[cfg(not(feature = "http"))]
            {
                Err(http_disabled(signal))
            }
        }
    }
}

pub(crate) fn build_metric_exporter(
    settings: &ExporterSettings,
) -> Result<opentelemetry_otlp::MetricExporter, TelemetryError> {
    let signal = Signal::Metric;
    match settings.config.protocol {
        Protocol::Grpc => {
            #[cfg(feature = "grpc")]
            {
                let mut builder = opentelemetry_otlp::MetricExporter::builder()
                    .with_tonic()
                    .with_endpoint(settings.config.grpc_endpoint());
                if let Some(tls) = &settings.tls {
                    builder = builder.with_tls_config(tls.tonic_tls());
                }
                builder.build().map_err(|e| build_err(signal, e))
            }
            #[cfg(not(feature = "grpc"))]
            {
                Err(grpc_disabled(signal))
            }
        }
        Protocol::Http => {
            #[cfg(feature = "http")]
            {
                let mut builder = opentelemetry_otlp::MetricExporter::builder()
                    .with_http()
                    .with_endpoint(settings.config.http_endpoint("/v1/metrics"));
                if let Some(tls) = &settings.tls {
                    builder = builder.with_http_client(tls.http_client(signal)?);
                }
                builder.build().map_err(|e| build_err(signal, e))
            }
            #[cfg(not(feature = "http"))]
            {
                Err(http_disabled(signal))
            }
        }
    }
}

pub(crate) fn build_log_exporter(
    settings: &ExporterSettings,
) -> Result<opentelemetry_otlp::LogExporter, TelemetryError> {
    let signal = Signal::Log;
    match settings.config.protocol {
        Protocol::Grpc => {
            #[cfg(feature = "grpc")]
            {
                let mut builder = opentelemetry_otlp::LogExporter::builder()
                    .with_tonic()
                    .with_endpoint(settings.config.grpc_endpoint());
                if let Some(tls) = &settings.tls {
                    builder = builder.with_tls_config(tls.tonic_tls());
                }
                builder.build().map_err(|e| build_err(signal, e))
            }
            #[cfg(not(feature = "grpc"))]
            {
                Err(grpc_disabled(signal))
            }
        }
        Protocol::Http => {
            #[cfg(feature = "http")]
            {
                let mut builder = opentelemetry_otlp::LogExporter::builder()
                    .with_http()
                    .with_endpoint(settings.config.http_endpoint("/v1/logs"));
                if let Some(tls) = &settings.tls {
                    builder = builder.with_http_client(tls.http_client(signal)?);
                }
                builder.build().map_err(|e| build_err(signal, e))
            }
            #[cfg(not(feature = "http"))]
            {
                Err(http_disabled(signal))
            }
        }
    }
}

/// Exponential backoff delay before attempt `attempt + 1`: 100ms doubling,
/// capped at 1.6s.
fn backoff_delay(attempt: u32) -> Duration {
    let millis = BACKOFF_INITIAL_MS
        .checked_shl(attempt)
        .unwrap_or(BACKOFF_CAP_MS)
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(millis)
}

/// Run `op` up to `attempts` times with exponential backoff between failures.
///
/// The inter-attempt wait races against `cancel`; cancellation aborts the
/// loop promptly with [`TelemetryError::Cancelled`] instead of waiting out
/// the remaining backoff. With `attempts <= 1` a single attempt is made and
/// its failure is returned unwrapped (fail-fast mode); otherwise the final
/// error wraps the last attempt's underlying cause.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    cancel: &CancellationToken,
    signal: Signal,
    attempts: u32,
    mut op: F,
) -> Result<T, TelemetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TelemetryError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TelemetryError::Cancelled);
        }
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempt += 1;
        if attempt >= attempts {
            if attempts == 1 {
                return Err(err);
            }
            return Err(TelemetryError::RetriesExhausted {
                signal,
                attempts,
                source: Box::new(err),
            });
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff_delay(attempt - 1)) => {}
            _ = cancel.cancelled() => return Err(TelemetryError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn failing_op(calls: Arc<AtomicU32>) -> impl FnMut() -> std::future::Ready<Result<(), TelemetryError>> {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(TelemetryError::ExporterBuild {
                signal: Signal::Trace,
                message: "collector unreachable".into(),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_makes_exactly_n_attempts_and_wraps_last_cause() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let err = retry_with_backoff(&cancel, Signal::Trace, 3, failing_op(calls.clone()))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match &err {
            TelemetryError::RetriesExhausted { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        // The last attempt's underlying cause is reachable via the source chain.
        let source = err.source().expect("wrapped cause");
        assert!(source.to_string().contains("collector unreachable"));
    }

    #[tokio::test]
    async fn fail_fast_makes_a_single_unwrapped_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let err = retry_with_backoff(&cancel, Signal::Metric, 1, failing_op(calls.clone()))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, TelemetryError::ExporterBuild { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();

        let result = retry_with_backoff(&cancel, Signal::Log, 5, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < 1 {
                Err(TelemetryError::ExporterBuild {
                    signal: Signal::Log,
                    message: "not yet".into(),
                })
            } else {
                Ok(42)
            })
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_backoff_returns_promptly() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = retry_with_backoff(&cancel, Signal::Trace, 5, failing_op(calls.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, TelemetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Aborted well before the first 100ms backoff elapsed.
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_all_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = retry_with_backoff(&cancel, Signal::Trace, 3, failing_op(calls.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, TelemetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let millis: Vec<u64> = (0..6).map(|a| backoff_delay(a).as_millis() as u64).collect();
        assert_eq!(millis, vec![100, 200, 400, 800, 1600, 1600]);
    }

    #[test]
    fn missing_tls_files_fail_without_retry() {
        let err = TlsMaterial::load(&TlsConfig {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, TelemetryError::Tls(_)));
    }
}
