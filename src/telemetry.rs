use std::borrow::Cow;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opentelemetry::logs::LoggerProvider as _;
use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{Context, InstrumentationScope};
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{InstrumentCache, EVICTION_INTERVAL, INSTRUMENT_TTL};
use crate::config::TelemetryConfig;
use crate::env::ValidatedConfig;
use crate::error::TelemetryError;
use crate::log::LogApi;
use crate::metric::MetricApi;
use crate::middleware::HttpTraceLayer;
use crate::providers::{build_providers, Providers};
use crate::subscriber::install_global_subscriber;
use crate::trace::TraceApi;

/// Handle to a running telemetry instance.
///
/// Returned by [`start`]; cloning is cheap and every clone controls the same
/// pipelines. Hold one for the lifetime of the application and call
/// [`shutdown`](Telemetry::shutdown) on the way out so buffered data reaches
/// the collector.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("service_name", &self.inner.service_name)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

struct Inner {
    service_name: String,
    providers: Providers,
    tracer: SdkTracer,
    meter: Meter,
    log: LogApi,
    cache: Arc<InstrumentCache>,
    shutdown_timeout: Duration,
    shutdown_result: OnceCell<Result<(), TelemetryError>>,
    eviction_cancel: CancellationToken,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone without an explicit shutdown; stop the sweep task.
        // Buffered data is not flushed here, that needs `shutdown`.
        self.eviction_cancel.cancel();
    }
}

/// Start telemetry with the given configuration.
///
/// Validates the configuration, builds the three OTLP pipelines with the
/// configured retry budget, and spawns the background instrument sweep.
/// Failing pipelines already built during a failed startup are torn down
/// before the error is returned.
pub async fn start(config: TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    start_with_cancellation(config, CancellationToken::new()).await
}

/// Start telemetry, aborting retry backoffs promptly when `cancel` fires.
///
/// Useful when startup runs under a signal handler: cancelling the token
/// makes a pending exporter retry return [`TelemetryError::Cancelled`]
/// instead of waiting out its backoff.
pub async fn start_with_cancellation(
    config: TelemetryConfig,
    cancel: CancellationToken,
) -> Result<Telemetry, TelemetryError> {
    let validated = ValidatedConfig::resolve(config)?;
    let providers = build_providers(&validated, &cancel).await?;

    let scope = InstrumentationScope::builder(validated.service_name.clone()).build();
    let tracer = providers.tracer.tracer_with_scope(scope.clone());
    let meter = providers.meter.meter_with_scope(scope.clone());
    let logger = providers.logger.logger_with_scope(scope);

    if validated.set_global {
        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        providers.register_global();
        if let Err(e) = install_global_subscriber(&providers.tracer, &providers.logger) {
            let _ = providers.shutdown_all(validated.shutdown_timeout).await;
            return Err(e);
        }
    }

    let cache = Arc::new(InstrumentCache::new());
    let eviction_cancel = CancellationToken::new();
    let eviction_task = tokio::spawn(eviction_loop(
        Arc::clone(&cache),
        eviction_cancel.clone(),
    ));

    Ok(Telemetry {
        inner: Arc::new(Inner {
            service_name: validated.service_name,
            log: LogApi::new(logger, validated.log_level),
            providers,
            tracer,
            meter,
            cache,
            shutdown_timeout: validated.shutdown_timeout,
            shutdown_result: OnceCell::new(),
            eviction_cancel,
            eviction_task: Mutex::new(Some(eviction_task)),
        }),
    })
}

async fn eviction_loop(cache: Arc<InstrumentCache>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval fires immediately on the first tick
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cache.evict_stale(INSTRUMENT_TTL);
            }
            _ = cancel.cancelled() => return,
        }
    }
}

impl Telemetry {
    /// Service name this instance reports under.
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Span operations.
    pub fn trace(&self) -> TraceApi {
        TraceApi::new(self.inner.tracer.clone())
    }

    /// Metric recording.
    pub fn metric(&self) -> MetricApi {
        MetricApi::new(self.inner.meter.clone(), Arc::clone(&self.inner.cache))
    }

    /// Structured log emission.
    pub fn log(&self) -> LogApi {
        self.inner.log.clone()
    }

    /// Tower layer that traces every request through it.
    ///
    /// Apply it after the routes it should cover:
    ///
    /// ```ignore
    /// let app = Router::new()
    ///     .route("/orders", get(list_orders))
    ///     .layer(telemetry.trace_layer());
    /// ```
    pub fn trace_layer(&self) -> HttpTraceLayer {
        HttpTraceLayer::new(self.inner.tracer.clone())
    }

    /// Underlying tracer provider, for integrating other instrumentation.
    pub fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.inner.providers.tracer
    }

    /// Underlying meter provider.
    pub fn meter_provider(&self) -> &SdkMeterProvider {
        &self.inner.providers.meter
    }

    /// Underlying logger provider.
    pub fn logger_provider(&self) -> &SdkLoggerProvider {
        &self.inner.providers.logger
    }

    /// Run `f` inside a new child span of `cx`, recording any error on the
    /// span before it ends.
    pub async fn with_span<T, E, F, Fut>(
        &self,
        cx: &Context,
        name: impl Into<Cow<'static, str>>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        let trace = self.trace();
        let guard = trace.start_span(cx, name);
        let result = f(guard.context().clone()).await;
        if let Err(e) = &result {
            trace.record_error(guard.context(), e);
        }
        guard.end();
        result
    }

    /// Run `f`, record its wall time in milliseconds to a histogram, and
    /// record any error on the span in `cx`.
    pub async fn measure_duration<T, E, F, Fut>(
        &self,
        cx: &Context,
        metric_name: &str,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        let started = std::time::Instant::now();
        let result = f().await;
        self.metric()
            .record_duration(metric_name, started.elapsed(), &[]);
        if let Err(e) = &result {
            self.trace().record_error(cx, e);
        }
        result
    }

    /// Flush buffered telemetry on all pipelines without shutting down,
    /// bounded by the configured shutdown timeout.
    pub async fn flush(&self) -> Result<(), TelemetryError> {
        self.flush_with_timeout(self.inner.shutdown_timeout).await
    }

    /// Flush with an explicit deadline.
    pub async fn flush_with_timeout(&self, timeout: Duration) -> Result<(), TelemetryError> {
        let started = std::time::Instant::now();
        let result = self.inner.providers.flush_all(timeout).await;
        warn_if_slow("flush", started.elapsed(), timeout);
        result
    }

    /// Shut down all pipelines, draining buffered data first. Uses the
    /// configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<(), TelemetryError> {
        self.shutdown_with_timeout(self.inner.shutdown_timeout).await
    }

    /// Shut down with an explicit deadline.
    ///
    /// Idempotent: the pipelines are torn down exactly once, and every call
    /// after the first (including concurrent callers racing the first)
    /// receives the first call's result. The deadline of later calls is
    /// ignored for the same reason.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), TelemetryError> {
        let inner = &self.inner;
        inner
            .shutdown_result
            .get_or_init(|| async {
                let started = std::time::Instant::now();
                inner.eviction_cancel.cancel();
                let task = match inner.eviction_task.lock() {
                    Ok(mut guard) => guard.take(),
                    Err(poisoned) => poisoned.into_inner().take(),
                };
                if let Some(task) = task {
                    let _ = task.await;
                }
                let result = inner.providers.shutdown_all(timeout).await;
                warn_if_slow("shutdown", started.elapsed(), timeout);
                result
            })
            .await
            .clone()
    }

    /// Whether [`shutdown`](Telemetry::shutdown) has already completed.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown_result.initialized()
    }
}

fn warn_if_slow(operation: &str, elapsed: Duration, timeout: Duration) {
    if elapsed > timeout / 2 {
        tracing::warn!(
            target: "heron_otel",
            operation,
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "slow telemetry lifecycle operation"
        );
    }
}
