//! # heron-otel
//!
//! Opinionated OpenTelemetry bootstrap for [`axum`] services.
//!
//! One call wires OTLP traces, metrics, and logs to a collector and returns a
//! [`Telemetry`] handle exposing a request-tracing middleware layer, cached
//! metric instruments, explicit-context spans, and trace-correlated logs.
//! Shutting the handle down drains all three pipelines exactly once.
//!
//! ## Quick Start
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use heron_otel::TelemetryConfig;
//!
//! # async fn run() -> Result<(), heron_otel::TelemetryError> {
//! let telemetry = heron_otel::start(
//!     TelemetryConfig::builder()
//!         .service_name("checkout")
//!         .endpoint("http://collector:4317")
//!         .build(),
//! )
//! .await?;
//!
//! let app: Router = Router::new()
//!     .route("/healthz", get(|| async { "ok" }))
//!     .layer(telemetry.trace_layer());
//!
//! // ... serve the app ...
//!
//! telemetry.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Request context
//!
//! The middleware extracts W3C `traceparent` headers, opens a server span per
//! request, and stores the resulting [`opentelemetry::Context`] in request
//! extensions. Handlers take it with `Extension<Context>` and hand it to the
//! facades so child spans and logs line up under the request trace:
//!
//! ```no_run
//! use axum::Extension;
//! use heron_otel::re_exports::opentelemetry::Context;
//! # use heron_otel::Telemetry;
//!
//! async fn place_order(Extension(cx): Extension<Context>, telemetry: Telemetry) {
//!     let span = telemetry.trace().start_span(&cx, "reserve-stock");
//!     telemetry.log().info(span.context(), "stock reserved", Vec::new());
//!     telemetry.metric().increment_counter("orders_placed", &[]);
//!     span.end();
//! }
//! ```
//!
//! ## Configuration priority
//!
//! 1. **Programmatic** — values set on [`TelemetryConfig`]
//! 2. **Environment variables** — `OTEL_SERVICE_NAME`,
//!    `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_EXPORTER_OTLP_PROTOCOL`,
//!    `OTEL_RESOURCE_ATTRIBUTES`
//! 3. **Defaults** — gRPC transport, plaintext, 10s shutdown timeout, 3
//!    exporter attempts with exponential backoff

mod cache;
mod config;
mod env;
mod error;
mod exporter;
mod log;
mod metric;
mod middleware;
mod providers;
mod subscriber;
mod telemetry;
mod testing;
mod trace;

pub mod attrs;
pub mod re_exports;

pub use config::{LogLevel, Protocol, TelemetryConfig, TelemetryConfigBuilder, TlsConfig};
pub use error::{Signal, TelemetryError};
pub use log::LogApi;
pub use metric::MetricApi;
pub use middleware::{HttpTraceLayer, HttpTraceService};
pub use telemetry::{start, start_with_cancellation, Telemetry};
pub use trace::{SpanGuard, TraceApi};
