//! Curated re-exports of key OpenTelemetry and tracing types.
//!
//! These re-exports let users access commonly needed types (spans,
//! [`opentelemetry::Context`], [`opentelemetry::KeyValue`], cancellation
//! tokens) without adding direct dependencies on the underlying crates to
//! their own `Cargo.toml`.

/// Re-export of the `tracing` crate for convenient access.
pub use tracing;

/// Re-export of the `opentelemetry` API crate.
pub use opentelemetry;

/// Re-export of the `opentelemetry_sdk` crate.
pub use opentelemetry_sdk;

/// Re-export of `tracing_opentelemetry` for span context extensions.
pub use tracing_opentelemetry;

/// Re-export of `tokio_util` for [`tokio_util::sync::CancellationToken`],
/// accepted by [`start_with_cancellation`](crate::start_with_cancellation).
pub use tokio_util;
