use std::time::Duration;

use crate::config::{LogLevel, Protocol, TelemetryConfig};

impl TelemetryConfig {
    /// Configuration suitable for tests: plaintext gRPC to a localhost
    /// collector, a single fail-fast exporter attempt, error-only logging,
    /// and a short shutdown deadline.
    ///
    /// Startup succeeds without a running collector, so handler tests can
    /// exercise the full middleware and facade surface offline:
    ///
    /// ```ignore
    /// let telemetry = heron_otel::start(TelemetryConfig::for_tests("my-service")).await?;
    /// let app = Router::new()
    ///     .route("/orders", get(my_handler))
    ///     .layer(telemetry.trace_layer());
    /// ```
    pub fn for_tests(service_name: impl Into<String>) -> Self {
        TelemetryConfig::builder()
            .service_name(service_name)
            .endpoint("localhost:4317")
            .protocol(Protocol::Grpc)
            .insecure(true)
            .log_level(LogLevel::Error)
            .exporter_retries(0)
            .shutdown_timeout(Duration::from_secs(5))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use crate::env::tests::{clear_otel_env, ENV_LOCK};
    use crate::env::ValidatedConfig;

    use super::*;

    #[test]
    fn test_config_resolves_without_environment() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_otel_env();

        let resolved = ValidatedConfig::resolve(TelemetryConfig::for_tests("svc")).unwrap();
        assert_eq!(resolved.service_name, "svc");
        assert_eq!(resolved.protocol, Protocol::Grpc);
        assert!(resolved.insecure);
        assert_eq!(resolved.retry_attempts, 1);
        assert_eq!(resolved.log_level, LogLevel::Error);
    }
}
