use std::collections::HashMap;
use std::time::Duration;

/// OTLP transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// gRPC transport (default, port 4317).
    Grpc,
    /// HTTP with Protobuf encoding (port 4318).
    Http,
}

/// Minimum severity for log records emitted through [`LogApi`](crate::LogApi).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// TLS settings for the collector connection, used when the insecure flag is
/// off.
///
/// All fields are optional: with none set, the system trust store verifies the
/// server. Client certificate and key enable mutual TLS and must be set
/// together.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Path to a PEM client certificate (mutual TLS).
    pub cert_file: Option<String>,
    /// Path to the PEM private key matching `cert_file`.
    pub key_file: Option<String>,
    /// Path to a PEM CA bundle used instead of the system trust store.
    pub ca_file: Option<String>,
    /// Skip server certificate verification.
    ///
    /// **Unsafe outside of tests.** Only honored on the HTTP transport; the
    /// gRPC transport rejects it at validation time.
    pub insecure_skip_verify: bool,
}

/// Configuration for [`start`](crate::start).
///
/// Use [`TelemetryConfig::builder()`] to construct an instance. Every field is
/// optional here; required fields (service name, endpoint) fall back to
/// environment variables during validation and fail startup with a descriptive
/// error if still unset.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub(crate) service_name: Option<String>,
    pub(crate) endpoint: Option<String>,
    pub(crate) protocol: Option<Protocol>,
    pub(crate) insecure: Option<bool>,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) log_level: Option<LogLevel>,
    pub(crate) global_attributes: HashMap<String, String>,
    pub(crate) shutdown_timeout: Option<Duration>,
    pub(crate) exporter_retries: Option<u32>,
    pub(crate) set_global: bool,
}

impl TelemetryConfig {
    /// Create a new builder.
    pub fn builder() -> TelemetryConfigBuilder {
        TelemetryConfigBuilder::default()
    }
}

/// Builder for [`TelemetryConfig`].
#[derive(Debug, Default)]
pub struct TelemetryConfigBuilder {
    config: TelemetryConfig,
}

impl TelemetryConfigBuilder {
    /// Service name reported in every exported record.
    ///
    /// Falls back to `OTEL_SERVICE_NAME` when unset.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = Some(name.into());
        self
    }

    /// Collector endpoint, e.g. `"http://collector:4317"` or `"collector:4317"`.
    ///
    /// Falls back to `OTEL_EXPORTER_OTLP_ENDPOINT` when unset.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = Some(endpoint.into());
        self
    }

    /// Transport protocol. Falls back to `OTEL_EXPORTER_OTLP_PROTOCOL`, then
    /// gRPC.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = Some(protocol);
        self
    }

    /// Use a plaintext connection (the default) or not.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.config.insecure = Some(insecure);
        self
    }

    /// TLS settings for the collector connection. Implies `insecure(false)`.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self.config.insecure = Some(false);
        self
    }

    /// TLS verified against a custom CA bundle instead of the system trust
    /// store. Implies `insecure(false)`.
    pub fn trusted_ca(self, ca_file: impl Into<String>) -> Self {
        self.tls(TlsConfig {
            ca_file: Some(ca_file.into()),
            ..TlsConfig::default()
        })
    }

    /// Mutual TLS from certificate, key, and CA file paths. Implies
    /// `insecure(false)`.
    pub fn mtls(
        self,
        cert_file: impl Into<String>,
        key_file: impl Into<String>,
        ca_file: impl Into<String>,
    ) -> Self {
        self.tls(TlsConfig {
            cert_file: Some(cert_file.into()),
            key_file: Some(key_file.into()),
            ca_file: Some(ca_file.into()),
            insecure_skip_verify: false,
        })
    }

    /// Minimum severity for the log facade. Defaults to [`LogLevel::Info`].
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = Some(level);
        self
    }

    /// Attributes attached to every exported record (team, environment,
    /// region, ...). Merged with `OTEL_RESOURCE_ATTRIBUTES`; on a key
    /// conflict the value set here wins.
    pub fn global_attributes(
        mut self,
        attrs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.config.global_attributes = attrs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Add a single global attribute.
    pub fn global_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .global_attributes
            .insert(key.into(), value.into());
        self
    }

    /// Deadline applied to shutdown and flush when the caller supplies none.
    /// Zero falls back to the default of 10 seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = Some(timeout);
        self
    }

    /// Exporter construction attempts.
    ///
    /// Unset means the default of 3 attempts with exponential backoff.
    /// An explicit `0` requests a single fail-fast attempt with no backoff,
    /// intended for tests and CI runs where the collector is known absent.
    pub fn exporter_retries(mut self, attempts: u32) -> Self {
        self.config.exporter_retries = Some(attempts);
        self
    }

    /// Also register the providers as the process-wide OpenTelemetry
    /// defaults and install a global `tracing` subscriber bridging into them.
    ///
    /// Off by default: the returned handle is fully self-contained, so
    /// multiple instances (e.g. parallel test suites) do not interfere. Do
    /// not enable this with more than one live instance in the process.
    pub fn set_global(mut self, set_global: bool) -> Self {
        self.config.set_global = set_global;
        self
    }

    /// Build the [`TelemetryConfig`].
    pub fn build(self) -> TelemetryConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_builder_turns_off_insecure() {
        let cfg = TelemetryConfig::builder()
            .service_name("svc")
            .tls(TlsConfig::default())
            .build();
        assert_eq!(cfg.insecure, Some(false));
        assert!(cfg.tls.is_some());
    }

    #[test]
    fn trusted_ca_sets_only_the_ca_and_turns_off_insecure() {
        let cfg = TelemetryConfig::builder()
            .trusted_ca("/etc/certs/ca.pem")
            .build();
        assert_eq!(cfg.insecure, Some(false));
        let tls = cfg.tls.unwrap();
        assert_eq!(tls.ca_file.as_deref(), Some("/etc/certs/ca.pem"));
        assert!(tls.cert_file.is_none());
        assert!(tls.key_file.is_none());
        assert!(!tls.insecure_skip_verify);
    }

    #[test]
    fn global_attribute_accumulates() {
        let cfg = TelemetryConfig::builder()
            .global_attribute("team", "core")
            .global_attribute("region", "eu-west-1")
            .build();
        assert_eq!(cfg.global_attributes.len(), 2);
        assert_eq!(cfg.global_attributes["team"], "core");
    }

    #[test]
    fn log_levels_are_ordered() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
    }
}
