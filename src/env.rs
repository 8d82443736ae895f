use std::collections::HashMap;
use std::time::Duration;

use crate::config::{LogLevel, Protocol, TelemetryConfig, TlsConfig};
use crate::error::TelemetryError;

pub(crate) const ENV_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
pub(crate) const ENV_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub(crate) const ENV_PROTOCOL: &str = "OTEL_EXPORTER_OTLP_PROTOCOL";
pub(crate) const ENV_RESOURCE_ATTRIBUTES: &str = "OTEL_RESOURCE_ATTRIBUTES";

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Fully resolved configuration after merging explicit values, environment
/// fallbacks, and defaults.
///
/// Priority (highest to lowest):
/// 1. Explicit — values set on [`TelemetryConfig`]
/// 2. Environment variables — `OTEL_SERVICE_NAME`, `OTEL_EXPORTER_OTLP_*`,
///    `OTEL_RESOURCE_ATTRIBUTES`
/// 3. Defaults
///
/// Immutable after [`resolve`](ValidatedConfig::resolve); cheap to clone.
#[derive(Debug, Clone)]
pub(crate) struct ValidatedConfig {
    pub service_name: String,
    pub endpoint: String,
    pub protocol: Protocol,
    pub insecure: bool,
    pub tls: Option<TlsConfig>,
    pub log_level: LogLevel,
    pub global_attributes: HashMap<String, String>,
    pub shutdown_timeout: Duration,
    /// Total exporter construction attempts; always >= 1.
    pub retry_attempts: u32,
    pub set_global: bool,
}

impl ValidatedConfig {
    /// Validate a user-supplied configuration, filling gaps from the
    /// environment.
    ///
    /// # Errors
    ///
    /// - service name or endpoint missing from both config and environment
    /// - unrecognized protocol token (config or environment)
    /// - inconsistent TLS settings
    pub fn resolve(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        let service_name = config
            .service_name
            .filter(|s| !s.is_empty())
            .or_else(|| env_var_non_empty(ENV_SERVICE_NAME))
            .ok_or(TelemetryError::MissingConfig("service name"))?;

        let endpoint = config
            .endpoint
            .filter(|s| !s.is_empty())
            .or_else(|| env_var_non_empty(ENV_ENDPOINT))
            .ok_or(TelemetryError::MissingConfig("endpoint"))?;

        let protocol = match config.protocol {
            Some(p) => p,
            None => match env_var_non_empty(ENV_PROTOCOL) {
                Some(token) => parse_protocol(&token)?,
                None => Protocol::Grpc,
            },
        };

        // Insecure defaults to true; setting TLS via the builder flips it.
        let insecure = config.insecure.unwrap_or(true);
        let tls = if insecure { None } else { config.tls };
        if let Some(tls) = &tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(TelemetryError::Tls(
                    "client certificate and key must both be set for mutual TLS".into(),
                ));
            }
            if tls.insecure_skip_verify && protocol == Protocol::Grpc {
                return Err(TelemetryError::Tls(
                    "insecure_skip_verify is not supported on the gRPC transport".into(),
                ));
            }
        }

        let mut global_attributes = parse_resource_attributes_env();
        // Explicit config wins per-key over the environment value.
        global_attributes.extend(config.global_attributes);

        let shutdown_timeout = config
            .shutdown_timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        // Tri-state: unset means the default budget, an explicit 0 means a
        // single fail-fast attempt.
        let retry_attempts = match config.exporter_retries {
            None => DEFAULT_RETRY_ATTEMPTS,
            Some(0) => 1,
            Some(n) => n,
        };

        Ok(ValidatedConfig {
            service_name,
            endpoint,
            protocol,
            insecure,
            tls,
            log_level: config.log_level.unwrap_or(LogLevel::Info),
            global_attributes,
            shutdown_timeout,
            retry_attempts,
            set_global: config.set_global,
        })
    }

    /// Endpoint with a scheme prefix, as the gRPC transport requires a URI.
    pub fn grpc_endpoint(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else if self.insecure {
            format!("http://{}", self.endpoint)
        } else {
            format!("https://{}", self.endpoint)
        }
    }

    /// Per-signal endpoint for the HTTP transport, e.g. `.../v1/traces`.
    pub fn http_endpoint(&self, path: &str) -> String {
        let base = if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else if self.insecure {
            format!("http://{}", self.endpoint)
        } else {
            format!("https://{}", self.endpoint)
        };
        format!("{}{}", base.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
impl ValidatedConfig {
    /// Minimal resolved config for tests that only touch resource building.
    pub(crate) fn for_resource_tests(
        service_name: &str,
        attrs: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        ValidatedConfig {
            service_name: service_name.to_owned(),
            endpoint: "localhost:4317".to_owned(),
            protocol: Protocol::Grpc,
            insecure: true,
            tls: None,
            log_level: LogLevel::Info,
            global_attributes: attrs.into_iter().collect(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            retry_attempts: 1,
            set_global: false,
        }
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn parse_protocol(token: &str) -> Result<Protocol, TelemetryError> {
    match token.to_ascii_lowercase().as_str() {
        "grpc" => Ok(Protocol::Grpc),
        "http" | "http/protobuf" => Ok(Protocol::Http),
        _ => Err(TelemetryError::InvalidProtocol(token.to_owned())),
    }
}

fn parse_resource_attributes_env() -> HashMap<String, String> {
    env_var_non_empty(ENV_RESOURCE_ATTRIBUTES)
        .map(|raw| parse_resource_attributes(&raw))
        .unwrap_or_default()
}

/// Parse a comma-separated `key=value` attribute string.
///
/// Backslash escapes a literal comma, equals sign, or backslash inside keys
/// and values. Keys and values are trimmed; entries with an empty key are
/// dropped.
pub(crate) fn parse_resource_attributes(raw: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for pair in split_unescaped(raw, ',') {
        let mut parts = split_unescaped(&pair, '=');
        let key = match parts.next() {
            Some(k) => k,
            None => continue,
        };
        let value = parts.next().unwrap_or_default();
        let key = unescape(key.trim());
        if key.is_empty() {
            continue;
        }
        attrs.insert(key, unescape(value.trim()));
    }
    attrs
}

/// Split on `sep`, honoring backslash escapes. Escapes are left in place for
/// [`unescape`] to resolve.
fn split_unescaped(raw: &str, sep: char) -> impl Iterator<Item = String> + '_ {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in raw.chars() {
        if escaped {
            current.push('\\');
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if escaped {
        current.push('\\');
    }
    parts.push(current);
    parts.into_iter()
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut escaped = false;
    for ch in raw.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    if escaped {
        out.push('\\');
    }
    out
}
