use opentelemetry::logs::{AnyValue, LogRecord as _, Logger as _, Severity};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::{Context, KeyValue, Value};
use opentelemetry_sdk::logs::SdkLogger;

use crate::config::LogLevel;

/// Structured log emission over the OTLP log pipeline.
///
/// Records below the configured minimum level are dropped before a record is
/// even allocated. When the supplied context carries an active span, the
/// record is stamped with its trace and span ids so the collector can join
/// logs to traces.
#[derive(Clone)]
pub struct LogApi {
    logger: SdkLogger,
    min_level: LogLevel,
}

impl LogApi {
    pub(crate) fn new(logger: SdkLogger, min_level: LogLevel) -> Self {
        LogApi { logger, min_level }
    }

    pub fn debug(&self, cx: &Context, message: impl Into<String>, attributes: Vec<KeyValue>) {
        self.emit(LogLevel::Debug, cx, message, attributes);
    }

    pub fn info(&self, cx: &Context, message: impl Into<String>, attributes: Vec<KeyValue>) {
        self.emit(LogLevel::Info, cx, message, attributes);
    }

    pub fn warn(&self, cx: &Context, message: impl Into<String>, attributes: Vec<KeyValue>) {
        self.emit(LogLevel::Warn, cx, message, attributes);
    }

    pub fn error(&self, cx: &Context, message: impl Into<String>, attributes: Vec<KeyValue>) {
        self.emit(LogLevel::Error, cx, message, attributes);
    }

    fn emit(
        &self,
        level: LogLevel,
        cx: &Context,
        message: impl Into<String>,
        attributes: Vec<KeyValue>,
    ) {
        if level < self.min_level {
            return;
        }
        let mut record = self.logger.create_log_record();
        record.set_observed_timestamp(std::time::SystemTime::now());
        record.set_severity_number(severity(level));
        record.set_severity_text(level.as_str());
        record.set_body(AnyValue::String(message.into().into()));
        for attribute in attributes {
            record.add_attribute(attribute.key, to_any_value(attribute.value));
        }
        let span = cx.span();
        let span_context = span.span_context();
        if span_context.is_valid() {
            record.set_trace_context(
                span_context.trace_id(),
                span_context.span_id(),
                Some(span_context.trace_flags()),
            );
        }
        self.logger.emit(record);
    }
}

fn severity(level: LogLevel) -> Severity {
    match level {
        LogLevel::Debug => Severity::Debug,
        LogLevel::Info => Severity::Info,
        LogLevel::Warn => Severity::Warn,
        LogLevel::Error => Severity::Error,
    }
}

fn to_any_value(value: Value) -> AnyValue {
    match value {
        Value::Bool(b) => AnyValue::Boolean(b),
        Value::I64(i) => AnyValue::Int(i),
        Value::F64(f) => AnyValue::Double(f),
        Value::String(s) => AnyValue::String(s),
        other => AnyValue::String(other.to_string().into()),
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::logs::LoggerProvider as _;
    use opentelemetry_sdk::logs::{InMemoryLogExporter, SdkLoggerProvider};

    use super::*;

    fn test_api(min_level: LogLevel) -> (LogApi, InMemoryLogExporter) {
        let exporter = InMemoryLogExporter::default();
        let provider = SdkLoggerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (
            LogApi::new(provider.logger("log-tests"), min_level),
            exporter,
        )
    }

    #[test]
    fn records_below_the_minimum_level_are_dropped() {
        let (api, exporter) = test_api(LogLevel::Warn);
        let cx = Context::new();

        api.debug(&cx, "noise", Vec::new());
        api.info(&cx, "chatter", Vec::new());
        api.warn(&cx, "heads up", Vec::new());
        api.error(&cx, "broken", Vec::new());

        assert_eq!(exporter.get_emitted_logs().unwrap().len(), 2);
    }

    #[test]
    fn attributes_and_spanless_context_are_accepted() {
        let (api, exporter) = test_api(LogLevel::Debug);

        api.info(
            &Context::new(),
            "order placed",
            vec![
                KeyValue::new("order.id", 981),
                KeyValue::new("express", true),
                KeyValue::new("total", 12.5),
            ],
        );

        assert_eq!(exporter.get_emitted_logs().unwrap().len(), 1);
    }
}
