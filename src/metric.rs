use std::sync::Arc;
use std::time::Duration;

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::cache::InstrumentCache;

/// Metric recording with instrument caching.
///
/// Instruments are looked up by name on every call and cached internally, so
/// recording a metric is a single map read on the hot path. Keep metric names
/// static and put dynamic values into attributes; a distinct name per user or
/// request leaks cache entries until the hourly sweep reclaims them.
#[derive(Clone)]
pub struct MetricApi {
    meter: Meter,
    cache: Arc<InstrumentCache>,
}

impl MetricApi {
    pub(crate) fn new(meter: Meter, cache: Arc<InstrumentCache>) -> Self {
        MetricApi { meter, cache }
    }

    /// Cached monotonic counter.
    pub fn counter(&self, name: &str) -> Counter<u64> {
        self.cache.counter_u64(&self.meter, name)
    }

    /// Cached floating-point counter.
    pub fn counter_f64(&self, name: &str) -> Counter<f64> {
        self.cache.counter_f64(&self.meter, name)
    }

    /// Cached gauge.
    pub fn gauge(&self, name: &str) -> Gauge<i64> {
        self.cache.gauge_i64(&self.meter, name)
    }

    /// Cached floating-point gauge.
    pub fn gauge_f64(&self, name: &str) -> Gauge<f64> {
        self.cache.gauge_f64(&self.meter, name)
    }

    /// Cached histogram.
    pub fn histogram(&self, name: &str) -> Histogram<u64> {
        self.cache.histogram_u64(&self.meter, name)
    }

    /// Cached floating-point histogram.
    pub fn histogram_f64(&self, name: &str) -> Histogram<f64> {
        self.cache.histogram_f64(&self.meter, name)
    }

    /// Add 1 to a counter.
    pub fn increment_counter(&self, name: &str, attributes: &[KeyValue]) {
        self.counter(name).add(1, attributes);
    }

    /// Add `value` to a counter.
    pub fn add_counter(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        self.counter(name).add(value, attributes);
    }

    /// Add `value` to a floating-point counter.
    pub fn add_counter_f64(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        self.counter_f64(name).add(value, attributes);
    }

    /// Record the current value of a gauge.
    pub fn record_gauge(&self, name: &str, value: i64, attributes: &[KeyValue]) {
        self.gauge(name).record(value, attributes);
    }

    /// Record the current value of a floating-point gauge.
    pub fn record_gauge_f64(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        self.gauge_f64(name).record(value, attributes);
    }

    /// Record a histogram observation.
    pub fn record_histogram(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        self.histogram(name).record(value, attributes);
    }

    /// Record a floating-point histogram observation.
    pub fn record_histogram_f64(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        self.histogram_f64(name).record(value, attributes);
    }

    /// Record a duration in milliseconds to a histogram.
    pub fn record_duration(&self, name: &str, duration: Duration, attributes: &[KeyValue]) {
        self.histogram(name)
            .record(duration.as_millis() as u64, attributes);
    }
}
