use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Hard ceiling on the number of cached instruments across all kinds.
pub(crate) const MAX_CACHED_INSTRUMENTS: usize = 10_000;
/// Instruments unused for this long are dropped by the eviction sweep.
pub(crate) const INSTRUMENT_TTL: Duration = Duration::from_secs(60 * 60);
/// Interval between eviction sweeps.
pub(crate) const EVICTION_INTERVAL: Duration = Duration::from_secs(10 * 60);

const CEILING_WARN_INTERVAL_MS: i64 = 60_000;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

struct CacheEntry<H> {
    handle: H,
    last_used: AtomicI64,
}

impl<H> CacheEntry<H> {
    fn new(handle: H) -> Self {
        CacheEntry {
            handle,
            last_used: AtomicI64::new(now_millis()),
        }
    }

    fn touch(&self) {
        self.last_used.store(now_millis(), Ordering::Relaxed);
    }
}

/// Concurrent instrument cache keyed by (name, value type, instrument kind).
///
/// One map per kind-and-value-type combination, so `counter_u64("x")` and
/// `counter_f64("x")` are distinct entries that coexist; each map's value
/// type is fixed statically and a lookup can never hand back a handle of the
/// wrong type. Hot-path lookups are lock-free reads; misses create the
/// instrument once even under racing callers.
///
/// A shared counter enforces [`MAX_CACHED_INSTRUMENTS`] across all maps;
/// past the ceiling, instruments are still created and returned, just not
/// cached, so recording keeps working while a rate-limited warning points at
/// the cardinality leak.
pub(crate) struct InstrumentCache {
    counters_u64: DashMap<String, Arc<CacheEntry<Counter<u64>>>>,
    counters_f64: DashMap<String, Arc<CacheEntry<Counter<f64>>>>,
    gauges_i64: DashMap<String, Arc<CacheEntry<Gauge<i64>>>>,
    gauges_f64: DashMap<String, Arc<CacheEntry<Gauge<f64>>>>,
    histograms_u64: DashMap<String, Arc<CacheEntry<Histogram<u64>>>>,
    histograms_f64: DashMap<String, Arc<CacheEntry<Histogram<f64>>>>,
    size: AtomicUsize,
    last_ceiling_warn: AtomicI64,
}

impl InstrumentCache {
    pub(crate) fn new() -> Self {
        InstrumentCache {
            counters_u64: DashMap::new(),
            counters_f64: DashMap::new(),
            gauges_i64: DashMap::new(),
            gauges_f64: DashMap::new(),
            histograms_u64: DashMap::new(),
            histograms_f64: DashMap::new(),
            size: AtomicUsize::new(0),
            last_ceiling_warn: AtomicI64::new(0),
        }
    }

    /// Number of cached instruments across all maps.
    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn get_or_create<H: Clone>(
        &self,
        map: &DashMap<String, Arc<CacheEntry<H>>>,
        name: &str,
        create: impl Fn() -> H,
    ) -> H {
        if let Some(entry) = map.get(name) {
            entry.touch();
            return entry.handle.clone();
        }

        if self.size.load(Ordering::Relaxed) >= MAX_CACHED_INSTRUMENTS {
            self.warn_ceiling();
            return create();
        }

        match map.entry(name.to_owned()) {
            Entry::Occupied(occupied) => {
                // Lost the race to another caller.
                occupied.get().touch();
                occupied.get().handle.clone()
            }
            Entry::Vacant(vacant) => {
                let handle = create();
                vacant.insert(Arc::new(CacheEntry::new(handle.clone())));
                self.size.fetch_add(1, Ordering::Relaxed);
                handle
            }
        }
    }

    fn warn_ceiling(&self) {
        let now = now_millis();
        let last = self.last_ceiling_warn.load(Ordering::Relaxed);
        if now - last >= CEILING_WARN_INTERVAL_MS
            && self
                .last_ceiling_warn
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            tracing::warn!(
                target: "heron_otel",
                limit = MAX_CACHED_INSTRUMENTS,
                "instrument cache at capacity; new instruments are created uncached"
            );
        }
    }

    pub(crate) fn counter_u64(&self, meter: &Meter, name: &str) -> Counter<u64> {
        self.get_or_create(&self.counters_u64, name, || {
            meter.u64_counter(name.to_owned()).build()
        })
    }

    pub(crate) fn counter_f64(&self, meter: &Meter, name: &str) -> Counter<f64> {
        self.get_or_create(&self.counters_f64, name, || {
            meter.f64_counter(name.to_owned()).build()
        })
    }

    pub(crate) fn gauge_i64(&self, meter: &Meter, name: &str) -> Gauge<i64> {
        self.get_or_create(&self.gauges_i64, name, || {
            meter.i64_gauge(name.to_owned()).build()
        })
    }

    pub(crate) fn gauge_f64(&self, meter: &Meter, name: &str) -> Gauge<f64> {
        self.get_or_create(&self.gauges_f64, name, || {
            meter.f64_gauge(name.to_owned()).build()
        })
    }

    pub(crate) fn histogram_u64(&self, meter: &Meter, name: &str) -> Histogram<u64> {
        self.get_or_create(&self.histograms_u64, name, || {
            meter.u64_histogram(name.to_owned()).build()
        })
    }

    pub(crate) fn histogram_f64(&self, meter: &Meter, name: &str) -> Histogram<f64> {
        self.get_or_create(&self.histograms_f64, name, || {
            meter.f64_histogram(name.to_owned()).build()
        })
    }

    /// Drop every instrument not used within `ttl`. Returns the number of
    /// evicted entries.
    pub(crate) fn evict_stale(&self, ttl: Duration) -> usize {
        let cutoff = now_millis() - ttl.as_millis() as i64;
        let mut evicted = 0usize;
        retain_fresh(&self.counters_u64, cutoff, &mut evicted);
        retain_fresh(&self.counters_f64, cutoff, &mut evicted);
        retain_fresh(&self.gauges_i64, cutoff, &mut evicted);
        retain_fresh(&self.gauges_f64, cutoff, &mut evicted);
        retain_fresh(&self.histograms_u64, cutoff, &mut evicted);
        retain_fresh(&self.histograms_f64, cutoff, &mut evicted);
        if evicted > 0 {
            self.size.fetch_sub(evicted, Ordering::Relaxed);
            tracing::debug!(target: "heron_otel", evicted, "evicted stale instruments");
        }
        evicted
    }
}

fn retain_fresh<H>(map: &DashMap<String, Arc<CacheEntry<H>>>, cutoff: i64, evicted: &mut usize) {
    map.retain(|_, entry| {
        let keep = entry.last_used.load(Ordering::Relaxed) >= cutoff;
        *evicted += usize::from(!keep);
        keep
    });
}

#[cfg(test)]
mod tests {
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;

    use super::*;

    fn test_meter() -> Meter {
        SdkMeterProvider::builder().build().meter("cache-tests")
    }

    #[test]
    fn repeated_lookups_hit_the_same_entry() {
        let cache = InstrumentCache::new();
        let meter = test_meter();

        cache.counter_u64(&meter, "requests_total");
        cache.counter_u64(&meter, "requests_total");
        assert_eq!(cache.len(), 1);

        cache.histogram_f64(&meter, "latency_seconds");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_misses_cache_a_single_entry() {
        let cache = Arc::new(InstrumentCache::new());
        let meter = test_meter();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                let meter = meter.clone();
                scope.spawn(move || {
                    for _ in 0..100 {
                        cache.counter_u64(&meter, "shared_counter");
                    }
                });
            }
        });

        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn one_name_with_both_value_types_keeps_two_entries() {
        let cache = InstrumentCache::new();
        let meter = test_meter();

        cache.counter_u64(&meter, "amount");
        cache.counter_f64(&meter, "amount");
        assert_eq!(cache.len(), 2);

        // Alternating calls hit their own entries, no churn.
        cache.counter_u64(&meter, "amount");
        cache.counter_f64(&meter, "amount");
        assert_eq!(cache.len(), 2);
        assert!(cache.counters_u64.contains_key("amount"));
        assert!(cache.counters_f64.contains_key("amount"));
    }

    #[test]
    fn one_name_across_instrument_kinds_keeps_distinct_entries() {
        let cache = InstrumentCache::new();
        let meter = test_meter();

        cache.counter_u64(&meter, "bytes");
        cache.histogram_u64(&meter, "bytes");
        cache.gauge_i64(&meter, "bytes");
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn ceiling_stops_caching_but_not_creation() {
        let cache = InstrumentCache::new();
        let meter = test_meter();
        cache.size.store(MAX_CACHED_INSTRUMENTS, Ordering::Relaxed);

        cache.counter_u64(&meter, "overflow_counter");
        assert!(!cache.counters_u64.contains_key("overflow_counter"));
        assert_eq!(cache.len(), MAX_CACHED_INSTRUMENTS);
    }

    #[test]
    fn eviction_drops_only_stale_entries() {
        let cache = InstrumentCache::new();
        let meter = test_meter();

        cache.counter_u64(&meter, "old");
        cache.gauge_f64(&meter, "fresh");
        cache
            .counters_u64
            .get("old")
            .unwrap()
            .last_used
            .store(now_millis() - 2 * 60 * 60 * 1000, Ordering::Relaxed);

        let evicted = cache.evict_stale(INSTRUMENT_TTL);
        assert_eq!(evicted, 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.counters_u64.contains_key("old"));
        assert!(cache.gauges_f64.contains_key("fresh"));
    }

    #[test]
    fn recent_use_resets_the_clock() {
        let cache = InstrumentCache::new();
        let meter = test_meter();

        cache.counter_u64(&meter, "busy");
        cache
            .counters_u64
            .get("busy")
            .unwrap()
            .last_used
            .store(now_millis() - 2 * 60 * 60 * 1000, Ordering::Relaxed);

        // A lookup refreshes last_used, so the sweep keeps it.
        cache.counter_u64(&meter, "busy");
        assert_eq!(cache.evict_stale(INSTRUMENT_TTL), 0);
        assert_eq!(cache.len(), 1);
    }
}
