//! Named counters and histograms for the transaction state machine, via the
//! `prometheus` crate already used by `proxy::plugin::prometheus`. These
//! register into the same process-wide default registry that plugin uses,
//! so `admin::stats_snapshot` and the scrape endpoint both see one
//! consistent set of series. Names are kept distinct from the
//! `http_requests_total`/`http_status`/`http_latency` metrics the plugin
//! pipeline exposes, since those measure the plugin pipeline while these
//! measure the transaction state machine itself.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};

/// Response/request size buckets, bytes.
const SIZE_BUCKETS: &[f64] = &[100.0, 1_000.0, 3_000.0, 5_000.0, 10_000.0, 1_000_000.0];

/// Transfer speed buckets, bytes/sec.
const SPEED_BUCKETS: &[f64] = &[
    100.0,
    1_000.0,
    10_000.0,
    100_000.0,
    1_000_000.0,
    10_000_000.0,
    100_000_000.0,
];

pub static CACHE_HITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "loomgate_cache_hits_total",
        "Cache lookups resolved as a usable hit"
    )
    .unwrap()
});

pub static CACHE_MISSES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "loomgate_cache_misses_total",
        "Cache lookups resolved as a miss"
    )
    .unwrap()
});

pub static CACHE_WRITES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "loomgate_cache_writes_total",
        "Responses written into the cache"
    )
    .unwrap()
});

pub static CONNECT_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "loomgate_connect_failures_total",
        "Failed upstream connection attempts, by target kind",
        &["target"]
    )
    .unwrap()
});

pub static PARENT_SWITCHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "loomgate_parent_switches_total",
        "Times a transaction failed over from one parent/origin candidate to the next"
    )
    .unwrap()
});

pub static PARENT_MARKED_DOWN: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "loomgate_parent_marked_down_total",
        "Times a parent proxy was marked down after exhausting its per-parent retry budget"
    )
    .unwrap()
});

pub static REQUEST_SIZE_BYTES: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "loomgate_request_size_bytes",
        "Client request body size",
        &["direction"],
        SIZE_BUCKETS.to_vec()
    )
    .unwrap()
});

pub static RESPONSE_SIZE_BYTES: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "loomgate_response_size_bytes",
        "Response body size sent to the client",
        &["direction"],
        SIZE_BUCKETS.to_vec()
    )
    .unwrap()
});

pub static ORIGIN_SPEED_BYTES_PER_SEC: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "loomgate_origin_speed_bytes_per_second",
        "Observed transfer speed to/from the origin",
        &["direction"],
        SPEED_BUCKETS.to_vec()
    )
    .unwrap()
});

pub static MILESTONE_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "loomgate_milestone_duration_ms",
        "Elapsed time from TS_MILESTONE_SM_START to each named milestone",
        &["milestone"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap()
});

/// Forces registration of every metric above, so a fresh process exposes
/// them at zero rather than only after first use.
pub fn init() {
    Lazy::force(&CACHE_HITS);
    Lazy::force(&CACHE_MISSES);
    Lazy::force(&CACHE_WRITES);
    Lazy::force(&CONNECT_FAILURES);
    Lazy::force(&PARENT_SWITCHES);
    Lazy::force(&PARENT_MARKED_DOWN);
    Lazy::force(&REQUEST_SIZE_BYTES);
    Lazy::force(&RESPONSE_SIZE_BYTES);
    Lazy::force(&ORIGIN_SPEED_BYTES_PER_SEC);
    Lazy::force(&MILESTONE_DURATION_MS);
}

/// Renders every metric in the default registry (this module's plus
/// `plugin::prometheus`'s own) as Prometheus text exposition.
pub fn gather_text() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        log::error!("failed to encode metrics: {e}");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_after_init() {
        init();
        CACHE_HITS.inc();
        CONNECT_FAILURES.with_label_values(&["origin"]).inc();
        let text = gather_text();
        assert!(text.contains("loomgate_cache_hits_total"));
        assert!(text.contains("loomgate_connect_failures_total"));
    }
}
