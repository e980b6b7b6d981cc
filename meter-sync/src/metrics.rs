use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SYNC_CYCLES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_sync_cycles_total",
        "Total poll cycles completed"
    ))
    .unwrap();
    pub static ref SYNC_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_sync_failures_total",
        "Total poll cycles that marked a device unavailable"
    ))
    .unwrap();
    pub static ref SYNC_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_sync_skipped_total",
        "Total poll ticks skipped because a cycle was still running"
    ))
    .unwrap();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_sync_stream_messages_total",
        "Total messages received from the broker"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_sync_invalid_messages_total",
        "Total broker payloads that failed to parse"
    ))
    .unwrap();
    pub static ref SINK_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_sync_sink_failures_total",
        "Total capability writes rejected by the sink"
    ))
    .unwrap();
    pub static ref ACTIVE_SESSIONS: Gauge = Gauge::with_opts(Opts::new(
        "meter_sync_active_sessions",
        "Stream sessions currently open"
    ))
    .unwrap();
    pub static ref SYNC_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "meter_sync_cycle_latency_seconds",
            "Time taken by one fetch-aggregate-apply cycle"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    )
    .unwrap();
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(SYNC_CYCLES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(SYNC_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(SYNC_SKIPPED_TOTAL.clone()))
            .unwrap();
        REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
        REGISTRY
            .register(Box::new(INVALID_MESSAGES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(SINK_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY.register(Box::new(ACTIVE_SESSIONS.clone())).unwrap();
        REGISTRY
            .register(Box::new(SYNC_LATENCY_SECONDS.clone()))
            .unwrap();
    });
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
