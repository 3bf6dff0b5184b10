use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_messages_total",
        "Total messages received from the broker"
    ))
    .unwrap();
    pub static ref MALFORMED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_malformed_messages_total",
        "Total status or registration payloads that could not be parsed"
    ))
    .unwrap();
    pub static ref REGISTRY_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_registry_updates_total",
        "Total registry writes caused by status or registration messages"
    ))
    .unwrap();
    pub static ref REGISTRY_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_registry_failures_total",
        "Total failed registry operations"
    ))
    .unwrap();
    pub static ref PUSH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_push_failures_total",
        "Total pushes to live subscribers that failed and evicted the subscriber"
    ))
    .unwrap();
    pub static ref COMMANDS_PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_commands_published_total",
        "Total ON/OFF commands published to devices"
    ))
    .unwrap();
    pub static ref ACTIVE_SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "bridge_active_subscribers",
        "Live push subscribers currently registered"
    ))
    .unwrap();
    pub static ref DISPATCH_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bridge_dispatch_latency_seconds",
            "Time taken to fan out and apply one inbound message"
        )
        .buckets(vec![
            0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5
        ])
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MALFORMED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REGISTRY_UPDATES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REGISTRY_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUSH_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_PUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_SUBSCRIBERS.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
