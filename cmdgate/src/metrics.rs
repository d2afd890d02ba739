// Prometheus metrics for cmdgate
//
// Exposed on the /metrics HTTP endpoint:
// - Admission decisions by status and tier (counter)
// - Evaluation latency (histogram)
// - Storage failures by operation (counter)
// - Lazy premium expiry normalizations (counter)

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::{Arc, Once};
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Decision metrics
    pub static ref ADMISSION_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("admission_decisions_total", "Admission decisions by status and tier"),
        &["status", "tier"]
    ).expect("Failed to create admission decisions metric");

    pub static ref EVALUATE_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("admission_evaluate_duration_seconds", "Time spent deciding one invocation")
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
    ).expect("Failed to create evaluate duration metric");

    pub static ref UNCONFIGURED_POLICY_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("admission_unconfigured_policy_total", "Invocations of commands with no applicable tier"),
        &["tier"]
    ).expect("Failed to create unconfigured policy metric");

    // Storage metrics
    pub static ref STORAGE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("admission_storage_errors_total", "Storage failures by operation"),
        &["operation"]
    ).expect("Failed to create storage errors metric");

    pub static ref ENTITLEMENT_NORMALIZATIONS_TOTAL: IntCounter = IntCounter::new(
        "entitlement_normalizations_total",
        "Expired premium records cleared on read"
    ).expect("Failed to create entitlement normalizations metric");

    pub static ref ANALYTICS_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "analytics_events_dropped_total",
        "Admission events that could not be recorded"
    ).expect("Failed to create analytics dropped metric");
}

static INIT: Once = Once::new();

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = register_all() {
            warn!("Failed to register metrics: {}", e);
        }
    });
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(ADMISSION_DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EVALUATE_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(UNCONFIGURED_POLICY_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORAGE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ENTITLEMENT_NORMALIZATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ANALYTICS_DROPPED_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
