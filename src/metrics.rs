//! Prometheus metrics for the generation pipeline.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup before building the
//! orchestrator. The helper functions (`record_stage_latency`, `inc_request`, …)
//! are no-ops if `init_metrics` was never called, so the pipeline is always
//! safe to run and observability simply degrades.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `comic_requests_total` | Counter | `outcome` |
//! | `comic_errors_total` | Counter | `stage`, `err_type` |
//! | `comic_stage_duration_seconds` | Histogram | `stage` |
//! | `comic_upstream_attempts_total` | Counter | `result` |
//! | `comic_admission_rejections_total` | Counter | `reason` |
//! | `comic_slots_available` | Gauge | |
//! | `comic_fields_filtered_total` | Counter | `field` |

use crate::OrchestratorError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the orchestrator, stored in a single
/// [`OnceLock`] and initialised together.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Finished requests by outcome (`ok` or an error code).
    pub requests_total: CounterVec,
    /// Errors by stage and error type.
    pub errors_total: CounterVec,
    /// Stage processing latency histogram.
    pub stage_duration: HistogramVec,
    /// Individual generator attempts by result.
    pub upstream_attempts: CounterVec,
    /// Refused admissions by reason.
    pub admission_rejections: CounterVec,
    /// Free admission slots at the last health tick.
    pub slots_available: IntGauge,
    /// Text fields rewritten by the safety filter.
    pub fields_filtered: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: Result<C, prometheus::Error>) -> Result<C, OrchestratorError>
where
    C: Collector + Clone + 'static,
{
    let collector = collector
        .map_err(|e| OrchestratorError::UnexpectedFailure(format!("metrics init failed: {e}")))?;
    registry.register(Box::new(collector.clone())).map_err(|e| {
        OrchestratorError::UnexpectedFailure(format!("metrics registration failed: {e}"))
    })?;
    Ok(collector)
}

fn build(registry: Registry, prefix: &str) -> Result<Metrics, OrchestratorError> {
    let name = |suffix: &str| format!("{prefix}_{suffix}");

    let requests_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("requests_total"), "Finished requests by outcome"),
            &["outcome"],
        ),
    )?;
    let errors_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("errors_total"), "Errors by stage and type"),
            &["stage", "err_type"],
        ),
    )?;
    let stage_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(name("stage_duration_seconds"), "Processing duration per stage"),
            &["stage"],
        ),
    )?;
    let upstream_attempts = register(
        &registry,
        CounterVec::new(
            Opts::new(name("upstream_attempts_total"), "Generator attempts by result"),
            &["result"],
        ),
    )?;
    let admission_rejections = register(
        &registry,
        CounterVec::new(
            Opts::new(name("admission_rejections_total"), "Refused admissions by reason"),
            &["reason"],
        ),
    )?;
    let slots_available = register(
        &registry,
        IntGauge::new(name("slots_available"), "Free admission slots"),
    )?;
    let fields_filtered = register(
        &registry,
        CounterVec::new(
            Opts::new(name("fields_filtered_total"), "Text fields rewritten by the safety filter"),
            &["field"],
        ),
    )?;

    Ok(Metrics {
        registry,
        requests_total,
        errors_total,
        stage_duration,
        upstream_attempts,
        admission_rejections,
        slots_available,
        fields_filtered,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::UnexpectedFailure`] if metric construction or
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build(Registry::new(), "comic")?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Record the processing latency for a pipeline stage.
///
/// No-op if metrics have not been initialised.
pub fn record_stage_latency(stage: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.stage_duration.get_metric_with_label_values(&[stage]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Count one finished request by outcome.
///
/// No-op if metrics have not been initialised.
pub fn inc_request(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Increment the error counter for a stage and error type.
///
/// No-op if metrics have not been initialised.
pub fn inc_error(stage: &str, err_type: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .errors_total
            .get_metric_with_label_values(&[stage, err_type])
        {
            c.inc();
        }
    }
}

/// Count one generator attempt (`ok` or `err`).
///
/// No-op if metrics have not been initialised.
pub fn inc_upstream_attempt(result: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.upstream_attempts.get_metric_with_label_values(&[result]) {
            c.inc();
        }
    }
}

/// Count one refused admission (`degraded` or `timeout`).
///
/// No-op if metrics have not been initialised.
pub fn inc_admission_rejection(reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .admission_rejections
            .get_metric_with_label_values(&[reason])
        {
            c.inc();
        }
    }
}

/// Set the free-slot gauge.
///
/// No-op if metrics have not been initialised.
pub fn set_slots_available(slots: usize) {
    if let Some(m) = metrics() {
        m.slots_available
            .set(i64::try_from(slots).unwrap_or(i64::MAX));
    }
}

/// Count one text field rewritten by the safety filter.
///
/// No-op if metrics have not been initialised.
pub fn inc_field_filtered(field: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.fields_filtered.get_metric_with_label_values(&[field]) {
            c.inc();
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// A structured snapshot of key metric counters.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Finished requests keyed by outcome.
    pub requests_total: HashMap<String, u64>,
    /// Error counts keyed by `"stage:err_type"`.
    pub errors_total: HashMap<String, u64>,
    /// Refused admissions keyed by reason.
    pub admission_rejections: HashMap<String, u64>,
    /// Generator attempts keyed by result.
    pub upstream_attempts: HashMap<String, u64>,
}

/// Counter values keyed by `labels` values joined with `:`, in the order given.
fn counter_values(vec: &CounterVec, labels: &[&str]) -> HashMap<String, u64> {
    let mut values = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = labels
                .iter()
                .map(|name| {
                    metric
                        .get_label()
                        .iter()
                        .find(|l| l.get_name() == *name)
                        .map_or("unknown", |l| l.get_value())
                })
                .collect::<Vec<_>>()
                .join(":");
            values.insert(key, metric.get_counter().get_value() as u64);
        }
    }
    values
}

/// Return a structured summary of current metric counter values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };

    MetricsSummary {
        requests_total: counter_values(&m.requests_total, &["outcome"]),
        errors_total: counter_values(&m.errors_total, &["stage", "err_type"]),
        admission_rejections: counter_values(&m.admission_rejections, &["reason"]),
        upstream_attempts: counter_values(&m.upstream_attempts, &["result"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The global `METRICS` OnceLock cannot be reset between tests, so tests
    /// that check exact values build an isolated bundle instead.
    fn make_test_metrics() -> Metrics {
        build(Registry::new(), "t").expect("test: isolated metrics build")
    }

    #[test]
    fn test_init_metrics_idempotent_second_call_is_noop() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_before_init_do_not_panic() {
        record_stage_latency("pre-init-stage", Duration::from_millis(5));
        inc_admission_rejection("timeout");
        set_slots_available(3);
    }

    #[test]
    fn test_stage_latency_records_observation_in_isolated_metrics() {
        let m = make_test_metrics();
        m.stage_duration
            .get_metric_with_label_values(&["gateway"])
            .expect("test: label values")
            .observe(0.005);
        let families = m.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "t_stage_duration_seconds")
            .expect("test: histogram family present");
        assert_eq!(family.get_metric()[0].get_histogram().get_sample_count(), 1);
    }

    #[test]
    fn test_counter_values_keys_follow_declared_label_order() {
        let m = make_test_metrics();
        for _ in 0..2 {
            m.errors_total
                .get_metric_with_label_values(&["gateway", "parse_fallback"])
                .expect("test: label values")
                .inc();
        }
        let values = counter_values(&m.errors_total, &["stage", "err_type"]);
        assert_eq!(values.get("gateway:parse_fallback"), Some(&2));
        assert_eq!(values.get("parse_fallback:gateway"), None);
    }

    #[test]
    fn test_slots_gauge_sets_exact_value() {
        let m = make_test_metrics();
        m.slots_available.set(7);
        let families = m.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "t_slots_available")
            .expect("test: gauge family present");
        assert!((family.get_metric()[0].get_gauge().get_value() - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_gather_metrics_contains_prefix_after_observation() {
        let _ = init_metrics();
        inc_request("ok");
        let output = gather_metrics();
        assert!(output.contains("comic_requests_total"));
    }

    #[test]
    fn test_summary_errors_keyed_stage_then_type() {
        let _ = init_metrics();
        inc_error("summary-stage", "summary_err");
        let summary = get_metrics_summary();
        assert!(
            summary
                .errors_total
                .get("summary-stage:summary_err")
                .copied()
                .unwrap_or(0)
                >= 1
        );
    }

    #[test]
    fn test_summary_reports_requests_after_observation() {
        let _ = init_metrics();
        inc_request("summary-test");
        let summary = get_metrics_summary();
        assert!(summary.requests_total.get("summary-test").copied().unwrap_or(0) >= 1);
    }
}
