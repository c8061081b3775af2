//! # Stage: Metrics Exporter
//!
//! ## Responsibility
//! Thread-safe recording of controller telemetry and deterministic rendering
//! to OpenMetrics text. All write operations guard their inputs, so whatever
//! upstream hands over, the rendered exposition stays well formed.
//!
//! ## Guarantees
//! - Deterministic: the same snapshot always renders byte-identical output
//! - Stable order: metrics appear in a fixed sequence ending with `# EOF`
//! - Non-blocking for workers: only the controller and the HTTP handler
//!   touch the internal lock
//!
//! ## NOT Responsible For
//! - Serving HTTP (src/web.rs)
//! - Deciding what the values mean (controller)

use std::{
    fmt::Write as _,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::error::ShaperError;
use crate::shaper::sanitize_ratio;

/// Content type of the rendered exposition.
pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Label value substituted for empty mode/state strings.
const UNKNOWN_LABEL: &str = "unknown";

// ---------------------------------------------------------------------------
// MetricsRecorder capability
// ---------------------------------------------------------------------------

/// Write surface the controller publishes through.
///
/// Input guards are part of the contract: NaN, infinities and negatives
/// become zero where applicable, ratios clamp, empty labels become
/// `"unknown"`.
pub trait MetricsRecorder: Send + Sync {
    fn set_mode(&self, mode: &str);
    fn set_state(&self, state: &str);
    fn set_target(&self, ratio: f64);
    /// Record a tenancy P95 reading. `fetched_at` (Unix seconds) only
    /// overwrites the last-success epoch when non-zero.
    fn observe_oci_p95(&self, value: f64, fetched_at: i64);
    fn set_duty_cycle(&self, busy: Duration);
    fn set_worker_count(&self, workers: u32);
    /// Record a host utilisation ratio; stored as a percentage.
    fn observe_host_cpu(&self, ratio: f64);
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of everything the exporter publishes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExporterSnapshot {
    pub target: f64,
    pub mode: String,
    pub state: String,
    pub oci_p95: f64,
    pub oci_last_success_epoch_seconds: i64,
    pub duty_cycle_ms: f64,
    pub worker_count: u32,
    pub host_cpu_percent: f64,
}

impl Default for ExporterSnapshot {
    fn default() -> Self {
        Self {
            target: 0.0,
            mode: UNKNOWN_LABEL.to_string(),
            state: UNKNOWN_LABEL.to_string(),
            oci_p95: 0.0,
            oci_last_success_epoch_seconds: 0,
            duty_cycle_ms: 0.0,
            worker_count: 0,
            host_cpu_percent: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// ShaperMetrics
// ---------------------------------------------------------------------------

/// The in-memory registry behind `/metrics`.
///
/// Clone the `Arc` freely; all handles share one snapshot.
pub struct ShaperMetrics {
    inner: Mutex<ExporterSnapshot>,
}

impl ShaperMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ExporterSnapshot::default()),
        })
    }

    /// Copy out the current snapshot.
    pub fn snapshot(&self) -> ExporterSnapshot {
        self.inner
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    /// Render the OpenMetrics exposition.
    ///
    /// Errors only when the internal lock is poisoned, which the HTTP
    /// handler maps to a 500.
    pub fn render(&self) -> Result<String, ShaperError> {
        let snap = self
            .inner
            .lock()
            .map_err(|_| ShaperError::Io("metrics registry lock poisoned".into()))?
            .clone();
        Ok(render_snapshot(&snap))
    }

    fn update<F: FnOnce(&mut ExporterSnapshot)>(&self, apply: F) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        apply(&mut guard);
    }
}

impl MetricsRecorder for ShaperMetrics {
    fn set_mode(&self, mode: &str) {
        let mode = normalize_label(mode);
        self.update(|s| s.mode = mode);
    }

    fn set_state(&self, state: &str) {
        let state = normalize_label(state);
        self.update(|s| s.state = state);
    }

    fn set_target(&self, ratio: f64) {
        self.update(|s| s.target = sanitize_ratio(ratio));
    }

    fn observe_oci_p95(&self, value: f64, fetched_at: i64) {
        self.update(|s| {
            s.oci_p95 = sanitize_ratio(value);
            if fetched_at != 0 {
                s.oci_last_success_epoch_seconds = fetched_at.max(0);
            }
        });
    }

    fn set_duty_cycle(&self, busy: Duration) {
        let ms = busy.as_secs_f64() * 1_000.0;
        self.update(|s| s.duty_cycle_ms = if ms.is_finite() { ms.max(0.0) } else { 0.0 });
    }

    fn set_worker_count(&self, workers: u32) {
        self.update(|s| s.worker_count = workers);
    }

    fn observe_host_cpu(&self, ratio: f64) {
        let percent = sanitize_ratio(ratio) * 100.0;
        self.update(|s| s.host_cpu_percent = percent.clamp(0.0, 100.0));
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn normalize_label(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        UNKNOWN_LABEL.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Escape a label value per the exposition format rules.
fn escape_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Render one snapshot. Pure; invoked by [`ShaperMetrics::render`] and
/// directly by tests.
pub fn render_snapshot(snap: &ExporterSnapshot) -> String {
    let mut out = String::with_capacity(1024);

    let _ = writeln!(
        out,
        "# HELP shaper_target_ratio Duty-cycle target currently programmed into the worker pool."
    );
    let _ = writeln!(out, "# TYPE shaper_target_ratio gauge");
    let _ = writeln!(out, "shaper_target_ratio {:.6}", snap.target);

    let _ = writeln!(out, "# HELP shaper_mode Active shaper mode label.");
    let _ = writeln!(out, "# TYPE shaper_mode gauge");
    let _ = writeln!(out, "shaper_mode{{mode=\"{}\"}} 1", escape_label(&snap.mode));

    let _ = writeln!(
        out,
        "# HELP shaper_state Controller state: normal, fallback or suppressed."
    );
    let _ = writeln!(out, "# TYPE shaper_state gauge");
    let _ = writeln!(
        out,
        "shaper_state{{state=\"{}\"}} 1",
        escape_label(&snap.state)
    );

    let _ = writeln!(
        out,
        "# HELP oci_p95 Last tenancy-reported seven-day P95 CPU utilisation ratio."
    );
    let _ = writeln!(out, "# TYPE oci_p95 gauge");
    let _ = writeln!(out, "oci_p95 {:.6}", snap.oci_p95);

    let _ = writeln!(
        out,
        "# HELP oci_last_success_epoch Unix time of the last successful tenancy query, 0 when never."
    );
    let _ = writeln!(out, "# TYPE oci_last_success_epoch gauge");
    let _ = writeln!(
        out,
        "oci_last_success_epoch {:.0}",
        snap.oci_last_success_epoch_seconds as f64
    );

    let _ = writeln!(
        out,
        "# HELP duty_cycle_ms Busy time per quantum in milliseconds."
    );
    let _ = writeln!(out, "# TYPE duty_cycle_ms gauge");
    let _ = writeln!(out, "duty_cycle_ms {:.3}", snap.duty_cycle_ms);

    let _ = writeln!(out, "# HELP worker_count Number of duty-cycle workers.");
    let _ = writeln!(out, "# TYPE worker_count gauge");
    let _ = writeln!(out, "worker_count {:.0}", snap.worker_count as f64);

    let _ = writeln!(
        out,
        "# HELP host_cpu_percent Smoothing input: last observed host CPU utilisation."
    );
    let _ = writeln!(out, "# TYPE host_cpu_percent gauge");
    let _ = writeln!(out, "host_cpu_percent {:.2}", snap.host_cpu_percent);

    out.push_str("# EOF\n");
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn metrics() -> Arc<ShaperMetrics> {
        ShaperMetrics::new()
    }

    // ===== Input guards =====

    #[test]
    fn test_default_snapshot_is_zeroed_unknown() {
        let snap = metrics().snapshot();
        assert_eq!(snap.target, 0.0);
        assert_eq!(snap.mode, "unknown");
        assert_eq!(snap.state, "unknown");
        assert_eq!(snap.oci_last_success_epoch_seconds, 0);
    }

    #[test]
    fn test_set_target_clamps() {
        let m = metrics();
        m.set_target(1.7);
        assert_eq!(m.snapshot().target, 1.0);
        m.set_target(f64::NAN);
        assert_eq!(m.snapshot().target, 0.0);
    }

    #[test]
    fn test_set_mode_empty_becomes_unknown() {
        let m = metrics();
        m.set_mode("");
        assert_eq!(m.snapshot().mode, "unknown");
        m.set_mode("   ");
        assert_eq!(m.snapshot().mode, "unknown");
    }

    #[test]
    fn test_set_state_kept_verbatim() {
        let m = metrics();
        m.set_state("suppressed");
        assert_eq!(m.snapshot().state, "suppressed");
    }

    #[test]
    fn test_observe_oci_p95_zero_epoch_keeps_previous() {
        let m = metrics();
        m.observe_oci_p95(0.21, 1_700_000_000);
        m.observe_oci_p95(0.25, 0);
        let snap = m.snapshot();
        assert_eq!(snap.oci_p95, 0.25);
        assert_eq!(snap.oci_last_success_epoch_seconds, 1_700_000_000);
    }

    #[test]
    fn test_observe_oci_p95_negative_epoch_floored() {
        let m = metrics();
        m.observe_oci_p95(0.2, -5);
        assert_eq!(m.snapshot().oci_last_success_epoch_seconds, 0);
    }

    #[test]
    fn test_set_duty_cycle_converts_to_ms() {
        let m = metrics();
        m.set_duty_cycle(Duration::from_micros(540));
        assert!((m.snapshot().duty_cycle_ms - 0.54).abs() < 1e-9);
    }

    #[test]
    fn test_observe_host_cpu_scales_and_clamps() {
        let m = metrics();
        m.observe_host_cpu(0.37);
        assert!((m.snapshot().host_cpu_percent - 37.0).abs() < 1e-9);
        m.observe_host_cpu(4.2);
        assert_eq!(m.snapshot().host_cpu_percent, 100.0);
        m.observe_host_cpu(f64::NAN);
        assert_eq!(m.snapshot().host_cpu_percent, 0.0);
    }

    #[test]
    fn test_set_worker_count() {
        let m = metrics();
        m.set_worker_count(4);
        assert_eq!(m.snapshot().worker_count, 4);
    }

    // ===== Rendering =====

    #[test]
    fn test_render_metric_order() {
        let body = render_snapshot(&ExporterSnapshot::default());
        let names = [
            "shaper_target_ratio",
            "shaper_mode",
            "shaper_state",
            "oci_p95",
            "oci_last_success_epoch",
            "duty_cycle_ms",
            "worker_count",
            "host_cpu_percent",
        ];
        let mut cursor = 0;
        for name in names {
            let pos = body[cursor..]
                .find(&format!("# HELP {name} "))
                .unwrap_or_else(|| panic!("{name} missing or out of order"));
            cursor += pos;
        }
    }

    #[test]
    fn test_render_ends_with_eof() {
        let body = render_snapshot(&ExporterSnapshot::default());
        assert!(body.ends_with("# EOF\n"));
    }

    #[test]
    fn test_render_one_help_one_type_per_metric() {
        let body = render_snapshot(&ExporterSnapshot::default());
        assert_eq!(body.matches("# HELP shaper_target_ratio").count(), 1);
        assert_eq!(body.matches("# TYPE shaper_target_ratio").count(), 1);
        assert_eq!(body.matches("# TYPE ").count(), 8);
    }

    #[test]
    fn test_render_value_formats() {
        let snap = ExporterSnapshot {
            target: 0.27,
            mode: "normal".into(),
            state: "normal".into(),
            oci_p95: 0.2,
            oci_last_success_epoch_seconds: 1_700_000_000,
            duty_cycle_ms: 0.54,
            worker_count: 2,
            host_cpu_percent: 12.5,
        };
        let body = render_snapshot(&snap);
        assert!(body.contains("shaper_target_ratio 0.270000\n"));
        assert!(body.contains("oci_p95 0.200000\n"));
        assert!(body.contains("oci_last_success_epoch 1700000000\n"));
        assert!(body.contains("duty_cycle_ms 0.540\n"));
        assert!(body.contains("worker_count 2\n"));
        assert!(body.contains("host_cpu_percent 12.50\n"));
    }

    #[test]
    fn test_render_mode_and_state_as_labels() {
        let snap = ExporterSnapshot {
            mode: "burst".into(),
            state: "suppressed".into(),
            ..ExporterSnapshot::default()
        };
        let body = render_snapshot(&snap);
        assert!(body.contains("shaper_mode{mode=\"burst\"} 1\n"));
        assert!(body.contains("shaper_state{state=\"suppressed\"} 1\n"));
    }

    #[test]
    fn test_render_escapes_label_values() {
        let snap = ExporterSnapshot {
            mode: "a\"b\\c".into(),
            ..ExporterSnapshot::default()
        };
        let body = render_snapshot(&snap);
        assert!(body.contains("shaper_mode{mode=\"a\\\"b\\\\c\"} 1\n"));
    }

    #[test]
    fn test_render_twice_identical_without_mutation() {
        let m = metrics();
        m.set_mode("normal");
        m.set_target(0.25);
        let first = m.render().unwrap();
        let second = m.render().unwrap();
        assert_eq!(first, second);
    }

    proptest! {
        #[test]
        fn prop_render_deterministic(target in any::<f64>(), percent_ratio in any::<f64>()) {
            let m = metrics();
            m.set_target(target);
            m.observe_host_cpu(percent_ratio);
            prop_assert_eq!(m.render().unwrap(), m.render().unwrap());
        }

        #[test]
        fn prop_recorded_target_always_a_ratio(value in any::<f64>()) {
            let m = metrics();
            m.set_target(value);
            let t = m.snapshot().target;
            prop_assert!((0.0..=1.0).contains(&t));
        }
    }
}
