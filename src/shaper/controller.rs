//! # Stage: Adaptive Controller
//!
//! ## Responsibility
//! Owns the three-state machine (normal / fallback / suppressed) that decides
//! the duty-cycle target. A slow loop queries the tenancy P95 and steps the
//! target toward the goal band; a fast loop smooths local host-load
//! observations and suppresses the load entirely under contention. Both
//! mutate one runtime under a single lock and publish every decision to the
//! pool and the metrics recorder.
//!
//! ## Guarantees
//! - Every pool write is either clamped to `[target_min, target_max]` or the
//!   literal `0` of suppression
//! - Suppression never discards the slow loop's work: the desired target is
//!   restored verbatim on resume
//! - Exporter state and target are updated in a fixed order within one
//!   decision, so scrapes never see `suppressed` paired with a non-zero
//!   target
//!
//! ## NOT Responsible For
//! - Taking host-load snapshots (sampler)
//! - Burning CPU (pool)
//! - Serving the exposition (exporter + web)

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ShaperError;
use crate::oci::MetricsClient;
use crate::shaper::{
    exporter::MetricsRecorder,
    pool::DutyCycler,
    sampler::Observation,
    sanitize_ratio,
};

/// Divisor of the exponential smoothing update, equivalent to alpha 0.2.
const SMOOTHING_WINDOW: f64 = 5.0;

/// Consecutive slow-tick failures before log severity escalates.
const FAILURE_ESCALATION_THRESHOLD: u32 = 5;

/// Replacement for a zero slow interval.
pub const DEFAULT_SLOW_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Replacement for a zero relaxed interval.
pub const DEFAULT_RELAXED_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

// ---------------------------------------------------------------------------
// ControllerConfig
// ---------------------------------------------------------------------------

/// Thresholds and cadences of the control loops. Immutable once validated.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Opaque resource identifier forwarded to the tenancy metrics client.
    pub resource_id: String,
    /// Free-form label published as `shaper_mode`.
    pub mode_label: String,
    pub target_start: f64,
    pub target_min: f64,
    pub target_max: f64,
    pub step_up: f64,
    pub step_down: f64,
    pub fallback_target: f64,
    pub goal_low: f64,
    pub goal_high: f64,
    /// P95 at or above which the slow loop stretches to the relaxed cadence.
    pub relaxed_threshold: f64,
    /// Smoothed host load at or above which suppression engages.
    pub suppress_threshold: f64,
    /// Smoothed host load at or below which suppression releases.
    pub suppress_resume: f64,
    pub slow_interval: Duration,
    pub relaxed_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resource_id: String::new(),
            mode_label: "normal".to_string(),
            target_start: 0.25,
            target_min: 0.22,
            target_max: 0.40,
            step_up: 0.02,
            step_down: 0.01,
            fallback_target: 0.25,
            goal_low: 0.23,
            goal_high: 0.30,
            relaxed_threshold: 0.28,
            suppress_threshold: 0.85,
            suppress_resume: 0.70,
            slow_interval: DEFAULT_SLOW_INTERVAL,
            relaxed_interval: DEFAULT_RELAXED_INTERVAL,
        }
    }
}

impl ControllerConfig {
    /// Validate the relational invariants, applying the two documented
    /// repairs (zero intervals replaced by defaults, an out-of-order resume
    /// threshold coerced below the suppress threshold). Any other violation
    /// is rejected with the offending config key in the message.
    pub fn validate(mut self) -> Result<Self, ShaperError> {
        if self.target_min < 0.0 {
            return Err(ShaperError::config(
                "controller.targetMin",
                "must not be negative",
            ));
        }
        if self.target_max > 1.0 {
            return Err(ShaperError::config(
                "controller.targetMax",
                "must not exceed 1",
            ));
        }
        if self.target_min > self.target_start {
            return Err(ShaperError::config(
                "controller.targetMin",
                "must not exceed controller.targetStart",
            ));
        }
        if self.target_start > self.target_max {
            return Err(ShaperError::config(
                "controller.targetStart",
                "must not exceed controller.targetMax",
            ));
        }
        if self.goal_low > self.goal_high {
            return Err(ShaperError::config(
                "controller.goalLow",
                "must not exceed controller.goalHigh",
            ));
        }
        if !(self.step_up > 0.0) {
            return Err(ShaperError::config("controller.stepUp", "must be positive"));
        }
        if !(self.step_down > 0.0) {
            return Err(ShaperError::config(
                "controller.stepDown",
                "must be positive",
            ));
        }

        let (ceiling, ceiling_key) = self.target_ceiling();
        if !(self.suppress_threshold > ceiling) {
            return Err(ShaperError::config(
                "controller.suppressThreshold",
                format!("must be greater than {ceiling_key}"),
            ));
        }
        if !(self.suppress_resume > ceiling) {
            return Err(ShaperError::config(
                "controller.suppressResume",
                format!("must be greater than {ceiling_key}"),
            ));
        }
        if self.suppress_resume >= self.suppress_threshold {
            // All other relations hold at this point, so this is the one
            // violation the contract repairs instead of rejecting.
            self.suppress_resume = self.suppress_threshold * 0.8;
        }

        if self.slow_interval.is_zero() {
            self.slow_interval = DEFAULT_SLOW_INTERVAL;
        }
        if self.relaxed_interval.is_zero() {
            self.relaxed_interval = DEFAULT_RELAXED_INTERVAL;
        }
        if self.mode_label.trim().is_empty() {
            self.mode_label = "normal".to_string();
        }

        Ok(self)
    }

    /// Largest of the target-family thresholds, with its config key. The
    /// suppression thresholds must clear every one of them.
    fn target_ceiling(&self) -> (f64, &'static str) {
        let mut ceiling = self.target_max;
        let mut key = "controller.targetMax";
        for (value, candidate) in [
            (self.target_start, "controller.targetStart"),
            (self.target_min, "controller.targetMin"),
            (self.fallback_target, "controller.fallbackTarget"),
            (self.goal_low, "controller.goalLow"),
            (self.goal_high, "controller.goalHigh"),
        ] {
            if value > ceiling {
                ceiling = value;
                key = candidate;
            }
        }
        (ceiling, key)
    }

    fn clamp_target(&self, value: f64) -> f64 {
        sanitize_ratio(value).clamp(self.target_min, self.target_max)
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Externally visible controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Normal,
    Fallback,
    Suppressed,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerState::Normal => "normal",
            ControllerState::Fallback => "fallback",
            ControllerState::Suppressed => "suppressed",
        }
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the slow loop last decided, independent of suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlowState {
    Normal,
    Fallback,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Mutable control state. Touched only under the runtime lock.
#[derive(Debug)]
struct RuntimeState {
    slow_state: SlowState,
    suppressed: bool,
    desired_target: f64,
    applied_target: f64,
    last_p95: f64,
    last_ocid_error: Option<ShaperError>,
    last_sampler_error: Option<ShaperError>,
    smoothed_host_load: f64,
    have_host_sample: bool,
    current_interval: Duration,
}

impl RuntimeState {
    fn effective_state(&self) -> ControllerState {
        if self.suppressed {
            ControllerState::Suppressed
        } else {
            match self.slow_state {
                SlowState::Normal => ControllerState::Normal,
                SlowState::Fallback => ControllerState::Fallback,
            }
        }
    }
}

/// Read-only copy of the interesting runtime fields, for tests and logs.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStatus {
    pub state: ControllerState,
    pub desired_target: f64,
    pub applied_target: f64,
    pub last_p95: f64,
    pub smoothed_host_load: f64,
    pub current_interval: Duration,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// The adaptive control plane.
///
/// Holds non-owning handles onto its collaborators; the orchestrator owns
/// the instances. Decision entry points are synchronous and public so tests
/// drive the state machine without timers.
pub struct Controller {
    cfg: ControllerConfig,
    client: Arc<dyn MetricsClient>,
    pool: Arc<dyn DutyCycler>,
    recorder: Arc<dyn MetricsRecorder>,
    runtime: Mutex<RuntimeState>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("cfg", &self.cfg)
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl Controller {
    /// Validate the config and seed the fallback state.
    ///
    /// The pool immediately receives the clamped fallback target: until a
    /// successful tenancy query proves the metric pipeline healthy, no
    /// other default is trusted.
    pub fn new(
        cfg: ControllerConfig,
        client: Arc<dyn MetricsClient>,
        pool: Arc<dyn DutyCycler>,
        recorder: Arc<dyn MetricsRecorder>,
    ) -> Result<Arc<Self>, ShaperError> {
        let cfg = cfg.validate()?;
        let fallback = cfg.clamp_target(cfg.fallback_target);

        let controller = Arc::new(Self {
            runtime: Mutex::new(RuntimeState {
                slow_state: SlowState::Fallback,
                suppressed: false,
                desired_target: fallback,
                applied_target: fallback,
                last_p95: 0.0,
                last_ocid_error: None,
                last_sampler_error: None,
                smoothed_host_load: 0.0,
                have_host_sample: false,
                current_interval: cfg.slow_interval,
            }),
            cfg,
            client,
            pool,
            recorder,
        });

        controller.recorder.set_mode(&controller.cfg.mode_label);
        controller.program(fallback);
        controller
            .recorder
            .set_state(ControllerState::Fallback.as_str());
        info!(
            applied = fallback,
            mode = %controller.cfg.mode_label,
            "controller seeded in fallback"
        );
        Ok(controller)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }

    /// Copy out the current control state.
    pub fn status(&self) -> ControllerStatus {
        let rt = self.lock_runtime();
        ControllerStatus {
            state: rt.effective_state(),
            desired_target: rt.desired_target,
            applied_target: rt.applied_target,
            last_p95: rt.last_p95,
            smoothed_host_load: rt.smoothed_host_load,
            current_interval: rt.current_interval,
        }
    }

    /// Most recent sampler error, if any.
    pub fn last_sampler_error(&self) -> Option<ShaperError> {
        self.lock_runtime().last_sampler_error.clone()
    }

    // -----------------------------------------------------------------------
    // Slow decision
    // -----------------------------------------------------------------------

    /// Apply one slow-loop result. Public so tests drive ticks synchronously.
    pub fn on_slow_result(&self, result: Result<f64, ShaperError>) {
        let mut rt = self.lock_runtime();
        match result {
            Err(err) => self.slow_failure(&mut rt, err),
            Ok(p95) => self.slow_success(&mut rt, p95),
        }
        self.publish_state(&rt);
    }

    fn slow_failure(&self, rt: &mut RuntimeState, err: ShaperError) {
        if rt.slow_state != SlowState::Fallback {
            warn!(error = %err, "tenancy query failed, entering fallback");
        }
        rt.slow_state = SlowState::Fallback;
        rt.last_ocid_error = Some(err);

        let fallback = self.cfg.clamp_target(self.cfg.fallback_target);
        rt.desired_target = fallback;
        if !rt.suppressed {
            rt.applied_target = fallback;
            self.program(fallback);
        }
        rt.current_interval = self.cfg.slow_interval;
    }

    fn slow_success(&self, rt: &mut RuntimeState, p95: f64) {
        let p95 = sanitize_ratio(p95);
        if rt.slow_state != SlowState::Normal {
            info!(p95, "tenancy query healthy, leaving fallback");
        }
        rt.slow_state = SlowState::Normal;
        rt.last_ocid_error = None;
        rt.last_p95 = p95;
        self.recorder.observe_oci_p95(p95, epoch_seconds());

        // During suppression the pool holds 0, so the stepping base is the
        // slow loop's own desired value, not the applied one.
        let current = if rt.suppressed {
            rt.desired_target
        } else {
            rt.applied_target
        };
        let current = if current == 0.0 {
            self.cfg.target_start
        } else {
            current
        };

        let next = if p95 < self.cfg.goal_low {
            current + self.cfg.step_up
        } else if p95 > self.cfg.goal_high {
            current - self.cfg.step_down
        } else {
            current
        };
        let next = self.cfg.clamp_target(next);

        rt.desired_target = next;
        if !rt.suppressed {
            rt.applied_target = next;
            self.program(next);
        }

        rt.current_interval = if p95 >= self.cfg.relaxed_threshold {
            self.cfg.relaxed_interval
        } else {
            self.cfg.slow_interval
        };
        debug!(
            p95,
            applied = next,
            interval_secs = rt.current_interval.as_secs(),
            "slow tick applied"
        );
    }

    // -----------------------------------------------------------------------
    // Fast suppression
    // -----------------------------------------------------------------------

    /// Apply one host-load observation. Public so tests drive the fast loop
    /// synchronously.
    pub fn on_observation(&self, obs: &Observation) {
        let mut rt = self.lock_runtime();

        if let Some(err) = &obs.error {
            rt.last_sampler_error = Some(err.clone());
            self.publish_state(&rt);
            return;
        }

        let u = sanitize_ratio(obs.utilisation);
        self.recorder.observe_host_cpu(u);

        if rt.have_host_sample {
            rt.smoothed_host_load += (u - rt.smoothed_host_load) / SMOOTHING_WINDOW;
        } else {
            rt.smoothed_host_load = u;
            rt.have_host_sample = true;
        }

        if !rt.suppressed && rt.smoothed_host_load >= self.cfg.suppress_threshold {
            rt.suppressed = true;
            rt.applied_target = 0.0;
            // The one write allowed below target_min: yield fully to the
            // contending workload.
            self.program(0.0);
            warn!(
                smoothed = rt.smoothed_host_load,
                "host contention detected, suppressing load"
            );
        } else if rt.suppressed && rt.smoothed_host_load <= self.cfg.suppress_resume {
            rt.suppressed = false;
            let restore = if rt.desired_target == 0.0 {
                self.cfg.target_start
            } else {
                rt.desired_target
            };
            let restore = self.cfg.clamp_target(restore);
            rt.applied_target = restore;
            self.program(restore);
            info!(
                smoothed = rt.smoothed_host_load,
                applied = restore,
                "host contention cleared, resuming load"
            );
        }

        self.publish_state(&rt);
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    /// Drive the slow loop, and the fast loop when `observations` is given,
    /// until the token is cancelled. Cancellation is success.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        observations: Option<impl Stream<Item = Observation> + Send + 'static>,
    ) -> Result<(), ShaperError> {
        let fast_task = observations.map(|stream| {
            let controller = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                controller.consume_observations(cancel, stream).await;
            })
        });

        let mut consecutive_failures: u32 = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.client.query_p95(&self.cfg.resource_id) => result,
            };

            match &result {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    if consecutive_failures >= FAILURE_ESCALATION_THRESHOLD {
                        error!(
                            error = %e,
                            consecutive_failures,
                            "tenancy query failing repeatedly, staying in fallback"
                        );
                    }
                }
            }
            self.on_slow_result(result);

            let interval = self.lock_runtime().current_interval;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if let Some(task) = fast_task {
            let _ = task.await;
        }
        Ok(())
    }

    async fn consume_observations(
        &self,
        cancel: CancellationToken,
        stream: impl Stream<Item = Observation> + Send,
    ) {
        tokio::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                obs = stream.next() => match obs {
                    Some(obs) => self.on_observation(&obs),
                    // Stream closed: suppression evaluation stops and the
                    // suppressed flag keeps its last value. Operators should
                    // treat a lost sampler as a configuration failure.
                    None => {
                        warn!("host load stream closed, suppression frozen");
                        return;
                    }
                },
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    fn lock_runtime(&self) -> MutexGuard<'_, RuntimeState> {
        self.runtime.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Program a target into the pool and mirror it to the recorder. Always
    /// pool first, then recorder, so a scrape never leads the pool.
    /// Re-programming the committed value is a no-op, so repeated in-band
    /// ticks produce no recorder churn.
    fn program(&self, target: f64) {
        if self.pool.target() == target {
            return;
        }
        self.pool.set_target(target);
        self.recorder.set_target(target);
        self.recorder
            .set_duty_cycle(self.pool.quantum().mul_f64(target));
    }

    fn publish_state(&self, rt: &RuntimeState) {
        self.recorder.set_state(rt.effective_state().as_str());
    }
}

fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
