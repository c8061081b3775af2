//! # Stage: Duty-Cycle Worker Pool
//!
//! ## Responsibility
//! Keeps `workers` OS threads alternating busy/sleep phases inside a fixed
//! millisecond quantum so the pool as a whole consumes `target × workers`
//! cores. The busy phase is a wall-clock spin that holds the thread on-CPU,
//! which is what cgroup CPU accounting actually measures.
//!
//! ## Guarantees
//! - Thread-safe: the target is one atomic `f64`, written by the controller
//!   and read by every worker at its next quantum boundary
//! - Bounded: worker count is at least 1, quantum clamps to `[1ms, 5ms]`
//! - Cancellation-clean: each worker returns at the next quantum boundary
//!
//! ## NOT Responsible For
//! - Deciding the target (controller)
//! - Publishing the target to the exporter (controller)

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ShaperError;
use crate::shaper::sanitize_ratio;

/// Shortest and longest allowed quantum. Values outside clamp.
pub const MIN_QUANTUM: Duration = Duration::from_millis(1);
pub const MAX_QUANTUM: Duration = Duration::from_millis(5);

/// Optional per-worker start hook, run once on the worker thread before the
/// first quantum. The default is a no-op; rootful builds install a hook that
/// requests an idle scheduling class.
pub type StartHook = Arc<dyn Fn() -> Result<(), ShaperError> + Send + Sync>;

/// Callback invoked with the worker index when a start hook fails. The
/// worker keeps running regardless.
pub type StartErrorHandler = Arc<dyn Fn(usize, &ShaperError) + Send + Sync>;

// ---------------------------------------------------------------------------
// DutyCycler capability
// ---------------------------------------------------------------------------

/// The controller's write handle onto the load generator.
pub trait DutyCycler: Send + Sync {
    /// Program a new duty-cycle target. Takes effect at each worker's next
    /// quantum boundary.
    fn set_target(&self, target: f64);
    /// Last committed target.
    fn target(&self) -> f64;
    /// The fixed quantum workers cycle on.
    fn quantum(&self) -> Duration;
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct PoolShared {
    /// Duty-cycle target as f64 bits. The only controller-to-worker hand-off.
    target_bits: AtomicU64,
}

impl PoolShared {
    fn target(&self) -> f64 {
        f64::from_bits(self.target_bits.load(Ordering::Relaxed))
    }

    fn set_target(&self, target: f64) {
        self.target_bits
            .store(sanitize_ratio(target).to_bits(), Ordering::Relaxed);
    }
}

/// Fixed-size duty-cycle worker pool.
pub struct DutyCyclePool {
    workers: u32,
    quantum: Duration,
    shared: Arc<PoolShared>,
    start_hook: Mutex<Option<StartHook>>,
    start_error_handler: Mutex<Option<StartErrorHandler>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    started: AtomicBool,
}

impl DutyCyclePool {
    /// Create a pool of `workers` threads cycling on `quantum`.
    ///
    /// `workers == 0` is clamped to 1 and `quantum` to `[1ms, 5ms]`.
    pub fn new(workers: u32, quantum: Duration) -> Self {
        Self {
            workers: workers.max(1),
            quantum: quantum.clamp(MIN_QUANTUM, MAX_QUANTUM),
            shared: Arc::new(PoolShared {
                target_bits: AtomicU64::new(0f64.to_bits()),
            }),
            start_hook: Mutex::new(None),
            start_error_handler: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> u32 {
        self.workers
    }

    /// Install a per-worker start hook. Must be called before `start`.
    pub fn set_worker_start_hook(&self, hook: StartHook) {
        *self.start_hook.lock().unwrap_or_else(|p| p.into_inner()) = Some(hook);
    }

    /// Install the callback that receives start-hook failures.
    pub fn set_worker_start_error_handler(&self, handler: StartErrorHandler) {
        *self
            .start_error_handler
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    /// Spawn the worker threads. Idempotent; only the first call spawns.
    pub fn start(&self, cancel: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let hook = self
            .start_hook
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let handler = self
            .start_error_handler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        for index in 0..self.workers as usize {
            let shared = Arc::clone(&self.shared);
            let quantum = self.quantum;
            let cancel = cancel.clone();
            let hook = hook.clone();
            let handler = handler.clone();
            let handle = thread::Builder::new()
                .name(format!("shaper-worker-{index}"))
                .spawn(move || {
                    if let Some(hook) = hook {
                        if let Err(e) = hook() {
                            warn!(worker = index, error = %e, "worker start hook failed, continuing");
                            if let Some(handler) = handler {
                                handler(index, &e);
                            }
                        }
                    }
                    worker_loop(&shared, quantum, &cancel);
                    debug!(worker = index, "duty-cycle worker stopped");
                })
                .expect("spawn duty-cycle worker");
            handles.push(handle);
        }
    }

    /// Wait for every worker to return. Call after cancelling the token.
    pub fn join(&self) {
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl DutyCycler for DutyCyclePool {
    fn set_target(&self, target: f64) {
        self.shared.set_target(target);
    }

    fn target(&self) -> f64 {
        self.shared.target()
    }

    fn quantum(&self) -> Duration {
        self.quantum
    }
}

/// One worker's busy/sleep cycle.
///
/// Per quantum: read the shared target, spin on-CPU for `target × quantum`,
/// sleep the remainder, yield. The spin must not sleep or the load becomes
/// invisible to cgroup CPU accounting.
fn worker_loop(shared: &PoolShared, quantum: Duration, cancel: &CancellationToken) {
    while !cancel.is_cancelled() {
        let target = shared.target();
        let busy = quantum.mul_f64(target);
        let busy = busy.min(quantum);
        let idle = quantum.saturating_sub(busy);

        if !busy.is_zero() {
            let until = Instant::now() + busy;
            while Instant::now() < until {
                std::hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }

        if !idle.is_zero() {
            thread::sleep(idle);
        } else {
            thread::yield_now();
        }

        thread::yield_now();
    }
}

// ---------------------------------------------------------------------------
// Rootful start hook
// ---------------------------------------------------------------------------

/// Start hook that asks the kernel for `SCHED_IDLE` on the calling thread.
///
/// Requires a rootful container (or `CAP_SYS_NICE`). Denial is surfaced to
/// the pool's start-error handler and the worker continues with its
/// inherited scheduling class.
#[cfg(all(feature = "rootful", target_os = "linux"))]
#[allow(unsafe_code)]
pub fn idle_scheduling_hook() -> StartHook {
    Arc::new(|| {
        let param = libc::sched_param { sched_priority: 0 };
        // SAFETY: pid 0 targets the calling thread and `param` outlives the
        // call; SCHED_IDLE requires sched_priority 0.
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_IDLE, &param) };
        if rc == 0 {
            Ok(())
        } else {
            Err(ShaperError::Io(
                std::io::Error::last_os_error().to_string(),
            ))
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
