//! # Stage: Host Load Sampler
//!
//! ## Responsibility
//! Converts cumulative CPU jiffy counters from `/proc/stat` into a bounded
//! stream of utilisation [`Observation`]s at a fixed interval. Counter
//! regressions (wrap or reset) produce a zero delta instead of garbage.
//!
//! ## Guarantees
//! - Bounded: `0 ≤ utilisation ≤ 1` for every non-error observation
//! - Single-start: a second `run` yields one `AlreadyStarted` error
//!   observation and a closed stream
//! - Cancellation-clean: the stream closes after the in-flight tick
//!
//! ## NOT Responsible For
//! - Smoothing or suppression decisions (controller)
//! - Publishing host CPU to the exporter (controller)

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ShaperError;
use crate::shaper::sanitize_ratio;

/// Channel capacity between the sampling task and the consumer.
const OBSERVATION_CHANNEL_CAP: usize = 16;

/// Interval used when the caller supplies a zero interval.
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Snapshot source
// ---------------------------------------------------------------------------

/// One cumulative reading of the aggregate `cpu` counters.
///
/// `idle` already includes `iowait`; `total` sums user through steal time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub idle: u64,
    pub total: u64,
}

/// Capability that produces cumulative CPU counter snapshots.
///
/// The production implementation reads `/proc/stat`; tests substitute a
/// scripted source.
pub trait CpuStatSource: Send + Sync {
    fn snapshot(&self) -> Result<CpuSnapshot, ShaperError>;
}

/// Reads the first `cpu ` line of a procfs stat file.
#[derive(Debug, Clone)]
pub struct ProcStatSource {
    path: PathBuf,
}

impl ProcStatSource {
    pub fn new() -> Self {
        Self::with_path("/proc/stat")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcStatSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuStatSource for ProcStatSource {
    fn snapshot(&self) -> Result<CpuSnapshot, ShaperError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| ShaperError::SamplerFailed(format!("{}: {e}", self.path.display())))?;
        parse_cpu_line(&text)
    }
}

/// Parse the aggregate `cpu ` line into a [`CpuSnapshot`].
///
/// Field order is user, nice, system, idle, iowait, irq, softirq, steal.
/// `iowait` is folded into idle per kernel convention; guest fields are
/// already accounted inside user time and are ignored.
pub fn parse_cpu_line(text: &str) -> Result<CpuSnapshot, ShaperError> {
    let line = text
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| ShaperError::SamplerFailed("no aggregate cpu line".into()))?;

    let mut fields = [0u64; 8];
    let mut count = 0;
    for (i, tok) in line.split_whitespace().skip(1).take(8).enumerate() {
        fields[i] = tok
            .parse::<u64>()
            .map_err(|_| ShaperError::SamplerFailed(format!("bad cpu field {tok:?}")))?;
        count = i + 1;
    }
    if count < 4 {
        return Err(ShaperError::SamplerFailed(format!(
            "cpu line has {count} fields, need at least 4"
        )));
    }

    let idle = fields[3].saturating_add(fields[4]);
    let total = fields[..count]
        .iter()
        .fold(0u64, |acc, f| acc.saturating_add(*f));
    Ok(CpuSnapshot { idle, total })
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// One sampler output: either a utilisation reading or a carried error.
#[derive(Debug, Clone)]
pub struct Observation {
    pub at: Instant,
    /// Fraction of CPU time spent non-idle since the previous snapshot.
    pub utilisation: f64,
    pub busy_jiffies: u64,
    pub total_jiffies: u64,
    pub error: Option<ShaperError>,
}

impl Observation {
    fn value(utilisation: f64, busy_jiffies: u64, total_jiffies: u64) -> Self {
        Self {
            at: Instant::now(),
            utilisation,
            busy_jiffies,
            total_jiffies,
            error: None,
        }
    }

    pub fn failure(error: ShaperError) -> Self {
        Self {
            at: Instant::now(),
            utilisation: 0.0,
            busy_jiffies: 0,
            total_jiffies: 0,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Compute the utilisation observation between two snapshots.
///
/// Counter regression on either axis yields a zero delta, and a window where
/// idle moved more than total reports zero utilisation.
fn observe_delta(prev: CpuSnapshot, next: CpuSnapshot) -> Observation {
    let d_total = next.total.saturating_sub(prev.total);
    let d_idle = next.idle.saturating_sub(prev.idle);

    if d_total == 0 || d_idle > d_total {
        return Observation::value(0.0, 0, d_total);
    }

    let busy = d_total - d_idle;
    let utilisation = sanitize_ratio(busy as f64 / d_total as f64);
    Observation::value(utilisation, busy, d_total)
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Periodic host-load sampler.
///
/// `run` spawns the sampling task and hands back the receiving end as a
/// stream. The sampler itself holds no mutable state beyond the start flag;
/// the snapshot cursor lives inside the task.
pub struct Sampler {
    source: Arc<dyn CpuStatSource>,
    interval: Duration,
    started: AtomicBool,
}

impl Sampler {
    /// Create a sampler over `source`. A zero `interval` is replaced by 1 s.
    pub fn new(source: Arc<dyn CpuStatSource>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_SAMPLE_INTERVAL
        } else {
            interval
        };
        Self {
            source,
            interval,
            started: AtomicBool::new(false),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start sampling and return the observation stream.
    ///
    /// Only the first call starts the task. Later calls receive a stream
    /// carrying a single `AlreadyStarted` error observation, then closed.
    pub fn run(&self, cancel: CancellationToken) -> ReceiverStream<Observation> {
        let (tx, rx) = mpsc::channel(OBSERVATION_CHANNEL_CAP);

        if self.started.swap(true, Ordering::SeqCst) {
            let _ = tx.try_send(Observation::failure(ShaperError::AlreadyStarted));
            return ReceiverStream::new(rx);
        }

        let source = Arc::clone(&self.source);
        let interval = self.interval;
        tokio::spawn(async move {
            sample_loop(source, interval, cancel, tx).await;
        });
        ReceiverStream::new(rx)
    }
}

async fn sample_loop(
    source: Arc<dyn CpuStatSource>,
    interval: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<Observation>,
) {
    // The initial snapshot is the baseline; failing here closes the stream
    // after a single error observation and the sampler is not retried.
    let mut prev = match source.snapshot() {
        Ok(snap) => snap,
        Err(e) => {
            let _ = tx.send(Observation::failure(e)).await;
            return;
        }
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of a tokio interval completes immediately; consume it so
    // the first observation covers a full interval.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("host load sampler stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        match source.snapshot() {
            Ok(next) => {
                let obs = observe_delta(prev, next);
                prev = next;
                if tx.send(obs).await.is_err() {
                    return;
                }
            }
            // Tick-time failures are delivered and sampling continues from
            // the last valid baseline.
            Err(e) => {
                if tx.send(Observation::failure(e)).await.is_err() {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
