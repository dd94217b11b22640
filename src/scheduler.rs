//! Capture timing: fixed or adaptive intervals, retry backoff and
//! interruptible sleeping

use crate::condition::{ConditionEstimate, Trend};
use crate::error::{Error, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Bounds and factors for the adaptive interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSettings {
    /// Shortest interval the scheduler will produce
    pub min_interval: Duration,
    /// Longest interval the scheduler will produce
    pub max_interval: Duration,
    /// Multiplier applied while conditions are changing
    pub narrow_factor: f64,
    /// Multiplier applied while conditions are stable and bright
    pub widen_factor: f64,
    /// Score at or above which a stable scene counts as bright
    pub bright_score: f64,
}

/// Retry backoff after transient failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on the un-jittered delay
    pub max: Duration,
    /// Random extra delay as a fraction of the computed delay, in [0, 1]
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

/// Outcome of the last attempt, as far as scheduling is concerned
#[derive(Debug, Clone, Copy)]
pub enum FireOutcome<'a> {
    /// Frame persisted; the estimate reflects it
    Captured(&'a ConditionEstimate),
    /// Transient failure; `attempt` counts consecutive failures from 1
    Retry {
        /// Consecutive failed attempts so far
        attempt: u32,
    },
    /// Terminal failure; nothing more is scheduled
    Fatal,
}

/// Timing state owned by the scheduler
#[derive(Debug, Clone)]
pub struct ScheduleState {
    /// When the next capture fires; `None` once stopped
    pub next_fire: Option<Instant>,
    /// Configured base interval
    pub base_interval: Duration,
    /// Adaptive bounds, when adaptive mode is enabled
    pub adaptive: Option<AdaptiveSettings>,
    /// Most recently produced interval
    pub last_interval: Option<Duration>,
    /// Set after a fatal outcome
    pub stopped: bool,
}

/// Computes fire times from attempt outcomes
#[derive(Debug, Clone)]
pub struct Scheduler {
    state: ScheduleState,
    backoff: BackoffSettings,
}

impl Scheduler {
    /// Build a scheduler. Rejects non-positive intervals and inverted bounds.
    pub fn new(
        base_interval: Duration,
        adaptive: Option<AdaptiveSettings>,
        backoff: BackoffSettings,
    ) -> Result<Self> {
        if base_interval.is_zero() {
            return Err(Error::Config("Base interval must be positive".into()));
        }
        if let Some(a) = adaptive {
            if a.min_interval.is_zero() || a.min_interval > a.max_interval {
                return Err(Error::Config(format!(
                    "Adaptive interval bounds are invalid: min {:?}, max {:?}",
                    a.min_interval, a.max_interval
                )));
            }
            let factors = [
                ("narrow_factor", a.narrow_factor),
                ("widen_factor", a.widen_factor),
            ];
            for (name, factor) in factors {
                if !factor.is_finite() || factor <= 0.0 {
                    return Err(Error::Config(format!("{name} must be positive, got {factor}")));
                }
            }
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(Error::Config(format!(
                "Retry jitter must be within [0, 1], got {}",
                backoff.jitter
            )));
        }

        Ok(Self {
            state: ScheduleState {
                next_fire: Some(Instant::now()),
                base_interval,
                adaptive,
                last_interval: None,
                stopped: false,
            },
            backoff,
        })
    }

    /// Current schedule state
    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    /// Record an outcome and compute the next fire time from `now`.
    ///
    /// Returns `None` after a fatal outcome; no later call reschedules.
    pub fn next_fire(&mut self, outcome: FireOutcome<'_>, now: Instant) -> Option<Instant> {
        if self.state.stopped {
            return None;
        }

        let delay = match outcome {
            FireOutcome::Captured(estimate) => {
                let interval = self.interval_for(estimate);
                self.state.last_interval = Some(interval);
                interval
            }
            FireOutcome::Retry { attempt } => self.backoff_for(attempt),
            FireOutcome::Fatal => {
                self.state.stopped = true;
                self.state.next_fire = None;
                return None;
            }
        };

        let next = now + delay;
        self.state.next_fire = Some(next);
        Some(next)
    }

    /// Interval after a successful capture.
    ///
    /// Adaptive mode narrows while the trend is moving, widens while the
    /// scene is stable and bright, and always stays within the bounds.
    pub fn interval_for(&self, estimate: &ConditionEstimate) -> Duration {
        let base = self.state.base_interval;
        let Some(adaptive) = self.state.adaptive else {
            return base;
        };

        let factor = match (estimate.reliable, estimate.trend, estimate.score) {
            (true, Trend::Improving | Trend::Worsening, _) => adaptive.narrow_factor,
            (true, Trend::Stable, Some(score)) if score >= adaptive.bright_score => {
                adaptive.widen_factor
            }
            _ => 1.0,
        };

        let secs = base.as_secs_f64() * factor;
        let secs = secs.clamp(
            adaptive.min_interval.as_secs_f64(),
            adaptive.max_interval.as_secs_f64(),
        );
        Duration::from_secs_f64(secs)
    }

    /// Delay before retry number `attempt` (1-based), with jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let delay = self
            .backoff
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff.max);
        if self.backoff.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.backoff.jitter);
        delay + delay.mul_f64(extra)
    }
}

/// Why a sleep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Deadline reached
    Fired,
    /// Shutdown requested
    Cancelled,
}

/// Sending half of the shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }
}

/// Receiving half of the shutdown signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    /// Whether shutdown was requested
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown is requested.
    ///
    /// Never resolves if every trigger was dropped without firing.
    pub async fn wait(&mut self) {
        if self.receiver.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Create a connected trigger / receiver pair.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (sender, receiver) = watch::channel(false);
    (
        ShutdownTrigger {
            sender: Arc::new(sender),
        },
        Shutdown { receiver },
    )
}

/// Sleep until `deadline` unless shutdown is requested first.
pub async fn sleep_until(deadline: Instant, shutdown: &mut Shutdown) -> Wake {
    if shutdown.is_triggered() {
        return Wake::Cancelled;
    }
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => Wake::Fired,
        _ = shutdown.wait() => Wake::Cancelled,
    }
}
