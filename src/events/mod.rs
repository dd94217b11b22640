//! Structured capture events and the sinks that consume them
//!
//! The orchestrator never formats log text. It emits [`CaptureEvent`]
//! records with a severity; sinks decide how to present them (tracing
//! output, metrics aggregation, a Unix socket stream, an in-memory buffer).

#[cfg(target_family = "unix")]
pub mod unix;

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Severity of a capture event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    /// Per-attempt detail
    Debug,
    /// Normal progress
    Info,
    /// Transient failure, schedule continues
    Warning,
    /// Failure that ended the run
    Error,
    /// Fatal stop requiring operator attention
    Critical,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventLevel::Debug => "DEBUG",
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
            EventLevel::Critical => "CRITICAL",
        })
    }
}

/// Orchestrator stage an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Directory checks and reconciliation before the first capture
    Startup,
    /// Control selection and request construction
    Preparing,
    /// Device capture
    Capturing,
    /// Writing image and metadata
    Persisting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Startup => "startup",
            Stage::Preparing => "preparing",
            Stage::Capturing => "capturing",
            Stage::Persisting => "persisting",
        })
    }
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Requested number of frames persisted
    Completed,
    /// Shutdown signal received
    Shutdown,
    /// Fatal failure
    Fatal,
}

/// A structured record of something the orchestrator did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CaptureEvent {
    /// Startup finished; scheduling begins
    RunStarted {
        /// Project name
        project: String,
        /// Output directory
        directory: String,
        /// Counter the first frame will use
        next_counter: u64,
        /// Capture device name
        device: String,
        /// Images that received recovered metadata during startup
        recovered: usize,
    },
    /// A capture attempt is about to run
    AttemptStarted {
        /// Counter the frame will use if persisted
        counter: u64,
        /// Attempt number for this frame, from 1
        attempt: u32,
        /// Selected condition bucket
        bucket: Option<String>,
        /// Whether fallback controls are in use
        fallback: bool,
    },
    /// Control selection moved to a different bucket
    BucketChanged {
        /// Previous bucket
        from: Option<String>,
        /// New bucket
        to: Option<String>,
        /// Score that caused the change
        score: Option<f64>,
    },
    /// Image and metadata persisted
    FrameCaptured {
        /// Frame counter
        counter: u64,
        /// Image filename
        image: String,
        /// Metadata filename
        metadata: Option<String>,
        /// Image size in bytes
        bytes: u64,
        /// Capture latency in milliseconds
        elapsed_ms: u64,
        /// Bucket whose controls were used
        bucket: Option<String>,
    },
    /// Retryable failure; the schedule continues
    TransientRetry {
        /// Stage that failed
        stage: Stage,
        /// Failure description
        reason: String,
        /// Consecutive failures so far
        attempt: u32,
        /// Delay before the retry in milliseconds
        retry_in_ms: u64,
    },
    /// Unrecoverable failure; scheduling halts
    FatalStop {
        /// Stage that failed
        stage: Stage,
        /// Failure description
        reason: String,
    },
    /// Condition estimate went stale; fallback controls apply
    ConditionUnreliable {
        /// Consecutive updates without usable metadata
        stale_updates: u32,
    },
    /// Next capture scheduled
    Scheduled {
        /// Delay until the next capture in milliseconds
        next_in_ms: u64,
    },
    /// Run loop exited
    RunStopped {
        /// Frames persisted during this run
        frames: u64,
        /// Why the run stopped
        reason: StopReason,
    },
}

impl CaptureEvent {
    /// Severity of the event
    pub fn level(&self) -> EventLevel {
        match self {
            CaptureEvent::AttemptStarted { .. } | CaptureEvent::Scheduled { .. } => {
                EventLevel::Debug
            }
            CaptureEvent::RunStarted { .. }
            | CaptureEvent::BucketChanged { .. }
            | CaptureEvent::FrameCaptured { .. } => EventLevel::Info,
            CaptureEvent::TransientRetry { .. } | CaptureEvent::ConditionUnreliable { .. } => {
                EventLevel::Warning
            }
            CaptureEvent::FatalStop { .. } => EventLevel::Critical,
            CaptureEvent::RunStopped { reason, .. } => match reason {
                StopReason::Fatal => EventLevel::Error,
                _ => EventLevel::Info,
            },
        }
    }

    /// Snake-case event name, matching the serialized `event` tag
    pub fn name(&self) -> &'static str {
        match self {
            CaptureEvent::RunStarted { .. } => "run_started",
            CaptureEvent::AttemptStarted { .. } => "attempt_started",
            CaptureEvent::BucketChanged { .. } => "bucket_changed",
            CaptureEvent::FrameCaptured { .. } => "frame_captured",
            CaptureEvent::TransientRetry { .. } => "transient_retry",
            CaptureEvent::FatalStop { .. } => "fatal_stop",
            CaptureEvent::ConditionUnreliable { .. } => "condition_unreliable",
            CaptureEvent::Scheduled { .. } => "scheduled",
            CaptureEvent::RunStopped { .. } => "run_stopped",
        }
    }
}

/// Consumer of capture events
pub trait EventSink: Send + Sync {
    /// Handle one event. Must not block for long; called inline by the orchestrator.
    fn emit(&self, event: &CaptureEvent);
}

/// Writes events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &CaptureEvent) {
        match event {
            CaptureEvent::RunStarted {
                project,
                directory,
                next_counter,
                device,
                recovered,
            } => tracing::info!(
                %project,
                %directory,
                next_counter,
                %device,
                recovered,
                "Time-lapse run started"
            ),
            CaptureEvent::AttemptStarted {
                counter,
                attempt,
                bucket,
                fallback,
            } => tracing::debug!(
                counter,
                attempt,
                bucket = bucket.as_deref().unwrap_or("-"),
                fallback,
                "Capture attempt"
            ),
            CaptureEvent::BucketChanged { from, to, score } => tracing::info!(
                from = from.as_deref().unwrap_or("-"),
                to = to.as_deref().unwrap_or("-"),
                ?score,
                "Condition bucket changed"
            ),
            CaptureEvent::FrameCaptured {
                counter,
                image,
                metadata,
                bytes,
                elapsed_ms,
                bucket,
            } => tracing::info!(
                counter,
                %image,
                metadata = metadata.as_deref().unwrap_or("-"),
                bytes,
                elapsed_ms,
                bucket = bucket.as_deref().unwrap_or("-"),
                "Frame captured"
            ),
            CaptureEvent::TransientRetry {
                stage,
                reason,
                attempt,
                retry_in_ms,
            } => tracing::warn!(
                %stage,
                %reason,
                attempt,
                retry_in_ms,
                "Transient failure, retrying"
            ),
            CaptureEvent::FatalStop { stage, reason } => tracing::error!(
                critical = true,
                %stage,
                %reason,
                "Fatal failure, scheduling stopped"
            ),
            CaptureEvent::ConditionUnreliable { stale_updates } => tracing::warn!(
                stale_updates,
                "Condition estimate unreliable, using fallback controls"
            ),
            CaptureEvent::Scheduled { next_in_ms } => {
                tracing::debug!(next_in_ms, "Next capture scheduled")
            }
            CaptureEvent::RunStopped { frames, reason } => match reason {
                StopReason::Fatal => tracing::error!(frames, ?reason, "Time-lapse run stopped"),
                _ => tracing::info!(frames, ?reason, "Time-lapse run stopped"),
            },
        }
    }
}

/// Buffers events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CaptureEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event received so far
    pub fn events(&self) -> Vec<CaptureEvent> {
        self.events.lock().expect("event sink mutex poisoned").clone()
    }

    /// Number of events received at exactly `level`
    pub fn count(&self, level: EventLevel) -> usize {
        self.events
            .lock()
            .expect("event sink mutex poisoned")
            .iter()
            .filter(|e| e.level() == level)
            .count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &CaptureEvent) {
        self.events
            .lock()
            .expect("event sink mutex poisoned")
            .push(event.clone());
    }
}

/// Forwards every event to several sinks
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Add a sink in place.
    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &CaptureEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
