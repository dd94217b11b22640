//! Capture state machine
//!
//! `Idle -> Preparing -> Capturing -> Persisting -> Updating -> Idle` on
//! success. Failures in `Capturing` or `Persisting` go to `RetryWait`
//! while the retry budgets last and to `Fatal` after that, or immediately
//! for non-transient failures. The orchestrator is the only place that
//! decides between retrying and stopping.

use crate::camera::{CaptureDevice, CaptureRequest, CaptureResult, DeviceError, Resolution};
use crate::condition::{ConditionEstimate, ConditionEstimator, EstimatorSettings};
use crate::controls::{ControlPolicy, ControlSelection, compute_controls};
use crate::error::{Error, Result};
use crate::events::{CaptureEvent, EventSink, Stage, StopReason};
use crate::metadata::{ConditionSummary, FrameInfo, MetadataRecorder};
use crate::naming::{FilenamePattern, FrameNames, NamingEngine};
use crate::scheduler::{
    AdaptiveSettings, BackoffSettings, FireOutcome, Scheduler, Shutdown, Wake, sleep_until,
};
use crate::storage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Waiting for the next fire time
    Idle,
    /// Selecting controls and building the request
    Preparing,
    /// Device capture in flight
    Capturing,
    /// Writing image and metadata
    Persisting,
    /// Feeding the result to the estimator and scheduler
    Updating,
    /// Waiting out a retry backoff
    RetryWait,
    /// Stopped on an unrecoverable failure
    Fatal,
}

/// Classified result of the capture stage
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Device produced a frame
    Success(CaptureResult),
    /// Retryable failure
    TransientFailure(String),
    /// Unrecoverable failure
    FatalFailure(String),
}

/// Result of one full cycle through the state machine
#[derive(Debug)]
pub enum CycleOutcome {
    /// Frame and metadata persisted
    Persisted(FrameNames),
    /// Retryable failure at `stage`
    Transient {
        /// Stage that failed
        stage: Stage,
        /// Failure description
        reason: String,
    },
    /// Unrecoverable failure at `stage`
    Fatal {
        /// Stage that failed
        stage: Stage,
        /// Terminal error
        error: Error,
    },
}

/// Summary returned when a run ends without a fatal failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Frames persisted during this run
    pub frames: u64,
    /// Counter the next frame would use
    pub next_counter: u64,
    /// Why the run ended
    pub reason: StopReason,
}

/// Validated settings for an orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Output directory
    pub directory: PathBuf,
    /// Create the output directory when missing
    pub create_directories: bool,
    /// Project name
    pub project: String,
    /// Image filename pattern
    pub image_pattern: FilenamePattern,
    /// Metadata filename pattern; `None` disables metadata
    pub metadata_pattern: Option<FilenamePattern>,
    /// Requested frame size
    pub resolution: Resolution,
    /// JPEG quality
    pub quality: u8,
    /// Condition to control mapping
    pub policy: ControlPolicy,
    /// Estimator tuning
    pub estimator: EstimatorSettings,
    /// Interval between captures
    pub base_interval: Duration,
    /// Adaptive interval bounds, when enabled
    pub adaptive: Option<AdaptiveSettings>,
    /// Retry backoff
    pub backoff: BackoffSettings,
    /// Upper bound on a single device call
    pub capture_timeout: Duration,
    /// Consecutive transient capture failures tolerated before stopping
    pub max_capture_retries: u32,
    /// Persist retries tolerated per frame before stopping
    pub max_persist_retries: u32,
    /// Stop after this many persisted frames
    pub max_captures: Option<u64>,
}

/// Drives one capture device through the capture cycle
pub struct Orchestrator {
    settings: OrchestratorSettings,
    device: Box<dyn CaptureDevice>,
    naming: NamingEngine,
    recorder: Option<MetadataRecorder>,
    estimator: ConditionEstimator,
    scheduler: Scheduler,
    events: Arc<dyn EventSink>,
    state: CaptureState,
    previous_bucket: Option<usize>,
    controls_rejected: bool,
    consecutive_failures: u32,
    unreliable_reported: bool,
    frames: u64,
    recovered: usize,
}

impl Orchestrator {
    /// Prepare the output directory and rebuild naming state.
    ///
    /// Fails before any capture when the directory is missing (and may not
    /// be created), unwritable, or holds metadata without an image.
    pub async fn new(
        settings: OrchestratorSettings,
        device: Box<dyn CaptureDevice>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        match Self::prepare(&settings).await {
            Ok((naming, recorder, recovered)) => {
                let scheduler =
                    Scheduler::new(settings.base_interval, settings.adaptive, settings.backoff)?;
                Ok(Self {
                    estimator: ConditionEstimator::new(settings.estimator),
                    settings,
                    device,
                    naming,
                    recorder,
                    scheduler,
                    events,
                    state: CaptureState::Idle,
                    previous_bucket: None,
                    controls_rejected: false,
                    consecutive_failures: 0,
                    unreliable_reported: false,
                    frames: 0,
                    recovered,
                })
            }
            Err(err) => {
                events.emit(&CaptureEvent::FatalStop {
                    stage: Stage::Startup,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn prepare(
        settings: &OrchestratorSettings,
    ) -> Result<(NamingEngine, Option<MetadataRecorder>, usize)> {
        storage::ensure_directory(&settings.directory, settings.create_directories).await?;

        let naming = NamingEngine::restore(
            settings.directory.clone(),
            settings.project.clone(),
            settings.image_pattern.clone(),
            settings.metadata_pattern.clone(),
        )
        .await?;

        let recorder = MetadataRecorder::new(settings.directory.clone(), settings.project.clone());
        let report = recorder.reconcile(&naming).await?;
        let recorder = settings.metadata_pattern.is_some().then_some(recorder);

        Ok((naming, recorder, report.recovered.len()))
    }

    /// Current state
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Counter the next persisted frame will use
    pub fn next_counter(&self) -> u64 {
        self.naming.peek()
    }

    /// Latest condition estimate
    pub fn estimate(&self) -> ConditionEstimate {
        self.estimator.current()
    }

    /// Scheduler (for inspection)
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run captures until shutdown, the capture limit, or a fatal failure.
    ///
    /// A fatal failure is returned as the error after the fatal event has
    /// been emitted; nothing is scheduled after it.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<RunSummary> {
        self.events.emit(&CaptureEvent::RunStarted {
            project: self.settings.project.clone(),
            directory: self.settings.directory.display().to_string(),
            next_counter: self.naming.peek(),
            device: self.device.name().to_string(),
            recovered: self.recovered,
        });

        loop {
            if self.limit_reached() {
                return Ok(self.stop(StopReason::Completed));
            }
            let Some(deadline) = self.scheduler.state().next_fire else {
                return Ok(self.stop(StopReason::Completed));
            };
            if sleep_until(deadline, &mut shutdown).await == Wake::Cancelled {
                return Ok(self.stop(StopReason::Shutdown));
            }

            let outcome = self.run_cycle().await;
            let now = Instant::now();

            match outcome {
                CycleOutcome::Persisted(_) => {
                    self.state = CaptureState::Idle;
                    if self.limit_reached() {
                        return Ok(self.stop(StopReason::Completed));
                    }
                    let estimate = self.estimator.current();
                    if let Some(next) = self
                        .scheduler
                        .next_fire(FireOutcome::Captured(&estimate), now)
                    {
                        self.events.emit(&CaptureEvent::Scheduled {
                            next_in_ms: millis(next.saturating_duration_since(now)),
                        });
                    }
                }
                CycleOutcome::Transient { stage, reason } => {
                    self.state = CaptureState::RetryWait;
                    let attempt = self.consecutive_failures;
                    if let Some(next) = self
                        .scheduler
                        .next_fire(FireOutcome::Retry { attempt }, now)
                    {
                        self.events.emit(&CaptureEvent::TransientRetry {
                            stage,
                            reason,
                            attempt,
                            retry_in_ms: millis(next.saturating_duration_since(now)),
                        });
                    }
                }
                CycleOutcome::Fatal { stage, error } => {
                    self.state = CaptureState::Fatal;
                    self.scheduler.next_fire(FireOutcome::Fatal, now);
                    self.events.emit(&CaptureEvent::FatalStop {
                        stage,
                        reason: error.to_string(),
                    });
                    self.events.emit(&CaptureEvent::RunStopped {
                        frames: self.frames,
                        reason: StopReason::Fatal,
                    });
                    return Err(error);
                }
            }
        }
    }

    fn limit_reached(&self) -> bool {
        self.settings
            .max_captures
            .is_some_and(|max| self.frames >= max)
    }

    fn stop(&mut self, reason: StopReason) -> RunSummary {
        self.state = CaptureState::Idle;
        self.events.emit(&CaptureEvent::RunStopped {
            frames: self.frames,
            reason,
        });
        RunSummary {
            frames: self.frames,
            next_counter: self.naming.peek(),
            reason,
        }
    }

    /// One pass through Preparing, Capturing, Persisting and Updating.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        // Preparing
        self.state = CaptureState::Preparing;
        let estimate = self.estimator.current();
        self.report_reliability(&estimate);
        let selection = self.select_controls(&estimate);
        let request = CaptureRequest {
            resolution: self.settings.resolution,
            controls: selection.controls.clone(),
            quality: self.settings.quality,
            destination: self.settings.directory.clone(),
        };
        self.events.emit(&CaptureEvent::AttemptStarted {
            counter: self.naming.peek(),
            attempt: self.consecutive_failures + 1,
            bucket: selection.bucket.clone(),
            fallback: selection.fallback,
        });

        // Capturing
        self.state = CaptureState::Capturing;
        let started = Instant::now();
        let captured = match tokio::time::timeout(
            self.settings.capture_timeout,
            self.device.capture(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(self.settings.capture_timeout)),
        };
        let elapsed = started.elapsed();

        let result = match self.classify(captured, &selection) {
            AttemptOutcome::Success(result) => result,
            AttemptOutcome::TransientFailure(reason) => {
                return CycleOutcome::Transient {
                    stage: Stage::Capturing,
                    reason,
                };
            }
            AttemptOutcome::FatalFailure(reason) => {
                return CycleOutcome::Fatal {
                    stage: Stage::Capturing,
                    error: Error::Fatal(reason),
                };
            }
        };

        // Persisting
        self.state = CaptureState::Persisting;
        let frame = match self.persist_with_retry(&result, &request, &selection, &estimate).await {
            Ok(names) => names,
            Err(error) => {
                return CycleOutcome::Fatal {
                    stage: Stage::Persisting,
                    error,
                };
            }
        };

        // Updating
        self.state = CaptureState::Updating;
        let counter = self.naming.next_counter();
        if let Err(err) = self.naming.checkpoint().await {
            tracing::warn!(error = %err, counter, "Failed to write counter checkpoint");
        }
        self.estimator.update(&result);
        self.consecutive_failures = 0;
        self.frames += 1;

        self.events.emit(&CaptureEvent::FrameCaptured {
            counter,
            image: frame.image.clone(),
            metadata: frame.metadata.clone(),
            bytes: result.image.len() as u64,
            elapsed_ms: millis(elapsed),
            bucket: selection.bucket,
        });
        self.state = CaptureState::Idle;

        CycleOutcome::Persisted(frame)
    }

    fn report_reliability(&mut self, estimate: &ConditionEstimate) {
        if estimate.reliable || estimate.score.is_none() {
            self.unreliable_reported = false;
            return;
        }
        if !self.unreliable_reported {
            self.unreliable_reported = true;
            self.events.emit(&CaptureEvent::ConditionUnreliable {
                stale_updates: estimate.stale_updates,
            });
        }
    }

    fn select_controls(&mut self, estimate: &ConditionEstimate) -> ControlSelection {
        let policy: &ControlPolicy = &self.settings.policy;
        let selection = if self.controls_rejected {
            policy.fallback()
        } else {
            compute_controls(estimate, policy, self.previous_bucket)
        };

        if selection.index != self.previous_bucket {
            self.events.emit(&CaptureEvent::BucketChanged {
                from: self
                    .previous_bucket
                    .and_then(|i| policy.bucket_name(i))
                    .map(str::to_string),
                to: selection.bucket.clone(),
                score: estimate.score,
            });
            self.previous_bucket = selection.index;
        }
        selection
    }

    /// Map a device result onto the attempt taxonomy, tracking retry budgets.
    fn classify(
        &mut self,
        captured: std::result::Result<CaptureResult, DeviceError>,
        selection: &ControlSelection,
    ) -> AttemptOutcome {
        let error = match captured {
            Ok(result) if result.image.is_empty() => {
                DeviceError::Failed("device returned an empty image".into())
            }
            Ok(result) => return AttemptOutcome::Success(result),
            Err(error) => error,
        };

        if let DeviceError::Unavailable(_) = error {
            return AttemptOutcome::FatalFailure(error.to_string());
        }
        if let DeviceError::RejectedControls(_) = error {
            if !selection.fallback {
                self.controls_rejected = true;
            }
        }

        self.estimator.record_missed();
        self.consecutive_failures += 1;
        if self.consecutive_failures > self.settings.max_capture_retries {
            return AttemptOutcome::FatalFailure(format!(
                "giving up after {} consecutive failed attempts: {error}",
                self.consecutive_failures
            ));
        }
        AttemptOutcome::TransientFailure(error.to_string())
    }

    async fn persist_with_retry(
        &mut self,
        result: &CaptureResult,
        request: &CaptureRequest,
        selection: &ControlSelection,
        estimate: &ConditionEstimate,
    ) -> Result<FrameNames> {
        let mut attempt = 0;
        loop {
            let err = match self.persist(result, request, selection, estimate).await {
                Ok(names) => return Ok(names),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => err,
            };

            attempt += 1;
            if attempt > self.settings.max_persist_retries {
                return Err(Error::Fatal(format!(
                    "persisting frame {} failed {attempt} times: {err}",
                    self.naming.peek()
                )));
            }

            // In-flight frames are finished even during shutdown.
            let delay = self.scheduler.backoff_for(attempt);
            self.state = CaptureState::RetryWait;
            self.events.emit(&CaptureEvent::TransientRetry {
                stage: Stage::Persisting,
                reason: err.to_string(),
                attempt,
                retry_in_ms: millis(delay),
            });
            tokio::time::sleep(delay).await;
            self.state = CaptureState::Persisting;
        }
    }

    /// Write the image, then its metadata. The metadata file never exists
    /// without its image; if metadata cannot be written the image is removed.
    async fn persist(
        &self,
        result: &CaptureResult,
        request: &CaptureRequest,
        selection: &ControlSelection,
        estimate: &ConditionEstimate,
    ) -> Result<FrameNames> {
        let names = self.naming.names_for(&result.captured_at)?;
        let directory = &self.settings.directory;
        let image_path = directory.join(&names.image);

        let staged = storage::temp_path(directory, &names.image);
        if let Err(err) = storage::write_durable(&staged, &result.image).await {
            storage::discard(&staged).await;
            return Err(err);
        }
        if let Err(err) = storage::publish(&staged, &image_path).await {
            storage::discard(&staged).await;
            return Err(err);
        }

        if let (Some(recorder), Some(metadata_name)) = (&self.recorder, &names.metadata) {
            let frame = FrameInfo {
                counter: names.counter,
                metadata_name: metadata_name.clone(),
                bucket: selection.bucket.clone(),
                fallback: selection.fallback,
                condition: ConditionSummary::from(estimate),
            };
            if let Err(err) = recorder.record(result, request, &image_path, &frame).await {
                storage::discard(&image_path).await;
                return Err(err);
            }
        }

        Ok(names)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
