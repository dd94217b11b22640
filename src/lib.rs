//! TIMELAPSE - unattended adaptive time-lapse capture for embedded cameras
//!
//! A capture device is driven on a schedule that adapts to lighting
//! conditions. Every persisted frame gets a collision-free filename and a
//! JSON metadata record, and the frame counter survives restarts.
//!
//! # Features
//!
//! - **Capture backends**: `rpicam-still`-style commands, V4L2 (feature
//!   `camera`), and a simulated device for dry runs
//! - **Condition buckets**: smoothed brightness drives control selection with
//!   hysteresis and safe fallbacks
//! - **Crash safety**: images and metadata are published atomically and the
//!   output directory is reconciled on startup
//! - **Async-first**: Built on Tokio; shutdown never interrupts a frame mid-write
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use timelapse::{TimelapseConfig, TracingSink, open_session, shutdown_channel};
//!
//! #[tokio::main]
//! async fn main() -> timelapse::Result<()> {
//!     let config = TimelapseConfig::load(None)?;
//!     let mut session = open_session(&config, Arc::new(TracingSink)).await?;
//!
//!     let (trigger, shutdown) = shutdown_channel();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         trigger.trigger();
//!     });
//!
//!     let summary = session.run(shutdown).await?;
//!     println!("captured {} frames", summary.frames);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs, rust_2024_compatibility)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod camera;
pub mod condition;
pub mod config;
pub mod controls;
pub mod error;
pub mod events;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod naming;
pub mod orchestrator;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

// Re-exports for convenience
pub use error::{Error, Result};

pub use camera::{CaptureDevice, CaptureRequest, CaptureResult, DeviceError, Resolution};
pub use condition::{ConditionEstimate, ConditionEstimator, Trend};
pub use config::{LogRotation, LoggingOptions, MetricsFormat, TimelapseConfig};
pub use controls::{ControlPolicy, ControlSelection, ControlValue, Controls, compute_controls};
pub use events::{
    CaptureEvent, EventLevel, EventSink, FanoutSink, MemorySink, StopReason, TracingSink,
};
pub use metadata::{MetadataRecord, MetadataRecorder};
pub use naming::{FilenamePattern, NamingEngine};
pub use orchestrator::{CaptureState, Orchestrator, OrchestratorSettings, RunSummary};
pub use scheduler::{Scheduler, Shutdown, ShutdownTrigger, shutdown_channel};

/// Validate `config`, open its camera backend and prepare the output directory.
///
/// Nothing is captured until [`Orchestrator::run`] is called.
pub async fn open_session(
    config: &TimelapseConfig,
    events: Arc<dyn EventSink>,
) -> Result<Orchestrator> {
    let settings = config.orchestrator_settings()?;
    let camera_config = config.camera_config()?;
    let device = camera::open_device(&camera_config).await?;
    tracing::debug!(
        backend = camera_config.backend.as_str(),
        device = device.name(),
        "Camera backend opened"
    );
    Orchestrator::new(settings, device, events).await
}
