//! Capture device abstraction
//!
//! The scheduler only ever talks to a [`CaptureDevice`]: one request in,
//! one image plus device-reported metadata out. Backends:
//!
//! - `command`: an external still-capture program such as `rpicam-still`
//! - `simulated`: synthetic day/night frames for local runs
//! - `v4l2`: direct Video4Linux2 access (feature `camera`)

mod command;
mod config;
mod simulated;
#[cfg(feature = "camera")]
mod v4l2;

pub use command::CommandDevice;
pub use config::{Backend, CameraConfig, PixelFormat};
pub use simulated::SimulatedDevice;
#[cfg(feature = "camera")]
#[cfg_attr(docsrs, doc(cfg(feature = "camera")))]
pub use v4l2::{V4l2Device, VideoDevice, find_device_by_name, list_devices};

use crate::controls::Controls;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Parameters for a single capture attempt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureRequest {
    /// Requested frame size
    pub resolution: Resolution,
    /// Effective controls for this attempt
    pub controls: Controls,
    /// JPEG quality, 0-100
    pub quality: u8,
    /// Output directory; backends may stage scratch files here
    pub destination: PathBuf,
}

/// Output of a successful capture
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Encoded image bytes
    pub image: Bytes,
    /// Raw device-reported metadata, passed through verbatim
    pub metadata: Map<String, Value>,
    /// When the frame was taken
    pub captured_at: DateTime<FixedOffset>,
}

/// Failures reported by a capture device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Device absent or unusable; not retried
    #[error("Capture device unavailable: {0}")]
    Unavailable(String),

    /// Capture exceeded its time budget
    #[error("Capture timed out after {0:?}")]
    Timeout(Duration),

    /// Device refused the requested controls; retried with fallback controls
    #[error("Capture device rejected controls: {0}")]
    RejectedControls(String),

    /// Single-shot capture failure
    #[error("Capture failed: {0}")]
    Failed(String),
}

/// A camera that produces one still per request.
///
/// Implementations must not be driven concurrently; the orchestrator holds
/// the only handle and serializes every capture.
#[async_trait]
pub trait CaptureDevice: Send {
    /// Short human-readable identifier for logs
    fn name(&self) -> &str;

    /// Capture one frame using the request's controls.
    async fn capture(
        &mut self,
        request: &CaptureRequest,
    ) -> std::result::Result<CaptureResult, DeviceError>;
}

/// Open the backend selected by `config`.
pub async fn open_device(config: &CameraConfig) -> Result<Box<dyn CaptureDevice>> {
    match config.backend {
        Backend::Command => Ok(Box::new(CommandDevice::new(config))),
        Backend::Simulated => Ok(Box::new(SimulatedDevice::new(config.day_length))),
        #[cfg(feature = "camera")]
        Backend::V4l2 => Ok(Box::new(V4l2Device::open(config).await?)),
        #[cfg(not(feature = "camera"))]
        Backend::V4l2 => Err(crate::error::Error::Config(
            "The v4l2 backend requires building with the `camera` feature".to_string(),
        )),
    }
}

/// Encode an RGB frame as JPEG at the requested quality.
pub(crate) fn encode_jpeg(image: &image::RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut encoded = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, quality.clamp(1, 100));
    image.write_with_encoder(encoder)?;
    Ok(encoded)
}
