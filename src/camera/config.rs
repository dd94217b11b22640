//! Camera backend configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which capture backend drives the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// External still-capture program (rpicam-still, libcamera-still)
    Command,
    /// Synthetic frames following a simulated day/night cycle
    Simulated,
    /// Video4Linux2 device
    V4l2,
}

impl Backend {
    /// Parse from a user-provided string (case-insensitive)
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "command" | "rpicam" | "libcamera" => Some(Backend::Command),
            "simulated" | "simulator" | "sim" => Some(Backend::Simulated),
            "v4l2" | "v4l" => Some(Backend::V4l2),
            _ => None,
        }
    }

    /// Canonical string representation for configuration files
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Command => "command",
            Backend::Simulated => "simulated",
            Backend::V4l2 => "v4l2",
        }
    }
}

/// Resolved camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Capture backend
    pub backend: Backend,

    /// Program invoked by the command backend
    pub program: String,

    /// Extra arguments appended to every command invocation
    pub extra_args: Vec<String>,

    /// Sensor settle time before the still is taken
    pub warmup: Duration,

    /// V4L2 device index (e.g. 0 for /dev/video0); auto-detect if unset
    pub device_index: Option<usize>,

    /// V4L2 device name substring; takes priority over `device_index`
    pub device_name: Option<String>,

    /// V4L2 pixel format
    pub format: PixelFormat,

    /// Number of V4L2 buffers to keep mapped
    pub buffer_count: u32,

    /// Length of one simulated day
    pub day_length: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Command,
            program: "rpicam-still".to_string(),
            extra_args: Vec::new(),
            warmup: Duration::from_millis(1000),
            device_index: None,
            device_name: None,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            day_length: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Pixel format for V4L2 capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Motion JPEG (compressed, recommended for high resolution)
    Mjpeg,
    /// YUYV 4:2:2 (uncompressed, better compatibility)
    Yuyv,
}

impl PixelFormat {
    /// Parse from a user-provided string (case-insensitive)
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mjpeg" | "mjpg" => Some(PixelFormat::Mjpeg),
            "yuyv" => Some(PixelFormat::Yuyv),
            _ => None,
        }
    }
}
