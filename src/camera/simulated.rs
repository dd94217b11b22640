//! Synthetic capture device following a simulated day/night cycle

use crate::camera::{CaptureDevice, CaptureRequest, CaptureResult, DeviceError, encode_jpeg};
use crate::controls::{ANALOGUE_GAIN, ControlValue, EXPOSURE_TIME};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Local;
use image::{Rgb, RgbImage};
use serde_json::{Map, Value, json};
use std::f64::consts::TAU;
use std::time::{Duration, Instant};

/// Longest exposure the simulated auto-exposure will choose, in microseconds
const MAX_AUTO_EXPOSURE_US: f64 = 200_000.0;
/// Highest analogue gain the simulated sensor supports
const MAX_GAIN: f64 = 16.0;

/// Produces gradient frames whose brightness tracks a sinusoidal day
pub struct SimulatedDevice {
    started: Instant,
    day_length: Duration,
    sequence: u64,
}

impl SimulatedDevice {
    /// Create a simulator whose day lasts `day_length`, starting at sunrise.
    pub fn new(day_length: Duration) -> Self {
        Self {
            started: Instant::now(),
            day_length: day_length.max(Duration::from_secs(1)),
            sequence: 0,
        }
    }

    /// Scene illuminance at `elapsed` into the run: 2^-2 lux at night,
    /// about 2^16 lux at noon.
    pub fn lux_at(&self, elapsed: Duration) -> f64 {
        let phase = elapsed.as_secs_f64() / self.day_length.as_secs_f64();
        let sun = (TAU * phase).sin();
        2f64.powf(7.0 + 9.0 * sun).max(0.25)
    }

    fn metadata(&self, lux: f64, request: &CaptureRequest) -> Map<String, Value> {
        // Auto-exposure aims for exposure * gain = 1e6 / lux.
        let target = 1_000_000.0 / lux;
        let exposure = request
            .controls
            .get(EXPOSURE_TIME)
            .and_then(ControlValue::as_f64)
            .unwrap_or_else(|| target.min(MAX_AUTO_EXPOSURE_US));
        let gain = request
            .controls
            .get(ANALOGUE_GAIN)
            .and_then(ControlValue::as_f64)
            .unwrap_or_else(|| (target / exposure).clamp(1.0, MAX_GAIN));

        let mut metadata = Map::new();
        metadata.insert("Lux".into(), json!(lux));
        metadata.insert("ExposureTime".into(), json!(exposure.round() as i64));
        metadata.insert("AnalogueGain".into(), json!(gain));
        metadata.insert("FrameSequence".into(), json!(self.sequence));
        metadata.insert("SensorModel".into(), json!("simulated"));
        metadata
    }
}

#[async_trait]
impl CaptureDevice for SimulatedDevice {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn capture(&mut self, request: &CaptureRequest) -> Result<CaptureResult, DeviceError> {
        self.sequence += 1;
        let lux = self.lux_at(self.started.elapsed());
        let metadata = self.metadata(lux, request);

        let (width, height) = (request.resolution.width, request.resolution.height);
        let quality = request.quality;
        // Map log-lux 0..16 onto a luma level for the frame.
        let level = ((lux.log2() / 16.0).clamp(0.0, 1.0) * 235.0) as u8 + 10;

        let encoded = tokio::task::spawn_blocking(move || {
            let frame = RgbImage::from_fn(width, height, |x, y| {
                let sky = (y as f32 / height.max(1) as f32 * 40.0) as u8;
                let edge = (x as f32 / width.max(1) as f32 * 10.0) as u8;
                let base = level.saturating_sub(sky);
                Rgb([base.saturating_sub(edge), base, level])
            });
            encode_jpeg(&frame, quality)
        })
        .await
        .map_err(|e| DeviceError::Failed(format!("encoder task failed: {e}")))?
        .map_err(|e| DeviceError::Failed(e.to_string()))?;

        Ok(CaptureResult {
            image: Bytes::from(encoded),
            metadata,
            captured_at: Local::now().fixed_offset(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Resolution;
    use crate::condition::brightness_score;
    use crate::controls::Controls;
    use std::path::PathBuf;

    #[test]
    fn test_lux_follows_day() {
        let sim = SimulatedDevice::new(Duration::from_secs(100));
        let sunrise = sim.lux_at(Duration::ZERO);
        let noon = sim.lux_at(Duration::from_secs(25));
        let midnight = sim.lux_at(Duration::from_secs(75));
        assert!(noon > sunrise && sunrise > midnight);
    }

    #[tokio::test]
    async fn test_capture_produces_jpeg_and_metadata() {
        let mut sim = SimulatedDevice::new(Duration::from_secs(60));
        let request = CaptureRequest {
            resolution: Resolution {
                width: 64,
                height: 48,
            },
            controls: Controls::new(),
            quality: 80,
            destination: PathBuf::from("."),
        };
        let result = sim.capture(&request).await.unwrap();
        assert_eq!(&result.image[..2], &[0xFF, 0xD8]);
        assert!(brightness_score(&result.metadata).is_some());
        assert_eq!(result.metadata["FrameSequence"], json!(1));
    }
}
