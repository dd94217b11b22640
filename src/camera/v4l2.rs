//! Video4Linux2 capture backend

use crate::camera::{
    CameraConfig, CaptureDevice, CaptureRequest, CaptureResult, DeviceError, PixelFormat,
    encode_jpeg,
};
use crate::controls::{
    ANALOGUE_GAIN, AWB_ENABLE, BRIGHTNESS, CONTRAST, ControlValue, Controls, EXPOSURE_TIME,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Local;
use image::{ImageBuffer, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::mem;
use v4l::buffer::Type;
use v4l::control::{Control, Description, Value as V4lValue};
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

/// V4L2 menu value selecting manual exposure
const AUTO_EXPOSURE_MANUAL: i64 = 1;

/// Information about a V4L2 capture device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDevice {
    /// Device index (e.g., 0 for /dev/video0)
    pub index: usize,
    /// Device path (e.g., "/dev/video0")
    pub path: String,
    /// Card name reported by the driver
    pub name: String,
    /// Driver name
    pub driver: String,
    /// Bus information
    pub bus_info: String,
}

/// List available V4L2 capture devices
pub fn list_devices() -> Result<Vec<VideoDevice>> {
    let mut devices = Vec::new();

    for index in 0..10 {
        let Ok(dev) = v4l::Device::new(index) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            devices.push(VideoDevice {
                index,
                path: format!("/dev/video{index}"),
                name: caps.card,
                driver: caps.driver,
                bus_info: caps.bus,
            });
        }
    }

    if devices.is_empty() {
        return Err(Error::Fatal("No V4L2 capture devices found".to_string()));
    }

    Ok(devices)
}

/// Find a capture device by name (case-insensitive substring match)
pub fn find_device_by_name(name: &str) -> Result<VideoDevice> {
    let name_lower = name.to_lowercase();
    list_devices()?
        .into_iter()
        .find(|d| d.name.to_lowercase().contains(&name_lower))
        .ok_or_else(|| Error::Fatal(format!("No V4L2 device matching '{name}'")))
}

/// Open V4L2 device with a warm mmap stream
pub struct V4l2Device {
    /// Memory-mapped stream kept warm between captures
    stream: MmapStream<'static>,
    /// Owning handle to the device. Field order drops the stream first.
    device: Box<Device>,
    controls: Vec<Description>,
    info: VideoDevice,
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl V4l2Device {
    /// Open and configure the device selected by `config`.
    pub async fn open(config: &CameraConfig) -> Result<Self> {
        let info = if let Some(ref name) = config.device_name {
            find_device_by_name(name)?
        } else if let Some(index) = config.device_index {
            list_devices()?
                .into_iter()
                .find(|d| d.index == index)
                .ok_or_else(|| Error::Fatal(format!("Device /dev/video{index} not found")))?
        } else {
            list_devices()?
                .into_iter()
                .next()
                .ok_or_else(|| Error::Fatal("No cameras available".to_string()))?
        };

        tracing::info!(name = %info.name, path = %info.path, "Opening V4L2 camera");

        let dev = Device::new(info.index)
            .map_err(|e| Error::Fatal(format!("Failed to open {}: {e}", info.path)))?;

        let mut fmt = dev
            .format()
            .map_err(|e| Error::Fatal(format!("Failed to get format: {e}")))?;
        fmt.fourcc = match config.format {
            PixelFormat::Mjpeg => v4l::FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => v4l::FourCC::new(b"YUYV"),
        };
        let fmt = dev
            .set_format(&fmt)
            .map_err(|e| Error::Fatal(format!("Failed to set format: {e}")))?;

        let controls = dev.query_controls().unwrap_or_default();

        // SAFETY: the boxed device outlives the mmap stream; both live in
        // V4l2Device and the stream field is dropped first.
        let device = Box::new(dev);
        let static_device: &'static Device =
            unsafe { mem::transmute::<&Device, &'static Device>(device.as_ref()) };

        let stream =
            MmapStream::with_buffers(static_device, Type::VideoCapture, config.buffer_count.max(2))
                .map_err(|e| Error::Fatal(format!("Failed to create stream: {e}")))?;

        Ok(Self {
            stream,
            device,
            controls,
            info,
            format: config.format,
            width: fmt.width,
            height: fmt.height,
        })
    }

    /// Device information
    pub fn info(&self) -> &VideoDevice {
        &self.info
    }

    fn find_control(&self, names: &[&str]) -> Option<&Description> {
        self.controls.iter().find(|desc| {
            let name = desc.name.to_ascii_lowercase();
            names.iter().any(|candidate| name == *candidate)
        })
    }

    fn set(&self, desc: &Description, value: V4lValue) -> std::result::Result<(), DeviceError> {
        self.device
            .set_control(Control { id: desc.id, value })
            .map_err(|e| DeviceError::RejectedControls(format!("{}: {e}", desc.name)))
    }

    /// Apply controls by V4L2 control name; returns what was applied.
    fn apply_controls(
        &self,
        controls: &Controls,
    ) -> std::result::Result<Map<String, Value>, DeviceError> {
        let mut applied = Map::new();

        if let Some(exposure_us) = controls.get(EXPOSURE_TIME).and_then(ControlValue::as_f64) {
            if let Some(auto) = self.find_control(&["auto exposure"]) {
                self.set(auto, V4lValue::Integer(AUTO_EXPOSURE_MANUAL))?;
            }
            if let Some(desc) =
                self.find_control(&["exposure time, absolute", "exposure (absolute)"])
            {
                // V4L2 absolute exposure is in 100 us units.
                let units =
                    ((exposure_us / 100.0).round() as i64).clamp(desc.minimum, desc.maximum);
                self.set(desc, V4lValue::Integer(units))?;
                applied.insert("ExposureTime".into(), json!(units * 100));
            }
        }

        if let Some(gain) = controls.get(ANALOGUE_GAIN).and_then(ControlValue::as_f64) {
            if let Some(desc) = self.find_control(&["gain", "analogue gain"]) {
                let value = (desc.minimum as f64 * gain).round() as i64;
                let value = value.clamp(desc.minimum.max(1), desc.maximum);
                self.set(desc, V4lValue::Integer(value))?;
                applied.insert(
                    "AnalogueGain".into(),
                    json!(value as f64 / desc.minimum.max(1) as f64),
                );
            }
        }

        if let Some(awb) = controls.get(AWB_ENABLE).and_then(ControlValue::as_bool) {
            if let Some(desc) =
                self.find_control(&["white balance, automatic", "white balance temperature, auto"])
            {
                self.set(desc, V4lValue::Boolean(awb))?;
                applied.insert("AwbEnable".into(), json!(awb));
            }
        }

        for (key, names) in [(BRIGHTNESS, ["brightness"]), (CONTRAST, ["contrast"])] {
            let Some(level) = controls.get(key).and_then(ControlValue::as_f64) else {
                continue;
            };
            if let Some(desc) = self.find_control(&names) {
                let value = scale_to_range(key, level, desc.minimum, desc.maximum);
                self.set(desc, V4lValue::Integer(value))?;
                applied.insert(key.into(), json!(value));
            }
        }

        Ok(applied)
    }

    fn encode(&self, buf: &[u8], quality: u8) -> Result<Vec<u8>> {
        let frame: RgbImage = match self.format {
            PixelFormat::Mjpeg => {
                image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?.to_rgb8()
            }
            PixelFormat::Yuyv => yuyv_to_rgb(buf, self.width, self.height)?,
        };
        encode_jpeg(&frame, quality)
    }
}

/// Brightness maps [-1, 1] and contrast maps [0, 2] onto the control range.
fn scale_to_range(key: &str, level: f64, min: i64, max: i64) -> i64 {
    let unit = if key == BRIGHTNESS {
        (level + 1.0) / 2.0
    } else {
        level / 2.0
    };
    let span = (max - min) as f64;
    (min as f64 + unit.clamp(0.0, 1.0) * span).round() as i64
}

fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let (w, h) = (width as usize, height as usize);
    let mut rgb = vec![0u8; w * h * 3];

    for (pair, chunk) in yuyv.chunks_exact(4).take(w * h / 2).enumerate() {
        let u = chunk[1] as i32 - 128;
        let v = chunk[3] as i32 - 128;
        for (offset, luma) in [chunk[0], chunk[2]].into_iter().enumerate() {
            let y = luma as i32;
            let idx = (pair * 2 + offset) * 3;
            rgb[idx] = (y + ((v * 1436) >> 10)).clamp(0, 255) as u8;
            rgb[idx + 1] = (y - ((u * 352 + v * 731) >> 10)).clamp(0, 255) as u8;
            rgb[idx + 2] = (y + ((u * 1814) >> 10)).clamp(0, 255) as u8;
        }
    }

    ImageBuffer::from_raw(width, height, rgb)
        .ok_or_else(|| Error::Image("Failed to create RGB image from YUYV".to_string()))
}

#[async_trait]
impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.info.name
    }

    async fn capture(
        &mut self,
        request: &CaptureRequest,
    ) -> std::result::Result<CaptureResult, DeviceError> {
        let mut metadata = self.apply_controls(&request.controls)?;

        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| DeviceError::Failed(format!("Failed to dequeue frame: {e}")))?;
        let captured_at = Local::now().fixed_offset();

        metadata.insert("FrameSequence".into(), json!(meta.sequence));
        metadata.insert("BytesUsed".into(), json!(meta.bytesused));
        metadata.insert("Driver".into(), json!(self.info.driver));

        let raw = buf.to_vec();
        let image = self
            .encode(&raw, request.quality)
            .map_err(|e| DeviceError::Failed(e.to_string()))?;

        Ok(CaptureResult {
            image: Bytes::from(image),
            metadata,
            captured_at,
        })
    }
}
