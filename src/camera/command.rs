//! Capture through an external still-capture program
//!
//! Targets the libcamera apps (`rpicam-still`, formerly `libcamera-still`):
//! the image and a JSON metadata dump are written to scratch files in the
//! destination directory, read back, and removed.

use crate::camera::{CameraConfig, CaptureDevice, CaptureRequest, CaptureResult, DeviceError};
use crate::controls::{
    AF_MODE, ANALOGUE_GAIN, AWB_ENABLE, BRIGHTNESS, COLOUR_GAINS, CONTRAST, ControlValue,
    EXPOSURE_TIME,
};
use crate::storage;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Local;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Runs an external program once per capture
pub struct CommandDevice {
    program: String,
    extra_args: Vec<String>,
    warmup: Duration,
}

impl CommandDevice {
    /// Create a device from the resolved camera configuration.
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            program: config.program.clone(),
            extra_args: config.extra_args.clone(),
            warmup: config.warmup,
        }
    }

    /// Command-line arguments for one capture.
    pub fn build_args(
        &self,
        request: &CaptureRequest,
        image_path: &Path,
        metadata_path: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            "--nopreview".to_string(),
            "--timeout".to_string(),
            self.warmup.as_millis().max(1).to_string(),
            "--width".to_string(),
            request.resolution.width.to_string(),
            "--height".to_string(),
            request.resolution.height.to_string(),
            "--quality".to_string(),
            request.quality.to_string(),
        ];

        let controls = &request.controls;
        if let Some(shutter) = controls.get(EXPOSURE_TIME).and_then(ControlValue::as_f64) {
            args.push("--shutter".into());
            args.push(format!("{}", shutter.round() as i64));
        }
        if let Some(gain) = controls.get(ANALOGUE_GAIN).and_then(ControlValue::as_f64) {
            args.push("--gain".into());
            args.push(gain.to_string());
        }

        let awb = controls.get(AWB_ENABLE).and_then(ControlValue::as_bool);
        match (awb, controls.get(COLOUR_GAINS)) {
            (Some(false) | None, Some(ControlValue::Pair(red, blue))) => {
                args.push("--awbgains".into());
                args.push(format!("{red},{blue}"));
            }
            (Some(true), _) => {
                args.push("--awb".into());
                args.push("auto".into());
            }
            _ => {}
        }

        if let Some(brightness) = controls.get(BRIGHTNESS).and_then(ControlValue::as_f64) {
            args.push("--brightness".into());
            args.push(brightness.to_string());
        }
        if let Some(contrast) = controls.get(CONTRAST).and_then(ControlValue::as_f64) {
            args.push("--contrast".into());
            args.push(contrast.to_string());
        }
        if let Some(ControlValue::Text(mode)) = controls.get(AF_MODE) {
            args.push("--autofocus-mode".into());
            args.push(mode.clone());
        }

        args.push("--output".into());
        args.push(image_path.display().to_string());
        args.push("--metadata".into());
        args.push(metadata_path.display().to_string());
        args.push("--metadata-format".into());
        args.push("json".into());
        args.extend(self.extra_args.iter().cloned());
        args
    }

    async fn run(
        &self,
        request: &CaptureRequest,
        image_path: &Path,
        metadata_path: &Path,
    ) -> Result<CaptureResult, DeviceError> {
        let args = self.build_args(request, image_path, metadata_path);
        tracing::debug!(program = %self.program, ?args, "Invoking capture program");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    DeviceError::Unavailable(format!("cannot run '{}': {e}", self.program))
                }
                _ => DeviceError::Failed(format!("failed to spawn '{}': {e}", self.program)),
            })?;
        let captured_at = Local::now().fixed_offset();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&self.program, output.status.code(), &stderr));
        }

        let image = tokio::fs::read(image_path).await.map_err(|e| {
            DeviceError::Failed(format!(
                "'{}' exited cleanly but produced no image: {e}",
                self.program
            ))
        })?;
        if image.is_empty() {
            return Err(DeviceError::Failed(format!(
                "'{}' produced an empty image",
                self.program
            )));
        }

        let metadata = match tokio::fs::read(metadata_path).await {
            Ok(raw) => match serde_json::from_slice::<Map<String, Value>>(&raw) {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!(error = %err, "Capture metadata was not a JSON object");
                    Map::new()
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "Capture program wrote no metadata");
                Map::new()
            }
        };

        Ok(CaptureResult {
            image: Bytes::from(image),
            metadata,
            captured_at,
        })
    }
}

/// Map a non-zero exit of the capture program onto the device error taxonomy.
fn classify_failure(program: &str, code: Option<i32>, stderr: &str) -> DeviceError {
    let lower = stderr.to_ascii_lowercase();
    let detail = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no diagnostic output")
        .trim()
        .to_string();

    if lower.contains("no cameras available") || lower.contains("camera not found") {
        DeviceError::Unavailable(detail)
    } else if lower.contains("unrecognised option")
        || lower.contains("unrecognized option")
        || lower.contains("invalid")
        || lower.contains("out of range")
    {
        DeviceError::RejectedControls(detail)
    } else {
        DeviceError::Failed(format!(
            "'{program}' exited with status {}: {detail}",
            code.map_or_else(|| "signal".to_string(), |c| c.to_string())
        ))
    }
}

/// Scratch outputs of one capture, removed when dropped.
///
/// The capture future may be dropped mid-run by a timeout, so cleanup cannot
/// wait for the program to return.
struct ScratchFiles {
    image: PathBuf,
    metadata: PathBuf,
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in [&self.image, &self.metadata] {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != ErrorKind::NotFound {
                    tracing::debug!(
                        path = %path.display(),
                        error = %err,
                        "Failed to remove scratch file"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl CaptureDevice for CommandDevice {
    fn name(&self) -> &str {
        &self.program
    }

    async fn capture(&mut self, request: &CaptureRequest) -> Result<CaptureResult, DeviceError> {
        let scratch = ScratchFiles {
            image: storage::temp_path(&request.destination, "capture.jpg"),
            metadata: storage::temp_path(&request.destination, "capture.json"),
        };
        self.run(request, &scratch.image, &scratch.metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Resolution;
    use crate::controls::Controls;

    fn request(controls: Controls) -> CaptureRequest {
        CaptureRequest {
            resolution: Resolution {
                width: 4056,
                height: 3040,
            },
            controls,
            quality: 93,
            destination: PathBuf::from("/tmp"),
        }
    }

    fn device() -> CommandDevice {
        CommandDevice::new(&CameraConfig {
            extra_args: vec!["--immediate".into()],
            ..CameraConfig::default()
        })
    }

    #[test]
    fn test_args_carry_controls() {
        let mut controls = Controls::new();
        controls.insert(EXPOSURE_TIME.into(), ControlValue::Int(20_000));
        controls.insert(ANALOGUE_GAIN.into(), ControlValue::Float(2.5));
        controls.insert(AWB_ENABLE.into(), ControlValue::Bool(false));
        controls.insert(COLOUR_GAINS.into(), ControlValue::Pair(1.8, 1.4));
        controls.insert(AF_MODE.into(), ControlValue::Text("manual".into()));

        let args = device().build_args(
            &request(controls),
            Path::new("/tmp/a.jpg"),
            Path::new("/tmp/a.json"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("--width 4056 --height 3040 --quality 93"));
        assert!(joined.contains("--shutter 20000"));
        assert!(joined.contains("--gain 2.5"));
        assert!(joined.contains("--awbgains 1.8,1.4"));
        assert!(joined.contains("--autofocus-mode manual"));
        assert!(joined.contains("--output /tmp/a.jpg --metadata /tmp/a.json"));
        assert_eq!(args.last().map(String::as_str), Some("--immediate"));
    }

    #[test]
    fn test_auto_white_balance() {
        let mut controls = Controls::new();
        controls.insert(AWB_ENABLE.into(), ControlValue::Bool(true));
        controls.insert(COLOUR_GAINS.into(), ControlValue::Pair(1.8, 1.4));
        let args = device().build_args(&request(controls), Path::new("a"), Path::new("b"));
        let joined = args.join(" ");
        assert!(joined.contains("--awb auto"));
        assert!(!joined.contains("--awbgains"));
    }

    #[test]
    fn test_failure_classification() {
        assert!(matches!(
            classify_failure("rpicam-still", Some(255), "ERROR: *** no cameras available ***"),
            DeviceError::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure("rpicam-still", Some(255), "unrecognised option '--gain'"),
            DeviceError::RejectedControls(_)
        ));
        assert!(matches!(
            classify_failure("rpicam-still", None, "dma heap allocation failure\n"),
            DeviceError::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = CommandDevice::new(&CameraConfig {
            program: "definitely-not-a-camera-program".into(),
            ..CameraConfig::default()
        });
        let mut req = request(Controls::new());
        req.destination = dir.path().to_path_buf();
        let err = device.capture(&req).await.unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_timed_out_capture_leaves_no_scratch_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stalled-still");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             while [ $# -gt 0 ]; do\n\
               [ \"$1\" = --output ] && echo partial > \"$2\"\n\
               shift\n\
             done\n\
             sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let frames = dir.path().join("frames");
        std::fs::create_dir(&frames).unwrap();
        let mut device = CommandDevice::new(&CameraConfig {
            program: script.display().to_string(),
            ..CameraConfig::default()
        });
        let mut req = request(Controls::new());
        req.destination = frames.clone();

        let outcome =
            tokio::time::timeout(Duration::from_millis(500), device.capture(&req)).await;
        assert!(outcome.is_err());

        let leftovers: Vec<_> = std::fs::read_dir(&frames)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "left behind {leftovers:?}");
    }
}
