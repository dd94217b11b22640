#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Local, TimeZone};
use serde_json::{Map, Value, json};

use timelapse::camera::{CaptureDevice, CaptureRequest, CaptureResult, DeviceError, Resolution};
use timelapse::condition::EstimatorSettings;
use timelapse::controls::{ControlPolicy, Controls};
use timelapse::naming::FilenamePattern;
use timelapse::orchestrator::OrchestratorSettings;
use timelapse::scheduler::BackoffSettings;

/// One scripted device response
pub enum Step {
    /// Return a frame whose metadata reports `lux`
    Frame { lux: f64 },
    /// Return a frame with no metadata
    Bare,
    /// Delete the output directory, then return a frame reporting `lux`
    Vanish { lux: f64 },
    /// Fail with the given error
    Fail(DeviceError),
    /// Never answer within any reasonable timeout
    Hang,
}

/// Capture device that replays a fixed script and records every request
pub struct ScriptedDevice {
    steps: VecDeque<Step>,
    requests: Arc<Mutex<Vec<CaptureRequest>>>,
}

impl ScriptedDevice {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> (Self, Arc<Mutex<Vec<CaptureRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                steps: steps.into_iter().collect(),
                requests: requests.clone(),
            },
            requests,
        )
    }
}

#[async_trait]
impl CaptureDevice for ScriptedDevice {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn capture(&mut self, request: &CaptureRequest) -> Result<CaptureResult, DeviceError> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self
            .steps
            .pop_front()
            .unwrap_or_else(|| Step::Fail(DeviceError::Unavailable("script exhausted".into())));
        match step {
            Step::Frame { lux } => Ok(frame(json!({ "Lux": lux, "SensorModel": "scripted" }))),
            Step::Bare => Ok(frame(json!({}))),
            Step::Vanish { lux } => {
                std::fs::remove_dir_all(&request.destination).unwrap();
                Ok(frame(json!({ "Lux": lux })))
            }
            Step::Fail(err) => Err(err),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(DeviceError::Failed("woke from hang".into()))
            }
        }
    }
}

fn frame(metadata: Value) -> CaptureResult {
    let metadata: Map<String, Value> = metadata.as_object().cloned().unwrap_or_default();
    CaptureResult {
        image: Bytes::from_static(b"\xFF\xD8\xFF\xE0scripted-jpeg\xFF\xD9"),
        metadata,
        captured_at: Local
            .with_ymd_and_hms(2026, 6, 21, 12, 0, 0)
            .unwrap()
            .fixed_offset(),
    }
}

/// Settings with millisecond timing so a run finishes quickly
pub fn settings(directory: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        directory: directory.to_path_buf(),
        create_directories: true,
        project: "ts".into(),
        image_pattern: FilenamePattern::parse("{name}_{counter}.jpg", 4).unwrap(),
        metadata_pattern: Some(FilenamePattern::parse("{name}_{counter}_meta.json", 4).unwrap()),
        resolution: Resolution {
            width: 640,
            height: 480,
        },
        quality: 85,
        policy: ControlPolicy::fixed(Controls::new()),
        estimator: EstimatorSettings::default(),
        base_interval: Duration::from_millis(10),
        adaptive: None,
        backoff: BackoffSettings {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            jitter: 0.0,
        },
        capture_timeout: Duration::from_secs(5),
        max_capture_retries: 3,
        max_persist_retries: 2,
        max_captures: None,
    }
}

/// Sorted names of the regular, non-hidden files in `dir`
pub fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names
}

/// Parse a JSON file from `dir`
pub fn read_json(dir: &Path, name: &str) -> Value {
    let text = std::fs::read_to_string(dir.join(name)).unwrap();
    serde_json::from_str(&text).unwrap()
}
