mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedDevice, Step, listing, read_json, settings};
use timelapse::camera::DeviceError;
use timelapse::controls::{ConditionBucket, ControlPolicy, ControlValue, Controls, EXPOSURE_TIME};
use timelapse::events::{
    CaptureEvent, EventLevel, EventSink, FanoutSink, MemorySink, Stage, StopReason,
};
use timelapse::naming::CHECKPOINT_FILE;
use timelapse::orchestrator::{CaptureState, Orchestrator, OrchestratorSettings};
use timelapse::scheduler::shutdown_channel;
use timelapse::{Error, Shutdown};

async fn orchestrator(
    settings: OrchestratorSettings,
    steps: Vec<Step>,
) -> (
    timelapse::Result<Orchestrator>,
    Arc<MemorySink>,
    Arc<std::sync::Mutex<Vec<timelapse::CaptureRequest>>>,
) {
    let (device, requests) = ScriptedDevice::new(steps);
    let sink = Arc::new(MemorySink::new());
    let orchestrator = Orchestrator::new(settings, Box::new(device), sink.clone()).await;
    (orchestrator, sink, requests)
}

fn idle_shutdown() -> Shutdown {
    let (trigger, shutdown) = shutdown_channel();
    // Dropping the trigger leaves the run to end on its own.
    drop(trigger);
    shutdown
}

#[tokio::test]
async fn three_successes_produce_sequential_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.max_captures = Some(3);

    let (orchestrator, sink, _) = orchestrator(
        settings,
        vec![
            Step::Frame { lux: 512.0 },
            Step::Frame { lux: 600.0 },
            Step::Frame { lux: 700.0 },
        ],
    )
    .await;
    let summary = orchestrator.unwrap().run(idle_shutdown()).await.unwrap();

    assert_eq!(summary.frames, 3);
    assert_eq!(summary.next_counter, 3);
    assert_eq!(summary.reason, StopReason::Completed);
    assert_eq!(
        listing(dir.path()),
        vec![
            "ts_0000.jpg",
            "ts_0000_meta.json",
            "ts_0001.jpg",
            "ts_0001_meta.json",
            "ts_0002.jpg",
            "ts_0002_meta.json",
        ]
    );

    let checkpoint = read_json(dir.path(), CHECKPOINT_FILE);
    assert_eq!(checkpoint["next_counter"], 3);
    assert_eq!(checkpoint["project"], "ts");

    let record = read_json(dir.path(), "ts_0001_meta.json");
    assert_eq!(record["counter"], 1);
    assert_eq!(record["image"], "ts_0001.jpg");
    assert_eq!(record["quality"], 85);
    assert_eq!(record["device"]["Lux"], 600.0);
    assert!(record.get("recovered").is_none());

    let events = sink.events();
    let frames = events
        .iter()
        .filter(|e| matches!(e, CaptureEvent::FrameCaptured { .. }))
        .count();
    assert_eq!(frames, 3);
    assert!(matches!(
        events.last(),
        Some(CaptureEvent::RunStopped {
            frames: 3,
            reason: StopReason::Completed
        })
    ));
    assert_eq!(sink.count(EventLevel::Warning), 0);
}

#[tokio::test]
async fn timeouts_are_retried_then_frame_persists() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.max_captures = Some(1);
    settings.capture_timeout = Duration::from_millis(50);

    let (orchestrator, sink, requests) = orchestrator(
        settings,
        vec![Step::Hang, Step::Hang, Step::Frame { lux: 100.0 }],
    )
    .await;
    let summary = orchestrator.unwrap().run(idle_shutdown()).await.unwrap();

    assert_eq!(summary.frames, 1);
    assert_eq!(requests.lock().unwrap().len(), 3);
    assert_eq!(sink.count(EventLevel::Warning), 2);
    let attempts: Vec<u32> = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            CaptureEvent::TransientRetry { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(listing(dir.path()), vec!["ts_0000.jpg", "ts_0000_meta.json"]);
}

#[tokio::test]
async fn unavailable_device_stops_the_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sink, requests) = orchestrator(
        settings(dir.path()),
        vec![Step::Fail(DeviceError::Unavailable("no camera detected".into()))],
    )
    .await;
    let mut orchestrator = orchestrator.unwrap();

    let err = orchestrator.run(idle_shutdown()).await.unwrap_err();
    assert!(matches!(err, Error::Fatal(_)));
    assert_eq!(orchestrator.state(), CaptureState::Fatal);
    assert!(orchestrator.scheduler().state().next_fire.is_none());
    assert_eq!(requests.lock().unwrap().len(), 1);

    assert_eq!(sink.count(EventLevel::Critical), 1);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        CaptureEvent::RunStopped {
            reason: StopReason::Fatal,
            ..
        }
    )));
    assert!(listing(dir.path()).is_empty());
}

#[tokio::test]
async fn retry_budget_exhaustion_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.max_capture_retries = 2;

    let failing = || Step::Fail(DeviceError::Failed("sensor busy".into()));
    let (orchestrator, sink, requests) =
        orchestrator(settings, vec![failing(), failing(), failing(), failing()]).await;
    let err = orchestrator.unwrap().run(idle_shutdown()).await.unwrap_err();

    assert!(matches!(err, Error::Fatal(_)));
    assert_eq!(requests.lock().unwrap().len(), 3);
    assert_eq!(sink.count(EventLevel::Warning), 2);
    assert_eq!(sink.count(EventLevel::Critical), 1);
}

#[tokio::test]
async fn counter_resumes_after_existing_frames() {
    let dir = tempfile::tempdir().unwrap();
    for counter in 0..5 {
        std::fs::write(dir.path().join(format!("ts_{counter:04}.jpg")), b"jpeg").unwrap();
        std::fs::write(dir.path().join(format!("ts_{counter:04}_meta.json")), b"{}").unwrap();
    }
    let mut settings = settings(dir.path());
    settings.max_captures = Some(1);

    let (orchestrator, _, _) = orchestrator(settings, vec![Step::Frame { lux: 50.0 }]).await;
    let mut orchestrator = orchestrator.unwrap();
    assert_eq!(orchestrator.next_counter(), 5);

    orchestrator.run(idle_shutdown()).await.unwrap();
    assert!(dir.path().join("ts_0005.jpg").exists());
    assert!(dir.path().join("ts_0005_meta.json").exists());
    assert_eq!(std::fs::read(dir.path().join("ts_0000.jpg")).unwrap(), b"jpeg");
}

#[tokio::test]
async fn checkpoint_ahead_of_directory_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ts_0000.jpg"), b"jpeg").unwrap();
    std::fs::write(dir.path().join("ts_0000_meta.json"), b"{}").unwrap();
    std::fs::write(
        dir.path().join(CHECKPOINT_FILE),
        r#"{"project":"ts","next_counter":9,"updated_at":"2026-06-21T12:00:00Z"}"#,
    )
    .unwrap();

    let (orchestrator, _, _) = orchestrator(settings(dir.path()), vec![]).await;
    assert_eq!(orchestrator.unwrap().next_counter(), 9);
}

#[tokio::test]
async fn startup_recovers_interrupted_frame() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ts_0000.jpg"), b"jpeg").unwrap();
    std::fs::write(dir.path().join("ts_0000_meta.json"), b"{}").unwrap();
    std::fs::write(dir.path().join("ts_0001.jpg"), b"interrupted").unwrap();
    std::fs::write(dir.path().join(".tmp-0f0f-ts_0002.jpg"), b"partial").unwrap();

    let (orchestrator, sink, _) = orchestrator(settings(dir.path()), vec![]).await;
    let mut orchestrator = orchestrator.unwrap();
    assert_eq!(orchestrator.next_counter(), 2);
    assert!(!dir.path().join(".tmp-0f0f-ts_0002.jpg").exists());

    let record = read_json(dir.path(), "ts_0001_meta.json");
    assert_eq!(record["recovered"], true);
    assert_eq!(record["image"], "ts_0001.jpg");
    assert_eq!(record["image_bytes"], 11);

    let (trigger, shutdown) = shutdown_channel();
    trigger.trigger();
    let summary = orchestrator.run(shutdown).await.unwrap();
    assert_eq!(summary.reason, StopReason::Shutdown);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        CaptureEvent::RunStarted { recovered: 1, .. }
    )));
}

#[tokio::test]
async fn orphan_metadata_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ts_0003_meta.json"), b"{}").unwrap();

    let (orchestrator, sink, requests) =
        orchestrator(settings(dir.path()), vec![Step::Frame { lux: 1.0 }]).await;

    assert!(matches!(orchestrator, Err(Error::DataIntegrity(_))));
    assert_eq!(sink.count(EventLevel::Critical), 1);
    assert!(requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_directory_without_create_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir.path().join("missing"));
    settings.create_directories = false;

    let (orchestrator, _, requests) = orchestrator(settings, vec![]).await;
    assert!(matches!(orchestrator, Err(Error::Config(_))));
    assert!(requests.lock().unwrap().is_empty());
    assert!(!dir.path().join("missing").exists());
}

#[tokio::test]
async fn missing_directory_is_created_when_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested").join("frames");
    let mut settings = settings(&target);
    settings.max_captures = Some(1);

    let (orchestrator, _, _) = orchestrator(settings, vec![Step::Frame { lux: 8.0 }]).await;
    orchestrator.unwrap().run(idle_shutdown()).await.unwrap();
    assert_eq!(listing(&target), vec!["ts_0000.jpg", "ts_0000_meta.json"]);
}

#[tokio::test]
async fn rejected_controls_fall_back_on_next_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.max_captures = Some(2);
    settings.policy = ControlPolicy::new(
        Controls::new(),
        vec![
            ConditionBucket {
                name: "dark".into(),
                threshold: 0.0,
                controls: Controls::from([(EXPOSURE_TIME.to_string(), ControlValue::Int(200_000))]),
            },
            ConditionBucket {
                name: "bright".into(),
                threshold: 10.0,
                controls: Controls::new(),
            },
        ],
        Some("bright"),
        0.5,
    )
    .unwrap();

    let (orchestrator, sink, requests) = orchestrator(
        settings,
        vec![
            Step::Frame { lux: 4.0 },
            Step::Fail(DeviceError::RejectedControls("ExposureTime out of range".into())),
            Step::Frame { lux: 4.0 },
        ],
    )
    .await;
    let summary = orchestrator.unwrap().run(idle_shutdown()).await.unwrap();
    assert_eq!(summary.frames, 2);

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    assert!(!requests[0].controls.contains_key(EXPOSURE_TIME));
    assert!(requests[1].controls.contains_key(EXPOSURE_TIME));
    assert!(!requests[2].controls.contains_key(EXPOSURE_TIME));

    let record = read_json(dir.path(), "ts_0001_meta.json");
    assert_eq!(record["fallback_controls"], true);
    assert_eq!(record["bucket"], "bright");
    assert_eq!(sink.count(EventLevel::Warning), 1);
}

#[tokio::test]
async fn metadata_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.metadata_pattern = None;
    settings.max_captures = Some(2);

    let (orchestrator, sink, _) =
        orchestrator(settings, vec![Step::Bare, Step::Frame { lux: 2.0 }]).await;
    orchestrator.unwrap().run(idle_shutdown()).await.unwrap();

    assert_eq!(listing(dir.path()), vec!["ts_0000.jpg", "ts_0001.jpg"]);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        CaptureEvent::FrameCaptured { metadata: None, .. }
    )));
}

#[tokio::test]
async fn shutdown_interrupts_the_wait_between_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.base_interval = Duration::from_secs(3600);

    let (orchestrator, sink, _) = orchestrator(
        settings,
        vec![Step::Frame { lux: 64.0 }, Step::Frame { lux: 64.0 }],
    )
    .await;
    let mut orchestrator = orchestrator.unwrap();

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.trigger();
    });

    let summary = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(shutdown))
        .await
        .expect("run should stop on shutdown")
        .unwrap();
    assert_eq!(summary.frames, 1);
    assert_eq!(summary.reason, StopReason::Shutdown);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        CaptureEvent::Scheduled { next_in_ms } if *next_in_ms >= 3_599_000
    )));
}

/// Recreates the output directory whenever a write is about to be retried
struct RestoreDirectory(PathBuf);

impl EventSink for RestoreDirectory {
    fn emit(&self, event: &CaptureEvent) {
        if let CaptureEvent::TransientRetry {
            stage: Stage::Persisting,
            ..
        } = event
        {
            std::fs::create_dir_all(&self.0).unwrap();
        }
    }
}

fn persist_retries(sink: &MemorySink) -> Vec<u32> {
    sink.events()
        .iter()
        .filter_map(|e| match e {
            CaptureEvent::TransientRetry {
                stage: Stage::Persisting,
                attempt,
                ..
            } => Some(*attempt),
            _ => None,
        })
        .collect()
}

fn scratch_files(dir: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".tmp-"))
        .collect()
}

#[tokio::test]
async fn failed_write_is_retried_without_recapturing() {
    let dir = tempfile::tempdir().unwrap();
    let frames = dir.path().join("frames");
    let mut settings = settings(&frames);
    settings.max_captures = Some(1);

    let (device, requests) = ScriptedDevice::new(vec![Step::Vanish { lux: 256.0 }]);
    let memory = Arc::new(MemorySink::new());
    let events = FanoutSink::new()
        .with(memory.clone())
        .with(Arc::new(RestoreDirectory(frames.clone())));
    let mut orchestrator = Orchestrator::new(settings, Box::new(device), Arc::new(events))
        .await
        .unwrap();

    let summary = orchestrator.run(idle_shutdown()).await.unwrap();
    assert_eq!(summary.frames, 1);
    assert_eq!(summary.next_counter, 1);
    assert_eq!(requests.lock().unwrap().len(), 1);
    assert_eq!(persist_retries(&memory), vec![1]);
    assert_eq!(listing(&frames), vec!["ts_0000.jpg", "ts_0000_meta.json"]);
    assert_eq!(read_json(&frames, "ts_0000_meta.json")["device"]["Lux"], 256.0);
}

#[tokio::test]
async fn image_removed_when_metadata_cannot_be_written() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sink, _) =
        orchestrator(settings(dir.path()), vec![Step::Frame { lux: 128.0 }]).await;
    let mut orchestrator = orchestrator.unwrap();

    // Something else already occupies the metadata name.
    std::fs::create_dir(dir.path().join("ts_0000_meta.json")).unwrap();

    let err = orchestrator.run(idle_shutdown()).await.unwrap_err();
    assert!(matches!(err, Error::DataIntegrity(_)));
    assert_eq!(orchestrator.state(), CaptureState::Fatal);
    assert!(!dir.path().join("ts_0000.jpg").exists());
    assert!(scratch_files(dir.path()).is_empty());
    assert!(sink.events().iter().any(|e| matches!(
        e,
        CaptureEvent::FatalStop {
            stage: Stage::Persisting,
            ..
        }
    )));
    assert!(
        !sink
            .events()
            .iter()
            .any(|e| matches!(e, CaptureEvent::FrameCaptured { .. }))
    );
}

#[tokio::test]
async fn persist_retry_budget_exhaustion_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let frames = dir.path().join("frames");
    let (orchestrator, sink, requests) =
        orchestrator(settings(&frames), vec![Step::Vanish { lux: 256.0 }]).await;
    let mut orchestrator = orchestrator.unwrap();

    let err = orchestrator.run(idle_shutdown()).await.unwrap_err();
    assert!(matches!(err, Error::Fatal(ref reason) if reason.contains("failed 3 times")));
    assert_eq!(orchestrator.state(), CaptureState::Fatal);
    assert_eq!(requests.lock().unwrap().len(), 1);
    assert_eq!(persist_retries(&sink), vec![1, 2]);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        CaptureEvent::RunStopped {
            frames: 0,
            reason: StopReason::Fatal
        }
    )));
}
