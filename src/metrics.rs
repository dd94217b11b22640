//! Lightweight runtime metrics aggregation for the capture daemon

use crate::config::MetricsFormat;
use crate::error::{Error, Result};
use crate::events::{CaptureEvent, EventSink};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

static METRICS: OnceLock<Arc<MetricsInner>> = OnceLock::new();
static LAST_SNAPSHOT: OnceLock<Mutex<Option<Snapshot>>> = OnceLock::new();

/// Label used for frames captured without condition buckets
const UNBUCKETED: &str = "none";

/// Enable periodic metrics emission with the provided interval in seconds.
pub fn enable(interval_secs: u64) {
    let interval = interval_secs.max(5);
    let inner = Arc::clone(METRICS.get_or_init(|| Arc::new(MetricsInner::new(interval))));
    inner.update_interval(interval);
    inner.ensure_task();
}

/// Record the outcome of a capture attempt for aggregation.
pub fn record_capture(duration: Duration, success: bool, bucket: Option<&str>) {
    if let Some(inner) = METRICS.get() {
        inner.record_capture(duration, success, bucket);
    }
}

/// Record the observed interval between successive persisted frames.
pub fn record_frame_interval(interval: Duration) {
    if let Some(inner) = METRICS.get() {
        inner.record_frame_interval(interval);
    }
}

/// Register the current run of consecutive failed attempts.
pub fn record_failure_streak(level: u64) {
    if let Some(inner) = METRICS.get() {
        inner.record_failure_streak(level);
    }
}

/// Fold a capture event into the aggregates.
pub fn record_event(event: &CaptureEvent) {
    let Some(inner) = METRICS.get() else {
        return;
    };
    match event {
        CaptureEvent::FrameCaptured {
            elapsed_ms,
            bucket,
            bytes,
            ..
        } => {
            inner.record_capture(
                Duration::from_millis(*elapsed_ms),
                true,
                Some(bucket.as_deref().unwrap_or(UNBUCKETED)),
            );
            inner.record_bytes(*bytes);
            inner.record_failure_streak(0);
            inner.mark_frame();
        }
        CaptureEvent::TransientRetry { attempt, .. } => {
            inner.record_capture(Duration::ZERO, false, None);
            inner.record_failure_streak(u64::from(*attempt));
        }
        CaptureEvent::FatalStop { .. } => inner.record_fatal(),
        _ => {}
    }
}

/// Event sink feeding [`record_event`]
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn emit(&self, event: &CaptureEvent) {
        record_event(event);
    }
}

/// Spawn a lightweight HTTP endpoint that exposes the latest metrics snapshot.
pub fn spawn_http_endpoint(addr: SocketAddr, format: MetricsFormat) -> Result<()> {
    let std_listener = std::net::TcpListener::bind(addr).map_err(Error::Io)?;
    std_listener.set_nonblocking(true).map_err(Error::Io)?;
    let listener = TcpListener::from_std(std_listener).map_err(Error::Io)?;

    tokio::spawn(async move {
        if let Err(err) = run_http_listener(listener, format).await {
            tracing::error!(target: "timelapse::metrics", error = %err, "metrics endpoint error");
        }
    });

    Ok(())
}

struct MetricsInner {
    state: Mutex<MetricsState>,
    interval_secs: AtomicU64,
    task_spawned: AtomicBool,
}

impl MetricsInner {
    fn new(interval_secs: u64) -> Self {
        Self {
            state: Mutex::new(MetricsState::new()),
            interval_secs: AtomicU64::new(interval_secs.max(5)),
            task_spawned: AtomicBool::new(false),
        }
    }

    fn update_interval(&self, interval_secs: u64) {
        self.interval_secs
            .store(interval_secs.max(5), Ordering::Relaxed);
    }

    fn ensure_task(self: &Arc<Self>) {
        if self
            .task_spawned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let runner = Arc::clone(self);
            tokio::spawn(async move {
                runner.run().await;
            });
        }
    }

    fn record_capture(&self, duration: Duration, success: bool, bucket: Option<&str>) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.attempts += 1;
        if success {
            state.frames += 1;
            state.capture_duration += duration;
        } else {
            state.transient_failures += 1;
        }

        if let Some(name) = bucket {
            let entry = state.per_bucket.entry(name.to_string()).or_default();
            if success {
                entry.frames += 1;
                entry.capture_duration += duration;
            }
        }
    }

    fn record_bytes(&self, bytes: u64) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.bytes_written = state.bytes_written.saturating_add(bytes);
    }

    fn record_fatal(&self) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.attempts += 1;
        state.fatal_stops += 1;
    }

    fn mark_frame(&self) {
        let now = Instant::now();
        let previous = {
            let mut state = self.state.lock().expect("metrics mutex poisoned");
            state.last_frame_at.replace(now)
        };
        if let Some(previous) = previous {
            self.record_frame_interval(now.saturating_duration_since(previous));
        }
    }

    fn record_frame_interval(&self, interval: Duration) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.frame_interval_total += interval;
        state.frame_interval_samples += 1;
        if interval > state.frame_interval_max {
            state.frame_interval_max = interval;
        }
        state.last_frame_interval = Some(interval);
    }

    fn record_failure_streak(&self, level: u64) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.failure_streak = level;
        if level > state.failure_streak_peak {
            state.failure_streak_peak = level;
        }
    }

    fn snapshot_current(&self) -> Snapshot {
        let state = self.state.lock().expect("metrics mutex poisoned");
        state.snapshot()
    }

    async fn run(self: Arc<Self>) {
        let mut current_secs = self.interval_secs.load(Ordering::Relaxed).max(5);
        loop {
            let mut ticker = time::interval(Duration::from_secs(current_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; report after a full interval.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let snapshot = self.snapshot_and_reset();
                store_snapshot(&snapshot);
                log_snapshot(&snapshot);

                let next_secs = self.interval_secs.load(Ordering::Relaxed).max(5);
                if next_secs != current_secs {
                    current_secs = next_secs;
                    break;
                }
            }
        }
    }

    fn snapshot_and_reset(&self) -> Snapshot {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        let snapshot = state.snapshot();
        state.reset_window();
        snapshot
    }
}

struct MetricsState {
    attempts: u64,
    frames: u64,
    transient_failures: u64,
    fatal_stops: u64,
    bytes_written: u64,
    capture_duration: Duration,
    per_bucket: HashMap<String, BucketCounters>,
    last_reset: Instant,
    last_frame_at: Option<Instant>,
    frame_interval_total: Duration,
    frame_interval_samples: u64,
    frame_interval_max: Duration,
    last_frame_interval: Option<Duration>,
    failure_streak: u64,
    failure_streak_peak: u64,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            attempts: 0,
            frames: 0,
            transient_failures: 0,
            fatal_stops: 0,
            bytes_written: 0,
            capture_duration: Duration::ZERO,
            per_bucket: HashMap::new(),
            last_reset: Instant::now(),
            last_frame_at: None,
            frame_interval_total: Duration::ZERO,
            frame_interval_samples: 0,
            frame_interval_max: Duration::ZERO,
            last_frame_interval: None,
            failure_streak: 0,
            failure_streak_peak: 0,
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut per_bucket: Vec<BucketSnapshot> = self
            .per_bucket
            .iter()
            .map(|(bucket, counters)| BucketSnapshot {
                bucket: bucket.clone(),
                frames: counters.frames,
                capture_duration: counters.capture_duration,
            })
            .collect();
        per_bucket.sort_by(|a, b| a.bucket.cmp(&b.bucket));

        let (frame_interval_avg, frame_interval_max) = if self.frame_interval_samples > 0 {
            let divisor = u32::try_from(self.frame_interval_samples).unwrap_or(u32::MAX);
            (
                self.frame_interval_total.checked_div(divisor),
                Some(self.frame_interval_max),
            )
        } else {
            (None, None)
        };

        Snapshot {
            attempts: self.attempts,
            frames: self.frames,
            transient_failures: self.transient_failures,
            fatal_stops: self.fatal_stops,
            bytes_written: self.bytes_written,
            capture_duration: self.capture_duration,
            elapsed: self.last_reset.elapsed(),
            per_bucket,
            frame_interval_avg,
            frame_interval_max,
            last_frame_interval: self.last_frame_interval,
            failure_streak: self.failure_streak,
            failure_streak_peak: self.failure_streak_peak,
        }
    }

    fn reset_window(&mut self) {
        self.attempts = 0;
        self.frames = 0;
        self.transient_failures = 0;
        self.fatal_stops = 0;
        self.bytes_written = 0;
        self.capture_duration = Duration::ZERO;
        self.per_bucket.clear();
        self.last_reset = Instant::now();
        self.frame_interval_total = Duration::ZERO;
        self.frame_interval_samples = 0;
        self.frame_interval_max = Duration::ZERO;
        self.failure_streak_peak = self.failure_streak;
    }
}

#[derive(Default)]
struct BucketCounters {
    frames: u64,
    capture_duration: Duration,
}

#[derive(Clone)]
struct Snapshot {
    attempts: u64,
    frames: u64,
    transient_failures: u64,
    fatal_stops: u64,
    bytes_written: u64,
    capture_duration: Duration,
    elapsed: Duration,
    per_bucket: Vec<BucketSnapshot>,
    frame_interval_avg: Option<Duration>,
    frame_interval_max: Option<Duration>,
    last_frame_interval: Option<Duration>,
    failure_streak: u64,
    failure_streak_peak: u64,
}

impl Snapshot {
    fn avg_capture_secs(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.capture_duration.as_secs_f64() / self.frames as f64
        }
    }

    fn success_ratio(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.frames as f64 / self.attempts as f64
        }
    }
}

#[derive(Clone)]
struct BucketSnapshot {
    bucket: String,
    frames: u64,
    capture_duration: Duration,
}

impl BucketSnapshot {
    fn avg_capture_ms(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.capture_duration.as_secs_f64() * 1_000.0 / self.frames as f64
        }
    }
}

fn log_snapshot(snapshot: &Snapshot) {
    let frame_avg_secs = snapshot.frame_interval_avg.map(|d| d.as_secs_f64());
    let frame_max_secs = snapshot.frame_interval_max.map(|d| d.as_secs_f64());

    info!(
        target: "timelapse::metrics",
        window_secs = snapshot.elapsed.as_secs(),
        attempts = snapshot.attempts,
        frames = snapshot.frames,
        transient_failures = snapshot.transient_failures,
        fatal_stops = snapshot.fatal_stops,
        bytes_written = snapshot.bytes_written,
        avg_capture_ms = snapshot.avg_capture_secs() * 1_000.0,
        success_rate = format_args!("{:.1}%", snapshot.success_ratio() * 100.0),
        frame_interval_avg_secs = frame_avg_secs,
        frame_interval_max_secs = frame_max_secs,
        failure_streak = snapshot.failure_streak,
        failure_streak_peak = snapshot.failure_streak_peak,
        "Capture metrics window"
    );

    if !snapshot.per_bucket.is_empty() {
        let breakdown = format_breakdown(&snapshot.per_bucket);
        info!(
            target: "timelapse::metrics",
            breakdown,
            "Per-bucket metrics"
        );
    }
}

fn format_breakdown(entries: &[BucketSnapshot]) -> String {
    entries
        .iter()
        .map(|entry| {
            format!(
                "{}: {} frames (avg {:.1} ms)",
                entry.bucket,
                entry.frames,
                entry.avg_capture_ms()
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn store_snapshot(snapshot: &Snapshot) {
    let lock = LAST_SNAPSHOT.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = lock.lock() {
        *guard = Some(snapshot.clone());
    }
}

fn latest_snapshot() -> Option<Snapshot> {
    let lock = LAST_SNAPSHOT.get_or_init(|| Mutex::new(None));
    match lock.lock() {
        Ok(guard) => (*guard).clone(),
        Err(_) => None,
    }
}

fn snapshot_fallback() -> Option<Snapshot> {
    METRICS.get().map(|inner| inner.snapshot_current())
}

async fn run_http_listener(listener: TcpListener, format: MetricsFormat) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(target: "timelapse::metrics", error = %err, "metrics accept failed");
                time::sleep(Duration::from_millis(250)).await;
                continue;
            }
        };

        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, format).await {
                tracing::debug!(
                    target: "timelapse::metrics",
                    peer = %peer,
                    error = %err,
                    "metrics connection closed"
                );
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, format: MetricsFormat) -> Result<()> {
    let mut buffer = [0u8; 1024];
    let _ = stream.read(&mut buffer).await.map_err(Error::Io)?;

    // Prefer the live window so scrapes between summaries are current.
    let snapshot = snapshot_fallback().or_else(latest_snapshot);

    let (status_line, content_type, body) = match snapshot {
        Some(snapshot) => match format {
            MetricsFormat::Json => {
                let payload = snapshot_to_http(&snapshot);
                let body = serde_json::to_vec(&payload)?;
                ("HTTP/1.1 200 OK\r\n", Some("application/json"), body)
            }
            MetricsFormat::Prometheus => {
                let body = render_prometheus(&snapshot).into_bytes();
                (
                    "HTTP/1.1 200 OK\r\n",
                    Some("text/plain; version=0.0.4"),
                    body,
                )
            }
        },
        None => ("HTTP/1.1 204 No Content\r\n", None, Vec::new()),
    };

    let mut response = Vec::with_capacity(128 + body.len());
    response.extend_from_slice(status_line.as_bytes());
    response.extend_from_slice(b"Connection: close\r\n");
    response.extend_from_slice(b"Cache-Control: no-store\r\n");
    if let Some(content_type) = content_type {
        response.extend_from_slice(b"Content-Type: ");
        response.extend_from_slice(content_type.as_bytes());
        response.extend_from_slice(b"\r\n");
    }
    let length_header = format!("Content-Length: {}\r\n\r\n", body.len());
    response.extend_from_slice(length_header.as_bytes());
    response.extend_from_slice(&body);

    stream.write_all(&response).await.map_err(Error::Io)?;
    stream.shutdown().await.map_err(Error::Io)?;

    Ok(())
}

#[derive(Serialize)]
struct HttpMetrics {
    window_secs: u64,
    attempts: u64,
    frames: u64,
    transient_failures: u64,
    fatal_stops: u64,
    bytes_written: u64,
    success_rate: f64,
    avg_capture_ms: f64,
    frame_intervals: Option<FrameIntervalMetrics>,
    failure_streak: StreakMetrics,
    per_bucket: Vec<HttpBucketMetrics>,
}

#[derive(Serialize)]
struct FrameIntervalMetrics {
    avg_secs: f64,
    max_secs: f64,
    last_secs: f64,
}

#[derive(Serialize)]
struct StreakMetrics {
    current: u64,
    peak: u64,
}

#[derive(Serialize)]
struct HttpBucketMetrics {
    bucket: String,
    frames: u64,
    avg_capture_ms: f64,
}

fn snapshot_to_http(snapshot: &Snapshot) -> HttpMetrics {
    let frame_intervals = snapshot.frame_interval_avg.map(|avg| FrameIntervalMetrics {
        avg_secs: avg.as_secs_f64(),
        max_secs: snapshot.frame_interval_max.unwrap_or(avg).as_secs_f64(),
        last_secs: snapshot.last_frame_interval.unwrap_or(avg).as_secs_f64(),
    });

    let per_bucket = snapshot
        .per_bucket
        .iter()
        .map(|entry| HttpBucketMetrics {
            bucket: entry.bucket.clone(),
            frames: entry.frames,
            avg_capture_ms: entry.avg_capture_ms(),
        })
        .collect();

    HttpMetrics {
        window_secs: snapshot.elapsed.as_secs(),
        attempts: snapshot.attempts,
        frames: snapshot.frames,
        transient_failures: snapshot.transient_failures,
        fatal_stops: snapshot.fatal_stops,
        bytes_written: snapshot.bytes_written,
        success_rate: snapshot.success_ratio() * 100.0,
        avg_capture_ms: snapshot.avg_capture_secs() * 1_000.0,
        frame_intervals,
        failure_streak: StreakMetrics {
            current: snapshot.failure_streak,
            peak: snapshot.failure_streak_peak,
        },
        per_bucket,
    }
}

fn write_metric(
    output: &mut String,
    name: &str,
    kind: &str,
    help: &str,
    value: impl std::fmt::Display,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}");
}

fn render_prometheus(snapshot: &Snapshot) -> String {
    let mut output = String::new();

    write_metric(
        &mut output,
        "timelapse_window_seconds",
        "gauge",
        "Duration of the aggregation window in seconds",
        snapshot.elapsed.as_secs(),
    );
    write_metric(
        &mut output,
        "timelapse_capture_attempts_total",
        "counter",
        "Capture attempts observed during the window",
        snapshot.attempts,
    );
    write_metric(
        &mut output,
        "timelapse_frames_total",
        "counter",
        "Frames persisted during the window",
        snapshot.frames,
    );
    write_metric(
        &mut output,
        "timelapse_transient_failures_total",
        "counter",
        "Transient failures retried during the window",
        snapshot.transient_failures,
    );
    write_metric(
        &mut output,
        "timelapse_fatal_stops_total",
        "counter",
        "Fatal stops during the window",
        snapshot.fatal_stops,
    );
    write_metric(
        &mut output,
        "timelapse_bytes_written_total",
        "counter",
        "Image bytes persisted during the window",
        snapshot.bytes_written,
    );
    write_metric(
        &mut output,
        "timelapse_capture_success_rate",
        "gauge",
        "Persisted frames per attempt for the window",
        format_args!("{:.6}", snapshot.success_ratio()),
    );
    write_metric(
        &mut output,
        "timelapse_capture_latency_avg_seconds",
        "gauge",
        "Average capture latency for persisted frames",
        format_args!("{:.6}", snapshot.avg_capture_secs()),
    );

    if let Some(avg) = snapshot.frame_interval_avg {
        let _ = writeln!(
            &mut output,
            "# HELP timelapse_frame_interval_seconds Interval between persisted frames"
        );
        let _ = writeln!(&mut output, "# TYPE timelapse_frame_interval_seconds gauge");
        let _ = writeln!(
            &mut output,
            "timelapse_frame_interval_seconds{{stat=\"avg\"}} {:.6}",
            avg.as_secs_f64()
        );
        if let Some(max) = snapshot.frame_interval_max {
            let _ = writeln!(
                &mut output,
                "timelapse_frame_interval_seconds{{stat=\"max\"}} {:.6}",
                max.as_secs_f64()
            );
        }
        if let Some(last) = snapshot.last_frame_interval {
            let _ = writeln!(
                &mut output,
                "timelapse_frame_interval_seconds{{stat=\"last\"}} {:.6}",
                last.as_secs_f64()
            );
        }
    }

    write_metric(
        &mut output,
        "timelapse_failure_streak",
        "gauge",
        "Current run of consecutive failed attempts",
        snapshot.failure_streak,
    );
    write_metric(
        &mut output,
        "timelapse_failure_streak_peak",
        "gauge",
        "Longest failure streak within the window",
        snapshot.failure_streak_peak,
    );

    if !snapshot.per_bucket.is_empty() {
        let _ = writeln!(
            &mut output,
            "# HELP timelapse_frames_by_bucket_total Frames persisted per condition bucket"
        );
        let _ = writeln!(&mut output, "# TYPE timelapse_frames_by_bucket_total counter");
        for entry in &snapshot.per_bucket {
            let label = escape_label(&entry.bucket);
            let _ = writeln!(
                &mut output,
                "timelapse_frames_by_bucket_total{{bucket=\"{label}\"}} {}",
                entry.frames
            );
        }
    }

    output
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
