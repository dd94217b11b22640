//! Time-lapse runtime configuration handling
//!
//! Files are YAML or TOML. Every section has defaults, environment
//! variables prefixed `TIMELAPSE_` override selected keys, and
//! [`TimelapseConfig::validate`] is the single fail-fast pass run before
//! anything touches the camera or the output directory.

use crate::camera::{Backend, CameraConfig, PixelFormat, Resolution};
use crate::condition::EstimatorSettings;
use crate::controls::{
    AF_MODE, ANALOGUE_GAIN, AWB_ENABLE, BRIGHTNESS, COLOUR_GAINS, CONTRAST, ConditionBucket,
    ControlPolicy, ControlValue, Controls, EXPOSURE_TIME,
};
use crate::error::{Error, Result};
use crate::naming::FilenamePattern;
use crate::orchestrator::OrchestratorSettings;
use crate::scheduler::{AdaptiveSettings, BackoffSettings};
use chrono::{FixedOffset, TimeZone};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Autofocus modes understood by the capture backends
const AF_MODES: [&str; 3] = ["manual", "auto", "continuous"];

/// Top-level configuration structure persisted to disk or environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelapseConfig {
    /// Camera backend selection
    pub camera: CameraOptions,
    /// Requested frame size
    pub resolution: Resolution,
    /// Base camera controls
    pub controls: ControlOptions,
    /// Output location and naming
    pub output: OutputOptions,
    /// Filesystem behaviour and metadata
    pub system: SystemOptions,
    /// Capture timing
    pub scheduling: SchedulingOptions,
    /// Condition estimation and bucketed controls
    pub conditions: ConditionOptions,
    /// Timeouts and retry budgets
    pub retry: RetryOptions,
    /// Logging configuration
    pub logging: LoggingOptions,
    /// Local event streaming
    pub api: ApiOptions,
}

impl TimelapseConfig {
    /// Load configuration from an explicit path or fall back to discovered defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit_path {
            Self::from_file(path)?
        } else if let Some(path) = Self::discover_file()? {
            tracing::info!("Using configuration file: {}", path.display());
            Self::from_file(&path)?
        } else {
            tracing::debug!("No timelapse.yaml / timelapse.toml found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Attempt to locate a configuration file in common locations.
    fn discover_file() -> Result<Option<PathBuf>> {
        let cwd =
            env::current_dir().map_err(|e| Error::Config(format!("Failed to read cwd: {e}")))?;
        for candidate in ["timelapse.yaml", "timelapse.yml", "timelapse.toml"] {
            let path = cwd.join(candidate);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        if let Some(xdg_config) = env::var_os("XDG_CONFIG_HOME") {
            let base = PathBuf::from(xdg_config).join("timelapse");
            for candidate in ["config.yaml", "config.toml"] {
                let path = base.join(candidate);
                if path.exists() {
                    return Ok(Some(path));
                }
            }
        }

        Ok(None)
    }

    /// Read configuration from a concrete file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;

        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase()
            .as_str()
        {
            "toml" => toml::from_str(&contents).map_err(|e| {
                Error::Config(format!("Failed to parse TOML {}: {e}", path.display()))
            }),
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| {
                Error::Config(format!("Failed to parse YAML {}: {e}", path.display()))
            }),
            other => Err(Error::Config(format!(
                "Unsupported config format '{other}', expected yaml/toml"
            ))),
        }
    }

    /// Apply environment variable overrides after file/default loading.
    fn apply_env_overrides(&mut self) {
        self.camera.apply_env_overrides();
        self.output.apply_env_overrides();
        self.scheduling.apply_env_overrides();
        self.logging.apply_env_overrides();
        self.api.apply_env_overrides();
    }

    /// Produce a fully resolved camera configuration.
    pub fn camera_config(&self) -> Result<CameraConfig> {
        self.camera.to_camera_config()
    }

    /// Validate every section without building anything.
    pub fn validate(&self) -> Result<()> {
        self.camera_config()?;
        self.orchestrator_settings().map(|_| ())
    }

    /// Base controls shared by every bucket.
    pub fn base_controls(&self) -> Result<Controls> {
        self.controls.to_controls("controls")
    }

    /// Condition to control mapping.
    pub fn control_policy(&self) -> Result<ControlPolicy> {
        let base = self.base_controls()?;
        let conditions = &self.conditions;
        let buckets = conditions
            .buckets
            .iter()
            .map(|bucket| {
                Ok(ConditionBucket {
                    name: bucket.name.clone(),
                    threshold: bucket.min_score,
                    controls: bucket
                        .controls
                        .to_controls(&format!("conditions.buckets.{}", bucket.name))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        ControlPolicy::new(
            base,
            buckets,
            conditions.default_bucket.as_deref(),
            conditions.hysteresis,
        )
    }

    /// Image and metadata filename patterns.
    ///
    /// The metadata pattern is `None` when metadata is disabled.
    pub fn patterns(&self) -> Result<(FilenamePattern, Option<FilenamePattern>)> {
        let width = self.output.counter_width;
        let image = FilenamePattern::parse(&self.output.filename_pattern, width)?;
        if !self.system.save_metadata {
            return Ok((image, None));
        }

        let metadata = FilenamePattern::parse(&self.system.metadata_filename, width)?;
        let project = &self.output.project_name;
        let sample = FixedOffset::east_opt(0)
            .and_then(|tz| tz.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).single())
            .ok_or_else(|| Error::Other("failed to build sample timestamp".into()))?;
        for counter in [0, 7, 12_345] {
            let image_name = image.render(project, counter, &sample)?;
            let metadata_name = metadata.render(project, counter, &sample)?;
            if image_name == metadata_name
                || image.match_counter(project, &metadata_name).is_some()
                || metadata.match_counter(project, &image_name).is_some()
            {
                return Err(Error::Config(format!(
                    "filename_pattern '{}' and metadata_filename '{}' can produce the same name",
                    image.as_str(),
                    metadata.as_str()
                )));
            }
        }
        Ok((image, Some(metadata)))
    }

    /// Estimator tuning.
    pub fn estimator_settings(&self) -> Result<EstimatorSettings> {
        let c = &self.conditions;
        if !(c.smoothing > 0.0 && c.smoothing <= 1.0) {
            return Err(Error::Config(format!(
                "conditions.smoothing must be within (0, 1], got {}",
                c.smoothing
            )));
        }
        if c.stale_after == 0 {
            return Err(Error::Config("conditions.stale_after must be at least 1".into()));
        }
        if !c.trend_threshold.is_finite() || c.trend_threshold < 0.0 {
            return Err(Error::Config(format!(
                "conditions.trend_threshold must be non-negative, got {}",
                c.trend_threshold
            )));
        }
        Ok(EstimatorSettings {
            smoothing: c.smoothing,
            stale_after: c.stale_after,
            trend_threshold: c.trend_threshold,
        })
    }

    /// Adaptive interval bounds, when adaptive scheduling is enabled.
    pub fn adaptive_settings(&self) -> Result<Option<AdaptiveSettings>> {
        let adaptive = &self.scheduling.adaptive;
        if !adaptive.enabled {
            return Ok(None);
        }
        let min_interval = seconds("scheduling.adaptive.min_interval", adaptive.min_interval)?;
        let max_interval = seconds("scheduling.adaptive.max_interval", adaptive.max_interval)?;
        if min_interval > max_interval {
            return Err(Error::Config(format!(
                "scheduling.adaptive.min_interval ({}) exceeds max_interval ({})",
                adaptive.min_interval, adaptive.max_interval
            )));
        }
        for (name, factor) in [
            ("narrow_factor", adaptive.narrow_factor),
            ("widen_factor", adaptive.widen_factor),
        ] {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(Error::Config(format!(
                    "scheduling.adaptive.{name} must be positive, got {factor}"
                )));
            }
        }
        Ok(Some(AdaptiveSettings {
            min_interval,
            max_interval,
            narrow_factor: adaptive.narrow_factor,
            widen_factor: adaptive.widen_factor,
            bright_score: adaptive.bright_score,
        }))
    }

    /// Retry backoff.
    pub fn backoff_settings(&self) -> Result<BackoffSettings> {
        let retry = &self.retry;
        let base = seconds("retry.backoff_base", retry.backoff_base)?;
        let max = seconds("retry.backoff_max", retry.backoff_max)?;
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(Error::Config(format!(
                "retry.jitter must be within [0, 1], got {}",
                retry.jitter
            )));
        }
        Ok(BackoffSettings {
            base,
            max: max.max(base),
            jitter: retry.jitter,
        })
    }

    /// Everything the orchestrator needs, validated.
    pub fn orchestrator_settings(&self) -> Result<OrchestratorSettings> {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(Error::Config(format!(
                "resolution must be non-zero, got {}x{}",
                self.resolution.width, self.resolution.height
            )));
        }
        if self.output.quality > 100 {
            return Err(Error::Config(format!(
                "output.quality must be within 0-100, got {}",
                self.output.quality
            )));
        }
        if self.output.project_name.trim().is_empty() {
            return Err(Error::Config("output.project_name must not be empty".into()));
        }
        if self.output.directory.as_os_str().is_empty() {
            return Err(Error::Config("output.directory must not be empty".into()));
        }
        if self.retry.max_persist_retries == 0 {
            return Err(Error::Config(
                "retry.max_persist_retries must be at least 1".into(),
            ));
        }
        if self.scheduling.max_captures == Some(0) {
            return Err(Error::Config(
                "scheduling.max_captures must be at least 1 when set".into(),
            ));
        }

        let (image_pattern, metadata_pattern) = self.patterns()?;

        Ok(OrchestratorSettings {
            directory: self.output.directory.clone(),
            create_directories: self.system.create_directories,
            project: self.output.project_name.clone(),
            image_pattern,
            metadata_pattern,
            resolution: self.resolution,
            quality: self.output.quality,
            policy: self.control_policy()?,
            estimator: self.estimator_settings()?,
            base_interval: seconds("scheduling.base_interval", self.scheduling.base_interval)?,
            adaptive: self.adaptive_settings()?,
            backoff: self.backoff_settings()?,
            capture_timeout: seconds("retry.capture_timeout", self.retry.capture_timeout)?,
            max_capture_retries: self.retry.max_capture_retries,
            max_persist_retries: self.retry.max_persist_retries,
            max_captures: self.scheduling.max_captures,
        })
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::Config(format!(
            "{name} must be a positive number of seconds, got {value}"
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::Config(format!("{name} is out of range: {e}")))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// User-friendly camera overrides merged on top of `CameraConfig::default()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraOptions {
    /// Backend name (`command`, `simulated`, `v4l2`)
    pub backend: Option<String>,
    /// Program for the command backend (default `rpicam-still`)
    pub program: Option<String>,
    /// Extra arguments appended to each command invocation
    pub extra_args: Vec<String>,
    /// Sensor settle time in milliseconds
    pub warmup_ms: Option<u64>,
    /// V4L2 device index (e.g. `/dev/video2`)
    pub device_index: Option<usize>,
    /// V4L2 device name substring
    pub device_name: Option<String>,
    /// V4L2 pixel format (mjpeg/yuyv)
    pub format: Option<String>,
    /// Number of V4L2 buffers to allocate
    pub buffer_count: Option<u32>,
    /// Length of a simulated day in seconds
    pub day_length_secs: Option<f64>,
}

impl CameraOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(backend) = env::var("TIMELAPSE_CAMERA_BACKEND") {
            self.backend = Some(backend);
        }
        if let Ok(program) = env::var("TIMELAPSE_CAMERA_PROGRAM") {
            self.program = Some(program);
        }
        if let Ok(name) = env::var("TIMELAPSE_CAMERA_DEVICE") {
            self.device_name = Some(name);
            self.device_index = None;
        }
        if let Ok(index) = env::var("TIMELAPSE_CAMERA_INDEX") {
            if let Ok(parsed) = index.parse::<usize>() {
                self.device_index = Some(parsed);
                self.device_name = None;
            }
        }
    }

    /// Merge overrides onto the default camera configuration.
    pub fn to_camera_config(&self) -> Result<CameraConfig> {
        let mut config = CameraConfig::default();

        if let Some(backend) = &self.backend {
            config.backend = Backend::from_str(backend).ok_or_else(|| {
                Error::Config(format!(
                    "Unknown camera backend '{backend}'. Use command, simulated, or v4l2"
                ))
            })?;
        }

        if let Some(program) = &self.program {
            if program.trim().is_empty() {
                return Err(Error::Config("camera.program must not be empty".into()));
            }
            config.program = program.clone();
        }
        config.extra_args = self.extra_args.clone();

        if let Some(ms) = self.warmup_ms {
            config.warmup = Duration::from_millis(ms);
        }

        if let Some(name) = &self.device_name {
            config.device_name = Some(name.clone());
            config.device_index = None;
        }
        if let Some(index) = self.device_index {
            config.device_index = Some(index);
            if self.device_name.is_none() {
                config.device_name = None;
            }
        }

        if let Some(format) = &self.format {
            config.format = PixelFormat::from_str(format).ok_or_else(|| {
                Error::Config(format!("Unknown pixel format '{format}'. Use mjpeg or yuyv"))
            })?;
        }
        if let Some(buffers) = self.buffer_count {
            config.buffer_count = buffers.max(2);
        }
        if let Some(secs) = self.day_length_secs {
            config.day_length = seconds("camera.day_length_secs", secs)?;
        }

        Ok(config)
    }
}

/// Camera controls as written in configuration files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlOptions {
    /// Exposure time in microseconds
    pub exposure_time: Option<u64>,
    /// Analogue gain multiplier
    pub analogue_gain: Option<f64>,
    /// Automatic white balance
    pub awb_enable: Option<bool>,
    /// Manual red/blue gains
    pub colour_gains: Option<(f64, f64)>,
    /// Brightness offset in [-1, 1]
    pub brightness: Option<f64>,
    /// Contrast multiplier, >= 0
    pub contrast: Option<f64>,
    /// Autofocus mode: manual, auto or continuous
    pub af_mode: Option<String>,
}

impl ControlOptions {
    /// Validate and convert into a control map keyed by libcamera names.
    pub fn to_controls(&self, section: &str) -> Result<Controls> {
        let invalid = |key: &str, detail: String| {
            Error::Config(format!("{section}.{key}: {detail}"))
        };
        let mut controls = Controls::new();

        if let Some(exposure) = self.exposure_time {
            if exposure == 0 {
                return Err(invalid("exposure_time", "must be positive".into()));
            }
            let exposure = i64::try_from(exposure)
                .map_err(|_| invalid("exposure_time", format!("{exposure} is too large")))?;
            controls.insert(EXPOSURE_TIME.into(), ControlValue::Int(exposure));
        }
        if let Some(gain) = self.analogue_gain {
            if !gain.is_finite() || gain <= 0.0 {
                return Err(invalid("analogue_gain", format!("must be positive, got {gain}")));
            }
            controls.insert(ANALOGUE_GAIN.into(), ControlValue::Float(gain));
        }
        if let Some(awb) = self.awb_enable {
            controls.insert(AWB_ENABLE.into(), ControlValue::Bool(awb));
        }
        if let Some((red, blue)) = self.colour_gains {
            if !(red.is_finite() && blue.is_finite() && red > 0.0 && blue > 0.0) {
                return Err(invalid(
                    "colour_gains",
                    format!("gains must be positive, got [{red}, {blue}]"),
                ));
            }
            controls.insert(COLOUR_GAINS.into(), ControlValue::Pair(red, blue));
        }
        if let Some(brightness) = self.brightness {
            if !(-1.0..=1.0).contains(&brightness) {
                return Err(invalid(
                    "brightness",
                    format!("must be within [-1, 1], got {brightness}"),
                ));
            }
            controls.insert(BRIGHTNESS.into(), ControlValue::Float(brightness));
        }
        if let Some(contrast) = self.contrast {
            if !contrast.is_finite() || contrast < 0.0 {
                return Err(invalid("contrast", format!("must be >= 0, got {contrast}")));
            }
            controls.insert(CONTRAST.into(), ControlValue::Float(contrast));
        }
        if let Some(mode) = &self.af_mode {
            let mode = mode.trim().to_ascii_lowercase();
            if !AF_MODES.contains(&mode.as_str()) {
                return Err(invalid(
                    "af_mode",
                    format!("'{mode}' is not one of {}", AF_MODES.join(", ")),
                ));
            }
            controls.insert(AF_MODE.into(), ControlValue::Text(mode));
        }

        Ok(controls)
    }
}

/// Output location and naming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Directory receiving images and metadata
    pub directory: PathBuf,
    /// Image filename pattern
    pub filename_pattern: String,
    /// Project name substituted for `{name}`
    pub project_name: String,
    /// JPEG quality, 0-100
    pub quality: u8,
    /// Zero padding for `{counter}`
    pub counter_width: usize,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("timelapse"),
            filename_pattern: "{name}_{counter}.jpg".to_string(),
            project_name: "timelapse".to_string(),
            quality: 90,
            counter_width: crate::naming::DEFAULT_COUNTER_WIDTH,
        }
    }
}

impl OutputOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var("TIMELAPSE_OUTPUT_DIR") {
            self.directory = PathBuf::from(dir);
        }
        if let Ok(project) = env::var("TIMELAPSE_PROJECT") {
            self.project_name = project;
        }
    }
}

/// Filesystem behaviour and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemOptions {
    /// Create the output directory when missing
    pub create_directories: bool,
    /// Write a metadata file next to every image
    pub save_metadata: bool,
    /// Metadata filename pattern
    pub metadata_filename: String,
}

impl Default for SystemOptions {
    fn default() -> Self {
        Self {
            create_directories: true,
            save_metadata: true,
            metadata_filename: "{name}_{counter}_meta.json".to_string(),
        }
    }
}

/// Capture timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingOptions {
    /// Seconds between captures
    pub base_interval: f64,
    /// Adaptive interval settings
    pub adaptive: AdaptiveOptions,
    /// Stop after this many persisted frames
    pub max_captures: Option<u64>,
}

impl Default for SchedulingOptions {
    fn default() -> Self {
        Self {
            base_interval: 60.0,
            adaptive: AdaptiveOptions::default(),
            max_captures: None,
        }
    }
}

impl SchedulingOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(interval) = env::var("TIMELAPSE_BASE_INTERVAL") {
            if let Ok(value) = interval.parse::<f64>() {
                self.base_interval = value;
            }
        }
    }
}

/// Adaptive interval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveOptions {
    /// Enable adaptive intervals
    pub enabled: bool,
    /// Shortest interval in seconds
    pub min_interval: f64,
    /// Longest interval in seconds
    pub max_interval: f64,
    /// Interval multiplier while conditions change
    pub narrow_factor: f64,
    /// Interval multiplier while conditions are stable and bright
    pub widen_factor: f64,
    /// Brightness score from which a stable scene counts as bright
    pub bright_score: f64,
}

impl Default for AdaptiveOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval: 10.0,
            max_interval: 600.0,
            narrow_factor: 0.5,
            widen_factor: 2.0,
            bright_score: 10.0,
        }
    }
}

/// Condition estimation and bucketed controls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionOptions {
    /// EWMA weight of the newest reading, in (0, 1]
    pub smoothing: f64,
    /// Consecutive stale updates before the estimate is unreliable
    pub stale_after: u32,
    /// Minimum score change that counts as a trend
    pub trend_threshold: f64,
    /// Band around bucket boundaries that must be crossed to switch
    pub hysteresis: f64,
    /// Bucket used when the estimate is unreliable
    pub default_bucket: Option<String>,
    /// Buckets in ascending `min_score` order
    pub buckets: Vec<BucketOptions>,
}

impl Default for ConditionOptions {
    fn default() -> Self {
        Self {
            smoothing: 0.3,
            stale_after: 3,
            trend_threshold: 0.25,
            hysteresis: 0.5,
            default_bucket: None,
            buckets: Vec::new(),
        }
    }
}

/// One configured condition bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketOptions {
    /// Bucket name
    pub name: String,
    /// Score at which the bucket starts
    pub min_score: f64,
    /// Controls overlaid on the base controls
    #[serde(default)]
    pub controls: ControlOptions,
}

/// Timeouts and retry budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Upper bound on one device call, seconds
    pub capture_timeout: f64,
    /// Consecutive transient capture failures tolerated
    pub max_capture_retries: u32,
    /// Persist retries tolerated per frame
    pub max_persist_retries: u32,
    /// First retry delay, seconds
    pub backoff_base: f64,
    /// Largest retry delay before jitter, seconds
    pub backoff_max: f64,
    /// Random extra delay as a fraction of the backoff, [0, 1]
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            capture_timeout: 30.0,
            max_capture_retries: 5,
            max_persist_retries: 3,
            backoff_base: 2.0,
            backoff_max: 60.0,
            jitter: 0.2,
        }
    }
}

/// Structured logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Default log level (overridable via `TIMELAPSE_LOG_LEVEL`)
    pub level: String,
    /// Optional log file path for teeing structured logs
    pub file: Option<PathBuf>,
    /// Force ANSI colors in stdout logging
    pub color: bool,
    /// Enable periodic metrics summaries over tracing
    pub metrics: bool,
    /// Interval in seconds for emitting aggregated metrics when enabled
    pub metrics_interval_secs: u64,
    /// Optional log rotation strategy applied to `file`
    pub rotation: Option<LogRotation>,
    /// Optional bind address for exposing runtime metrics over HTTP (e.g., "127.0.0.1:9900")
    pub metrics_endpoint: Option<String>,
    /// Output format for the metrics endpoint (`json` or `prometheus`)
    pub metrics_format: MetricsFormat,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            color: true,
            metrics: false,
            metrics_interval_secs: 300,
            rotation: None,
            metrics_endpoint: None,
            metrics_format: MetricsFormat::Json,
        }
    }
}

impl LoggingOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("TIMELAPSE_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(file) = env::var("TIMELAPSE_LOG_FILE") {
            self.file = Some(PathBuf::from(file));
        }
        if let Some(color) = env::var("TIMELAPSE_LOG_COLOR").ok().as_deref().and_then(parse_bool) {
            self.color = color;
        }
        if let Some(metrics) = env::var("TIMELAPSE_LOG_METRICS")
            .ok()
            .as_deref()
            .and_then(parse_bool)
        {
            self.metrics = metrics;
        }
        if let Ok(interval) = env::var("TIMELAPSE_LOG_METRICS_INTERVAL") {
            if let Ok(value) = interval.parse::<u64>() {
                self.metrics_interval_secs = value.max(5);
            }
        }
        if let Ok(rotation) = env::var("TIMELAPSE_LOG_ROTATION") {
            if let Some(parsed) = LogRotation::from_str(&rotation) {
                self.rotation = Some(parsed);
            }
        }
        if let Ok(endpoint) = env::var("TIMELAPSE_METRICS_ENDPOINT") {
            self.metrics_endpoint = Some(endpoint);
        }
        if let Ok(format) = env::var("TIMELAPSE_METRICS_FORMAT") {
            if let Ok(parsed) = format.parse::<MetricsFormat>() {
                self.metrics_format = parsed;
            }
        }
    }
}

/// Supported log rotation policies for file sinks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// Rotate log files once per hour
    Hourly,
    /// Rotate log files once per day
    Daily,
}

impl LogRotation {
    fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            _ => None,
        }
    }
}

/// Supported serialization formats for the metrics endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricsFormat {
    /// Emit metrics as structured JSON
    Json,
    /// Emit metrics in Prometheus text exposition format
    Prometheus,
}

impl MetricsFormat {
    /// Parse a metrics format identifier (case-insensitive) from a string slice.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "prometheus" => Some(Self::Prometheus),
            _ => None,
        }
    }
}

impl FromStr for MetricsFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| {
            format!("Unsupported metrics format '{value}', expected 'json' or 'prometheus'")
        })
    }
}

/// Local event streaming
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiOptions {
    /// Optional Unix domain socket path for streaming capture events
    pub unix_socket: Option<PathBuf>,
}

impl ApiOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(socket) = env::var("TIMELAPSE_UNIX_SOCKET") {
            if socket.trim().is_empty() {
                self.unix_socket = None;
            } else {
                self.unix_socket = Some(PathBuf::from(socket));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
camera:
  backend: simulated
resolution:
  width: 2028
  height: 1520
controls:
  awb_enable: false
  colour_gains: [1.8, 1.5]
  af_mode: manual
output:
  directory: /var/lib/timelapse/garden
  filename_pattern: "%Y%m%d_{name}_{counter:6}.jpg"
  project_name: garden
  quality: 93
system:
  create_directories: false
  metadata_filename: "{name}_{counter:6}.json"
scheduling:
  base_interval: 30
  adaptive:
    enabled: true
    min_interval: 10
    max_interval: 120
conditions:
  default_bucket: normal
  buckets:
    - name: dark
      min_score: 0
      controls:
        exposure_time: 200000
        analogue_gain: 8.0
    - name: normal
      min_score: 6
    - name: bright
      min_score: 12
      controls:
        exposure_time: 1000
"#;

    fn sample() -> TimelapseConfig {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = TimelapseConfig::default();
        config.validate().unwrap();
        assert_eq!(config.output.filename_pattern, "{name}_{counter}.jpg");
        assert_eq!(config.output.quality, 90);
        assert!(config.system.save_metadata);
        assert!(!config.scheduling.adaptive.enabled);
    }

    #[test]
    fn test_yaml_sections() {
        let config = sample();
        let settings = config.orchestrator_settings().unwrap();
        assert_eq!(settings.resolution.width, 2028);
        assert!(!settings.create_directories);
        assert_eq!(settings.base_interval, Duration::from_secs(30));
        assert_eq!(
            settings.adaptive.map(|a| a.max_interval),
            Some(Duration::from_secs(120))
        );
        assert_eq!(settings.policy.buckets().len(), 3);
        assert_eq!(
            settings.policy.base().get(COLOUR_GAINS),
            Some(&ControlValue::Pair(1.8, 1.5))
        );
        assert_eq!(
            config.camera_config().unwrap().backend,
            Backend::Simulated
        );
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timelapse.toml");
        std::fs::write(
            &path,
            r#"
[output]
project_name = "roof"
directory = "frames"

[scheduling]
base_interval = 5.5
max_captures = 10
"#,
        )
        .unwrap();
        let config = TimelapseConfig::from_file(&path).unwrap();
        let settings = config.orchestrator_settings().unwrap();
        assert_eq!(settings.project, "roof");
        assert_eq!(settings.base_interval, Duration::from_millis(5500));
        assert_eq!(settings.max_captures, Some(10));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timelapse.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(matches!(
            TimelapseConfig::from_file(&path),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_pattern_fails_validation() {
        let mut config = TimelapseConfig::default();
        config.output.filename_pattern = "{name}_{frame}.jpg".into();
        assert!(matches!(config.validate(), Err(Error::InvalidPattern(_))));
    }

    #[test]
    fn test_colliding_patterns_rejected() {
        let mut config = TimelapseConfig::default();
        config.system.metadata_filename = "{name}_{counter}.jpg".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.system.save_metadata = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases: Vec<fn(&mut TimelapseConfig)> = vec![
            |c| c.output.quality = 101,
            |c| c.resolution.width = 0,
            |c| c.scheduling.base_interval = 0.0,
            |c| c.scheduling.base_interval = f64::NAN,
            |c| {
                c.scheduling.adaptive.enabled = true;
                c.scheduling.adaptive.min_interval = 900.0;
            },
            |c| c.controls.analogue_gain = Some(0.0),
            |c| c.controls.brightness = Some(1.5),
            |c| c.controls.contrast = Some(-0.1),
            |c| c.controls.colour_gains = Some((1.0, 0.0)),
            |c| c.controls.af_mode = Some("macro".into()),
            |c| c.conditions.smoothing = 0.0,
            |c| c.retry.jitter = 2.0,
            |c| c.retry.max_persist_retries = 0,
            |c| c.output.project_name = " ".into(),
        ];
        for (i, mutate) in cases.into_iter().enumerate() {
            let mut config = TimelapseConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(Error::Config(_))),
                "case {i} accepted"
            );
        }
    }

    #[test]
    fn test_bucket_validation() {
        let mut config = sample();
        config.conditions.default_bucket = Some("dusk".into());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = sample();
        config.conditions.buckets.swap(0, 1);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut config = TimelapseConfig::default();
        config.camera.backend = Some("gphoto".into());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_metrics_format_parse() {
        assert_eq!("JSON".parse::<MetricsFormat>(), Ok(MetricsFormat::Json));
        assert!("xml".parse::<MetricsFormat>().is_err());
    }
}
