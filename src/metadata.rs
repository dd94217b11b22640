//! Per-frame metadata records
//!
//! A record is written next to its image only after the image itself is in
//! place, through a scratch file and a rename, so a metadata file is always
//! complete and always has an image.

use crate::camera::{CaptureRequest, CaptureResult, Resolution};
use crate::condition::{ConditionEstimate, Trend};
use crate::controls::Controls;
use crate::error::{Error, Result};
use crate::naming::NamingEngine;
use crate::storage;
use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

/// Condition estimate as recorded alongside a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSummary {
    /// Smoothed brightness score
    pub score: Option<f64>,
    /// Trend at capture time
    pub trend: Trend,
    /// Whether the estimate was considered reliable
    pub reliable: bool,
}

impl From<&ConditionEstimate> for ConditionSummary {
    fn from(estimate: &ConditionEstimate) -> Self {
        Self {
            score: estimate.score,
            trend: estimate.trend,
            reliable: estimate.reliable,
        }
    }
}

/// Structured metadata persisted for each frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Project name
    pub project: String,
    /// Frame counter
    pub counter: u64,
    /// Image filename (sibling of the metadata file)
    pub image: String,
    /// Capture timestamp, RFC 3339
    pub captured_at: String,
    /// Requested resolution
    pub resolution: Resolution,
    /// JPEG quality
    pub quality: u8,
    /// Effective controls used for the capture
    pub controls: Controls,
    /// Condition bucket the controls came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Whether fallback controls were used
    #[serde(default)]
    pub fallback_controls: bool,
    /// Condition estimate the controls were derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionSummary>,
    /// Size of the image file in bytes
    pub image_bytes: u64,
    /// Set when the record was rebuilt at startup for an image missing its metadata
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recovered: bool,
    /// Raw device-reported metadata, verbatim
    #[serde(default)]
    pub device: Map<String, Value>,
}

/// Per-frame values known to the orchestrator but not to the device
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// Counter embedded in the filenames
    pub counter: u64,
    /// Metadata filename
    pub metadata_name: String,
    /// Selected condition bucket
    pub bucket: Option<String>,
    /// Whether fallback controls were used
    pub fallback: bool,
    /// Estimate used to select the controls
    pub condition: ConditionSummary,
}

/// Outcome of the startup reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Scratch files removed
    pub removed_temp_files: usize,
    /// Images that received a recovered metadata record
    pub recovered: Vec<u64>,
}

/// Writes metadata records into the output directory
#[derive(Debug, Clone)]
pub struct MetadataRecorder {
    directory: PathBuf,
    project: String,
}

impl MetadataRecorder {
    /// Create a recorder for `directory`.
    pub fn new(directory: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            project: project.into(),
        }
    }

    /// Assemble the record for a captured frame.
    pub fn build(
        &self,
        result: &CaptureResult,
        request: &CaptureRequest,
        image_path: &Path,
        frame: &FrameInfo,
    ) -> MetadataRecord {
        MetadataRecord {
            project: self.project.clone(),
            counter: frame.counter,
            image: file_name(image_path),
            captured_at: result
                .captured_at
                .to_rfc3339_opts(SecondsFormat::Millis, false),
            resolution: request.resolution,
            quality: request.quality,
            controls: request.controls.clone(),
            bucket: frame.bucket.clone(),
            fallback_controls: frame.fallback,
            condition: Some(frame.condition.clone()),
            image_bytes: result.image.len() as u64,
            recovered: false,
            device: result.metadata.clone(),
        }
    }

    /// Persist the record for a frame whose image is already at `image_path`.
    ///
    /// Returns the path of the metadata file.
    pub async fn record(
        &self,
        result: &CaptureResult,
        request: &CaptureRequest,
        image_path: &Path,
        frame: &FrameInfo,
    ) -> Result<PathBuf> {
        let record = self.build(result, request, image_path, frame);
        let target = self.directory.join(&frame.metadata_name);
        self.write(&record, &target).await?;
        Ok(target)
    }

    async fn write(&self, record: &MetadataRecord, target: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        let staged = storage::temp_path(&self.directory, &file_name(target));
        if let Err(err) = storage::write_durable(&staged, &json).await {
            storage::discard(&staged).await;
            return Err(err);
        }
        storage::publish(&staged, target).await
    }

    /// Restore the image/metadata pairing after an unclean stop.
    ///
    /// Scratch files are removed. An image without metadata (stopped between
    /// the two renames) gets a recovered record. Metadata without an image
    /// cannot be produced by a correct run and is a data integrity violation.
    pub async fn reconcile(&self, naming: &NamingEngine) -> Result<Reconciliation> {
        let scan = naming.scan().await?;
        let mut report = Reconciliation::default();

        for path in &scan.temp_files {
            storage::discard(path).await;
            report.removed_temp_files += 1;
            tracing::info!(path = %path.display(), "Removed leftover scratch file");
        }

        let Some(pattern) = naming.state().metadata_pattern.as_ref() else {
            return Ok(report);
        };

        if let Some((counter, path)) = scan
            .metadata
            .iter()
            .find(|(counter, _)| !scan.images.contains_key(counter))
        {
            return Err(Error::DataIntegrity(format!(
                "Metadata {} (frame {counter}) has no matching image",
                path.display()
            )));
        }

        for (counter, image_path) in &scan.images {
            if scan.metadata.contains_key(counter) {
                continue;
            }

            let info = tokio::fs::metadata(image_path).await?;
            let modified: DateTime<Local> = info.modified()?.into();
            let modified = modified.fixed_offset();
            let name = pattern.render(&self.project, *counter, &modified)?;

            let record = MetadataRecord {
                project: self.project.clone(),
                counter: *counter,
                image: file_name(image_path),
                captured_at: modified.to_rfc3339_opts(SecondsFormat::Millis, false),
                resolution: Resolution::default(),
                quality: 0,
                controls: Controls::new(),
                bucket: None,
                fallback_controls: false,
                condition: None,
                image_bytes: info.len(),
                recovered: true,
                device: Map::from_iter([(
                    "note".to_string(),
                    json!("reconstructed after an interrupted run"),
                )]),
            };
            self.write(&record, &self.directory.join(&name)).await?;
            tracing::warn!(
                counter,
                image = %image_path.display(),
                metadata = %name,
                "Recovered metadata for image without a record"
            );
            report.recovered.push(*counter);
        }

        Ok(report)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
