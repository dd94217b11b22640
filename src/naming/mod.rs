//! Frame naming and counter allocation
//!
//! The counter is rebuilt on startup from the output directory (the source
//! of truth) and a checkpoint file (a cache that keeps the counter from
//! regressing when old frames are archived away).

mod pattern;

pub use pattern::{DEFAULT_COUNTER_WIDTH, FilenamePattern, render};

use crate::error::Result;
use crate::storage;
use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Checkpoint file kept in the output directory
pub const CHECKPOINT_FILE: &str = ".timelapse-state.json";

/// Persisted counter checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Project the counter belongs to
    pub project: String,
    /// Counter the next persisted frame will use
    pub next_counter: u64,
    /// When the checkpoint was written (RFC 3339)
    pub updated_at: String,
}

/// Counter, project and patterns owned by the naming engine
#[derive(Debug, Clone)]
pub struct NamingState {
    /// Counter the next persisted frame will use
    pub counter: u64,
    /// Project name substituted for `{name}`
    pub project: String,
    /// Image filename pattern
    pub image_pattern: FilenamePattern,
    /// Metadata filename pattern, absent when metadata is disabled
    pub metadata_pattern: Option<FilenamePattern>,
}

/// Filenames reserved for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameNames {
    /// Counter embedded in both names
    pub counter: u64,
    /// Image filename
    pub image: String,
    /// Metadata filename
    pub metadata: Option<String>,
}

/// Files found in the output directory, keyed by embedded counter
#[derive(Debug, Default)]
pub struct DirectoryScan {
    /// Images matching the image pattern
    pub images: BTreeMap<u64, PathBuf>,
    /// Metadata files matching the metadata pattern
    pub metadata: BTreeMap<u64, PathBuf>,
    /// Leftover scratch files
    pub temp_files: Vec<PathBuf>,
}

impl DirectoryScan {
    /// Highest counter present in either map
    pub fn highest_counter(&self) -> Option<u64> {
        let images = self.images.keys().next_back().copied();
        let metadata = self.metadata.keys().next_back().copied();
        images.max(metadata)
    }
}

/// Scan `directory` for files produced by the given patterns.
pub async fn scan_directory(directory: &Path, state: &NamingState) -> Result<DirectoryScan> {
    let mut scan = DirectoryScan::default();
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(scan),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if storage::is_temp_name(&name) {
            scan.temp_files.push(entry.path());
            continue;
        }
        if let Some(counter) = state.image_pattern.match_counter(&state.project, &name) {
            scan.images.insert(counter, entry.path());
        } else if let Some(counter) = state
            .metadata_pattern
            .as_ref()
            .and_then(|p| p.match_counter(&state.project, &name))
        {
            scan.metadata.insert(counter, entry.path());
        }
    }

    Ok(scan)
}

/// Renders names and allocates counters for persisted frames
#[derive(Debug)]
pub struct NamingEngine {
    state: NamingState,
    directory: PathBuf,
}

impl NamingEngine {
    /// Rebuild the naming state for `directory`.
    ///
    /// The next counter is one past the highest counter found on disk, or
    /// the checkpointed value if that is larger. It never regresses.
    pub async fn restore(
        directory: impl Into<PathBuf>,
        project: impl Into<String>,
        image_pattern: FilenamePattern,
        metadata_pattern: Option<FilenamePattern>,
    ) -> Result<Self> {
        let directory = directory.into();
        let mut state = NamingState {
            counter: 0,
            project: project.into(),
            image_pattern,
            metadata_pattern,
        };

        let scan = scan_directory(&directory, &state).await?;
        let from_scan = scan.highest_counter().map_or(0, |c| c.saturating_add(1));
        let from_checkpoint = read_checkpoint(&directory, &state.project).await;
        state.counter = from_scan.max(from_checkpoint.unwrap_or(0));

        tracing::info!(
            directory = %directory.display(),
            project = %state.project,
            frames_found = scan.images.len(),
            from_scan,
            ?from_checkpoint,
            next_counter = state.counter,
            "Restored naming state"
        );

        Ok(Self { state, directory })
    }

    /// Current naming state
    pub fn state(&self) -> &NamingState {
        &self.state
    }

    /// Output directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Counter the next persisted frame will use, without allocating it
    pub fn peek(&self) -> u64 {
        self.state.counter
    }

    /// Names for the next frame, captured at `timestamp`.
    pub fn names_for(&self, timestamp: &DateTime<FixedOffset>) -> Result<FrameNames> {
        let counter = self.state.counter;
        let image = self
            .state
            .image_pattern
            .render(&self.state.project, counter, timestamp)?;
        let metadata = self
            .state
            .metadata_pattern
            .as_ref()
            .map(|p| p.render(&self.state.project, counter, timestamp))
            .transpose()?;
        Ok(FrameNames {
            counter,
            image,
            metadata,
        })
    }

    /// Commit the current counter to a persisted frame and advance.
    ///
    /// Call exactly once per frame, after its files are in place.
    pub fn next_counter(&mut self) -> u64 {
        let allocated = self.state.counter;
        self.state.counter = allocated.saturating_add(1);
        allocated
    }

    /// Write the checkpoint for the current counter.
    pub async fn checkpoint(&self) -> Result<()> {
        let checkpoint = Checkpoint {
            project: self.state.project.clone(),
            next_counter: self.state.counter,
            updated_at: Local::now().to_rfc3339(),
        };
        let json = serde_json::to_vec_pretty(&checkpoint)?;
        storage::replace(&self.directory.join(CHECKPOINT_FILE), &json).await
    }

    /// Scan the output directory with this engine's patterns.
    pub async fn scan(&self) -> Result<DirectoryScan> {
        scan_directory(&self.directory, &self.state).await
    }
}

async fn read_checkpoint(directory: &Path, project: &str) -> Option<u64> {
    let path = directory.join(CHECKPOINT_FILE);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Failed to read checkpoint");
            return None;
        }
    };

    match serde_json::from_slice::<Checkpoint>(&raw) {
        Ok(checkpoint) if checkpoint.project == project => Some(checkpoint.next_counter),
        Ok(checkpoint) => {
            tracing::warn!(
                checkpoint_project = %checkpoint.project,
                project,
                "Ignoring checkpoint written for a different project"
            );
            None
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Ignoring malformed checkpoint");
            None
        }
    }
}
