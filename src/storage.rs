//! Durable file publication for frames, metadata and checkpoints
//!
//! Every file becomes visible through a rename from a scratch path in the
//! same directory, so readers either see the complete file or nothing.

use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Prefix of scratch files; anything carrying it is removed on startup.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Unique scratch path in `dir` for a file that will become `final_name`.
pub fn temp_path(dir: &Path, final_name: &str) -> PathBuf {
    dir.join(format!(
        "{TEMP_PREFIX}{}-{final_name}",
        Uuid::new_v4().simple()
    ))
}

/// Whether `name` is one of our scratch files.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX)
}

/// Write `bytes` to a new file and flush it to stable storage.
pub async fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Move a staged file into place, refusing to replace an existing file.
///
/// A pre-existing target means two frames were about to share a name; that
/// is reported as a data integrity violation rather than overwritten.
pub async fn publish(staged: &Path, target: &Path) -> Result<()> {
    if fs::try_exists(target).await? {
        discard(staged).await;
        return Err(Error::DataIntegrity(format!(
            "refusing to overwrite existing file {}",
            target.display()
        )));
    }
    fs::rename(staged, target).await?;
    sync_parent(target).await;
    Ok(())
}

/// Atomically replace `target` with `bytes` (used for checkpoints).
pub async fn replace(target: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(target);
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("replace");
    let staged = temp_path(dir, name);
    if let Err(err) = write_durable(&staged, bytes).await {
        discard(&staged).await;
        return Err(err);
    }
    if let Err(err) = fs::rename(&staged, target).await {
        discard(&staged).await;
        return Err(err.into());
    }
    sync_parent(target).await;
    Ok(())
}

/// Best-effort removal of a scratch or rolled-back file.
pub async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %err, "Failed to remove file");
        }
    }
}

/// Make sure the output directory exists and accepts writes.
///
/// A missing directory is created only when `create` is set; otherwise it
/// is a configuration error. A directory that cannot be written to after
/// that is fatal.
pub async fn ensure_directory(dir: &Path, create: bool) -> Result<()> {
    match fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(Error::Config(format!(
                "Output path {} exists but is not a directory",
                dir.display()
            )));
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if !create {
                return Err(Error::Config(format!(
                    "Output directory {} does not exist and create_directories is disabled",
                    dir.display()
                )));
            }
            fs::create_dir_all(dir).await.map_err(|e| {
                Error::Fatal(format!("Failed to create directory {}: {e}", dir.display()))
            })?;
            tracing::info!(directory = %dir.display(), "Created output directory");
        }
        Err(err) => {
            return Err(Error::Fatal(format!(
                "Cannot access output directory {}: {err}",
                dir.display()
            )));
        }
    }

    let probe = temp_path(dir, "probe");
    let writable = write_durable(&probe, b"").await;
    discard(&probe).await;
    writable.map_err(|e| {
        Error::Fatal(format!(
            "Output directory {} is not writable: {e}",
            dir.display()
        ))
    })
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

async fn sync_parent(path: &Path) {
    if let Ok(dir) = File::open(parent_dir(path)).await {
        let _ = dir.sync_all().await;
    }
}
