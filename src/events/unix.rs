//! Unix domain socket broadcast of capture events as JSON lines

use crate::error::{Error, Result};
use crate::events::{CaptureEvent, EventSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 128;

/// Broadcasts capture events to all connected Unix domain socket clients.
pub struct UnixBroadcast {
    sender: broadcast::Sender<Arc<String>>,
    accept_task: JoinHandle<()>,
    socket_path: PathBuf,
}

impl UnixBroadcast {
    /// Bind to the provided Unix domain socket path and spawn the accept loop.
    pub async fn bind(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Io(std::io::Error::new(
                        e.kind(),
                        format!("Failed to create directory {}: {e}", parent.display()),
                    ))
                })?;
            }
        }

        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_file(path).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to remove existing socket {}: {e}", path.display()),
                ))
            })?;
        }

        let listener = UnixListener::bind(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind Unix socket {}: {e}", path.display()),
            ))
        })?;

        let (sender, _) = broadcast::channel::<Arc<String>>(CHANNEL_CAPACITY);
        let sender_clone = sender.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let rx = sender_clone.subscribe();
                        tokio::spawn(handle_client(stream, rx));
                    }
                    Err(err) => {
                        tracing::warn!("Unix socket accept error: {err}");
                    }
                }
            }
        });

        tracing::info!(path = %path.display(), "Streaming capture events on Unix socket");

        Ok(Arc::new(Self {
            sender,
            accept_task,
            socket_path: path.to_path_buf(),
        }))
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Serialize and broadcast one event. Events sent with no client
    /// connected are dropped.
    pub fn send_event(&self, event: &CaptureEvent) -> Result<()> {
        let mut payload = serde_json::to_value(event)?;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("level".into(), serde_json::to_value(event.level())?);
        }
        let line = serde_json::to_string(&payload)?;
        if self.sender.receiver_count() > 0 {
            // Clients may disconnect between the check and the send.
            let _ = self.sender.send(Arc::new(line));
        }
        Ok(())
    }
}

impl EventSink for UnixBroadcast {
    fn emit(&self, event: &CaptureEvent) {
        if let Err(err) = self.send_event(event) {
            tracing::debug!(error = %err, "Failed to broadcast capture event");
        }
    }
}

impl Drop for UnixBroadcast {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!(
                "Failed to cleanup Unix socket {}: {}",
                self.socket_path.display(),
                err
            );
        }
    }
}

async fn handle_client(mut stream: UnixStream, mut rx: broadcast::Receiver<Arc<String>>) {
    loop {
        let payload = match rx.recv().await {
            Ok(payload) => payload,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Unix socket client lagging, events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if let Err(err) = stream.write_all(payload.as_bytes()).await {
            tracing::debug!("Unix socket client write error: {err}");
            break;
        }
        if let Err(err) = stream.write_all(b"\n").await {
            tracing::debug!("Unix socket client newline error: {err}");
            break;
        }
        if let Err(err) = stream.flush().await {
            tracing::debug!("Unix socket flush error: {err}");
            break;
        }
    }
}
