//! Durable snapshot of every named queue, stored as one JSON document.

use std::path::{Path, PathBuf};

use crate::models::job::JobStatus;
use crate::models::queue::{NamedQueue, QueueStatus};

/// Rewrite in-flight states to `idle`.
///
/// The snapshot records what the user asked for, not what a process was doing
/// when it stopped; applied both before writing and after reading.
pub fn normalize_for_persistence(mut queues: Vec<NamedQueue>) -> Vec<NamedQueue> {
    for queue in &mut queues {
        if queue.status == QueueStatus::Running {
            queue.status = QueueStatus::Idle;
        }
        for job in &mut queue.jobs {
            if job.status.is_transient() {
                job.status = JobStatus::Idle;
            }
        }
    }
    queues
}

/// File-backed store for the named-queue registry.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. A missing file is an empty registry.
    pub async fn load(&self) -> Result<Vec<NamedQueue>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let queues: Vec<NamedQueue> = serde_json::from_slice(&bytes)?;
        Ok(normalize_for_persistence(queues))
    }

    /// Write the snapshot atomically (temp file, then rename).
    pub async fn save(&self, queues: Vec<NamedQueue>) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(&normalize_for_persistence(queues))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Io(e));
        }
        Ok(())
    }

    /// Check the snapshot directory is reachable (for health checks).
    pub async fn health_check(&self) -> Result<(), StoreError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && parent.exists() => {
                tokio::fs::metadata(parent).await?;
                Ok(())
            }
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::create_dir_all(parent).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
