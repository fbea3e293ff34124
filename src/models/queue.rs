use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::job::{Job, JobStatus};

/// Aggregate status of a named queue, always derived from its jobs.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

/// An ordered group of scenes forming one episode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedQueue {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ep_code: Option<String>,
    /// Index handed to the next appended job. Never reused, so indexes stay
    /// stable addresses for `{{job:N}}` after removals.
    #[serde(default)]
    pub next_index: u32,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl NamedQueue {
    pub fn job(&self, job_id: u64) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    pub fn job_mut(&mut self, job_id: u64) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }

    pub fn job_at(&self, index: u32) -> Option<&Job> {
        self.jobs.iter().find(|j| j.index == index)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    /// Recompute the queue status after a job transition.
    ///
    /// When `failed` is set (the job that just finished errored) every job
    /// still `pending` is returned to `idle` and the queue becomes `error`.
    /// Returns the ids of the cancelled jobs so they can be dropped from the
    /// ready list.
    pub fn settle(&mut self, failed: bool) -> Vec<u64> {
        if failed {
            let mut cancelled = Vec::new();
            for job in self.jobs.iter_mut().filter(|j| j.status == JobStatus::Pending) {
                job.status = JobStatus::Idle;
                cancelled.push(job.id);
            }
            self.status = QueueStatus::Error;
            return cancelled;
        }

        self.status = derive_status(&self.jobs);
        Vec::new()
    }
}

/// Status of a queue whose jobs are in the given states, absent a fresh failure.
pub fn derive_status(jobs: &[Job]) -> QueueStatus {
    if jobs.is_empty() {
        return QueueStatus::Idle;
    }
    if jobs.iter().any(|j| j.status.is_transient()) {
        return QueueStatus::Running;
    }
    if jobs.iter().all(|j| j.status.is_terminal()) {
        if jobs.iter().any(|j| j.status == JobStatus::Error) {
            QueueStatus::Error
        } else {
            QueueStatus::Done
        }
    } else {
        QueueStatus::Idle
    }
}

/// Next `EPnnn` code for a project given the codes already in use.
pub fn next_ep_code<'a>(existing: impl IntoIterator<Item = &'a str>) -> String {
    let highest = existing
        .into_iter()
        .filter_map(|code| code.strip_prefix("EP"))
        .filter_map(|n| n.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("EP{:03}", highest + 1)
}
