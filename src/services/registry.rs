//! The named-queue collection and the job/queue state machine.
//!
//! Every operation takes the registry lock for one read-modify-write and
//! returns owned data; nothing here blocks or awaits while holding it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::models::job::{Job, JobHandle, JobStatus, TaskKind, TaskParams, MAX_REF_IMAGES};
use crate::models::queue::{next_ep_code, NamedQueue, QueueStatus};
use crate::models::reference::AssetRef;
use crate::models::requests::{JobPatch, NewJob, QueueSummary};
use crate::services::resolver::{self, ResolvedJob};

/// A job taken off the ready list and marked `running`.
#[derive(Debug, Clone)]
pub struct Claim {
    pub resolved: ResolvedJob,
    pub queue_name: String,
    /// "Scene 2/7 — label" style position for progress display.
    pub scene: String,
}

/// How a finished render ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Rendered { output: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    /// Project-linked queue: jobs dropped, the episode slot kept.
    Cleared,
}

#[derive(Debug)]
struct RegistryState {
    queues: Vec<NamedQueue>,
    next_queue_id: u64,
    next_job_id: u64,
}

/// Owner of all named queues.
#[derive(Debug)]
pub struct QueueRegistry {
    state: Mutex<RegistryState>,
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::from_snapshot(Vec::new())
    }
}

impl QueueRegistry {
    /// Rebuild from a (normalized) snapshot, restoring the id counters to one
    /// past the highest id seen.
    pub fn from_snapshot(mut queues: Vec<NamedQueue>) -> Self {
        let next_queue_id = queues.iter().map(|q| q.id).max().unwrap_or(0) + 1;
        let next_job_id = queues
            .iter()
            .flat_map(|q| q.jobs.iter().map(|j| j.id))
            .max()
            .unwrap_or(0)
            + 1;

        for i in 0..queues.len() {
            let queue = &queues[i];
            let high = queue.jobs.iter().map(|j| j.index + 1).max().unwrap_or(0);
            let next_index = queue.next_index.max(high);
            let needs_code = queue.project.is_some() && queue.ep_code.is_none();
            let code = needs_code.then(|| {
                let project = queue.project.as_deref();
                next_ep_code(
                    queues
                        .iter()
                        .filter(|q| q.project.as_deref() == project)
                        .filter_map(|q| q.ep_code.as_deref()),
                )
            });

            let queue = &mut queues[i];
            queue.next_index = next_index;
            if let Some(code) = code {
                queue.ep_code = Some(code);
            }
            let queue_id = queue.id;
            for job in &mut queue.jobs {
                job.queue_id = Some(queue_id);
            }
        }

        Self {
            state: Mutex::new(RegistryState {
                queues,
                next_queue_id,
                next_job_id,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of every queue, for persistence.
    pub fn snapshot(&self) -> Vec<NamedQueue> {
        self.lock().queues.clone()
    }

    pub fn summaries(&self) -> Vec<QueueSummary> {
        self.lock().queues.iter().map(QueueSummary::from).collect()
    }

    pub fn queue(&self, queue_id: u64) -> Result<NamedQueue, RegistryError> {
        let state = self.lock();
        find(&state.queues, queue_id).cloned()
    }

    /// Number of `running` jobs across all queues.
    pub fn running_count(&self) -> usize {
        self.lock()
            .queues
            .iter()
            .map(|q| q.count(JobStatus::Running))
            .sum()
    }

    /// Hand out a process-unique job id (shared with standalone submissions).
    pub fn mint_job_id(&self) -> u64 {
        let mut state = self.lock();
        let id = state.next_job_id;
        state.next_job_id += 1;
        id
    }

    pub fn create_queue(
        &self,
        name: String,
        project: Option<String>,
        jobs: Vec<NewJob>,
    ) -> NamedQueue {
        let mut state = self.lock();
        let id = state.next_queue_id;
        state.next_queue_id += 1;

        let ep_code = project.as_deref().map(|p| {
            next_ep_code(
                state
                    .queues
                    .iter()
                    .filter(|q| q.project.as_deref() == Some(p))
                    .filter_map(|q| q.ep_code.as_deref()),
            )
        });

        let mut queue = NamedQueue {
            id,
            name,
            status: QueueStatus::Idle,
            created_at: Utc::now(),
            project,
            ep_code,
            next_index: 0,
            jobs: Vec::with_capacity(jobs.len()),
        };
        for new_job in jobs {
            let job_id = state.next_job_id;
            state.next_job_id += 1;
            let index = queue.next_index;
            queue.next_index += 1;
            queue
                .jobs
                .push(new_job.into_job(job_id, Some(id), index, JobStatus::Idle));
        }

        tracing::info!(queue_id = id, name = %queue.name, jobs = queue.jobs.len(), "Created queue");
        state.queues.push(queue.clone());
        queue
    }

    /// Append a scene to a queue. It is created `idle` with the next unused index.
    pub fn add_job(&self, queue_id: u64, new_job: NewJob) -> Result<Job, RegistryError> {
        let mut state = self.lock();
        let job_id = state.next_job_id;
        let queue = find_mut(&mut state.queues, queue_id)?;
        let index = queue.next_index;
        queue.next_index += 1;
        let job = new_job.into_job(job_id, Some(queue_id), index, JobStatus::Idle);
        queue.jobs.push(job.clone());
        if queue.status == QueueStatus::Done {
            queue.status = QueueStatus::Idle;
        }
        state.next_job_id += 1;
        Ok(job)
    }

    /// Edit a scene. Returns whether a finished scene was reset to `idle`.
    pub fn patch_job(
        &self,
        queue_id: u64,
        job_id: u64,
        patch: JobPatch,
    ) -> Result<bool, RegistryError> {
        let mut state = self.lock();
        let queue = find_mut(&mut state.queues, queue_id)?;
        let job = queue
            .job_mut(job_id)
            .ok_or(RegistryError::JobNotFound { queue_id, job_id })?;
        if job.status == JobStatus::Running {
            return Err(RegistryError::Conflict(format!(
                "Job {job_id} is running and cannot be edited"
            )));
        }

        let was_done = job.status == JobStatus::Done;
        let audio_only = patch.is_audio_only(job.kind());
        apply_patch(job, patch)?;

        let reset = was_done && !audio_only;
        if reset {
            job.clear_run();
            if queue.status == QueueStatus::Done {
                queue.status = QueueStatus::Idle;
            }
        }
        Ok(reset)
    }

    /// Remove a scene. Indexes of the remaining scenes are left as they are.
    pub fn delete_job(&self, queue_id: u64, job_id: u64) -> Result<Job, RegistryError> {
        let mut state = self.lock();
        let queue = find_mut(&mut state.queues, queue_id)?;
        let position = queue
            .jobs
            .iter()
            .position(|j| j.id == job_id)
            .ok_or(RegistryError::JobNotFound { queue_id, job_id })?;
        if queue.jobs[position].status == JobStatus::Running {
            return Err(RegistryError::Conflict(format!(
                "Job {job_id} is running and cannot be removed"
            )));
        }
        let removed = queue.jobs.remove(position);
        if removed.status == JobStatus::Pending || queue.status != QueueStatus::Error {
            queue.settle(false);
        }
        Ok(removed)
    }

    pub fn delete_queue(&self, queue_id: u64, force: bool) -> Result<DeleteOutcome, RegistryError> {
        let mut state = self.lock();
        let position = state
            .queues
            .iter()
            .position(|q| q.id == queue_id)
            .ok_or(RegistryError::QueueNotFound(queue_id))?;
        let queue = &mut state.queues[position];
        if queue.status == QueueStatus::Running {
            return Err(RegistryError::Conflict(format!(
                "Queue {queue_id} is running and cannot be deleted"
            )));
        }

        if queue.project.is_some() && !force {
            queue.jobs.clear();
            queue.status = QueueStatus::Idle;
            Ok(DeleteOutcome::Cleared)
        } else {
            state.queues.remove(position);
            Ok(DeleteOutcome::Removed)
        }
    }

    pub fn unlink_project(&self, queue_id: u64) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let queue = find_mut(&mut state.queues, queue_id)?;
        ensure_not_running(queue)?;
        queue.project = None;
        Ok(())
    }

    /// Set (or clear, with an empty string) the background track of every scene.
    pub fn set_background_audio(&self, queue_id: u64, audio_bg: &str) -> Result<usize, RegistryError> {
        let mut state = self.lock();
        let queue = find_mut(&mut state.queues, queue_id)?;
        let value = Some(audio_bg.trim()).filter(|s| !s.is_empty()).map(str::to_string);
        for job in &mut queue.jobs {
            job.audio.audio_bg = value.clone();
        }
        Ok(queue.jobs.len())
    }

    /// Schedule every `idle` scene, in index order.
    pub fn run_all(&self, queue_id: u64) -> Result<Vec<JobHandle>, RegistryError> {
        let mut state = self.lock();
        let queue = find_mut(&mut state.queues, queue_id)?;
        ensure_not_running(queue)?;
        schedule_idle(queue)
    }

    /// Schedule a single scene. A finished scene is cleared and run again.
    pub fn run_one(&self, queue_id: u64, job_id: u64) -> Result<JobHandle, RegistryError> {
        let mut state = self.lock();
        let queue = find_mut(&mut state.queues, queue_id)?;
        let job = queue
            .job_mut(job_id)
            .ok_or(RegistryError::JobNotFound { queue_id, job_id })?;
        if job.status.is_transient() {
            return Err(RegistryError::Conflict(format!(
                "Job {job_id} is already {}",
                job.status
            )));
        }
        job.clear_run();
        job.status = JobStatus::Pending;
        queue.status = QueueStatus::Running;
        Ok(JobHandle {
            job_id,
            queue_id: Some(queue_id),
        })
    }

    /// Repeat from error: clear failed and unrun scenes, keep finished ones, run.
    pub fn reset(&self, queue_id: u64) -> Result<Vec<JobHandle>, RegistryError> {
        let mut state = self.lock();
        let queue = find_mut(&mut state.queues, queue_id)?;
        ensure_not_running(queue)?;
        for job in queue
            .jobs
            .iter_mut()
            .filter(|j| matches!(j.status, JobStatus::Error | JobStatus::Idle))
        {
            job.clear_run();
        }
        queue.status = QueueStatus::Idle;
        schedule_idle(queue)
    }

    /// Restart from scratch: clear every scene, including finished ones, run.
    pub fn restart(&self, queue_id: u64) -> Result<Vec<JobHandle>, RegistryError> {
        let mut state = self.lock();
        let queue = find_mut(&mut state.queues, queue_id)?;
        ensure_not_running(queue)?;
        for job in &mut queue.jobs {
            job.clear_run();
        }
        queue.status = QueueStatus::Idle;
        schedule_idle(queue)
    }

    /// Return a `pending` scene to `idle` before the worker picks it up.
    pub fn cancel(&self, queue_id: u64, job_id: u64) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let queue = find_mut(&mut state.queues, queue_id)?;
        let job = queue
            .job_mut(job_id)
            .ok_or(RegistryError::JobNotFound { queue_id, job_id })?;
        if job.status != JobStatus::Pending {
            return Err(RegistryError::Conflict(format!(
                "Job {job_id} is {} and cannot be cancelled",
                job.status
            )));
        }
        job.status = JobStatus::Idle;
        queue.settle(false);
        Ok(())
    }

    /// Mark a `pending` scene `running` and resolve its references against the
    /// queue's current jobs. `None` if it was cancelled or removed meanwhile.
    pub fn claim(&self, queue_id: u64, job_id: u64) -> Option<Claim> {
        let mut state = self.lock();
        let queue = state.queues.iter_mut().find(|q| q.id == queue_id)?;
        let total = queue.jobs.len();
        let position = queue.jobs.iter().position(|j| j.id == job_id)?;
        let job = &mut queue.jobs[position];
        if job.status != JobStatus::Pending {
            return None;
        }
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.finished_at = None;
        job.error = None;
        let scene = format!("Scene {}/{} — {}", position + 1, total, job.label);

        let job = queue.jobs[position].clone();
        let resolved = resolver::resolve_job(&job, &queue.jobs);
        queue.status = QueueStatus::Running;
        Some(Claim {
            resolved,
            queue_name: queue.name.clone(),
            scene,
        })
    }

    /// Record the end of a render and settle the queue. Returns the ids of
    /// scenes cancelled by a failure.
    pub fn complete(&self, queue_id: u64, job_id: u64, outcome: JobOutcome) -> Vec<u64> {
        let mut state = self.lock();
        let Some(queue) = state.queues.iter_mut().find(|q| q.id == queue_id) else {
            return Vec::new();
        };
        let Some(job) = queue.job_mut(job_id) else {
            return Vec::new();
        };

        job.finished_at = Some(Utc::now());
        let failed = match outcome {
            JobOutcome::Rendered { output } => {
                job.status = JobStatus::Done;
                job.output = Some(output);
                job.error = None;
                false
            }
            JobOutcome::Failed { error } => {
                job.status = JobStatus::Error;
                job.output = None;
                job.error = Some(error);
                true
            }
        };

        let cancelled = queue.settle(failed);
        if !cancelled.is_empty() {
            tracing::warn!(queue_id, job_id, cancelled = ?cancelled, "Scene failed, cancelled the rest of the queue");
        }
        tracing::info!(queue_id, job_id, queue_status = %queue.status, "Scene finished");
        cancelled
    }

    /// Name of the queue and its `done` scenes with outputs, in index order.
    pub fn finished_outputs(&self, queue_id: u64) -> Result<(String, Vec<Job>), RegistryError> {
        let state = self.lock();
        let queue = find(&state.queues, queue_id)?;
        let mut done: Vec<Job> = queue
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Done && j.output.is_some())
            .cloned()
            .collect();
        done.sort_by_key(|j| j.index);
        Ok((queue.name.clone(), done))
    }
}

fn find(queues: &[NamedQueue], queue_id: u64) -> Result<&NamedQueue, RegistryError> {
    queues
        .iter()
        .find(|q| q.id == queue_id)
        .ok_or(RegistryError::QueueNotFound(queue_id))
}

fn find_mut(queues: &mut [NamedQueue], queue_id: u64) -> Result<&mut NamedQueue, RegistryError> {
    queues
        .iter_mut()
        .find(|q| q.id == queue_id)
        .ok_or(RegistryError::QueueNotFound(queue_id))
}

fn ensure_not_running(queue: &NamedQueue) -> Result<(), RegistryError> {
    if queue.status == QueueStatus::Running {
        return Err(RegistryError::Conflict(format!(
            "Queue {} is running",
            queue.id
        )));
    }
    Ok(())
}

fn schedule_idle(queue: &mut NamedQueue) -> Result<Vec<JobHandle>, RegistryError> {
    let mut order: Vec<&mut Job> = queue
        .jobs
        .iter_mut()
        .filter(|j| j.status == JobStatus::Idle)
        .collect();
    if order.is_empty() {
        return Err(RegistryError::NothingToRun(queue.id));
    }
    order.sort_by_key(|j| j.index);

    let queue_id = queue.id;
    let handles = order
        .into_iter()
        .map(|job| {
            job.status = JobStatus::Pending;
            JobHandle {
                job_id: job.id,
                queue_id: Some(queue_id),
            }
        })
        .collect();
    queue.status = QueueStatus::Running;
    Ok(handles)
}

fn apply_patch(job: &mut Job, patch: JobPatch) -> Result<(), RegistryError> {
    let kind = job.kind();
    if patch.ref_imgs.is_some() && kind != TaskKind::ReferenceToVideo {
        return Err(RegistryError::InvalidEdit(format!("ref_imgs does not apply to {kind}")));
    }
    if patch.input_video.is_some() && job.task.input_video_mut().is_none() {
        return Err(RegistryError::InvalidEdit(format!("input_video does not apply to {kind}")));
    }
    if patch.input_image.is_some() && kind != TaskKind::TalkingAvatar {
        return Err(RegistryError::InvalidEdit(format!("input_image does not apply to {kind}")));
    }

    if let Some(label) = patch.label {
        job.label = label;
    }
    if let Some(prompt) = patch.prompt {
        job.settings.prompt = prompt;
    }
    if let Some(resolution) = patch.resolution {
        job.settings.resolution = resolution;
    }
    if let Some(duration) = patch.duration {
        job.settings.duration = duration;
    }
    if let Some(seed) = patch.seed {
        job.settings.seed = seed;
    }
    if let Some(offload) = patch.offload {
        job.settings.offload = offload;
    }
    if let Some(low_vram) = patch.low_vram {
        job.settings.low_vram = low_vram;
    }
    if let (Some(list), TaskParams::ReferenceToVideo { ref_imgs }) = (patch.ref_imgs, &mut job.task) {
        *ref_imgs = list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .take(MAX_REF_IMAGES)
            .collect();
    }
    if let (Some(value), Some(slot)) = (patch.input_video, job.task.input_video_mut()) {
        *slot = asset(value);
    }
    if let (Some(value), Some(slot)) = (patch.input_image, job.task.input_image_mut()) {
        *slot = asset(value);
    }
    if let Some(value) = patch.input_audio {
        job.audio.input_audio = asset(value);
    }
    if let Some(value) = patch.audio_bg {
        job.audio.audio_bg = text(value);
    }
    if let Some(value) = patch.audio_text {
        job.audio.audio_text = text(value);
    }
    if let Some(value) = patch.voice_id {
        job.audio.voice_id = text(value);
    }
    Ok(())
}

fn asset(value: String) -> Option<AssetRef> {
    text(value).map(AssetRef::from)
}

fn text(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Queue {0} not found")]
    QueueNotFound(u64),

    #[error("Job {job_id} not found in queue {queue_id}")]
    JobNotFound { queue_id: u64, job_id: u64 },

    #[error("{0}")]
    Conflict(String),

    #[error("Queue {0} has no scenes to run")]
    NothingToRun(u64),

    #[error("Invalid edit: {0}")]
    InvalidEdit(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{RenderSettings, SceneAudio};

    fn new_job(seed: u64) -> NewJob {
        NewJob {
            label: None,
            settings: RenderSettings {
                seed,
                ..RenderSettings::default()
            },
            task: TaskParams::ReferenceToVideo { ref_imgs: vec![] },
            audio: SceneAudio::default(),
        }
    }

    fn registry_with_queue(scenes: u64) -> (QueueRegistry, u64) {
        let registry = QueueRegistry::default();
        let queue = registry.create_queue(
            "Pilot".to_string(),
            None,
            (0..scenes).map(new_job).collect(),
        );
        (registry, queue.id)
    }

    fn job_ids(registry: &QueueRegistry, queue_id: u64) -> Vec<u64> {
        registry.queue(queue_id).unwrap().jobs.iter().map(|j| j.id).collect()
    }

    #[test]
    fn test_run_all_schedules_in_index_order() {
        let (registry, qid) = registry_with_queue(3);
        let handles = registry.run_all(qid).unwrap();
        assert_eq!(handles.iter().map(|h| h.job_id).collect::<Vec<_>>(), job_ids(&registry, qid));

        let queue = registry.queue(qid).unwrap();
        assert_eq!(queue.status, QueueStatus::Running);
        assert!(queue.jobs.iter().all(|j| j.status == JobStatus::Pending));
        assert!(matches!(registry.run_all(qid), Err(RegistryError::Conflict(_))));
    }

    #[test]
    fn test_failure_mid_run_aborts_remaining() {
        let (registry, qid) = registry_with_queue(3);
        let ids = job_ids(&registry, qid);
        registry.run_all(qid).unwrap();

        registry.claim(qid, ids[0]).unwrap();
        registry.complete(qid, ids[0], JobOutcome::Rendered { output: "a.mp4".into() });
        registry.claim(qid, ids[1]).unwrap();
        let cancelled = registry.complete(qid, ids[1], JobOutcome::Failed { error: "exit 1".into() });

        assert_eq!(cancelled, vec![ids[2]]);
        let queue = registry.queue(qid).unwrap();
        assert_eq!(queue.status, QueueStatus::Error);
        assert_eq!(queue.jobs[0].status, JobStatus::Done);
        assert_eq!(queue.jobs[0].output.as_deref(), Some("a.mp4"));
        assert_eq!(queue.jobs[1].status, JobStatus::Error);
        assert_eq!(queue.jobs[2].status, JobStatus::Idle);
        assert!(registry.claim(qid, ids[2]).is_none());
    }

    #[test]
    fn test_reset_keeps_done_and_restart_clears_all() {
        let (registry, qid) = registry_with_queue(2);
        let ids = job_ids(&registry, qid);
        registry.run_all(qid).unwrap();
        registry.claim(qid, ids[0]).unwrap();
        registry.complete(qid, ids[0], JobOutcome::Rendered { output: "a.mp4".into() });
        registry.claim(qid, ids[1]).unwrap();
        registry.complete(qid, ids[1], JobOutcome::Failed { error: "boom".into() });

        let handles = registry.reset(qid).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].job_id, ids[1]);
        let queue = registry.queue(qid).unwrap();
        assert_eq!(queue.jobs[0].status, JobStatus::Done);
        assert!(queue.jobs[1].error.is_none());

        registry.cancel(qid, ids[1]).unwrap();
        let handles = registry.restart(qid).unwrap();
        assert_eq!(handles.len(), 2);
        let queue = registry.queue(qid).unwrap();
        assert!(queue.jobs.iter().all(|j| j.output.is_none()));
    }

    #[test]
    fn test_partial_run_settles_idle() {
        let (registry, qid) = registry_with_queue(2);
        let ids = job_ids(&registry, qid);
        registry.run_one(qid, ids[0]).unwrap();
        registry.claim(qid, ids[0]).unwrap();
        registry.complete(qid, ids[0], JobOutcome::Rendered { output: "a.mp4".into() });
        assert_eq!(registry.queue(qid).unwrap().status, QueueStatus::Idle);
    }

    #[test]
    fn test_indexes_are_never_reused() {
        let (registry, qid) = registry_with_queue(3);
        let ids = job_ids(&registry, qid);
        registry.delete_job(qid, ids[1]).unwrap();
        let added = registry.add_job(qid, new_job(9)).unwrap();
        assert_eq!(added.index, 3);
        let indexes: Vec<u32> = registry.queue(qid).unwrap().jobs.iter().map(|j| j.index).collect();
        assert_eq!(indexes, vec![0, 2, 3]);
    }

    #[test]
    fn test_audio_only_edit_keeps_done() {
        let (registry, qid) = registry_with_queue(1);
        let id = job_ids(&registry, qid)[0];
        registry.run_one(qid, id).unwrap();
        registry.claim(qid, id).unwrap();
        registry.complete(qid, id, JobOutcome::Rendered { output: "a.mp4".into() });

        let patch = JobPatch {
            audio_bg: Some("music/bg.mp3".into()),
            ..JobPatch::default()
        };
        assert!(!registry.patch_job(qid, id, patch).unwrap());
        let job = registry.queue(qid).unwrap().jobs[0].clone();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.audio.audio_bg.as_deref(), Some("music/bg.mp3"));

        let patch = JobPatch {
            prompt: Some("a different shot".into()),
            ..JobPatch::default()
        };
        assert!(registry.patch_job(qid, id, patch).unwrap());
        let job = registry.queue(qid).unwrap().jobs[0].clone();
        assert_eq!(job.status, JobStatus::Idle);
        assert!(job.output.is_none());
    }

    #[test]
    fn test_running_job_rejects_edits_and_removal() {
        let (registry, qid) = registry_with_queue(1);
        let id = job_ids(&registry, qid)[0];
        registry.run_one(qid, id).unwrap();
        registry.claim(qid, id).unwrap();

        assert!(matches!(
            registry.patch_job(qid, id, JobPatch { seed: Some(1), ..JobPatch::default() }),
            Err(RegistryError::Conflict(_))
        ));
        assert!(matches!(registry.delete_job(qid, id), Err(RegistryError::Conflict(_))));
        assert!(matches!(registry.delete_queue(qid, true), Err(RegistryError::Conflict(_))));
        assert!(matches!(registry.cancel(qid, id), Err(RegistryError::Conflict(_))));
    }

    #[test]
    fn test_patch_rejects_foreign_fields() {
        let (registry, qid) = registry_with_queue(1);
        let id = job_ids(&registry, qid)[0];
        let patch = JobPatch {
            input_video: Some("{{prev}}".into()),
            ..JobPatch::default()
        };
        assert!(matches!(
            registry.patch_job(qid, id, patch),
            Err(RegistryError::InvalidEdit(_))
        ));
    }

    #[test]
    fn test_project_queue_delete_clears_unless_forced() {
        let registry = QueueRegistry::default();
        let q1 = registry.create_queue("A".into(), Some("Lumi".into()), vec![new_job(1)]);
        let q2 = registry.create_queue("B".into(), Some("Lumi".into()), vec![]);
        assert_eq!(q1.ep_code.as_deref(), Some("EP001"));
        assert_eq!(q2.ep_code.as_deref(), Some("EP002"));

        assert_eq!(registry.delete_queue(q1.id, false).unwrap(), DeleteOutcome::Cleared);
        assert!(registry.queue(q1.id).unwrap().jobs.is_empty());
        assert_eq!(registry.delete_queue(q1.id, true).unwrap(), DeleteOutcome::Removed);
        assert!(matches!(registry.queue(q1.id), Err(RegistryError::QueueNotFound(_))));
    }

    #[test]
    fn test_counters_restored_from_snapshot() {
        let (registry, qid) = registry_with_queue(3);
        let snapshot = registry.snapshot();
        let max_job = snapshot[0].jobs.iter().map(|j| j.id).max().unwrap();

        let restored = QueueRegistry::from_snapshot(snapshot);
        assert_eq!(restored.mint_job_id(), max_job + 1);
        let next = restored.create_queue("Next".into(), None, vec![]);
        assert_eq!(next.id, qid + 1);
    }

    #[test]
    fn test_set_background_audio() {
        let (registry, qid) = registry_with_queue(2);
        assert_eq!(registry.set_background_audio(qid, " music/a.mp3 ").unwrap(), 2);
        let queue = registry.queue(qid).unwrap();
        assert!(queue.jobs.iter().all(|j| j.audio.audio_bg.as_deref() == Some("music/a.mp3")));
        registry.set_background_audio(qid, "").unwrap();
        let queue = registry.queue(qid).unwrap();
        assert!(queue.jobs.iter().all(|j| j.audio.audio_bg.is_none()));
    }
}
