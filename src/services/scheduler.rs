//! Single-worker dispatch loop.
//!
//! Scheduled jobs wait on a FIFO ready list. The worker task receives one
//! handle at a time over a channel of capacity one, and the next handle is
//! only sent once the previous render (and its mix) has finished, so at most
//! one job is ever `running`.
//!
//! The ready-list lock and the registry lock are never held together, and
//! neither is held across a render, mix or finalize.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::models::job::{Job, JobHandle, JobStatus, TaskKind};
use crate::models::queue::NamedQueue;
use crate::models::requests::{JobPatch, NewJob, QueueSummary};
use crate::services::finalizer::{FinalizeError, FinalizeOutput, Finalizer};
use crate::services::import::{self, ImportError};
use crate::services::mixer::{self, AudioMixer, MixReport};
use crate::services::registry::{DeleteOutcome, JobOutcome, QueueRegistry, RegistryError};
use crate::services::renderer::{self, RenderError, RenderInvocation, RenderProgress, Renderer};
use crate::store::SnapshotStore;

/// The render currently in flight.
#[derive(Debug, Clone)]
struct CurrentRender {
    job_id: u64,
    queue_id: Option<u64>,
    queue_name: Option<String>,
    scene: Option<String>,
    started_at: DateTime<Utc>,
    progress: Arc<RenderProgress>,
}

#[derive(Debug, Default)]
struct ReadyState {
    entries: VecDeque<JobHandle>,
    /// Handle sent to the worker and not yet finished.
    in_flight: Option<JobHandle>,
    /// Queue-less submissions; kept in memory only.
    standalone: Vec<Job>,
    current: Option<CurrentRender>,
}

/// Snapshot of the worker for status polling.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub job_id: Option<u64>,
    pub queue_id: Option<u64>,
    pub queue_name: Option<String>,
    pub scene: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub log: Vec<String>,
    pub ready: usize,
}

pub struct Scheduler {
    config: AppConfig,
    registry: QueueRegistry,
    store: SnapshotStore,
    renderer: Arc<dyn Renderer>,
    mixer: AudioMixer,
    finalizer: Finalizer,
    ready: Mutex<ReadyState>,
    dispatch: mpsc::Sender<JobHandle>,
    persist_lock: tokio::sync::Mutex<()>,
    /// Held while a render or a remix touches scene videos.
    media_lock: tokio::sync::Mutex<()>,
}

impl Scheduler {
    /// Build the scheduler and spawn its worker task on the current runtime.
    pub fn start(
        config: AppConfig,
        registry: QueueRegistry,
        store: SnapshotStore,
        renderer: Arc<dyn Renderer>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        let scheduler = Arc::new(Self {
            mixer: AudioMixer::from_config(&config),
            finalizer: Finalizer::from_config(&config),
            config,
            registry,
            store,
            renderer,
            ready: Mutex::new(ReadyState::default()),
            dispatch: tx,
            persist_lock: tokio::sync::Mutex::new(()),
            media_lock: tokio::sync::Mutex::new(()),
        });
        tokio::spawn(Arc::clone(&scheduler).worker(rx));
        scheduler
    }

    async fn worker(self: Arc<Self>, mut rx: mpsc::Receiver<JobHandle>) {
        info!("Render worker started");
        while let Some(handle) = rx.recv().await {
            self.execute(handle).await;
            {
                let mut ready = self.lock_ready();
                ready.in_flight = None;
                ready.current = None;
            }
            self.pump();
        }
        warn!("Render worker stopped");
    }

    fn lock_ready(&self) -> MutexGuard<'_, ReadyState> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn worker_alive(&self) -> bool {
        !self.dispatch.is_closed()
    }

    /// Append handles to the ready list, skipping ones already waiting.
    fn enqueue(&self, handles: &[JobHandle]) {
        {
            let mut ready = self.lock_ready();
            for handle in handles {
                if !ready.entries.contains(handle) && ready.in_flight != Some(*handle) {
                    ready.entries.push_back(*handle);
                }
            }
            metrics::gauge!("ready_list_depth").set(ready.entries.len() as f64);
        }
        self.pump();
    }

    /// Hand the next ready job to the worker if it is idle.
    fn pump(&self) {
        let mut ready = self.lock_ready();
        if ready.in_flight.is_some() {
            return;
        }
        let Some(handle) = ready.entries.pop_front() else {
            return;
        };
        match self.dispatch.try_send(handle) {
            Ok(()) => ready.in_flight = Some(handle),
            Err(e) => {
                error!(job_id = handle.job_id, error = %e, "Failed to hand job to worker");
                ready.entries.push_front(handle);
            }
        }
        metrics::gauge!("ready_list_depth").set(ready.entries.len() as f64);
    }

    fn forget(&self, job_ids: &[u64]) {
        if job_ids.is_empty() {
            return;
        }
        let mut ready = self.lock_ready();
        ready.entries.retain(|h| !job_ids.contains(&h.job_id));
        metrics::gauge!("ready_list_depth").set(ready.entries.len() as f64);
    }

    async fn execute(&self, handle: JobHandle) {
        match handle.queue_id {
            Some(queue_id) => self.execute_queued(queue_id, handle.job_id).await,
            None => self.execute_standalone(handle.job_id).await,
        }
    }

    async fn execute_queued(&self, queue_id: u64, job_id: u64) {
        let Some(claim) = self.registry.claim(queue_id, job_id) else {
            debug!(queue_id, job_id, "Skipping job that is no longer pending");
            return;
        };
        info!(queue_id, job_id, scene = %claim.scene, "Starting scene render");

        let result = if self.config.strict_references && !claim.resolved.unresolved.is_empty() {
            Err(RenderError::Unresolved(claim.resolved.unresolved.clone()))
        } else {
            self.render(
                &claim.resolved.job,
                Some(claim.queue_name.clone()),
                Some(claim.scene.clone()),
            )
            .await
        };

        let outcome = match result {
            Ok(output) => JobOutcome::Rendered { output },
            Err(e) => {
                warn!(queue_id, job_id, error = %e, "Scene render failed");
                JobOutcome::Failed { error: e.to_string() }
            }
        };
        let cancelled = self.registry.complete(queue_id, job_id, outcome);
        self.forget(&cancelled);
        self.persist().await;
    }

    async fn execute_standalone(&self, job_id: u64) {
        let job = {
            let mut ready = self.lock_ready();
            let Some(job) = ready
                .standalone
                .iter_mut()
                .find(|j| j.id == job_id && j.status == JobStatus::Pending)
            else {
                return;
            };
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.clone()
        };
        info!(job_id, "Starting standalone render");

        let result = self.render(&job, None, None).await;

        let mut ready = self.lock_ready();
        if let Some(job) = ready.standalone.iter_mut().find(|j| j.id == job_id) {
            job.finished_at = Some(Utc::now());
            match result {
                Ok(output) => {
                    job.status = JobStatus::Done;
                    job.output = Some(output);
                }
                Err(e) => {
                    warn!(job_id, error = %e, "Standalone render failed");
                    job.status = JobStatus::Error;
                    job.error = Some(e.to_string());
                }
            }
        }
    }

    /// Render a resolved job, mix its audio and write the sidecar. Returns the
    /// output path relative to the project root.
    async fn render(
        &self,
        job: &Job,
        queue_name: Option<String>,
        scene: Option<String>,
    ) -> Result<String, RenderError> {
        let progress = Arc::new(RenderProgress::default());
        self.lock_ready().current = Some(CurrentRender {
            job_id: job.id,
            queue_id: job.queue_id,
            queue_name,
            scene,
            started_at: Utc::now(),
            progress: Arc::clone(&progress),
        });

        let invocation = RenderInvocation::for_job(job, &self.config);
        let _media = self.media_lock.lock().await;
        metrics::counter!("render_jobs_started").increment(1);
        let started = Instant::now();

        let video = match self.renderer.render(&invocation, &progress).await {
            Ok(video) => video,
            Err(e) => {
                metrics::counter!("render_jobs_failed").increment(1);
                return Err(e);
            }
        };
        metrics::histogram!("render_duration_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("render_jobs_completed").increment(1);

        if job.kind() != TaskKind::TalkingAvatar && job.audio.has_sources() {
            self.mix_rendered(job, &video).await;
        }
        if let Err(e) = renderer::write_sidecar(&video, &invocation.metadata).await {
            warn!(job_id = job.id, error = %e, "Failed to write render metadata");
        }

        Ok(self
            .config
            .relative_to_root(&video)
            .to_string_lossy()
            .into_owned())
    }

    async fn mix_rendered(&self, job: &Job, video: &Path) {
        let (speech, background) = mixer::existing_sources(job, &self.config).await;
        if speech.is_none() && background.is_none() {
            warn!(job_id = job.id, "Audio configured but no source file exists, skipping mix");
            return;
        }
        if let Err(e) = self
            .mixer
            .mix_scene(video, speech.as_deref(), background.as_deref())
            .await
        {
            warn!(job_id = job.id, error = %e, "Scene mix failed, keeping silent render");
        }
    }

    /// Write the registry snapshot. Failures are logged; in-memory state wins.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        if let Err(e) = self.store.save(self.registry.snapshot()).await {
            error!(path = %self.store.path().display(), error = %e, "Failed to persist queues");
        }
    }

    // Standalone jobs

    pub fn submit_standalone(&self, new_job: NewJob) -> Job {
        let id = self.registry.mint_job_id();
        let job = new_job.into_job(id, None, 0, JobStatus::Pending);
        self.lock_ready().standalone.push(job.clone());
        info!(job_id = id, kind = %job.kind(), "Standalone job submitted");
        self.enqueue(&[JobHandle {
            job_id: id,
            queue_id: None,
        }]);
        job
    }

    pub fn standalone_jobs(&self) -> Vec<Job> {
        self.lock_ready().standalone.clone()
    }

    /// Remove a standalone job that is not rendering. A `pending` one is
    /// dropped from the ready list before the worker reaches it.
    pub fn cancel_standalone(&self, job_id: u64) -> Result<Job, SchedulerError> {
        let mut ready = self.lock_ready();
        let position = ready
            .standalone
            .iter()
            .position(|j| j.id == job_id)
            .ok_or(SchedulerError::StandaloneNotFound(job_id))?;
        let status = ready.standalone[position].status;
        if status == JobStatus::Running {
            return Err(SchedulerError::StandaloneRunning(job_id));
        }

        let removed = ready.standalone.remove(position);
        ready.entries.retain(|h| !(h.queue_id.is_none() && h.job_id == job_id));
        metrics::gauge!("ready_list_depth").set(ready.entries.len() as f64);
        info!(job_id, %status, "Standalone job removed");
        Ok(removed)
    }

    /// Drop finished (`done` or `error`) standalone jobs. Returns how many.
    pub fn clear_finished_standalone(&self) -> usize {
        let mut ready = self.lock_ready();
        let before = ready.standalone.len();
        ready.standalone.retain(|j| !j.status.is_terminal());
        before - ready.standalone.len()
    }

    // Queue reads

    pub fn summaries(&self) -> Vec<QueueSummary> {
        self.registry.summaries()
    }

    pub fn queue(&self, queue_id: u64) -> Result<NamedQueue, RegistryError> {
        self.registry.queue(queue_id)
    }

    /// Jobs in `running` state across queues and standalone submissions.
    pub fn running_count(&self) -> usize {
        let standalone = self
            .lock_ready()
            .standalone
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count();
        standalone + self.registry.running_count()
    }

    pub fn status(&self) -> SchedulerStatus {
        let ready = self.lock_ready();
        let current = ready.current.as_ref();
        SchedulerStatus {
            running: current.is_some(),
            job_id: current.map(|c| c.job_id),
            queue_id: current.and_then(|c| c.queue_id),
            queue_name: current.and_then(|c| c.queue_name.clone()),
            scene: current.and_then(|c| c.scene.clone()),
            started_at: current.map(|c| c.started_at),
            progress: current.map_or(0, |c| c.progress.percent()),
            log: current.map(|c| c.progress.log_tail()).unwrap_or_default(),
            ready: ready.entries.len(),
        }
    }

    // Queue mutations

    pub async fn create_queue(&self, name: String, project: Option<String>, jobs: Vec<NewJob>) -> NamedQueue {
        let queue = self.registry.create_queue(name, project, jobs);
        self.persist().await;
        queue
    }

    pub async fn import_queue(
        &self,
        name: String,
        project: Option<String>,
        content: &str,
    ) -> Result<NamedQueue, SchedulerError> {
        let jobs = import::parse_scene_list(content)?;
        Ok(self.create_queue(name, project, jobs).await)
    }

    pub async fn add_job(&self, queue_id: u64, new_job: NewJob) -> Result<Job, RegistryError> {
        let job = self.registry.add_job(queue_id, new_job)?;
        self.persist().await;
        Ok(job)
    }

    pub async fn patch_job(&self, queue_id: u64, job_id: u64, patch: JobPatch) -> Result<bool, RegistryError> {
        let reset = self.registry.patch_job(queue_id, job_id, patch)?;
        self.persist().await;
        Ok(reset)
    }

    pub async fn delete_job(&self, queue_id: u64, job_id: u64) -> Result<Job, RegistryError> {
        let removed = self.registry.delete_job(queue_id, job_id)?;
        self.forget(&[job_id]);
        self.persist().await;
        Ok(removed)
    }

    pub async fn delete_queue(&self, queue_id: u64, force: bool) -> Result<DeleteOutcome, RegistryError> {
        let job_ids: Vec<u64> = self.registry.queue(queue_id)?.jobs.iter().map(|j| j.id).collect();
        let outcome = self.registry.delete_queue(queue_id, force)?;
        self.forget(&job_ids);
        self.persist().await;
        info!(queue_id, ?outcome, "Queue deleted");
        Ok(outcome)
    }

    pub async fn unlink_project(&self, queue_id: u64) -> Result<(), RegistryError> {
        self.registry.unlink_project(queue_id)?;
        self.persist().await;
        Ok(())
    }

    pub async fn set_background_audio(&self, queue_id: u64, audio_bg: &str) -> Result<usize, RegistryError> {
        let updated = self.registry.set_background_audio(queue_id, audio_bg)?;
        self.persist().await;
        Ok(updated)
    }

    // Scheduling

    pub async fn run_all(&self, queue_id: u64) -> Result<usize, RegistryError> {
        let handles = self.registry.run_all(queue_id)?;
        info!(queue_id, jobs = handles.len(), "Queue scheduled");
        self.enqueue(&handles);
        self.persist().await;
        Ok(handles.len())
    }

    pub async fn run_one(&self, queue_id: u64, job_id: u64) -> Result<(), RegistryError> {
        let handle = self.registry.run_one(queue_id, job_id)?;
        self.enqueue(&[handle]);
        self.persist().await;
        Ok(())
    }

    pub async fn reset(&self, queue_id: u64) -> Result<usize, RegistryError> {
        let handles = self.registry.reset(queue_id)?;
        info!(queue_id, jobs = handles.len(), "Queue reset and scheduled");
        self.enqueue(&handles);
        self.persist().await;
        Ok(handles.len())
    }

    pub async fn restart(&self, queue_id: u64) -> Result<usize, RegistryError> {
        let handles = self.registry.restart(queue_id)?;
        info!(queue_id, jobs = handles.len(), "Queue restarted");
        self.enqueue(&handles);
        self.persist().await;
        Ok(handles.len())
    }

    pub async fn cancel(&self, queue_id: u64, job_id: u64) -> Result<(), RegistryError> {
        self.registry.cancel(queue_id, job_id)?;
        self.forget(&[job_id]);
        self.persist().await;
        Ok(())
    }

    // Post-processing

    pub async fn finalize(&self, queue_id: u64) -> Result<FinalizeOutput, SchedulerError> {
        let (name, scenes) = self.registry.finished_outputs(queue_id)?;
        Ok(self.finalizer.finalize(&name, &scenes).await?)
    }

    pub async fn remix(&self, queue_id: u64) -> Result<MixReport, RegistryError> {
        let queue = self.registry.queue(queue_id)?;
        let report = {
            let _media = self.media_lock.lock().await;
            self.mixer.remix_queue(&queue, &self.config).await
        };
        info!(
            queue_id,
            mixed = report.mixed,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Queue re-mixed"
        );
        Ok(report)
    }

    /// Check the media tools can be launched.
    pub async fn media_health(&self) -> bool {
        self.mixer.media().health_check().await.is_ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    #[error("Standalone job {0} not found")]
    StandaloneNotFound(u64),

    #[error("Standalone job {0} is rendering and cannot be removed")]
    StandaloneRunning(u64),
}
