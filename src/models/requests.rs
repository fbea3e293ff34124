use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use super::job::{Job, JobStatus, RenderSettings, Resolution, SceneAudio, TaskKind, TaskParams};
use super::queue::{NamedQueue, QueueStatus};

/// A scene as submitted by a caller, before it is given an id and index.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewJob {
    #[serde(
        default,
        deserialize_with = "crate::models::job::non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    #[garde(length(min = 1, max = 200))]
    pub label: Option<String>,

    #[serde(flatten)]
    #[garde(dive)]
    pub settings: RenderSettings,

    #[serde(flatten)]
    #[garde(skip)]
    pub task: TaskParams,

    #[serde(flatten)]
    #[garde(skip)]
    pub audio: SceneAudio,
}

impl NewJob {
    pub fn into_job(self, id: u64, queue_id: Option<u64>, index: u32, status: JobStatus) -> Job {
        let label = self
            .label
            .unwrap_or_else(|| Job::default_label(&self.task, &self.settings));
        Job {
            id,
            queue_id,
            index,
            label,
            status,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
            settings: self.settings,
            task: self.task,
            audio: self.audio,
        }
    }
}

/// Partial edit of a queued scene. Absent fields are left untouched; an empty
/// string clears an optional path.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct JobPatch {
    #[garde(length(min = 1, max = 200))]
    pub label: Option<String>,

    #[garde(length(max = 8000))]
    pub prompt: Option<String>,

    #[garde(skip)]
    pub resolution: Option<Resolution>,

    #[garde(range(min = 1, max = 60))]
    pub duration: Option<u32>,

    #[garde(skip)]
    pub seed: Option<u64>,

    #[garde(skip)]
    pub offload: Option<bool>,

    #[garde(skip)]
    pub low_vram: Option<bool>,

    #[garde(skip)]
    pub ref_imgs: Option<Vec<String>>,

    #[garde(skip)]
    pub input_video: Option<String>,

    #[garde(skip)]
    pub input_image: Option<String>,

    #[garde(skip)]
    pub input_audio: Option<String>,

    #[garde(skip)]
    pub audio_bg: Option<String>,

    #[garde(skip)]
    pub audio_text: Option<String>,

    #[garde(skip)]
    pub voice_id: Option<String>,
}

impl JobPatch {
    /// Names of the fields this patch sets.
    pub fn edited_fields(&self) -> Vec<&'static str> {
        let present = [
            ("label", self.label.is_some()),
            ("prompt", self.prompt.is_some()),
            ("resolution", self.resolution.is_some()),
            ("duration", self.duration.is_some()),
            ("seed", self.seed.is_some()),
            ("offload", self.offload.is_some()),
            ("low_vram", self.low_vram.is_some()),
            ("ref_imgs", self.ref_imgs.is_some()),
            ("input_video", self.input_video.is_some()),
            ("input_image", self.input_image.is_some()),
            ("input_audio", self.input_audio.is_some()),
            ("audio_bg", self.audio_bg.is_some()),
            ("audio_text", self.audio_text.is_some()),
            ("voice_id", self.voice_id.is_some()),
        ];
        present
            .into_iter()
            .filter_map(|(name, set)| set.then_some(name))
            .collect()
    }

    /// True when the patch only touches the audio laid over the finished video,
    /// so an already rendered scene stays valid. A talking avatar's speech track
    /// drives its lip-sync render and is therefore not audio-only.
    pub fn is_audio_only(&self, kind: TaskKind) -> bool {
        let edited = self.edited_fields();
        !edited.is_empty()
            && edited.iter().all(|field| match *field {
                "audio_bg" | "audio_text" | "voice_id" => true,
                "input_audio" => kind != TaskKind::TalkingAvatar,
                _ => false,
            })
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateQueueRequest {
    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[serde(default, deserialize_with = "crate::models::job::non_empty")]
    #[garde(length(min = 1, max = 200))]
    pub project: Option<String>,

    #[serde(default)]
    #[garde(dive)]
    pub jobs: Vec<NewJob>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ImportQueueRequest {
    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[serde(default, deserialize_with = "crate::models::job::non_empty")]
    #[garde(length(min = 1, max = 200))]
    pub project: Option<String>,

    /// Markdown or JSON scene list.
    #[serde(alias = "markdown")]
    #[garde(length(min = 1))]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct BackgroundAudioRequest {
    #[serde(default)]
    pub audio_bg: String,
}

/// Response after creating a job or queue.
#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: u64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct PatchResponse {
    pub ok: bool,
    /// Whether a finished scene was sent back to `idle` by the edit.
    pub reset: bool,
}

/// List view of a named queue.
#[derive(Debug, Serialize)]
pub struct QueueSummary {
    pub id: u64,
    pub name: String,
    pub project: Option<String>,
    pub ep_code: Option<String>,
    pub status: QueueStatus,
    pub job_count: usize,
    pub done_count: usize,
    pub error_count: usize,
    pub created_at: DateTime<Utc>,
    pub estimated_minutes: u64,
    pub remaining_minutes: u64,
}

impl From<&NamedQueue> for QueueSummary {
    fn from(queue: &NamedQueue) -> Self {
        let estimated: f64 = queue.jobs.iter().map(|j| j.estimated_minutes()).sum();
        let remaining: f64 = queue
            .jobs
            .iter()
            .filter(|j| j.status != JobStatus::Done)
            .map(|j| j.estimated_minutes())
            .sum();

        Self {
            id: queue.id,
            name: queue.name.clone(),
            project: queue.project.clone(),
            ep_code: queue.ep_code.clone(),
            status: queue.status,
            job_count: queue.jobs.len(),
            done_count: queue.count(JobStatus::Done),
            error_count: queue.count(JobStatus::Error),
            created_at: queue.created_at,
            estimated_minutes: estimated.round() as u64,
            remaining_minutes: remaining.round() as u64,
        }
    }
}
