use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Deserializer, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::reference::AssetRef;

/// Maximum number of reference images the renderer accepts.
pub const MAX_REF_IMAGES: usize = 4;

/// Lifecycle of a scene render job.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, Display, AsRefStr,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    /// In-flight states that never survive a process restart.
    pub fn is_transient(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// Renderer task kinds, spelled as the renderer's `--task_type` values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskKind {
    ReferenceToVideo,
    SingleShotExtension,
    ShotSwitchingExtension,
    TalkingAvatar,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
pub enum Resolution {
    #[serde(rename = "480P")]
    #[strum(serialize = "480P")]
    P480,
    #[default]
    #[serde(rename = "540P")]
    #[strum(serialize = "540P")]
    P540,
    #[serde(rename = "720P")]
    #[strum(serialize = "720P")]
    P720,
}

/// Kind-specific renderer inputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskParams {
    ReferenceToVideo {
        #[serde(default, deserialize_with = "string_list")]
        ref_imgs: Vec<String>,
    },
    SingleShotExtension {
        #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
        input_video: Option<AssetRef>,
    },
    ShotSwitchingExtension {
        #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
        input_video: Option<AssetRef>,
    },
    TalkingAvatar {
        #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
        input_image: Option<AssetRef>,
    },
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParams::ReferenceToVideo { .. } => TaskKind::ReferenceToVideo,
            TaskParams::SingleShotExtension { .. } => TaskKind::SingleShotExtension,
            TaskParams::ShotSwitchingExtension { .. } => TaskKind::ShotSwitchingExtension,
            TaskParams::TalkingAvatar { .. } => TaskKind::TalkingAvatar,
        }
    }

    pub fn input_video(&self) -> Option<&AssetRef> {
        match self {
            TaskParams::SingleShotExtension { input_video }
            | TaskParams::ShotSwitchingExtension { input_video } => input_video.as_ref(),
            _ => None,
        }
    }

    pub fn input_video_mut(&mut self) -> Option<&mut Option<AssetRef>> {
        match self {
            TaskParams::SingleShotExtension { input_video }
            | TaskParams::ShotSwitchingExtension { input_video } => Some(input_video),
            _ => None,
        }
    }

    pub fn input_image(&self) -> Option<&AssetRef> {
        match self {
            TaskParams::TalkingAvatar { input_image } => input_image.as_ref(),
            _ => None,
        }
    }

    pub fn input_image_mut(&mut self) -> Option<&mut Option<AssetRef>> {
        match self {
            TaskParams::TalkingAvatar { input_image } => Some(input_image),
            _ => None,
        }
    }
}

/// Settings shared by every task kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct RenderSettings {
    #[serde(default)]
    #[garde(length(max = 8000))]
    pub prompt: String,

    #[serde(default)]
    #[garde(skip)]
    pub resolution: Resolution,

    #[serde(default = "default_duration")]
    #[garde(range(min = 1, max = 60))]
    pub duration: u32,

    #[serde(default = "default_seed")]
    #[garde(skip)]
    pub seed: u64,

    #[serde(default = "default_true")]
    #[garde(skip)]
    pub offload: bool,

    #[serde(default)]
    #[garde(skip)]
    pub low_vram: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            resolution: Resolution::default(),
            duration: default_duration(),
            seed: default_seed(),
            offload: true,
            low_vram: false,
        }
    }
}

/// Audio that is laid over a rendered scene. For talking avatars `input_audio`
/// drives the lip-sync render instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SceneAudio {
    /// Speech/narration track, full volume.
    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub input_audio: Option<AssetRef>,

    /// Background music, mixed at reduced gain.
    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub audio_bg: Option<String>,

    /// Narration text the speech track was synthesized from.
    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub audio_text: Option<String>,

    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
}

impl SceneAudio {
    pub fn has_sources(&self) -> bool {
        self.input_audio.is_some() || self.audio_bg.is_some()
    }
}

/// Address of a scheduled job on the ready list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobHandle {
    pub job_id: u64,
    /// `None` for standalone submissions.
    pub queue_id: Option<u64>,
}

/// One scene render: a common envelope around kind-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<u64>,
    #[serde(default)]
    pub index: u32,
    pub label: String,
    #[serde(default)]
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub settings: RenderSettings,
    #[serde(flatten)]
    pub task: TaskParams,
    #[serde(flatten)]
    pub audio: SceneAudio,
}

impl Job {
    pub fn kind(&self) -> TaskKind {
        self.task.kind()
    }

    /// Return to `idle`, dropping the rendered output and run timestamps.
    pub fn clear_run(&mut self) {
        self.status = JobStatus::Idle;
        self.output = None;
        self.error = None;
        self.started_at = None;
        self.finished_at = None;
    }

    /// Rough render time on the single GPU, in minutes.
    pub fn estimated_minutes(&self) -> f64 {
        let duration = f64::from(self.settings.duration.max(1));
        match self.kind() {
            TaskKind::ReferenceToVideo => {
                let base = match self.settings.resolution {
                    Resolution::P480 => 8.0,
                    Resolution::P540 => 12.0,
                    Resolution::P720 => 18.0,
                };
                base + duration * 0.5
            }
            TaskKind::TalkingAvatar => match self.settings.resolution {
                Resolution::P720 => 22.0,
                _ => 15.0,
            },
            TaskKind::SingleShotExtension => 8.0 + duration * 0.4,
            TaskKind::ShotSwitchingExtension => 5.0 + duration * 0.3,
        }
    }

    pub fn default_label(task: &TaskParams, settings: &RenderSettings) -> String {
        format!("{} — seed {}", task.kind(), settings.seed)
    }
}

fn default_duration() -> u32 {
    5
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

/// Treat a missing, null or blank string as absent.
pub(crate) fn non_empty<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: From<String>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .filter(|s| !s.trim().is_empty())
        .map(T::from))
}

/// Accept either a JSON list or a comma-separated string.
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrCsv {
        List(Vec<String>),
        Csv(String),
    }

    let items = match Option::<ListOrCsv>::deserialize(deserializer)? {
        Some(ListOrCsv::List(items)) => items,
        Some(ListOrCsv::Csv(csv)) => csv.split(',').map(str::to_string).collect(),
        None => Vec::new(),
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_from(value: serde_json::Value) -> Job {
        serde_json::from_value(value).expect("job should deserialize")
    }

    #[test]
    fn test_job_flattened_shape() {
        let job = job_from(json!({
            "id": 7,
            "queue_id": 2,
            "index": 1,
            "label": "Lumi enters",
            "status": "done",
            "created_at": "2024-05-01T10:00:00Z",
            "output": "result/single_shot_extension/9_a.mp4",
            "task_type": "single_shot_extension",
            "input_video": "{{prev}}",
            "prompt": "the door opens",
            "resolution": "720P",
            "duration": 8,
            "seed": 9,
            "audio_bg": ""
        }));

        assert_eq!(job.kind(), TaskKind::SingleShotExtension);
        assert_eq!(job.settings.resolution, Resolution::P720);
        assert!(job.settings.offload);
        assert!(matches!(job.task.input_video(), Some(AssetRef::Prev { .. })));
        assert_eq!(job.audio.audio_bg, None);

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["task_type"], "single_shot_extension");
        assert_eq!(value["input_video"], "{{prev}}");
        assert!(value.get("audio_bg").is_none());
    }

    #[test]
    fn test_ref_imgs_accepts_csv() {
        let job = job_from(json!({
            "id": 1,
            "label": "x",
            "created_at": "2024-05-01T10:00:00Z",
            "task_type": "reference_to_video",
            "ref_imgs": "a.png, b.png,,c.png"
        }));
        match job.task {
            TaskParams::ReferenceToVideo { ref_imgs } => {
                assert_eq!(ref_imgs, vec!["a.png", "b.png", "c.png"]);
            }
            other => panic!("unexpected task {other:?}"),
        }
        assert_eq!(job.settings.duration, 5);
        assert_eq!(job.settings.seed, 42);
        assert_eq!(job.settings.resolution, Resolution::P540);
    }

    #[test]
    fn test_estimated_minutes() {
        let mut job = job_from(json!({
            "id": 1,
            "label": "x",
            "created_at": "2024-05-01T10:00:00Z",
            "task_type": "reference_to_video",
            "resolution": "720P",
            "duration": 10
        }));
        assert!((job.estimated_minutes() - 23.0).abs() < 1e-9);

        job.task = TaskParams::TalkingAvatar { input_image: None };
        assert!((job.estimated_minutes() - 22.0).abs() < 1e-9);

        job.task = TaskParams::ShotSwitchingExtension { input_video: None };
        assert!((job.estimated_minutes() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_classes() {
        assert!(JobStatus::Pending.is_transient());
        assert!(JobStatus::Running.is_transient());
        assert!(!JobStatus::Idle.is_transient());
        assert!(JobStatus::Error.is_terminal());
        assert_eq!(JobStatus::Done.to_string(), "done");
    }
}
