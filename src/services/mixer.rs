//! Lays speech and background tracks over rendered scenes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::models::job::{Job, JobStatus, TaskKind};
use crate::models::queue::NamedQueue;
use crate::services::media::{MediaError, MediaTool};
use crate::services::resolver;

pub const MIX_SAMPLE_RATE: u32 = 44_100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixOutcome {
    Mixed,
    /// Neither source was given; the video was left alone.
    NotMixed,
}

/// Result of re-mixing every finished scene of a queue.
#[derive(Debug, Default, Serialize)]
pub struct MixReport {
    pub mixed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Build the ffmpeg arguments for a scene mix.
///
/// Only the video stream of the original is mapped, so any audio it already
/// carries is discarded. Output length is the shortest of the inputs.
pub fn mix_args(
    video: &Path,
    output: &Path,
    speech: Option<&Path>,
    background: Option<&Path>,
    background_volume: f64,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), video.into()];
    for source in [speech, background].into_iter().flatten() {
        args.push("-i".into());
        args.push(source.into());
    }

    let normalize = format!("aresample={MIX_SAMPLE_RATE},aformat=channel_layouts=stereo");
    match (speech, background) {
        (Some(_), Some(_)) => {
            let graph = format!(
                "[1:a]{normalize},volume=1.0[speech];\
                 [2:a]{normalize},volume={background_volume}[bg];\
                 [speech][bg]amix=inputs=2:duration=shortest:dropout_transition=0:normalize=0[a]"
            );
            args.push("-filter_complex".into());
            args.push(graph.into());
            args.extend(["-map", "0:v", "-map", "[a]"].map(OsString::from));
        }
        (Some(_), None) => {
            args.extend(["-map", "0:v", "-map", "1:a"].map(OsString::from));
        }
        (None, Some(_)) => {
            let graph = format!("[1:a]{normalize},volume={background_volume}[a]");
            args.push("-filter_complex".into());
            args.push(graph.into());
            args.extend(["-map", "0:v", "-map", "[a]"].map(OsString::from));
        }
        (None, None) => {}
    }

    args.extend(
        [
            "-c:v",
            "copy",
            "-c:a",
            "aac",
            "-ar",
            "44100",
            "-ac",
            "2",
            "-shortest",
        ]
        .map(OsString::from),
    );
    args.push(output.into());
    args
}

/// Temp file the mix is written to before it replaces the original.
pub fn mix_temp_path(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scene".to_string());
    video.with_file_name(format!("{stem}_mixed_tmp.mp4"))
}

pub struct AudioMixer {
    media: MediaTool,
    background_volume: f64,
    timeout: Duration,
}

impl AudioMixer {
    pub fn new(media: MediaTool, background_volume: f64, timeout: Duration) -> Self {
        Self {
            media,
            background_volume,
            timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            MediaTool::from_config(config),
            config.background_volume,
            config.mix_timeout(),
        )
    }

    pub fn media(&self) -> &MediaTool {
        &self.media
    }

    /// Replace the audio of `video` with speech and/or background, in place.
    ///
    /// On failure the temp output is removed and `video` is untouched.
    pub async fn mix_scene(
        &self,
        video: &Path,
        speech: Option<&Path>,
        background: Option<&Path>,
    ) -> Result<MixOutcome, MixError> {
        if speech.is_none() && background.is_none() {
            return Ok(MixOutcome::NotMixed);
        }

        let tmp = mix_temp_path(video);
        let args = mix_args(video, &tmp, speech, background, self.background_volume);
        let result = self.media.ffmpeg(args, self.timeout).await;

        match result {
            Ok(()) if tokio::fs::try_exists(&tmp).await.unwrap_or(false) => {
                if let Err(e) = tokio::fs::rename(&tmp, video).await {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(MixError::Io(e));
                }
                info!(video = %video.display(), speech = speech.is_some(), background = background.is_some(), "Mixed scene audio");
                Ok(MixOutcome::Mixed)
            }
            Ok(()) => Err(MixError::MissingOutput(tmp)),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(MixError::Media(e))
            }
        }
    }

    /// Re-mix the finished scenes of a queue.
    ///
    /// A scene with only a speech source whose video already has audio is
    /// considered mixed and skipped. A scene with a background source is
    /// always re-mixed, since the track may have changed.
    pub async fn remix_queue(&self, queue: &NamedQueue, config: &AppConfig) -> MixReport {
        let mut report = MixReport::default();
        let mut jobs: Vec<&Job> = queue.jobs.iter().collect();
        jobs.sort_by_key(|j| j.index);

        for job in jobs {
            if job.status != JobStatus::Done || job.kind() == TaskKind::TalkingAvatar {
                report.skipped += 1;
                continue;
            }
            let Some(output) = job.output.as_deref() else {
                report.skipped += 1;
                continue;
            };
            if !job.audio.has_sources() {
                report.skipped += 1;
                continue;
            }

            let video = config.resolve(output);
            if !tokio::fs::try_exists(&video).await.unwrap_or(false) {
                report.errors.push(format!("{}: video not found", job.label));
                continue;
            }

            let effective = resolver::resolve_job(job, &queue.jobs).job;
            let (speech, background) = existing_sources(&effective, config).await;
            if speech.is_none() && background.is_none() {
                report.errors.push(format!("{}: audio file(s) not found", job.label));
                continue;
            }

            if background.is_none() {
                match self.media.probe(&video).await {
                    Ok(info) if info.has_audio => {
                        report.skipped += 1;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        report.errors.push(format!("{}: {e}", job.label));
                        continue;
                    }
                }
            }

            let rendered_at = tokio::fs::metadata(&video)
                .await
                .and_then(|meta| meta.modified())
                .ok();
            match self
                .mix_scene(&video, speech.as_deref(), background.as_deref())
                .await
            {
                Ok(MixOutcome::Mixed) => {
                    report.mixed += 1;
                    // A remixed scene keeps its render time so output scans skip it.
                    if let Some(modified) = rendered_at {
                        if let Err(e) = restore_modified(&video, modified).await {
                            warn!(job_id = job.id, error = %e, "Failed to restore scene mtime");
                        }
                    }
                }
                Ok(MixOutcome::NotMixed) => report.skipped += 1,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "Scene mix failed");
                    report.errors.push(format!("{}: {e}", job.label));
                }
            }
        }
        report
    }
}

/// Speech and background paths of a (resolved) job that exist on disk.
pub async fn existing_sources(job: &Job, config: &AppConfig) -> (Option<PathBuf>, Option<PathBuf>) {
    let speech = match job.audio.input_audio.as_ref() {
        Some(path) => existing(config.resolve(path.as_str())).await,
        None => None,
    };
    let background = match job.audio.audio_bg.as_deref() {
        Some(path) => existing(config.resolve(path)).await,
        None => None,
    };
    (speech, background)
}

async fn restore_modified(path: &Path, modified: SystemTime) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.into_std().await.set_modified(modified)
}

async fn existing(path: PathBuf) -> Option<PathBuf> {
    tokio::fs::try_exists(&path)
        .await
        .unwrap_or(false)
        .then_some(path)
}

#[derive(Debug, thiserror::Error)]
pub enum MixError {
    #[error("Mix failed: {0}")]
    Media(#[from] MediaError),

    #[error("Mix produced no output at {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("Failed to replace scene video: {0}")]
    Io(#[from] std::io::Error),
}
