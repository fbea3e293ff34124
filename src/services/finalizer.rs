//! Concatenation of a queue's finished scenes into one episode file.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::info;

use crate::config::AppConfig;
use crate::models::job::Job;
use crate::services::media::{MediaError, MediaInfo, MediaTool};

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeOutput {
    /// Path of the episode file, relative to the project root where possible.
    pub output: String,
    pub scene_count: usize,
}

/// Most frequent frame size among the clips; ties go to the one seen first.
pub fn canonical_resolution(sizes: &[(u32, u32)]) -> Option<(u32, u32)> {
    let mut counts: HashMap<(u32, u32), usize> = HashMap::new();
    for size in sizes {
        *counts.entry(*size).or_default() += 1;
    }
    let mut best: Option<((u32, u32), usize)> = None;
    for size in sizes {
        let count = counts[size];
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((*size, count));
        }
    }
    best.map(|(size, _)| size)
}

/// Body of an ffmpeg concat-demuxer list.
pub fn concat_list(clips: &[PathBuf]) -> String {
    clips
        .iter()
        .map(|clip| {
            let escaped = clip.to_string_lossy().replace('\'', r"'\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

/// Filter graph that letterboxes every clip to `size`, gives every clip a
/// stereo 44.1 kHz track (silence where it had none) and concatenates them.
pub fn normalize_filter_graph(infos: &[MediaInfo], size: (u32, u32)) -> String {
    let (w, h) = size;
    let mut parts = Vec::with_capacity(infos.len() * 2 + 1);
    let mut pairs = String::new();

    for (i, info) in infos.iter().enumerate() {
        parts.push(format!(
            "[{i}:v]scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black,setpts=PTS-STARTPTS[v{i}]"
        ));
        if info.has_audio {
            parts.push(format!(
                "[{i}:a]aresample=44100,aformat=channel_layouts=stereo,asetpts=PTS-STARTPTS[a{i}]"
            ));
        } else {
            parts.push(format!(
                "anullsrc=r=44100:cl=stereo,atrim=duration={:.3},asetpts=PTS-STARTPTS[a{i}]",
                info.duration_sec
            ));
        }
        pairs.push_str(&format!("[v{i}][a{i}]"));
    }
    parts.push(format!("{pairs}concat=n={}:v=1:a=1[v][a]", infos.len()));
    parts.join(";")
}

/// `<queue name>_<YYYY-MM-DD_HH-MM-SS>.mp4`, with anything but ASCII
/// alphanumerics, `-` and `_` replaced.
pub fn output_name(queue_name: &str, at: DateTime<Local>) -> String {
    let safe: String = queue_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}_{}.mp4", at.format("%Y-%m-%d_%H-%M-%S"))
}

pub struct Finalizer {
    media: MediaTool,
    config: AppConfig,
    timeout: Duration,
}

impl Finalizer {
    pub fn new(media: MediaTool, config: &AppConfig) -> Self {
        Self {
            media,
            config: config.clone(),
            timeout: config.finalize_timeout(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(MediaTool::from_config(config), config)
    }

    /// Concatenate `scenes` (the queue's `done` jobs, in index order).
    pub async fn finalize(&self, queue_name: &str, scenes: &[Job]) -> Result<FinalizeOutput, FinalizeError> {
        let clips: Vec<PathBuf> = scenes
            .iter()
            .filter_map(|j| j.output.as_deref())
            .map(|o| self.config.resolve(o))
            .collect();
        if clips.is_empty() {
            return Err(FinalizeError::NothingToFinalize);
        }

        // The concat demuxer reads list entries relative to the list file, so
        // every clip is made absolute up front.
        let mut missing = Vec::new();
        let mut absolute = Vec::with_capacity(clips.len());
        for clip in &clips {
            match tokio::fs::canonicalize(clip).await {
                Ok(path) => absolute.push(path),
                Err(_) => missing.push(clip.display().to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(FinalizeError::MissingArtifacts(missing.join(", ")));
        }
        let clips = absolute;

        let mut infos = Vec::with_capacity(clips.len());
        for clip in &clips {
            infos.push(self.media.probe(clip).await?);
        }

        let out_dir = self.config.finalized_dir();
        tokio::fs::create_dir_all(&out_dir).await?;
        let output = out_dir.join(output_name(queue_name, Local::now()));
        let partial = output.with_extension("partial.mp4");

        let copy = !infos.iter().any(|i| i.has_audio);
        let result = if copy {
            self.concat_copy(&clips, &output, &partial).await
        } else {
            self.concat_normalized(&clips, &infos, &partial).await
        };

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        if !tokio::fs::try_exists(&partial).await.unwrap_or(false) {
            return Err(FinalizeError::MissingOutput);
        }
        if let Err(e) = tokio::fs::rename(&partial, &output).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(FinalizeError::Io(e));
        }

        info!(
            queue = queue_name,
            scenes = clips.len(),
            stream_copy = copy,
            output = %output.display(),
            "Finalized queue"
        );
        Ok(FinalizeOutput {
            output: self.config.relative_to_root(&output).to_string_lossy().into_owned(),
            scene_count: clips.len(),
        })
    }

    async fn concat_copy(&self, clips: &[PathBuf], output: &Path, partial: &Path) -> Result<(), FinalizeError> {
        let list = output.with_extension("concat.txt");
        tokio::fs::write(&list, concat_list(clips)).await?;

        let args: Vec<OsString> = vec![
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list.clone().into(),
            "-c".into(),
            "copy".into(),
            partial.into(),
        ];
        let result = self.media.ffmpeg(args, self.timeout).await;
        let _ = tokio::fs::remove_file(&list).await;
        result.map_err(FinalizeError::from)
    }

    async fn concat_normalized(
        &self,
        clips: &[PathBuf],
        infos: &[MediaInfo],
        partial: &Path,
    ) -> Result<(), FinalizeError> {
        let sizes: Vec<(u32, u32)> = infos.iter().filter_map(MediaInfo::resolution).collect();
        let size = canonical_resolution(&sizes).ok_or(FinalizeError::UnknownResolution)?;

        let mut args: Vec<OsString> = vec!["-y".into()];
        for clip in clips {
            args.push("-i".into());
            args.push(clip.into());
        }
        args.push("-filter_complex".into());
        args.push(normalize_filter_graph(infos, size).into());
        args.extend(
            [
                "-map", "[v]", "-map", "[a]", "-c:v", "libx264", "-preset", "ultrafast", "-crf",
                "23", "-c:a", "aac", "-ar", "44100", "-ac", "2", "-b:a", "128k",
            ]
            .map(OsString::from),
        );
        args.push(partial.into());

        self.media.ffmpeg(args, self.timeout).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("No finished scenes to finalize")]
    NothingToFinalize,

    #[error("Missing scene file(s): {0}")]
    MissingArtifacts(String),

    #[error("Could not determine a frame size for the scenes")]
    UnknownResolution,

    #[error("ffmpeg produced no output")]
    MissingOutput,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("Finalize I/O error: {0}")]
    Io(#[from] std::io::Error),
}
