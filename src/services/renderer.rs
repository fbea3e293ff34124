//! Invocation of the external video renderer.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::AppConfig;
use crate::models::job::{Job, Resolution, TaskKind, TaskParams, MAX_REF_IMAGES};
use crate::services::media::tail_lines;

/// Lines of renderer output kept for status display and error reports.
const LOG_TAIL_LINES: usize = 40;

/// Renderer outputs may carry an mtime slightly older than the spawn time.
const MTIME_SLACK: Duration = Duration::from_secs(2);

/// Everything needed to launch one render.
#[derive(Debug, Clone)]
pub struct RenderInvocation {
    pub job_id: u64,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// Directory searched for the produced video.
    pub result_root: PathBuf,
    /// Written next to the video as a JSON sidecar.
    pub metadata: Value,
}

impl RenderInvocation {
    /// Build the renderer command line for a (resolved) job.
    pub fn for_job(job: &Job, config: &AppConfig) -> Self {
        let kind = job.kind();
        let settings = &job.settings;
        let resolution = effective_resolution(kind, settings.resolution);

        let mut args = vec![
            config.resolve(&config.renderer_script).to_string_lossy().into_owned(),
            "--task_type".to_string(),
            kind.to_string(),
            "--prompt".to_string(),
            settings.prompt.clone(),
            "--resolution".to_string(),
            resolution.to_string(),
            "--duration".to_string(),
            settings.duration.to_string(),
            "--seed".to_string(),
            settings.seed.to_string(),
        ];
        if settings.low_vram {
            args.push("--low_vram".to_string());
        } else if settings.offload {
            args.push("--offload".to_string());
        }

        let prompt = if settings.prompt.is_empty() {
            "(no prompt)"
        } else {
            settings.prompt.as_str()
        };
        let mut metadata = json!({
            "task_type": kind,
            "prompt": prompt,
            "resolution": resolution.to_string(),
            "seed": settings.seed,
            "offload": settings.low_vram || settings.offload,
            "low_vram": settings.low_vram,
        });

        match &job.task {
            TaskParams::ReferenceToVideo { ref_imgs } => {
                let refs: Vec<&str> = ref_imgs.iter().take(MAX_REF_IMAGES).map(String::as_str).collect();
                if !refs.is_empty() {
                    args.push("--ref_imgs".to_string());
                    args.push(refs.join(","));
                }
                metadata["ref_imgs"] = json!(refs);
                metadata["duration"] = json!(format!("{}s", settings.duration));
            }
            TaskParams::SingleShotExtension { input_video }
            | TaskParams::ShotSwitchingExtension { input_video } => {
                if let Some(video) = input_video {
                    args.push("--input_video".to_string());
                    args.push(video.as_str().to_string());
                }
                metadata["input_video"] = json!(input_video.as_ref().map(|v| v.as_str()).unwrap_or_default());
                metadata["duration"] = json!(format!("{}s", settings.duration));
            }
            TaskParams::TalkingAvatar { input_image } => {
                if let Some(image) = input_image {
                    args.push("--input_image".to_string());
                    args.push(image.as_str().to_string());
                }
                if let Some(audio) = &job.audio.input_audio {
                    args.push("--input_audio".to_string());
                    args.push(audio.as_str().to_string());
                }
                metadata["input_image"] = json!(input_image.as_ref().map(|v| v.as_str()).unwrap_or_default());
                metadata["input_audio"] =
                    json!(job.audio.input_audio.as_ref().map(|v| v.as_str()).unwrap_or_default());
                metadata["duration"] = json!("set by audio");
            }
        }

        let mut env = vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())];
        if settings.low_vram {
            env.push((
                "PYTORCH_CUDA_ALLOC_CONF".to_string(),
                "expandable_segments:True".to_string(),
            ));
        }

        Self {
            job_id: job.id,
            program: config.resolve_command(&config.renderer_program),
            args,
            env,
            cwd: config.project_root.clone(),
            result_root: config.result_root(),
            metadata,
        }
    }
}

/// Talking avatars render at 480P or 720P only; 540P falls back to 480P.
pub fn effective_resolution(kind: TaskKind, requested: Resolution) -> Resolution {
    match (kind, requested) {
        (TaskKind::TalkingAvatar, Resolution::P540) => Resolution::P480,
        (_, r) => r,
    }
}

/// Percentage from a tqdm progress line such as ` 25%|██▌  | 2/8 [00:10<00:30]`.
pub fn parse_progress(line: &str) -> Option<u8> {
    let (head, rest) = line.split_once('|')?;
    if !rest.contains('/') {
        return None;
    }
    let pct: u8 = head.trim().strip_suffix('%')?.trim().parse().ok()?;
    (pct <= 100).then_some(pct)
}

/// Live view of the render in flight.
#[derive(Debug, Default)]
pub struct RenderProgress {
    percent: AtomicU8,
    log: Mutex<VecDeque<String>>,
}

impl RenderProgress {
    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::Relaxed)
    }

    pub fn set_percent(&self, pct: u8) {
        self.percent.store(pct, Ordering::Relaxed);
    }

    pub fn push_line(&self, line: &str) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.len() == LOG_TAIL_LINES {
            log.pop_front();
        }
        log.push_back(line.to_string());
    }

    pub fn log_tail(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Something that turns a render invocation into a video file.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Run the render to completion and return the absolute path of the video.
    async fn render(
        &self,
        invocation: &RenderInvocation,
        progress: &RenderProgress,
    ) -> Result<PathBuf, RenderError>;
}

/// Runs the renderer as a child process. There is no timeout: a started
/// render always runs to completion or failure.
#[derive(Debug, Default, Clone)]
pub struct CommandRenderer;

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(
        &self,
        invocation: &RenderInvocation,
        progress: &RenderProgress,
    ) -> Result<PathBuf, RenderError> {
        let started = SystemTime::now();
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            job_id = invocation.job_id,
            program = %invocation.program.display(),
            "Launching renderer"
        );
        let mut child = cmd.spawn().map_err(RenderError::Spawn)?;

        let stdout = child.stdout.take().ok_or(RenderError::MissingPipe)?;
        let stderr = child.stderr.take().ok_or(RenderError::MissingPipe)?;
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let (mut out_open, mut err_open) = (true, true);

        loop {
            let line = tokio::select! {
                line = out_lines.next_line(), if out_open => match line {
                    Ok(Some(line)) => line,
                    _ => {
                        out_open = false;
                        continue;
                    }
                },
                line = err_lines.next_line(), if err_open => match line {
                    Ok(Some(line)) => line,
                    _ => {
                        err_open = false;
                        continue;
                    }
                },
                else => break,
            };

            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if let Some(pct) = parse_progress(line) {
                progress.set_percent(pct);
            }
            tracing::debug!(job_id = invocation.job_id, "{line}");
            progress.push_line(line);
        }

        let status = child.wait().await.map_err(RenderError::Spawn)?;
        if !status.success() {
            return Err(RenderError::Exited {
                code: status.code(),
                tail: tail_lines(&progress.log_tail().join("\n"), 12),
            });
        }

        let cutoff = started.checked_sub(MTIME_SLACK).unwrap_or(started);
        newest_video(&invocation.result_root, cutoff)
            .await?
            .ok_or_else(|| RenderError::NoArtifact(invocation.result_root.clone()))
    }
}

/// Most recently modified `.mp4` under `root` modified at or after `since`.
/// Finalized episodes and in-progress mix files are not render outputs.
pub async fn newest_video(root: &Path, since: SystemTime) -> Result<Option<PathBuf>, RenderError> {
    let mut best: Option<(SystemTime, PathBuf)> = None;
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(RenderError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                if path.file_name().is_some_and(|n| n != "finalized") {
                    dirs.push(path);
                }
                continue;
            }
            let is_video = path.extension().is_some_and(|e| e == "mp4");
            let is_temp = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with("_mixed_tmp.mp4"));
            if !is_video || is_temp {
                continue;
            }
            let modified = meta.modified()?;
            if modified < since {
                continue;
            }
            if best.as_ref().map_or(true, |(t, _)| modified > *t) {
                best = Some((modified, path));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// Write the render metadata next to `video` as `<stem>.json`.
pub async fn write_sidecar(video: &Path, metadata: &Value) -> Result<(), RenderError> {
    let mut metadata = metadata.clone();
    metadata["generated_at"] = json!(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
    let data = serde_json::to_vec_pretty(&metadata).map_err(|e| RenderError::Io(e.into()))?;
    tokio::fs::write(video.with_extension("json"), data).await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to launch renderer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Renderer output pipe unavailable")]
    MissingPipe,

    #[error("Renderer exited with {code:?}: {tail}")]
    Exited { code: Option<i32>, tail: String },

    #[error("Renderer finished but no video appeared under {}", .0.display())]
    NoArtifact(PathBuf),

    #[error("Unresolved reference(s): {}", .0.join(", "))]
    Unresolved(Vec<String>),

    #[error("Render I/O error: {0}")]
    Io(#[from] std::io::Error),
}
