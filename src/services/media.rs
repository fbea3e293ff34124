use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use crate::config::AppConfig;

/// Number of stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 12;

/// Stream facts about a media file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration_sec: f64,
    pub has_audio: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl MediaInfo {
    pub fn resolution(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOut {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

/// Parse `ffprobe -print_format json -show_streams -show_format` output.
pub fn parse_probe(json: &[u8]) -> Result<MediaInfo, MediaError> {
    let parsed: ProbeOut = serde_json::from_slice(json).map_err(MediaError::Parse)?;
    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let duration_sec = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(MediaInfo {
        duration_sec,
        has_audio: parsed
            .streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("audio")),
        width: video.and_then(|s| s.width),
        height: video.and_then(|s| s.height),
    })
}

/// Wrapper around the `ffmpeg`/`ffprobe` command-line tools.
#[derive(Debug, Clone)]
pub struct MediaTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    probe_timeout: Duration,
}

impl MediaTool {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>, probe_timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            probe_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.ffmpeg_bin, &config.ffprobe_bin, config.probe_timeout())
    }

    /// Inspect duration, audio presence and frame size of `path`.
    pub async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path);
        let stdout = run(cmd, self.probe_timeout, "ffprobe").await?;
        parse_probe(&stdout)
    }

    /// Run ffmpeg with `args`, bounded by `timeout`.
    pub async fn ffmpeg(&self, args: Vec<OsString>, timeout: Duration) -> Result<(), MediaError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(args);
        run(cmd, timeout, "ffmpeg").await.map(|_| ())
    }

    /// Check the probe binary can be launched (for health checks).
    pub async fn health_check(&self) -> Result<(), MediaError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.arg("-version");
        run(cmd, self.probe_timeout, "ffprobe").await.map(|_| ())
    }
}

async fn run(mut cmd: Command, timeout: Duration, tool: &'static str) -> Result<Vec<u8>, MediaError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| MediaError::Spawn { tool, source: e })?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| MediaError::Spawn { tool, source: e })?,
        Err(_) => return Err(MediaError::Timeout { tool, timeout }),
    };

    if !output.status.success() {
        return Err(MediaError::Failed {
            tool,
            code: output.status.code(),
            stderr: tail_lines(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES),
        });
    }
    Ok(output.stdout)
}

/// Last `n` non-empty lines of a tool's output.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} timed out after {}s", .timeout.as_secs())]
    Timeout { tool: &'static str, timeout: Duration },

    #[error("{tool} exited with {code:?}: {stderr}")]
    Failed {
        tool: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to parse ffprobe output: {0}")]
    Parse(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_with_audio() {
        let json = br#"{
            "streams": [
                {"codec_type": "video", "width": 960, "height": 544},
                {"codec_type": "audio"}
            ],
            "format": {"duration": "5.042000"}
        }"#;
        let info = parse_probe(json).unwrap();
        assert!(info.has_audio);
        assert_eq!(info.resolution(), Some((960, 544)));
        assert!((info.duration_sec - 5.042).abs() < 1e-9);
    }

    #[test]
    fn test_parse_probe_silent_without_duration() {
        let json = br#"{"streams": [{"codec_type": "video", "width": 1280, "height": 720}], "format": {}}"#;
        let info = parse_probe(json).unwrap();
        assert!(!info.has_audio);
        assert_eq!(info.duration_sec, 0.0);
    }

    #[test]
    fn test_tail_lines() {
        let text = "a\n\nb\nc\nd\n";
        assert_eq!(tail_lines(text, 2), "c\nd");
        assert_eq!(tail_lines(text, 10), "a\nb\nc\nd");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let tool = MediaTool::new(
            "/nonexistent/ffmpeg",
            "/nonexistent/ffprobe",
            Duration::from_secs(1),
        );
        let err = tool.probe(Path::new("x.mp4")).await.unwrap_err();
        assert!(matches!(err, MediaError::Spawn { tool: "ffprobe", .. }));
    }
}
