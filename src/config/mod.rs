use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:7860").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root directory all relative asset and output paths are resolved against.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Directory the renderer writes its videos into.
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,

    /// Snapshot file holding every named queue.
    #[serde(default = "default_queues_file")]
    pub queues_file: PathBuf,

    /// Interpreter used to launch the renderer script.
    #[serde(default = "default_renderer_program")]
    pub renderer_program: PathBuf,

    /// Renderer entry point passed as the first argument.
    #[serde(default = "default_renderer_script")]
    pub renderer_script: PathBuf,

    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,

    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: PathBuf,

    /// Upper bound for a single scene mix.
    #[serde(default = "default_mix_timeout_secs")]
    pub mix_timeout_secs: u64,

    /// Upper bound for concatenating an episode.
    #[serde(default = "default_finalize_timeout_secs")]
    pub finalize_timeout_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Gain applied to background tracks (0.0 - 1.0).
    #[serde(default = "default_background_volume")]
    pub background_volume: f64,

    /// Fail a job at dispatch when one of its references cannot be resolved,
    /// instead of handing the literal token to the renderer.
    #[serde(default)]
    pub strict_references: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:7860".to_string()
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_result_dir() -> PathBuf {
    PathBuf::from("result")
}

fn default_queues_file() -> PathBuf {
    PathBuf::from("uploads/queues.json")
}

fn default_renderer_program() -> PathBuf {
    PathBuf::from(".venv/bin/python")
}

fn default_renderer_script() -> PathBuf {
    PathBuf::from("generate_video.py")
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_mix_timeout_secs() -> u64 {
    120
}

fn default_finalize_timeout_secs() -> u64 {
    600
}

fn default_probe_timeout_secs() -> u64 {
    15
}

fn default_background_volume() -> f64 {
    0.28
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Configuration rooted at `project_root` with every other key at its default.
    pub fn with_project_root(project_root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: default_bind_addr(),
            project_root: project_root.into(),
            result_dir: default_result_dir(),
            queues_file: default_queues_file(),
            renderer_program: default_renderer_program(),
            renderer_script: default_renderer_script(),
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
            mix_timeout_secs: default_mix_timeout_secs(),
            finalize_timeout_secs: default_finalize_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            background_volume: default_background_volume(),
            strict_references: false,
        }
    }

    /// Resolve a possibly relative path against the project root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    /// Resolve an executable: a bare name is left for `PATH` lookup, anything
    /// with a directory part is resolved like other paths.
    pub fn resolve_command(&self, program: impl AsRef<Path>) -> PathBuf {
        let program = program.as_ref();
        if program.components().count() > 1 {
            self.resolve(program)
        } else {
            program.to_path_buf()
        }
    }

    pub fn result_root(&self) -> PathBuf {
        self.resolve(&self.result_dir)
    }

    pub fn finalized_dir(&self) -> PathBuf {
        self.result_root().join("finalized")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.resolve(&self.queues_file)
    }

    pub fn mix_timeout(&self) -> Duration {
        Duration::from_secs(self.mix_timeout_secs)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Express `path` relative to the project root when it lives under it.
    pub fn relative_to_root(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.project_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
