//! Scripted renderer and polling helpers for scheduler tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scene_render_queue::config::AppConfig;
use scene_render_queue::services::registry::QueueRegistry;
use scene_render_queue::services::renderer::{RenderError, RenderInvocation, RenderProgress, Renderer};
use scene_render_queue::services::scheduler::Scheduler;
use scene_render_queue::store::SnapshotStore;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::fixtures::FAILING_SEED;

/// In-process stand-in for the GPU renderer.
///
/// Writes a small file under the result root named after the task and seed,
/// fails for [`FAILING_SEED`], and records every invocation. When gated, each
/// render waits for a permit before finishing.
#[derive(Default)]
pub struct ScriptedRenderer {
    pub calls: Mutex<Vec<RenderInvocation>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    counter: AtomicUsize,
}

impl ScriptedRenderer {
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn arg_after(&self, call: usize, flag: &str) -> Option<String> {
        let calls = self.calls.lock().unwrap();
        let args = &calls.get(call)?.args;
        let at = args.iter().position(|a| a == flag)?;
        args.get(at + 1).cloned()
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn render(
        &self,
        invocation: &RenderInvocation,
        progress: &RenderProgress,
    ) -> Result<PathBuf, RenderError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(invocation.clone());

        progress.set_percent(50);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        } else {
            sleep(Duration::from_millis(20)).await;
        }

        let arg = |flag: &str| {
            let at = invocation.args.iter().position(|a| a == flag).unwrap();
            invocation.args[at + 1].clone()
        };
        let seed = arg("--seed");
        let task = arg("--task_type");

        let result = if seed == FAILING_SEED.to_string() {
            Err(RenderError::Exited {
                code: Some(1),
                tail: "CUDA out of memory".to_string(),
            })
        } else {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let dir = invocation.result_root.join(&task);
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join(format!("{seed}_{n}.mp4"));
            tokio::fs::write(&path, b"not really a video").await?;
            Ok(path)
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: AppConfig,
    pub renderer: Arc<ScriptedRenderer>,
    pub scheduler: Arc<Scheduler>,
}

pub fn harness(renderer: ScriptedRenderer) -> Harness {
    harness_with(renderer, |_| {})
}

pub fn harness_with(renderer: ScriptedRenderer, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = AppConfig::with_project_root(dir.path());
    tweak(&mut config);
    let renderer = Arc::new(renderer);
    let scheduler = Scheduler::start(
        config.clone(),
        QueueRegistry::default(),
        SnapshotStore::new(config.snapshot_path()),
        renderer.clone(),
    );
    Harness {
        dir,
        config,
        renderer,
        scheduler,
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}
