//! Dispatch-time resolution of forward references between scenes of a queue.

use tracing::{debug, warn};

use crate::models::job::{Job, JobStatus};
use crate::models::reference::AssetRef;

/// A job whose reference fields have been rewritten to concrete paths.
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub job: Job,
    /// Tokens that could not be resolved and were left as written.
    pub unresolved: Vec<String>,
}

/// Resolve a single reference against the live job list of its queue.
///
/// Returns `None` when the token points at a scene that is missing, not yet
/// `done`, or has no output.
pub fn resolve_ref(reference: &AssetRef, index: u32, siblings: &[Job]) -> Option<String> {
    let target = match reference {
        AssetRef::Literal(path) => return Some(path.clone()),
        AssetRef::Prev { .. } => {
            let prev = index.checked_sub(1)?;
            siblings.iter().find(|j| j.index == prev)
        }
        AssetRef::Index { index: target, .. } => {
            let target = (*target)?;
            siblings.iter().find(|j| j.index == target)
        }
        AssetRef::LegacySeed { seed, .. } => siblings
            .iter()
            .find(|j| j.settings.seed == *seed && rendered_output(j).is_some()),
    }?;
    rendered_output(target).map(str::to_string)
}

fn rendered_output(job: &Job) -> Option<&str> {
    if job.status != JobStatus::Done {
        return None;
    }
    job.output.as_deref().filter(|o| !o.is_empty())
}

/// Produce the effective job to hand to the renderer.
///
/// Fields whose token cannot be resolved keep the literal token and are
/// reported in `unresolved`; resolution never fails the job by itself.
pub fn resolve_job(job: &Job, siblings: &[Job]) -> ResolvedJob {
    let mut effective = job.clone();
    let mut unresolved = Vec::new();

    let mut apply = |field: &'static str, slot: &mut Option<AssetRef>| {
        let Some(reference) = slot.as_ref() else {
            return;
        };
        if !reference.is_token() {
            return;
        }
        match resolve_ref(reference, job.index, siblings) {
            Some(path) => {
                debug!(job_id = job.id, field, token = %reference, resolved = %path, "Resolved reference");
                *slot = Some(AssetRef::Literal(path));
            }
            None => {
                warn!(job_id = job.id, index = job.index, field, token = %reference, "Reference could not be resolved");
                unresolved.push(reference.to_string());
            }
        }
    };

    if let Some(slot) = effective.task.input_video_mut() {
        apply("input_video", slot);
    }
    if let Some(slot) = effective.task.input_image_mut() {
        apply("input_image", slot);
    }
    apply("input_audio", &mut effective.audio.input_audio);

    ResolvedJob {
        job: effective,
        unresolved,
    }
}
