//! Scene fixtures shared by the integration tests.

use scene_render_queue::models::requests::NewJob;
use serde_json::{json, Value};

/// A reference-driven scene with the given seed.
pub fn reference_scene(seed: u64) -> NewJob {
    scene(json!({
        "task_type": "reference_to_video",
        "prompt": format!("establishing shot {seed}"),
        "ref_imgs": ["uploads/lumi.png"],
        "seed": seed
    }))
}

/// A same-shot extension continuing from `input_video`.
pub fn extension_scene(seed: u64, input_video: &str) -> NewJob {
    scene(json!({
        "task_type": "single_shot_extension",
        "prompt": "the camera keeps rolling",
        "input_video": input_video,
        "seed": seed
    }))
}

pub fn scene(value: Value) -> NewJob {
    serde_json::from_value(value).expect("fixture scene should deserialize")
}

/// Seed that makes the scripted renderer fail.
pub const FAILING_SEED: u64 = 666;
