//! Markdown scene lists.
//!
//! ```text
//! ## Scene 1
//! - task_type: reference_to_video
//! - prompt: two friends on a pier at dawn
//! - ref_imgs: uploads/a.png, uploads/b.png
//! - duration: 8
//!
//! ## Scene 2
//! - task_type: single_shot_extension
//! - input_video: {{prev}}
//! ```
//!
//! A heading starts a new scene; `- key: value` bullets set its fields.
//! Blocks without a `task_type` are ignored.
//!
//! A document starting with `[` or `{` is read as a JSON array of scenes (or a
//! single scene) with the same field names.

use garde::Validate;
use serde_json::{Map, Value};

use crate::models::requests::NewJob;

/// Parse a scene list, JSON or Markdown, into jobs in document order.
pub fn parse_scene_list(text: &str) -> Result<Vec<NewJob>, ImportError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        parse_json_queue(trimmed)
    } else {
        parse_markdown_queue(text)
    }
}

/// Parse a JSON array of scenes, or a single scene object.
pub fn parse_json_queue(text: &str) -> Result<Vec<NewJob>, ImportError> {
    let items = match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => return Err(ImportError::Empty),
    };
    let blocks: Vec<Map<String, Value>> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(block) if block.contains_key("task_type") => Some(block),
            _ => None,
        })
        .collect();
    build_jobs(blocks)
}

/// Parse a Markdown scene list into jobs, in document order.
pub fn parse_markdown_queue(text: &str) -> Result<Vec<NewJob>, ImportError> {
    let mut blocks: Vec<Map<String, Value>> = Vec::new();
    let mut current = Map::new();

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            flush(&mut blocks, &mut current);
        } else if let Some(item) = line.strip_prefix("- ") {
            if let Some((key, value)) = item.split_once(':') {
                let key = key.trim();
                current.insert(key.to_string(), coerce(key, value.trim()));
            }
        }
    }
    flush(&mut blocks, &mut current);
    build_jobs(blocks)
}

fn build_jobs(blocks: Vec<Map<String, Value>>) -> Result<Vec<NewJob>, ImportError> {
    if blocks.is_empty() {
        return Err(ImportError::Empty);
    }

    blocks
        .into_iter()
        .enumerate()
        .map(|(i, block)| {
            let scene = i + 1;
            let job: NewJob = serde_json::from_value(Value::Object(block))
                .map_err(|e| ImportError::Scene { scene, reason: e.to_string() })?;
            job.validate()
                .map_err(|e| ImportError::Scene { scene, reason: e.to_string() })?;
            Ok(job)
        })
        .collect()
}

fn flush(blocks: &mut Vec<Map<String, Value>>, current: &mut Map<String, Value>) {
    let block = std::mem::take(current);
    if block.contains_key("task_type") {
        blocks.push(block);
    }
}

fn coerce(key: &str, value: &str) -> Value {
    match key {
        "duration" | "seed" => value
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(value)),
        "ref_imgs" => Value::Array(
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Value::from)
                .collect(),
        ),
        "offload" | "low_vram" => Value::Bool(matches!(
            value.to_ascii_lowercase().as_str(),
            "true" | "yes" | "1" | "sim"
        )),
        _ => Value::from(value),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("No scenes with a task_type were found")]
    Empty,

    #[error("Scene {scene}: {reason}")]
    Scene { scene: usize, reason: String },

    #[error("Invalid JSON scene list: {0}")]
    Json(#[from] serde_json::Error),
}
