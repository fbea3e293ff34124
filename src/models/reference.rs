use serde::{Deserialize, Serialize};
use std::fmt;

const PREV_TOKEN: &str = "{{prev}}";
const JOB_TOKEN_PREFIX: &str = "{{job:";
const TOKEN_SUFFIX: &str = "}}";
const LEGACY_ROOT: &str = "result/";
const LEGACY_PLACEHOLDER: &str = "_<timestamp>.mp4";

/// An asset path field that may point at the output of a sibling job.
///
/// Parsed once when the job is built or loaded; serialized back to the exact
/// string the author wrote, so snapshots keep the token syntax intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AssetRef {
    /// A plain path, used as-is.
    Literal(String),
    /// `{{prev}}`: output of the job at `index - 1` in the same queue.
    Prev { raw: String },
    /// `{{job:N}}`: output of the job whose index is `N`. `None` when `N` is
    /// out of range; such a token never resolves.
    Index { index: Option<u32>, raw: String },
    /// `result/<task>/<seed>_<timestamp>.mp4`: output of the job rendered with `seed`.
    LegacySeed { seed: u64, raw: String },
}

impl AssetRef {
    pub fn parse(value: &str) -> Self {
        let raw = value.to_string();
        if value.eq_ignore_ascii_case(PREV_TOKEN) {
            return AssetRef::Prev { raw };
        }
        if let Some(index) = parse_job_token(value) {
            return AssetRef::Index { index, raw };
        }
        if let Some(seed) = find_legacy_seed(value) {
            return AssetRef::LegacySeed { seed, raw };
        }
        AssetRef::Literal(raw)
    }

    /// The text as authored.
    pub fn as_str(&self) -> &str {
        match self {
            AssetRef::Literal(raw)
            | AssetRef::Prev { raw }
            | AssetRef::Index { raw, .. }
            | AssetRef::LegacySeed { raw, .. } => raw,
        }
    }

    pub fn is_token(&self) -> bool {
        !matches!(self, AssetRef::Literal(_))
    }
}

impl From<String> for AssetRef {
    fn from(value: String) -> Self {
        AssetRef::parse(&value)
    }
}

impl From<&str> for AssetRef {
    fn from(value: &str) -> Self {
        AssetRef::parse(value)
    }
}

impl From<AssetRef> for String {
    fn from(value: AssetRef) -> Self {
        match value {
            AssetRef::Literal(raw)
            | AssetRef::Prev { raw }
            | AssetRef::Index { raw, .. }
            | AssetRef::LegacySeed { raw, .. } => raw,
        }
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{{job:N}}`, case-insensitive on the keyword, whole value only.
fn parse_job_token(value: &str) -> Option<Option<u32>> {
    let prefix = value.get(..JOB_TOKEN_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(JOB_TOKEN_PREFIX) {
        return None;
    }
    let digits = value[JOB_TOKEN_PREFIX.len()..].strip_suffix(TOKEN_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = digits.parse().ok();
    if index.is_none() {
        tracing::warn!(token = value, "Scene index in reference is out of range");
    }
    Some(index)
}

/// Search `value` for `result/<task>/<digits>_<timestamp>.mp4` and return the digits.
fn find_legacy_seed(value: &str) -> Option<u64> {
    let lower = value.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find(LEGACY_ROOT) {
        let start = from + pos + LEGACY_ROOT.len();
        if let Some(seed) = legacy_tail(&lower[start..]) {
            return Some(seed);
        }
        from = start;
    }
    None
}

fn legacy_tail(rest: &str) -> Option<u64> {
    let slash = rest.find('/')?;
    if slash == 0 {
        return None;
    }
    let after = &rest[slash + 1..];
    let digits_len = after.bytes().take_while(u8::is_ascii_digit).count();
    if digits_len == 0 || !after[digits_len..].starts_with(LEGACY_PLACEHOLDER) {
        return None;
    }
    after[..digits_len].parse().ok()
}
