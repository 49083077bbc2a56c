//! Build, push and pull progress parsing.
//!
//! The Engine streams newline-delimited JSON, but a single read can carry
//! several objects, so each chunk is split on newlines before parsing.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressChunk {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "errorDetail")]
    pub error_detail: Option<Value>,
}

impl ProgressChunk {
    fn unparsable(raw: &str) -> Self {
        Self {
            stream: Some(format!("Cannot parse {raw}")),
            ..Default::default()
        }
    }

    /// `errorDetail` rendered as JSON, or `null`.
    pub fn error_detail_json(&self) -> String {
        self.error_detail
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "null".to_string())
    }
}

/// Parse one raw output chunk into progress entries.
///
/// If any line fails to parse, the whole chunk is reported as a single
/// `Cannot parse ...` stream line.
pub fn parse_chunk(raw: &str) -> Vec<ProgressChunk> {
    let trimmed = raw.trim();
    let parsed: Result<Vec<ProgressChunk>, _> = trimmed
        .split('\n')
        .map(serde_json::from_str::<ProgressChunk>)
        .collect();
    match parsed {
        Ok(chunks) => chunks,
        Err(_) => vec![ProgressChunk::unparsable(trimmed)],
    }
}
