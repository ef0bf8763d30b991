use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Totals written to `session.json` when a chat session ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub turns_submitted: u64,
    pub turns_failed: u64,
    pub turns_rejected: u64,
    pub uploads_succeeded: u64,
    pub uploads_failed: u64,
    pub attachment_kind: Option<String>,
    pub terminated: bool,
}

pub fn write_summary(
    path: &Path,
    summary: &SessionSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
