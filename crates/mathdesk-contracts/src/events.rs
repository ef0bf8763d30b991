//! Session event log: one tagged JSON object per line in `events.jsonl`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Why a submitted turn produced no answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Service,
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session_dir: String,
        store: String,
        completion: String,
    },
    ModelSelected {
        model: String,
        provider: String,
        requested: Option<String>,
        fallback_reason: Option<String>,
    },
    ImageAttached {
        file_name: String,
        store: String,
        kind: String,
        reference: String,
        sha256: String,
    },
    UploadFailed {
        file_name: String,
        store: String,
        error: String,
    },
    TurnRejected {
        reason: String,
    },
    TurnSubmitted {
        sequence: u64,
        model: String,
        messages: usize,
        has_text: bool,
        has_image: bool,
    },
    AssistantMessage {
        sequence: u64,
        chars: usize,
    },
    TurnFailed {
        sequence: u64,
        class: FailureClass,
        error: String,
    },
    SessionTerminated {
        submission_sequence: u64,
    },
    SessionFinished {
        turns_submitted: u64,
        turns_failed: u64,
        summary_path: String,
    },
}

impl SessionEvent {
    /// The `type` tag written for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::ModelSelected { .. } => "model_selected",
            Self::ImageAttached { .. } => "image_attached",
            Self::UploadFailed { .. } => "upload_failed",
            Self::TurnRejected { .. } => "turn_rejected",
            Self::TurnSubmitted { .. } => "turn_submitted",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::TurnFailed { .. } => "turn_failed",
            Self::SessionTerminated { .. } => "session_terminated",
            Self::SessionFinished { .. } => "session_finished",
        }
    }
}

/// One line of the log: the event plus its envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: String,
    pub session_id: String,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Append-only `events.jsonl` for a single session. The file handle stays
/// open for the life of the session.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    session_id: String,
    file: Mutex<File>,
}

impl EventLog {
    pub fn create(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed opening {}", path.display()))?;
        Ok(Self {
            path,
            session_id: session_id.into(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn append(&self, event: SessionEvent) -> Result<EventRecord> {
        let record = EventRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            session_id: self.session_id.clone(),
            event,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        file.write_all(&line)
            .with_context(|| format!("failed appending to {}", self.path.display()))?;
        Ok(record)
    }
}

/// Reads a session log back, skipping blank lines.
pub fn read_events(path: &Path) -> Result<Vec<EventRecord>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: malformed event", path.display(), index + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::Value;

    use super::{read_events, EventLog, FailureClass, SessionEvent};

    #[test]
    fn append_writes_one_tagged_object_per_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::create(&path, "session-123")?;

        let record = log.append(SessionEvent::TurnFailed {
            sequence: 2,
            class: FailureClass::Service,
            error: "OpenAI request failed (500): boom".to_string(),
        })?;
        assert_eq!(record.session_id, "session-123");

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;
        assert_eq!(parsed["type"], "turn_failed");
        assert_eq!(parsed["session_id"], "session-123");
        assert_eq!(parsed["sequence"], 2);
        assert_eq!(parsed["class"], "service");
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn records_read_back_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");

        let first = EventLog::create(&path, "s-1")?.append(SessionEvent::TurnRejected {
            reason: "empty".to_string(),
        })?;
        let second = EventLog::create(&path, "s-1")?.append(SessionEvent::ModelSelected {
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            requested: None,
            fallback_reason: Some("No model specified; using default.".to_string()),
        })?;

        let records = read_events(&path)?;
        assert_eq!(records, vec![first, second]);
        assert_eq!(records[1].event.kind(), "model_selected");
        Ok(())
    }

    #[test]
    fn malformed_line_is_reported_with_its_number() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        fs::write(
            &path,
            "{\"ts\":\"t\",\"session_id\":\"s\",\"type\":\"turn_rejected\",\"reason\":\"empty\"}\n\n{\"type\":\"nope\"}\n",
        )?;
        let err = read_events(&path).unwrap_err();
        assert!(format!("{err}").ends_with(":3: malformed event"), "{err}");
        Ok(())
    }
}
