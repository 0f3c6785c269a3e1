use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::Provider;
use crate::modes::WorkMode;

/// Everything a session reports to its `events.jsonl`. The variant name
/// becomes the record's `type` field; variant payloads become the record's
/// remaining fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        keystore: String,
    },
    ImageLoaded,
    KeysAdded {
        provider: Provider,
        added: usize,
        failed: usize,
    },
    GenerationStarted {
        mode: WorkMode,
        provider: Provider,
        model: String,
        masked: bool,
    },
    GenerationFailed {
        provider: Provider,
        error: String,
    },
    ArtifactStaged {
        artifact_id: String,
    },
    KeyEvicted {
        provider: Provider,
    },
    ResultCommitted,
}

/// Append-only session log: one compact JSON object per line, each stamped
/// with the session id and an RFC3339 timestamp alongside the event fields.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event: &SessionEvent) -> Result<Value> {
        let mut record = serde_json::to_value(event)?
            .as_object()
            .cloned()
            .context("session event did not serialize to an object")?;
        record.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        record.insert("ts".to_string(), Value::String(now_utc_iso()));

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&record)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(record))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emitted_record_carries_type_session_and_event_fields() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "session-42");

        let emitted = log.emit(&SessionEvent::GenerationStarted {
            mode: WorkMode::Portrait,
            provider: Provider::Gemini,
            model: "gemini-2.5-flash-image".to_string(),
            masked: false,
        })?;

        let content = fs::read_to_string(&path)?;
        let parsed: Value = serde_json::from_str(content.lines().next().unwrap_or(""))?;
        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], "generation_started");
        assert_eq!(parsed["session_id"], "session-42");
        assert_eq!(parsed["mode"], "portrait");
        assert_eq!(parsed["provider"], "gemini");
        assert_eq!(parsed["masked"], false);

        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn unit_variants_emit_bare_type_records() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "session-42");

        let emitted = log.emit(&SessionEvent::ResultCommitted)?;
        assert_eq!(emitted["type"], "result_committed");
        assert!(emitted.get("provider").is_none());
        Ok(())
    }

    #[test]
    fn log_appends_one_line_per_event_in_order() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "session-42");

        log.emit(&SessionEvent::ImageLoaded)?;
        log.emit(&SessionEvent::KeyEvicted {
            provider: Provider::OpenAi,
        })?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["type"], "image_loaded");
        assert_eq!(second["type"], "key_evicted");
        assert_eq!(second["provider"], "openai");
        Ok(())
    }
}
