use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

/// What a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Script,
    SceneImage,
}

/// One audited provider exchange: raw input, raw output, the system prompt
/// used (script records only) and any error detail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub kind: AuditKind,
    pub timestamp: DateTime<Utc>,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn script(
        input: &str,
        output: Option<&str>,
        system_prompt: &str,
        error: Option<String>,
    ) -> Self {
        Self {
            kind: AuditKind::Script,
            timestamp: Utc::now(),
            input: input.to_owned(),
            output: output.map(str::to_owned),
            system_prompt: Some(system_prompt.to_owned()),
            error,
        }
    }

    pub fn scene_image(prompt: &str, error: Option<String>) -> Self {
        Self {
            kind: AuditKind::SceneImage,
            timestamp: Utc::now(),
            input: prompt.to_owned(),
            output: None,
            system_prompt: None,
            error,
        }
    }
}

/// Best-effort audit sink. Recording must never block or fail the main flow;
/// implementations swallow their own errors.
pub trait AuditLog: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
}

impl JsonlAuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl AuditLog for JsonlAuditLog {
    fn record(&self, record: AuditRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(error) => {
                warn!(error = %error, "failed to serialize audit record");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(error) = result {
            warn!(path = %self.path.display(), error = %error, "failed to write audit record");
        }
    }
}

/// Discards every record. Used when no audit path is configured.
#[derive(Debug, Default)]
pub struct NullAuditLog;

impl AuditLog for NullAuditLog {
    fn record(&self, _record: AuditRecord) {}
}

/// Collects records in memory. Intended for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("audit lock poisoned").clone()
    }
}

impl AuditLog for MemoryAuditLog {
    fn record(&self, record: AuditRecord) {
        self.records.lock().expect("audit lock poisoned").push(record);
    }
}
