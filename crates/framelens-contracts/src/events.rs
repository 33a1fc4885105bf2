use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// The event kinds an analysis run emits, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    AnalysisStarted,
    FramesSampled,
    AnalysisCompleted,
    AnalysisFailed,
    ExportWritten,
    ChatTurn,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::AnalysisStarted => "analysis_started",
            Self::FramesSampled => "frames_sampled",
            Self::AnalysisCompleted => "analysis_completed",
            Self::AnalysisFailed => "analysis_failed",
            Self::ExportWritten => "export_written",
            Self::ChatTurn => "chat_turn",
        }
    }
}

/// Append-only `events.jsonl` writer for one analysis run.
///
/// One compact JSON object per line. Every line carries `event`, `run`, and
/// `at` (RFC 3339); the caller payload is merged last and may override them.
/// The file handle is opened once in append mode and shared across clones.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    run_id: String,
    sink: Arc<Mutex<File>>,
}

impl EventLog {
    /// Opens (creating parent directories as needed) the log at `path`.
    pub fn create(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating event log directory for {}", path.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self {
            path,
            run_id: run_id.into(),
            sink: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Appends one event line and returns the record as written.
    pub fn log(&self, kind: EventKind, payload: EventPayload) -> Result<Value> {
        let mut record = Map::with_capacity(payload.len() + 3);
        record.insert("event".to_string(), Value::String(kind.name().to_string()));
        record.insert("run".to_string(), Value::String(self.run_id.clone()));
        record.insert(
            "at".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        record.extend(payload);

        let record = Value::Object(record);
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        // serde_json's Display renders a Value compactly, one object per line
        writeln!(sink, "{record}")
            .with_context(|| format!("appending to {}", self.path.display()))?;
        Ok(record)
    }
}
