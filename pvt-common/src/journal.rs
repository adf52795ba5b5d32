//! Machine-readable run journal.
//!
//! One JSON line per lifecycle transition and per rendezvous cycle, so a
//! deadlock or mismatch can be reconstructed after the fact.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::HarnessResult;

/// Stable schema version for journal events.
pub const JOURNAL_SCHEMA_VERSION: &str = "1.0.0";

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Bind,
    Launch,
    Handshake,
    Scenario,
    Poll,
    Teardown,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Bind => "bind",
            Self::Launch => "launch",
            Self::Handshake => "handshake",
            Self::Scenario => "scenario",
            Self::Poll => "poll",
            Self::Teardown => "teardown",
        };
        write!(f, "{phase}")
    }
}

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub schema_version: String,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub run_id: String,
    pub phase: RunPhase,
    pub step: String,
    pub decision_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Append-only event log for one run. Events are always kept in memory and
/// additionally streamed to a JSONL file when created with a directory.
pub struct RunJournal {
    run_id: String,
    start_time: Instant,
    events: Mutex<Vec<JournalEvent>>,
    writer: Mutex<Option<BufWriter<File>>>,
    path: Option<PathBuf>,
}

impl RunJournal {
    /// In-memory journal.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            start_time: Instant::now(),
            events: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
            path: None,
        }
    }

    /// Journal that also writes `<dir>/journal_<run_id>.jsonl`.
    pub fn create(dir: &Path, run_id: impl Into<String>) -> HarnessResult<Self> {
        let mut journal = Self::new(run_id);
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("journal_{}.jsonl", journal.run_id));
        let file = File::create(&path)?;
        info!(path = %path.display(), "Writing run journal");
        journal.writer = Mutex::new(Some(BufWriter::new(file)));
        journal.path = Some(path);
        Ok(journal)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an event.
    pub fn record(
        &self,
        phase: RunPhase,
        step: impl Into<String>,
        decision_code: impl Into<String>,
        payload: Option<&str>,
    ) -> JournalEvent {
        let event = JournalEvent {
            schema_version: JOURNAL_SCHEMA_VERSION.to_string(),
            timestamp: Utc::now(),
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
            run_id: self.run_id.clone(),
            phase,
            step: step.into(),
            decision_code: decision_code.into(),
            payload: payload.map(str::to_string),
        };

        if let Ok(mut writer_guard) = self.writer.lock()
            && let Some(ref mut writer) = *writer_guard
        {
            match serde_json::to_string(&event) {
                Ok(serialized) => {
                    let _ = writeln!(writer, "{serialized}");
                    let _ = writer.flush();
                }
                Err(e) => warn!(error = %e, "Failed to serialize journal event"),
            }
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        event
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<JournalEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl fmt::Debug for RunJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunJournal")
            .field("run_id", &self.run_id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
