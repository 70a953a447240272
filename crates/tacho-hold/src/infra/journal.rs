//! Session journal.
//!
//! Append-only JSONL record of each session: start parameters, phase
//! transitions and how the session ended, including the final report.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    /// Session parameters, written before the hardware is touched
    SessionStart,
    /// Controller moved to a new phase
    PhaseTransition,
    /// Phase sequence ran to the end
    SessionCompleted,
    /// Stop requested (Ctrl-C or run limit) before the sequence finished
    SessionCancelled,
    /// Fatal fault; teardown still ran
    SessionFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: JournalEventType,
    pub details: serde_json::Value,
}

/// Thread-safe journal writer.
pub struct SessionJournal {
    writer: Mutex<BufWriter<File>>,
}

impl SessionJournal {
    /// Open `path` in append mode, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: &JournalEntry) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event_type: JournalEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(&JournalEntry {
            timestamp_us,
            unix_us,
            event_type,
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn journal_appends_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("session.jsonl");

        let journal = SessionJournal::new(&path).unwrap();
        journal
            .log_event(
                1_000,
                1_704_067_200_000_000,
                JournalEventType::SessionStart,
                serde_json::json!({"target_hz": 50.0}),
            )
            .unwrap();
        journal
            .log_event(
                2_000,
                1_704_067_201_000_000,
                JournalEventType::PhaseTransition,
                serde_json::json!({"from": "idle", "to": "calibrating"}),
            )
            .unwrap();
        drop(journal);

        // Reopening appends rather than truncating.
        SessionJournal::new(&path)
            .unwrap()
            .log_event(3_000, 0, JournalEventType::SessionCancelled, serde_json::Value::Null)
            .unwrap();

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 3);

        let first: JournalEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, JournalEventType::SessionStart);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event_type"], "phase_transition");
        assert_eq!(second["details"]["to"], "calibrating");
        let third: JournalEntry = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(third.timestamp_us, 3_000);
    }
}
