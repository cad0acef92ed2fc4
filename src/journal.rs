use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::guardian::{GuardianSnapshot, Reflection};
use crate::ledger::LedgerSnapshot;
use crate::logging;
use crate::population::ArchivedAgent;

/// Append-only record writer. Keyed by the timestamp each entry carries.
pub trait PersistenceSink: Send + Sync {
    fn append(&self, entry: &JournalEntry) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record")]
pub enum JournalEntry {
    #[serde(rename = "guardian_snapshot")]
    GuardianSnapshot { ts: DateTime<Utc>, snapshot: GuardianSnapshot },
    #[serde(rename = "reflection")]
    Reflection { ts: DateTime<Utc>, reflection: Reflection },
    #[serde(rename = "ledger_checkpoint")]
    LedgerCheckpoint {
        ts: DateTime<Utc>,
        cycle: u64,
        state_hash: String,
        ledger: LedgerSnapshot,
    },
    #[serde(rename = "archived")]
    Archived { ts: DateTime<Utc>, agent: ArchivedAgent },
}

impl JournalEntry {
    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            JournalEntry::GuardianSnapshot { ts, .. }
            | JournalEntry::Reflection { ts, .. }
            | JournalEntry::LedgerCheckpoint { ts, .. }
            | JournalEntry::Archived { ts, .. } => *ts,
        }
    }
}

/// What a journal replay yields.
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    /// Most recent ledger checkpoint and the cycle it was taken at.
    pub last_checkpoint: Option<(u64, String, LedgerSnapshot)>,
    pub snapshots: Vec<GuardianSnapshot>,
    pub reflections: Vec<Reflection>,
    pub archived: Vec<ArchivedAgent>,
    pub skipped_lines: usize,
}

/// JSON-lines journal on disk.
#[derive(Debug)]
pub struct Journal {
    file: Mutex<File>,
    path: String,
}

impl Journal {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn replay(path: &str) -> Result<Vec<String>> {
        if !Path::new(path).exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(reader.lines().map_while(|l| l.ok()).collect())
    }

    /// Parse every line; unreadable lines are counted and skipped.
    pub fn recover(path: &str) -> Result<Recovery> {
        let mut state = Recovery::default();
        for line in Self::replay(path)? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(JournalEntry::LedgerCheckpoint {
                    cycle, state_hash, ledger, ..
                }) => state.last_checkpoint = Some((cycle, state_hash, ledger)),
                Ok(JournalEntry::GuardianSnapshot { snapshot, .. }) => state.snapshots.push(snapshot),
                Ok(JournalEntry::Reflection { reflection, .. }) => state.reflections.push(reflection),
                Ok(JournalEntry::Archived { agent, .. }) => state.archived.push(agent),
                Err(err) => {
                    logging::log_transient(logging::Domain::Audit, "journal_line", &err.to_string());
                    state.skipped_lines += 1;
                }
            }
        }
        Ok(state)
    }
}

impl PersistenceSink for Journal {
    fn append(&self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }
}

/// Writes every record to each inner sink. A failing sink does not stop
/// the others; the first error is returned once all have been tried.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn PersistenceSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn PersistenceSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl PersistenceSink for FanoutSink {
    fn append(&self, entry: &JournalEntry) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.append(entry) {
                logging::log_transient(logging::Domain::Audit, "fanout_append", &err.to_string());
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
