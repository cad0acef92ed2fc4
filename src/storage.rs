use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::journal::{JournalEntry, PersistenceSink};
use crate::ledger::LedgerSnapshot;

/// SQLite-backed persistence sink.
pub struct HiveStore {
    conn: Mutex<Connection>,
}

impl HiveStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS guardian_snapshots (
                ts TEXT NOT NULL,
                seq INTEGER NOT NULL,
                equity REAL NOT NULL,
                drawdown REAL NOT NULL,
                margin_level REAL NOT NULL,
                open_positions INTEGER NOT NULL,
                largest_cluster INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS reflections (
                ts TEXT NOT NULL,
                seq INTEGER NOT NULL,
                breaches INTEGER NOT NULL,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ledger_checkpoints (
                ts TEXT NOT NULL,
                cycle INTEGER NOT NULL,
                state_hash TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS archive (
                ts TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                body TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn latest_checkpoint(&self) -> Result<Option<(u64, String, LedgerSnapshot)>> {
        let conn = self.conn.lock();
        let row: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT cycle, state_hash, body FROM ledger_checkpoints ORDER BY rowid DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        match row {
            Some((cycle, hash, body)) => Ok(Some((cycle as u64, hash, serde_json::from_str(&body)?))),
            None => Ok(None),
        }
    }

    pub fn count(&self, table: StoreTable) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let n: i64 = self.conn.lock().query_row(&sql, [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTable {
    GuardianSnapshots,
    Reflections,
    LedgerCheckpoints,
    Archive,
}

impl StoreTable {
    fn name(&self) -> &'static str {
        match self {
            StoreTable::GuardianSnapshots => "guardian_snapshots",
            StoreTable::Reflections => "reflections",
            StoreTable::LedgerCheckpoints => "ledger_checkpoints",
            StoreTable::Archive => "archive",
        }
    }
}

impl PersistenceSink for HiveStore {
    fn append(&self, entry: &JournalEntry) -> Result<()> {
        let ts = entry.ts().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        match entry {
            JournalEntry::GuardianSnapshot { snapshot: s, .. } => {
                tx.execute(
                    "INSERT INTO guardian_snapshots (ts, seq, equity, drawdown, margin_level, open_positions, largest_cluster)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        ts,
                        s.seq as i64,
                        s.equity,
                        s.drawdown,
                        s.margin_level,
                        s.open_position_count as i64,
                        s.largest_cluster as i64
                    ],
                )?;
            }
            JournalEntry::Reflection { reflection, .. } => {
                tx.execute(
                    "INSERT INTO reflections (ts, seq, breaches, body) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        ts,
                        reflection.seq as i64,
                        reflection.breaches.len() as i64,
                        serde_json::to_string(reflection)?
                    ],
                )?;
            }
            JournalEntry::LedgerCheckpoint {
                cycle, state_hash, ledger, ..
            } => {
                tx.execute(
                    "INSERT INTO ledger_checkpoints (ts, cycle, state_hash, body) VALUES (?1, ?2, ?3, ?4)",
                    params![ts, *cycle as i64, state_hash, serde_json::to_string(ledger)?],
                )?;
            }
            JournalEntry::Archived { agent, .. } => {
                tx.execute(
                    "INSERT INTO archive (ts, agent_id, reason, body) VALUES (?1, ?2, ?3, ?4)",
                    params![ts, agent.summary.id, agent.reason, serde_json::to_string(agent)?],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::fingerprint::Context;
    use crate::guardian::{GuardianSnapshot, RiskState};
    use crate::ledger::Ledger;
    use chrono::Utc;

    #[test]
    fn test_checkpoint_roundtrip() {
        let store = HiveStore::in_memory().unwrap();
        store.init().unwrap();

        let mut ledger = Ledger::new(&LedgerConfig::default());
        ledger.record("agent-1", &Context::empty(), true);
        store
            .append(&JournalEntry::LedgerCheckpoint {
                ts: Utc::now(),
                cycle: 5,
                state_hash: ledger.state_hash(),
                ledger: ledger.snapshot(),
            })
            .unwrap();

        let (cycle, hash, snapshot) = store.latest_checkpoint().unwrap().unwrap();
        assert_eq!(cycle, 5);
        assert_eq!(Ledger::restore(&LedgerConfig::default(), snapshot).state_hash(), hash);
    }

    #[test]
    fn test_snapshots_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.sqlite");
        let store = HiveStore::new(path.to_str().unwrap()).unwrap();
        store.init().unwrap();
        for seq in 1..=3 {
            let snapshot = GuardianSnapshot::from_state(seq, &RiskState::default());
            store
                .append(&JournalEntry::GuardianSnapshot { ts: snapshot.time, snapshot })
                .unwrap();
        }
        assert_eq!(store.count(StoreTable::GuardianSnapshots).unwrap(), 3);
        assert!(store.latest_checkpoint().unwrap().is_none());
    }
}
