//! Persistence sinks for run transitions and node execution records.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection};

use flowgraph_core::error::{FlowError, Result};
use flowgraph_core::traits::RunStore;
use flowgraph_core::types::{NodeExecutionRecord, RunState};

/// In-memory sink. Keeps every write in arrival order.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<Vec<RunState>>,
    records: Mutex<Vec<NodeExecutionRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run transition recorded for `run_id`.
    pub fn transitions(&self, run_id: &str) -> Vec<RunState> {
        lock(&self.runs)
            .iter()
            .filter(|s| s.run_id.0 == run_id)
            .cloned()
            .collect()
    }

    /// Every node record write for `run_id`, including intermediate states.
    pub fn records(&self, run_id: &str) -> Vec<NodeExecutionRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| r.run_id.0 == run_id)
            .cloned()
            .collect()
    }
}

impl RunStore for MemoryRunStore {
    fn record_run(&self, state: &RunState) -> BoxFuture<'_, Result<()>> {
        lock(&self.runs).push(state.clone());
        Box::pin(async { Ok(()) })
    }

    fn record_node(&self, record: &NodeExecutionRecord) -> BoxFuture<'_, Result<()>> {
        lock(&self.records).push(record.clone());
        Box::pin(async { Ok(()) })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append-only SQLite sink.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    /// Open or create the store database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| FlowError::Database(format!("Failed to open run store: {}", e)))?;
        Self::init(conn)
    }

    /// A private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| FlowError::Database(format!("Failed to open run store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS run_transitions (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 graph_id TEXT NOT NULL,
                 graph_version INTEGER NOT NULL,
                 status TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 recorded_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_rt_run
                 ON run_transitions(run_id, id);

             CREATE TABLE IF NOT EXISTS node_records (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 node_id TEXT NOT NULL,
                 parent TEXT,
                 iteration INTEGER,
                 status TEXT NOT NULL,
                 attempts INTEGER NOT NULL DEFAULT 0,
                 record_json TEXT NOT NULL,
                 recorded_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_nr_run
                 ON node_records(run_id, id);",
        )
        .map_err(|e| FlowError::Database(format!("Failed to initialize run store schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }

    fn insert_run(&self, state: &RunState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.conn()
            .execute(
                "INSERT INTO run_transitions (run_id, graph_id, graph_version, status, state_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    state.run_id.0,
                    state.graph_id,
                    state.graph_version as i64,
                    state.status.to_string(),
                    json,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| FlowError::Database(format!("Failed to record run transition: {}", e)))?;
        Ok(())
    }

    fn insert_node(&self, record: &NodeExecutionRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let status = serde_json::to_value(record.status)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.conn()
            .execute(
                "INSERT INTO node_records (run_id, node_id, parent, iteration, status, attempts, record_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.run_id.0,
                    record.node_id,
                    record.parent,
                    record.iteration.map(|i| i as i64),
                    status,
                    record.attempts as i64,
                    json,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| FlowError::Database(format!("Failed to record node: {}", e)))?;
        Ok(())
    }

    /// Every recorded transition of a run, oldest first.
    pub fn run_history(&self, run_id: &str) -> Result<Vec<RunState>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT state_json FROM run_transitions WHERE run_id = ?1 ORDER BY id")
            .map_err(|e| FlowError::Database(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .map_err(|e| FlowError::Database(format!("Failed to query transitions: {}", e)))?;

        let mut states = Vec::new();
        for row in rows {
            let json = row.map_err(|e| FlowError::Database(e.to_string()))?;
            states.push(serde_json::from_str(&json)?);
        }
        Ok(states)
    }

    /// The most recent state recorded for a run.
    pub fn latest_run(&self, run_id: &str) -> Result<Option<RunState>> {
        Ok(self.run_history(run_id)?.pop())
    }

    /// The latest record of each node instance of a run, in first-seen order.
    pub fn node_records(&self, run_id: &str) -> Result<Vec<NodeExecutionRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT record_json FROM node_records WHERE run_id = ?1 ORDER BY id")
            .map_err(|e| FlowError::Database(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .map_err(|e| FlowError::Database(format!("Failed to query node records: {}", e)))?;

        let mut records: Vec<NodeExecutionRecord> = Vec::new();
        for row in rows {
            let json = row.map_err(|e| FlowError::Database(e.to_string()))?;
            let record: NodeExecutionRecord = serde_json::from_str(&json)?;
            let existing = records.iter_mut().find(|r| {
                r.node_id == record.node_id && r.parent == record.parent && r.iteration == record.iteration
            });
            match existing {
                Some(slot) => *slot = record,
                None => records.push(record),
            }
        }
        Ok(records)
    }

    /// Ids of every run with at least one recorded transition.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT DISTINCT run_id FROM run_transitions ORDER BY run_id")
            .map_err(|e| FlowError::Database(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| FlowError::Database(format!("Failed to list runs: {}", e)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FlowError::Database(e.to_string()))
    }

    /// Delete everything recorded for a run. Returns the rows removed.
    pub fn delete_run(&self, run_id: &str) -> Result<usize> {
        let conn = self.conn();
        let transitions = conn
            .execute("DELETE FROM run_transitions WHERE run_id = ?1", params![run_id])
            .map_err(|e| FlowError::Database(format!("Failed to delete run: {}", e)))?;
        let nodes = conn
            .execute("DELETE FROM node_records WHERE run_id = ?1", params![run_id])
            .map_err(|e| FlowError::Database(format!("Failed to delete node records: {}", e)))?;
        Ok(transitions + nodes)
    }
}

impl RunStore for SqliteRunStore {
    fn record_run(&self, state: &RunState) -> BoxFuture<'_, Result<()>> {
        let result = self.insert_run(state);
        Box::pin(async move { result })
    }

    fn record_node(&self, record: &NodeExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let result = self.insert_node(record);
        Box::pin(async move { result })
    }
}
