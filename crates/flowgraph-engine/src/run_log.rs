use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowgraph_core::types::{EventType, RunEvent, RunId};

/// JSONL run logger.
///
/// Consumes run events from the bus and writes one JSON object per line to
/// `{log_dir}/{run_id}/{timestamp}.jsonl`. A run's file is opened on its
/// first logged event and closed on its terminal event; stragglers that
/// follow a `run-stopped` are appended to the same file. Append-only, so a
/// crash leaves every previously written line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    sequence: u64,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run lifecycle, 2 = + node lifecycle,
    /// 3 = + streamed output chunks.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger as a background task until cancelled or the bus closes.
    ///
    /// Takes a receiver rather than the bus so callers can subscribe before
    /// starting the runs they want logged.
    pub async fn run(self, mut rx: broadcast::Receiver<RunEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut logs = RunLogs::default();
        loop {
            // Queued events are drained before cancellation is observed.
            tokio::select! {
                biased;
                result = rx.recv() => match result {
                    Ok(event) => self.write(&mut logs, &event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        for (_, mut writer) in logs.open.drain() {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn write(&self, logs: &mut RunLogs, event: &RunEvent) {
        let Some(entry) = self.event_to_entry(event) else {
            return;
        };
        let json = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize log entry");
                return;
            }
        };

        if !logs.open.contains_key(&event.run_id) {
            let path = match logs.paths.get(&event.run_id) {
                Some(path) => path.clone(),
                None => match new_run_log(&self.log_dir, &event.run_id).await {
                    Some(path) => path,
                    None => return,
                },
            };
            let Some(writer) = open_run_log(&path).await else {
                return;
            };
            logs.paths.insert(event.run_id.clone(), path);
            logs.open.insert(event.run_id.clone(), writer);
        }
        let Some(writer) = logs.open.get_mut(&event.run_id) else {
            return;
        };

        let line = format!("{}\n", json);
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(run_id = %event.run_id, error = %e, "Failed to write log entry");
            return;
        }
        // Flush after each entry for crash resilience
        if let Err(e) = writer.flush().await {
            error!(run_id = %event.run_id, error = %e, "Failed to flush log");
        }

        if event.event_type.is_run_terminal() {
            logs.open.remove(&event.run_id);
        }
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let min_level = match event.event_type {
            EventType::RunStarted
            | EventType::RunPaused
            | EventType::RunResumed
            | EventType::RunSucceeded
            | EventType::RunFailed
            | EventType::RunStopped => 1,
            EventType::NodeStarted
            | EventType::NodeRetrying
            | EventType::NodeSucceeded
            | EventType::NodeFailed
            | EventType::NodeSkipped => 2,
            EventType::NodeOutputChunk => 3,
        };
        if self.level < min_level {
            return None;
        }

        let detail = match event.event_type {
            EventType::NodeOutputChunk => Some(serde_json::json!({
                "chunk": truncate_json(&event.payload["chunk"], 500),
                "index": event.payload["index"],
            })),
            _ if is_empty_payload(&event.payload) => None,
            _ => Some(event.payload.clone()),
        };

        Some(LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            run_id: event.run_id.to_string(),
            sequence: event.sequence,
            event_type: event.event_type.to_string(),
            node_id: event.node_id.clone(),
            detail,
        })
    }
}

/// Log files by run. `paths` outlives `open` so a closed run's file is
/// reused rather than a second one started.
#[derive(Default)]
struct RunLogs {
    open: HashMap<RunId, BufWriter<File>>,
    paths: HashMap<RunId, PathBuf>,
}

async fn new_run_log(log_dir: &Path, run_id: &RunId) -> Option<PathBuf> {
    let run_dir = log_dir.join(&run_id.0);
    if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
        error!(run_id = %run_id, error = %e, "Failed to create run log directory");
        return None;
    }
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    Some(run_dir.join(format!("{}.jsonl", timestamp)))
}

async fn open_run_log(log_path: &Path) -> Option<BufWriter<File>> {
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await
    {
        Ok(file) => {
            debug!(path = %log_path.display(), "Run log opened");
            Some(BufWriter::new(file))
        }
        Err(e) => {
            error!(error = %e, path = %log_path.display(), "Failed to open log file");
            None
        }
    }
}

fn is_empty_payload(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: EventType, node_id: Option<&str>, payload: serde_json::Value) -> RunEvent {
        RunEvent {
            run_id: RunId::from_str("run-1"),
            node_id: node_id.map(String::from),
            event_type,
            payload,
            timestamp: Utc::now(),
            sequence: 1,
        }
    }

    #[test]
    fn test_jsonl_entry_format() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(&event(EventType::RunStarted, None, json!({})))
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"run-started\""));
        assert!(json.contains("run-1"));
        // None fields are skipped
        assert!(!json.contains("node_id"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let started = event(EventType::NodeStarted, Some("a"), json!({"node_type": "start"}));
        let chunk = event(EventType::NodeOutputChunk, Some("a"), json!({"index": 0, "chunk": "hi"}));
        let done = event(EventType::RunSucceeded, None, json!({"outputs": {}}));

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&done).is_some());
        assert!(l1.event_to_entry(&started).is_none());
        assert!(l1.event_to_entry(&chunk).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = l2.event_to_entry(&started).unwrap();
        assert_eq!(entry.node_id.as_deref(), Some("a"));
        assert_eq!(entry.detail, Some(json!({"node_type": "start"})));
        assert!(l2.event_to_entry(&chunk).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        let entry = l3.event_to_entry(&chunk).unwrap();
        assert_eq!(entry.detail, Some(json!({"chunk": "\"hi\"", "index": 0})));
    }

    #[test]
    fn test_truncate_json() {
        let value = json!({"key": "a very long string that should be truncated"});
        let result = truncate_json(&value, 20);
        assert!(result.len() <= 23);
        assert!(result.ends_with("..."));
        assert_eq!(truncate_json(&json!("ok"), 20), "\"ok\"");
    }

    #[tokio::test]
    async fn test_writes_one_file_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let task = tokio::spawn(logger.run(rx, cancel.clone()));

        tx.send(event(EventType::RunStarted, None, json!({}))).unwrap();
        tx.send(event(EventType::NodeStarted, Some("start"), json!({}))).unwrap();
        tx.send(event(EventType::RunSucceeded, None, json!({"outputs": {}}))).unwrap();
        drop(tx);
        task.await.unwrap();

        let run_dir = dir.path().join("run-1");
        let mut files = std::fs::read_dir(&run_dir).unwrap();
        let path = files.next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("run-succeeded"));
    }

    #[tokio::test]
    async fn test_events_after_stop_append_to_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = broadcast::channel(16);
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let task = tokio::spawn(logger.run(rx, CancellationToken::new()));

        tx.send(event(EventType::RunStarted, None, json!({}))).unwrap();
        tx.send(event(EventType::NodeStarted, Some("slow"), json!({}))).unwrap();
        tx.send(event(EventType::RunStopped, None, json!({"reason": "cancelled"}))).unwrap();
        tx.send(event(EventType::NodeSucceeded, Some("slow"), json!({}))).unwrap();
        drop(tx);
        task.await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("run-1"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("run-stopped"));
        assert!(lines[3].contains("node-succeeded"));
    }
}
