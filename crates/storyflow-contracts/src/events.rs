use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for a run's `events.jsonl`.
///
/// Every line is one compact JSON object carrying `type`, `run_id`, a
/// per-writer `seq` and an RFC 3339 `ts`, followed by the caller payload.
/// Clones share the file lock and the sequence counter.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    seq: AtomicU64,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                seq: AtomicU64::new(0),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;

        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert(
            "seq".to_string(),
            Value::Number(self.inner.seq.fetch_add(1, Ordering::SeqCst).into()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            if matches!(key.as_str(), "type" | "run_id" | "seq") {
                continue;
            }
            event.insert(key, value);
        }

        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
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

    fn read_lines(path: &Path) -> anyhow::Result<Vec<Value>> {
        let content = fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for line in content.lines() {
            rows.push(serde_json::from_str(line)?);
        }
        Ok(rows)
    }

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        let mut payload = EventPayload::new();
        payload.insert("total".to_string(), Value::from(4));
        let emitted = writer.emit("run_started", payload)?;

        let rows = read_lines(&path)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], emitted);
        assert_eq!(rows[0]["type"], Value::from("run_started"));
        assert_eq!(rows[0]["run_id"], Value::from("run-123"));
        assert_eq!(rows[0]["seq"], Value::from(0));
        assert_eq!(rows[0]["total"], Value::from(4));

        let ts = rows[0]["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_cannot_override_identity_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-123");

        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), Value::from("override"));
        payload.insert("run_id".to_string(), Value::from("other-run"));
        payload.insert("seq".to_string(), Value::from(99));
        let emitted = writer.emit("instruction_started", payload)?;

        assert_eq!(emitted["type"], Value::from("instruction_started"));
        assert_eq!(emitted["run_id"], Value::from("run-123"));
        assert_eq!(emitted["seq"], Value::from(0));
        Ok(())
    }

    #[test]
    fn clones_share_sequence_and_append() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");
        let clone = writer.clone();

        writer.emit("one", EventPayload::new())?;
        clone.emit("two", EventPayload::new())?;
        writer.emit("three", EventPayload::new())?;

        let rows = read_lines(&path)?;
        let seqs: Vec<u64> = rows.iter().filter_map(|row| row["seq"].as_u64()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(rows[1]["type"], Value::from("two"));
        Ok(())
    }
}
