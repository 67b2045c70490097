use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// One dispatched tool call: the action, its observation and the status code
/// returned to the controller. Appended as a JSONL row so a cancelled episode
/// still leaves a usable prefix on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRow {
    pub seq: u64,
    pub ts: String,
    pub action_kind: String,
    pub command: String,
    pub observation: String,
    pub status_code: u8,
    pub done: bool,
}

pub trait EventSink: Send {
    fn append(&mut self, row: &EventRow) -> Result<()>;
}

pub struct JsonlEventSink {
    writer: BufWriter<File>,
}

impl JsonlEventSink {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl EventSink for JsonlEventSink {
    fn append(&mut self, row: &EventRow) -> Result<()> {
        serde_json::to_writer(&mut self.writer, row)?;
        self.writer.write_all(b"\n")?;
        // Flushed per row: a deadline can cut the episode at any step.
        self.writer.flush()?;
        Ok(())
    }
}

/// Sink of last resort when the log directory cannot be opened.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn append(&mut self, _row: &EventRow) -> Result<()> {
        Ok(())
    }
}

/// Read back whatever event rows made it to disk. A torn trailing line
/// (interrupted append) is dropped rather than failing the whole read.
pub fn read_event_rows(path: &Path) -> Result<Vec<EventRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRow>(&line) {
            Ok(row) => rows.push(row),
            Err(err) => {
                tracing::warn!("skipping malformed event row: {:#}", err);
            }
        }
    }
    Ok(rows)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryEntry {
    pub step: u64,
    pub action: String,
    pub command: String,
    pub observation: String,
    pub done: bool,
}

/// Pure mapping from a (possibly partial) event log to a trajectory.
pub fn reconstruct_trajectory(events: &[EventRow]) -> Vec<TrajectoryEntry> {
    events
        .iter()
        .map(|row| TrajectoryEntry {
            step: row.seq,
            action: row.action_kind.clone(),
            command: row.command.clone(),
            observation: row.observation.clone(),
            done: row.done,
        })
        .collect()
}

/// Best-effort trajectory persistence: a no-op when the primary path already
/// produced the file. Returns whether this call wrote it.
pub fn write_trajectory_if_missing(trajectory_path: &Path, events_path: &Path) -> Result<bool> {
    if trajectory_path.exists() {
        return Ok(false);
    }
    let events = read_event_rows(events_path)?;
    let trajectory = reconstruct_trajectory(&events);
    pentest_core::atomic_write_json_pretty(trajectory_path, &trajectory)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("pentest_sink_{}_{}", label, nanos));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn row(seq: u64) -> EventRow {
        EventRow {
            seq,
            ts: "2026-08-05T00:00:00Z".to_string(),
            action_kind: "execute_command".to_string(),
            command: format!("nmap -p- host{}", seq),
            observation: "22/tcp open".to_string(),
            status_code: 0,
            done: false,
        }
    }

    #[test]
    fn appended_rows_round_trip() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("events.jsonl");
        {
            let mut sink = JsonlEventSink::new(&path).expect("sink");
            sink.append(&row(0)).expect("append");
            sink.append(&row(1)).expect("append");
        }
        let rows = read_event_rows(&path).expect("read rows");
        assert_eq!(rows, vec![row(0), row(1)]);
    }

    #[test]
    fn torn_trailing_line_is_dropped() {
        let dir = temp_dir("torn");
        let path = dir.join("events.jsonl");
        let mut raw = serde_json::to_string(&row(0)).expect("serialize");
        raw.push('\n');
        raw.push_str("{\"seq\": 1, \"ts\": \"2026-"); // write cut mid-record
        fs::write(&path, raw).expect("write");
        let rows = read_event_rows(&path).expect("read rows");
        assert_eq!(rows.len(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn reconstruction_writes_once_then_skips() {
        let dir = temp_dir("reconstruct");
        let events = dir.join("events.jsonl");
        let trajectory = dir.join("trajectory.json");
        {
            let mut sink = JsonlEventSink::new(&events).expect("sink");
            sink.append(&row(0)).expect("append");
        }
        assert!(write_trajectory_if_missing(&trajectory, &events).expect("first call"));
        let first = fs::read_to_string(&trajectory).expect("read trajectory");

        assert!(!write_trajectory_if_missing(&trajectory, &events).expect("second call"));
        let second = fs::read_to_string(&trajectory).expect("read trajectory again");
        assert_eq!(first, second, "second finalization must be a no-op");

        let entries: Vec<TrajectoryEntry> =
            serde_json::from_str(&first).expect("trajectory parses");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "execute_command");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_event_log_reconstructs_to_an_empty_trajectory() {
        let dir = temp_dir("empty");
        let trajectory = dir.join("trajectory.json");
        assert!(
            write_trajectory_if_missing(&trajectory, &dir.join("events.jsonl")).expect("write")
        );
        let entries: Vec<TrajectoryEntry> =
            serde_json::from_str(&fs::read_to_string(&trajectory).expect("read"))
                .expect("parse");
        assert!(entries.is_empty());
        let _ = fs::remove_dir_all(dir);
    }
}
