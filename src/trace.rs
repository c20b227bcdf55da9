//! Per-batch trace capture for prioritization runs.
//!
//! One JSON line per dispatched batch. Writes happen on a dedicated thread so a
//! slow disk never holds up the run; dropping every sink handle and joining the
//! [`TraceWorker`] flushes the file.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::store::ItemId;

#[derive(Debug, Clone, Serialize)]
pub struct BatchTrace {
    pub timestamp_ms: i64,
    pub run_id: String,
    pub group: String,
    pub batch_index: usize,
    pub item_ids: Vec<ItemId>,
    pub prompt_template_slug: String,
    pub system_prompt_hash: String,
    pub provider: String,
    pub model: String,
    /// Pairs the model returned; `None` when the call or parse failed.
    pub returned: Option<usize>,
    pub applied: usize,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: BatchTrace) -> Result<(), TraceError>;
}

#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<BatchTrace>,
}

pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    pub fn join(mut self) -> Result<(), TraceError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<BatchTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: BatchTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<BatchTrace>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Stable content hash for prompt text.
pub fn prompt_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_hash_is_stable_hex() {
        let a = prompt_hash("rubric");
        assert_eq!(a, prompt_hash("rubric"));
        assert_ne!(a, prompt_hash("rubric "));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn worker_joins_once_every_clone_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
        let other = sink.clone();
        other
            .record(BatchTrace {
                timestamp_ms: now_epoch_ms(),
                run_id: "r".into(),
                group: "Bio".into(),
                batch_index: 0,
                item_ids: vec![1, 2],
                prompt_template_slug: "s".into(),
                system_prompt_hash: prompt_hash("x"),
                provider: "openai".into(),
                model: "m".into(),
                returned: Some(2),
                applied: 2,
                error: None,
            })
            .unwrap();
        drop(sink);
        drop(other);
        worker.join().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 1);
        assert!(raw.contains("\"item_ids\":[1,2]"));
    }
}
