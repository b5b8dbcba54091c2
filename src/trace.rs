//! JSONL trace of every item coding in a run.
//!
//! Events go over a channel to a dedicated writer thread so dispatch never
//! blocks on file I/O.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::codebook::Category;
use crate::extract::ExtractionOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct CodingTrace {
    pub timestamp_ms: i64,
    pub run_id: Uuid,
    /// "reliability" or "batch".
    pub run_kind: &'static str,
    pub item_index: usize,
    pub item_hash: String,
    pub protocol_version: u32,
    pub protocol_hash: String,
    pub template_slug: String,
    pub model: String,
    pub cache_key_hash: Option<String>,
    pub raw_response: Option<String>,
    pub category: Category,
    pub found: Option<Category>,
    pub outcome: Option<ExtractionOutcome>,
    pub cached: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: CodingTrace) -> Result<(), TraceError>;
}

#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<CodingTrace>,
}

/// Handle to the writer thread. Drop every sink clone, then `join` to flush.
pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<usize, TraceError>>>,
}

impl TraceWorker {
    /// Wait for the writer to drain; returns the number of events written.
    pub fn join(mut self) -> Result<usize, TraceError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| TraceError::Join("trace worker panicked".to_string()))?,
            None => Ok(0),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<CodingTrace>();
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
    fn record(&self, event: CodingTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<CodingTrace>,
) -> Result<usize, TraceError> {
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    for event in receiver {
        serde_json::to_writer(&mut writer, &event)?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
