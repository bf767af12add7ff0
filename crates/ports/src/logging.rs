//! Log streaming ports.
//!
//! A step's stdout/stderr flows through a [`LogWriter`] chain (secret
//! replacer → live-log buffer) and is delivered to the remote sink via a
//! [`LogStreamClient`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A single log line as delivered to the remote sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    #[serde(default)]
    pub level: String,
    #[serde(rename = "pos")]
    pub number: i64,
    #[serde(rename = "out")]
    pub message: String,
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, String>,
}

/// Write side of the per-step log pipeline. Writers are shared across
/// tasks and internally synchronized; `write` never blocks on the remote
/// sink.
pub trait LogWriter: Send + Sync {
    /// Accepts a chunk of container output. Returns the number of bytes
    /// accepted, which is always the caller's byte count even when the
    /// written form differs (masking).
    fn write(&self, p: &[u8]) -> usize;
}

#[derive(Error, Debug)]
pub enum LogStreamError {
    #[error("log stream transport error: {0}")]
    Transport(String),

    #[error("log stream rejected: status {0}")]
    Status(u16),
}

impl LogStreamError {
    /// 4xx responses are permanent; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(code) => *code >= 500,
        }
    }
}

/// A per-step log stream: a writer that can be closed exactly once when
/// the step finishes, flushing whatever the implementation buffers.
#[async_trait]
pub trait StepStream: LogWriter {
    async fn close(&self);
}

/// Opens per-step streams. The execer asks for one stream per dispatched
/// step, keyed by the step number and name.
#[async_trait]
pub trait Streamer: Send + Sync {
    async fn stream(&self, step_number: i64, step_name: &str) -> Arc<dyn StepStream>;
}

/// Borrows the writer half of a step stream as a plain [`LogWriter`]
/// trait object.
pub struct StreamWriter(pub Arc<dyn StepStream>);

impl LogWriter for StreamWriter {
    fn write(&self, p: &[u8]) -> usize {
        self.0.write(p)
    }
}

/// Receives card artifacts emitted by steps.
#[async_trait]
pub trait CardUploader: Send + Sync {
    async fn upload_card(&self, step_name: &str, card: &[u8]);
}

/// Remote log sink. Keys are opaque stream identifiers assigned by the
/// coordinator.
#[async_trait]
pub trait LogStreamClient: Send + Sync {
    /// Opens the stream.
    async fn open(&self, key: &str) -> Result<(), LogStreamError>;

    /// Batch-appends lines to the stream.
    async fn batch(&self, key: &str, lines: &[Line]) -> Result<(), LogStreamError>;

    /// Uploads the full log history as a single blob.
    async fn upload(&self, key: &str, lines: &[Line]) -> Result<(), LogStreamError>;

    /// Closes the stream.
    async fn close(&self, key: &str) -> Result<(), LogStreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_wire_names() {
        let line = Line {
            level: "info".to_string(),
            number: 3,
            message: "hello\n".to_string(),
            timestamp: Utc::now(),
            args: HashMap::new(),
        };
        let value = serde_json::to_value(&line).unwrap();
        assert_eq!(value["pos"], 3);
        assert_eq!(value["out"], "hello\n");
        assert!(value.get("args").is_none());
        assert!(value.get("time").is_some());
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(LogStreamError::Status(500).is_retryable());
        assert!(LogStreamError::Status(503).is_retryable());
        assert!(!LogStreamError::Status(404).is_retryable());
        assert!(!LogStreamError::Status(400).is_retryable());
        assert!(LogStreamError::Transport("reset".to_string()).is_retryable());
    }
}
