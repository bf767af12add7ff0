//! Live log writer.
//!
//! Collects step output and streams it to the remote sink in near real
//! time. Three invariants hold: line numbers are monotonic per step,
//! in-memory history is bounded by a byte cap with oldest-first eviction,
//! and remote delivery is batched by a background flusher that runs at
//! most once per interval. The writer never blocks the step's output
//! pipe; if the history overflows, streaming is suspended while the local
//! history keeps only the newest lines for the final upload.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::debug;

use hodei_runner_core::CancelToken;
use hodei_runner_ports::{Line, LogStreamClient, LogWriter, StepStream};

/// Default maximum log history size in bytes (5 MiB).
const DEFAULT_LIMIT: usize = 5_242_880;

/// Default flush interval.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Buffers {
    pending: Vec<Line>,
    history: Vec<Line>,
    size: usize,
    num: i64,
    stopped: bool,
}

/// Writer that uploads the live log stream to the remote sink.
pub struct LiveLogWriter {
    client: Arc<dyn LogStreamClient>,
    key: String,
    limit: usize,
    interval: Duration,
    buffers: Mutex<Buffers>,
    ready: Notify,
    stop: CancelToken,
}

impl LiveLogWriter {
    /// Opens the remote stream and starts the background flusher. Open
    /// failures are logged and the writer continues; log streams are
    /// ephemeral and never block the pipeline.
    pub async fn open(client: Arc<dyn LogStreamClient>, key: impl Into<String>) -> Arc<Self> {
        Self::open_with(client, key, DEFAULT_LIMIT, DEFAULT_INTERVAL).await
    }

    pub async fn open_with(
        client: Arc<dyn LogStreamClient>,
        key: impl Into<String>,
        limit: usize,
        interval: Duration,
    ) -> Arc<Self> {
        let key = key.into();
        if let Err(err) = client.open(&key).await {
            debug!(key = %key, error = %err, "cannot open log stream");
        }
        let writer = Arc::new(Self {
            client,
            key,
            limit,
            interval,
            buffers: Mutex::new(Buffers::default()),
            ready: Notify::new(),
            stop: CancelToken::new(),
        });
        writer.spawn_flusher();
        writer
    }

    fn spawn_flusher(self: &Arc<Self>) {
        let writer = Arc::clone(self);
        let interval = writer.interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer.stop.cancelled() => return,
                    _ = writer.ready.notified() => {}
                }
                tokio::select! {
                    _ = writer.stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        // errors are intentionally ignored; the final
                        // upload carries the authoritative history.
                        writer.flush().await;
                    }
                }
            }
        });
    }

    /// Batch-uploads all buffered lines to the sink.
    async fn flush(&self) {
        let lines = {
            let mut buffers = self.buffers.lock().unwrap();
            std::mem::take(&mut buffers.pending)
        };
        if lines.is_empty() {
            return;
        }
        if let Err(err) = self.client.batch(&self.key, &lines).await {
            debug!(key = %self.key, error = %err, "cannot batch log lines");
        }
    }

    // stops streaming; returns true on the first call.
    fn stop_streaming(&self) -> bool {
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.stopped {
            return false;
        }
        buffers.stopped = true;
        self.stop.cancel();
        true
    }

    /// Current history snapshot.
    pub fn history(&self) -> Vec<Line> {
        self.buffers.lock().unwrap().history.clone()
    }
}

impl LogWriter for LiveLogWriter {
    fn write(&self, p: &[u8]) -> usize {
        let now = Utc::now();
        let payload = p.len();
        let mut overflowed = false;
        {
            let mut buffers = self.buffers.lock().unwrap();
            for part in split(p) {
                let line = Line {
                    level: String::new(),
                    number: buffers.num,
                    message: part.to_string(),
                    timestamp: now,
                    args: Default::default(),
                };

                // the history buffer is the back-stop: when a write
                // would exceed the cap, evict the oldest lines and stop
                // streaming to the remote sink.
                while buffers.size + payload > self.limit && !buffers.history.is_empty() {
                    overflowed = true;
                    let evicted = buffers.history.remove(0);
                    buffers.size -= evicted.message.len();
                }
                if buffers.size + payload > self.limit {
                    overflowed = true;
                }

                buffers.size += line.message.len();
                buffers.num += 1;

                if overflowed && !buffers.stopped {
                    buffers.stopped = true;
                    self.stop.cancel();
                }
                if !buffers.stopped {
                    buffers.pending.push(line.clone());
                }
                buffers.history.push(line);
            }
        }
        self.ready.notify_one();
        payload
    }
}

#[async_trait]
impl StepStream for LiveLogWriter {
    /// Closes the writer: stops the flusher, sends the final batch,
    /// uploads the full history as a single blob and closes the stream.
    async fn close(&self) {
        if self.stop_streaming() {
            self.flush().await;
        }
        let history = self.history();
        if let Err(err) = self.client.upload(&self.key, &history).await {
            debug!(key = %self.key, error = %err, "cannot upload log history");
        }
        if let Err(err) = self.client.close(&self.key).await {
            debug!(key = %self.key, error = %err, "cannot close log stream");
        }
    }
}

// splits a payload into lines, preserving the trailing line feed the
// container runtime appends. output may arrive with multiple lines
// combined into a single block.
fn split(p: &[u8]) -> Vec<&str> {
    let s = std::str::from_utf8(p).unwrap_or_default();
    let trimmed = s.strip_suffix('\n').unwrap_or(s);
    if !trimmed.contains('\n') {
        return vec![s];
    }
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(pos) = rest.find('\n') {
        out.push(&rest[..=pos]);
        rest = &rest[pos + 1..];
    }
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}
