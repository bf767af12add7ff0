//! Step stream implementations for the binary.

use std::io::Write as _;
use std::sync::Arc;

use async_trait::async_trait;

use hodei_runner_ports::{LogWriter, StepStream, Streamer};

/// Streams step output to the local console, prefixed with the step
/// name. Used by the exec subcommand.
pub struct ConsoleStreamer;

struct ConsoleStream {
    prefix: String,
}

impl LogWriter for ConsoleStream {
    fn write(&self, p: &[u8]) -> usize {
        let text = String::from_utf8_lossy(p);
        let mut stdout = std::io::stdout().lock();
        for line in text.split_inclusive('\n') {
            let _ = write!(stdout, "[{}] {}", self.prefix, line);
        }
        if !text.ends_with('\n') {
            let _ = writeln!(stdout);
        }
        let _ = stdout.flush();
        p.len()
    }
}

#[async_trait]
impl StepStream for ConsoleStream {
    async fn close(&self) {}
}

#[async_trait]
impl Streamer for ConsoleStreamer {
    async fn stream(&self, _number: i64, name: &str) -> Arc<dyn StepStream> {
        Arc::new(ConsoleStream {
            prefix: name.to_string(),
        })
    }
}
