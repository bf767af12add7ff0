//! Card artifact extraction.
//!
//! Steps may emit a card, a small structured artifact rendered by the
//! coordinator UI, by writing a single marker line to stdout containing
//! the base64-encoded payload. The extractor sits outermost in the writer
//! chain, captures the payload and suppresses the marker line from the
//! visible log.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::{Arc, Mutex};

use hodei_runner_ports::{LogWriter, StepStream};

// OSC 1338 marker, terminated by BEL.
const CARD_PREFIX: &str = "\u{1b}]1338;";
const CARD_SUFFIX: char = '\u{7}';

pub struct CardExtractor {
    inner: Arc<dyn StepStream>,
    card: Mutex<Option<Vec<u8>>>,
}

impl CardExtractor {
    pub fn new(inner: Arc<dyn StepStream>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            card: Mutex::new(None),
        })
    }

    /// Returns the extracted card payload, if the step emitted one.
    pub fn file(&self) -> Option<Vec<u8>> {
        self.card.lock().unwrap().clone()
    }
}

impl LogWriter for CardExtractor {
    fn write(&self, p: &[u8]) -> usize {
        let text = String::from_utf8_lossy(p);
        if let Some(start) = text.find(CARD_PREFIX) {
            let payload = &text[start + CARD_PREFIX.len()..];
            let payload = match payload.find(CARD_SUFFIX) {
                Some(end) => &payload[..end],
                None => payload.trim_end(),
            };
            if let Ok(decoded) = STANDARD.decode(payload.trim().as_bytes()) {
                *self.card.lock().unwrap() = Some(decoded);
            }
            // forward everything before the marker only
            if start > 0 {
                self.inner.write(text[..start].as_bytes());
            }
            return p.len();
        }
        self.inner.write(p)
    }
}

#[async_trait]
impl StepStream for CardExtractor {
    async fn close(&self) {
        self.inner.close().await;
    }
}
