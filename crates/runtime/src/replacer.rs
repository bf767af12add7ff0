//! Secret masking writer.
//!
//! Wraps a log writer and masks any occurrence of masked secret values
//! before they reach the buffer. Multi-line secrets register every
//! non-trivial line as an independent needle so re-ordered fragments can
//! never leak; empty and single-character lines are intentionally not
//! masked.

use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use std::sync::Arc;

use hodei_runner_core::Secret;
use hodei_runner_ports::{LogWriter, StepStream};

const MASK: &str = "******";

struct Replacer {
    inner: Arc<dyn StepStream>,
    automaton: AhoCorasick,
}

/// Wraps the writer with a masking filter built from the step's secret
/// list. When no masked secrets exist, the writer passes through
/// unchanged.
pub fn mask_writer(inner: Arc<dyn StepStream>, secrets: &[Secret]) -> Arc<dyn StepStream> {
    let mut needles = Vec::new();
    for secret in secrets {
        if !secret.mask || secret.data.is_empty() {
            continue;
        }
        for part in secret.value().lines() {
            let part = part.trim();
            // avoid masking empty or single character strings.
            if part.len() < 2 {
                continue;
            }
            needles.push(part.to_string());
        }
    }
    if needles.is_empty() {
        return inner;
    }
    match AhoCorasick::new(&needles) {
        Ok(automaton) => Arc::new(Replacer { inner, automaton }),
        Err(_) => inner,
    }
}

impl LogWriter for Replacer {
    fn write(&self, p: &[u8]) -> usize {
        let text = String::from_utf8_lossy(p);
        let replacements = vec![MASK; self.automaton.patterns_len()];
        let masked = self.automaton.replace_all(&text, &replacements);
        self.inner.write(masked.as_bytes());
        // report the caller's original byte count even when the written
        // size differs due to masking.
        p.len()
    }
}

#[async_trait]
impl StepStream for Replacer {
    async fn close(&self) {
        self.inner.close().await;
    }
}
