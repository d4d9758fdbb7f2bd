//! Fixed pauses after actions that usually kick off asynchronous rendering.

use std::time::Duration;

use crate::types::{ActionStep, normalize_label};
use crate::verifier::ExpectedEvidence;

#[derive(Debug, Clone)]
pub struct WaitScheduler {
    pause: Duration,
    keywords: Vec<Vec<String>>,
}

impl WaitScheduler {
    pub fn new(pause: Duration, keywords: &[String]) -> Self {
        Self {
            pause,
            keywords: keywords
                .iter()
                .map(|k| normalize_label(k).split(' ').map(str::to_string).collect())
                .filter(|words: &Vec<String>| !words.is_empty() && !words[0].is_empty())
                .collect(),
        }
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Submit, login, save, send-Enter and dialog-closing actions.
    pub fn is_processing_likely(&self, step: &ActionStep, expect: &ExpectedEvidence) -> bool {
        if mentions_modal_close(expect) {
            return true;
        }
        match step {
            ActionStep::SendKeys { keys, .. } => keys
                .split('+')
                .any(|k| k.eq_ignore_ascii_case("enter") || k.eq_ignore_ascii_case("return")),
            ActionStep::Click { target } => target
                .label()
                .is_some_and(|label| self.matches_keyword(label)),
            _ => false,
        }
    }

    /// Pause to honour before the next snapshot is trusted. Deterministic: either zero or the
    /// configured interval, never a poll.
    pub fn pause_after(&self, step: &ActionStep, expect: &ExpectedEvidence) -> Duration {
        if self.is_processing_likely(step, expect) {
            self.pause
        } else {
            Duration::ZERO
        }
    }

    fn matches_keyword(&self, label: &str) -> bool {
        let words: Vec<String> = normalize_label(label)
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        self.keywords
            .iter()
            .any(|kw| words.windows(kw.len()).any(|w| w == kw.as_slice()))
    }
}

fn mentions_modal_close(expect: &ExpectedEvidence) -> bool {
    match expect {
        ExpectedEvidence::ModalClosed { .. } => true,
        ExpectedEvidence::AnyOf { options } => options.iter().any(mentions_modal_close),
        _ => false,
    }
}
