//! Per-conversation intent tracking.
//!
//! One tracker per conversation, exclusively owning that conversation's
//! history of `(prompt, risk_score)` turns. The judge provider is stateless;
//! escalation context travels in the rendered history string.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::IntentConfig;
use crate::providers::JudgeProvider;

#[derive(Debug, Clone)]
pub struct IntentVerdict {
    pub allowed: bool,
    pub risk_score: u8,
    pub reason: String,
}

pub struct IntentTracker {
    history: Vec<(String, u8)>,
    judge: Arc<dyn JudgeProvider>,
    cfg: IntentConfig,
}

impl IntentTracker {
    pub fn new(judge: Arc<dyn JudgeProvider>, cfg: IntentConfig) -> Self {
        Self { history: Vec::new(), judge, cfg }
    }

    /// Score the prompt in conversation context and decide pass / ambiguous /
    /// block.
    ///
    /// Blocked prompts are never appended to history, so rejected content
    /// cannot bias future scoring. Judge failure fails open with score 0 and
    /// no append.
    pub async fn analyze(&mut self, prompt: &str) -> IntentVerdict {
        let context = self.render_context();

        let judgement = match self.judge.judge(&context, prompt).await {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "judge provider failed, failing open");
                return IntentVerdict {
                    allowed: true,
                    risk_score: 0,
                    reason: "Inference Error (Fail Open)".into(),
                };
            }
        };

        let risk_score = judgement.risk_score.min(100);
        debug!(risk_score, turns = self.history.len(), "intent analyzed");

        if risk_score > self.cfg.block_threshold {
            return IntentVerdict {
                allowed: false,
                risk_score,
                reason: format!("BLOCK: {}", judgement.reason),
            };
        }

        self.history.push((prompt.to_string(), risk_score));

        if risk_score >= self.cfg.ambiguous_threshold {
            IntentVerdict {
                allowed: true,
                risk_score,
                reason: format!("AMBIGUOUS: {}", judgement.reason),
            }
        } else {
            IntentVerdict { allowed: true, risk_score, reason: "PASS".into() }
        }
    }

    /// Render history as `[risk=N] <prompt>` lines, oldest first, so any
    /// stateless judge can observe escalation.
    fn render_context(&self) -> String {
        let mut out = String::new();
        for (prompt, risk) in &self.history {
            out.push_str(&format!("[risk={risk}] {prompt}\n"));
        }
        out
    }

    /// Forget the conversation. The antibody store is unaffected.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
#[path = "intent_tests.rs"]
mod tests;
