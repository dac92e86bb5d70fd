//! Per-request decision pipeline: membrane first, intent second, then the
//! downstream model. Blocks feed the hardening loop; clean passes can teach
//! the membrane a new safe anchor. One pipeline instance serves all
//! conversations; per-conversation state lives in the caller's tracker.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::hardening::HardeningLoop;
use crate::intent::{IntentTracker, IntentVerdict};
use crate::membrane::{AntibodyKind, Membrane};
use crate::providers::{ChunkStream, Forwarder};

const REJECT_L1: &str = "Request Rejected. Security Violation";
const REJECT_L2: &str = "Request Rejected. Unsafe Context Detected";
const CLARIFY_MSG: &str =
    "Clarification Required: Please explain the educational context.";
const GENERIC_ERROR_MSG: &str =
    "A system error occurred while generating the response.";

/// Request lifecycle states. `PipelineResult.stage` records the terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    CheckL1,
    CheckL2,
    LearnSafe,
    Forward,
    BlockedL1,
    BlockedL2,
    Ambiguous,
    Success,
    Error,
}

/// One record per request, immutable once returned. Latency covers request
/// entry to terminal transition; background work and streaming are excluded.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub stage: Stage,
    pub l1_similarity: f32,
    pub l2_score: u8,
    pub block_reason: String,
    pub latency_ms: f64,
    pub skipped_l2: bool,
}

/// What the caller sends back to the user: a terminal message, or the live
/// downstream stream on success.
pub enum Outcome {
    Message(String),
    Stream(ChunkStream),
}

pub struct PipelineOutput {
    pub result: PipelineResult,
    pub outcome: Outcome,
}

pub struct Pipeline {
    membrane: Arc<Membrane>,
    hardening: HardeningLoop,
    forwarder: Arc<dyn Forwarder>,
    cfg: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        membrane: Arc<Membrane>,
        hardening: HardeningLoop,
        forwarder: Arc<dyn Forwarder>,
        cfg: PipelineConfig,
    ) -> Self {
        Self { membrane, hardening, forwarder, cfg }
    }

    /// Run one prompt through the full pipeline. The tracker is the calling
    /// conversation's; turns within a conversation serialize on it.
    pub async fn process(
        &self,
        tracker: &mut IntentTracker,
        prompt: &str,
    ) -> PipelineOutput {
        let start = Instant::now();
        let mut stage = Stage::Init;
        debug!(?stage, prompt_len = prompt.len(), "request entered pipeline");

        stage = Stage::CheckL1;
        let l1 = self.membrane.check(prompt).await;
        debug!(?stage, similarity = l1.similarity, safe = l1.is_safe, "membrane verdict");

        if !l1.is_safe {
            // Exactly one hardening submission per block, from here only.
            self.hardening.submit(prompt, &l1.reason);
            return PipelineOutput {
                result: PipelineResult {
                    stage: Stage::BlockedL1,
                    l1_similarity: l1.similarity,
                    l2_score: 0,
                    block_reason: l1.reason.clone(),
                    latency_ms: elapsed_ms(start),
                    skipped_l2: false,
                },
                outcome: Outcome::Message(format!("{REJECT_L1}: {}", l1.reason)),
            };
        }

        // A confident safe-anchor match is trusted outright; the expensive
        // judge never runs.
        let skip = l1.matched == Some(AntibodyKind::SafeAnchor)
            && l1.similarity > self.cfg.skip_threshold;

        let (verdict, skipped_l2) = if skip {
            debug!(similarity = l1.similarity, "trusted pattern, skipping intent check");
            (
                IntentVerdict {
                    allowed: true,
                    risk_score: 0,
                    reason: "Skipped (Trusted Pattern)".into(),
                },
                true,
            )
        } else {
            stage = Stage::CheckL2;
            let v = tracker.analyze(prompt).await;
            debug!(?stage, score = v.risk_score, allowed = v.allowed, "intent verdict");
            (v, false)
        };

        if !verdict.allowed {
            self.hardening.submit(prompt, &verdict.reason);
            return PipelineOutput {
                result: PipelineResult {
                    stage: Stage::BlockedL2,
                    l1_similarity: l1.similarity,
                    l2_score: verdict.risk_score,
                    block_reason: verdict.reason.clone(),
                    latency_ms: elapsed_ms(start),
                    skipped_l2,
                },
                outcome: Outcome::Message(format!("{REJECT_L2}: {}", verdict.reason)),
            };
        }

        if verdict.reason.starts_with("AMBIGUOUS") {
            // Ask for clarification; the score stays internal.
            return PipelineOutput {
                result: PipelineResult {
                    stage: Stage::Ambiguous,
                    l1_similarity: l1.similarity,
                    l2_score: verdict.risk_score,
                    block_reason: String::new(),
                    latency_ms: elapsed_ms(start),
                    skipped_l2,
                },
                outcome: Outcome::Message(CLARIFY_MSG.to_string()),
            };
        }

        if !skipped_l2 && verdict.risk_score == 0 {
            // Verified clean: teach the membrane a safe anchor in the
            // background so the next identical ask can skip the judge.
            stage = Stage::LearnSafe;
            debug!(?stage, "learning verified safe pattern");
            let membrane = self.membrane.clone();
            let text = prompt.to_string();
            tokio::spawn(async move {
                membrane.learn(&text, "SAFE: Verified Pattern").await;
            });
        }

        stage = Stage::Forward;
        debug!(?stage, "forwarding downstream");
        match self.forwarder.generate(prompt).await {
            Ok(stream) => PipelineOutput {
                result: PipelineResult {
                    stage: Stage::Success,
                    l1_similarity: l1.similarity,
                    l2_score: verdict.risk_score,
                    block_reason: String::new(),
                    latency_ms: elapsed_ms(start),
                    skipped_l2,
                },
                outcome: Outcome::Stream(stream),
            },
            Err(e) => {
                warn!(error = %e, "downstream forward failed");
                PipelineOutput {
                    result: PipelineResult {
                        stage: Stage::Error,
                        l1_similarity: l1.similarity,
                        l2_score: verdict.risk_score,
                        block_reason: String::new(),
                        latency_ms: elapsed_ms(start),
                        skipped_l2,
                    },
                    outcome: Outcome::Message(GENERIC_ERROR_MSG.to_string()),
                }
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
