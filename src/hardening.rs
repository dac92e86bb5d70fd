//! Self-hardening loop: turn every block into new antibodies.
//!
//! Blocked prompts are red-teamed in the background: generate adversarial
//! variants, probe the membrane with each, and teach it every variant that
//! currently slips through. Runs detached from the request path on a
//! bounded queue; a flood of blocks drops events instead of growing memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HardeningConfig;
use crate::membrane::Membrane;
use crate::providers::VariationGenerator;

struct HardeningEvent {
    prompt: String,
    reason: String,
}

/// Cloneable handle to the background worker. Submissions are fire-and-forget;
/// nothing on the request path ever awaits completion.
#[derive(Clone)]
pub struct HardeningLoop {
    tx: mpsc::Sender<HardeningEvent>,
    updates: Arc<AtomicU64>,
}

impl HardeningLoop {
    /// Spawn the worker task. The handle only reaches the membrane through
    /// its public mutation API.
    pub fn spawn(
        membrane: Arc<Membrane>,
        generator: Arc<dyn VariationGenerator>,
        cfg: HardeningConfig,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<HardeningEvent>(cfg.queue_capacity);
        let updates = Arc::new(AtomicU64::new(0));

        let counter = updates.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let added = process_event(
                    &membrane,
                    generator.as_ref(),
                    cfg.max_variants,
                    &ev.prompt,
                    &ev.reason,
                )
                .await;
                counter.fetch_add(added, Ordering::Relaxed);
            }
        });

        Self { tx, updates }
    }

    /// Queue a blocked prompt for analysis. Drops the event with a warning if
    /// the queue is full; backpressure must not reach the request path.
    pub fn submit(&self, blocked_prompt: &str, reason: &str) {
        let ev = HardeningEvent {
            prompt: blocked_prompt.to_string(),
            reason: reason.to_string(),
        };
        if let Err(e) = self.tx.try_send(ev) {
            warn!(error = %e, "hardening queue full, dropping event");
        }
    }

    /// Total antibodies added by hardening since process start. Monotone.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

/// Analyze one blocked prompt: generate variants, find the ones the membrane
/// still calls safe, and learn an antibody for each. Returns the number of
/// bypasses ingested.
pub async fn process_event(
    membrane: &Membrane,
    generator: &dyn VariationGenerator,
    max_variants: usize,
    blocked_prompt: &str,
    reason: &str,
) -> u64 {
    debug!(prompt = blocked_prompt, reason, "analyzing blocked prompt");

    let mut variants = match generator.generate(blocked_prompt).await {
        Ok(vs) if !vs.is_empty() => vs,
        Ok(_) => {
            debug!("variation generator returned nothing, using fallback variant");
            fallback_variants(blocked_prompt)
        }
        Err(e) => {
            warn!(error = %e, "variation generator failed, using fallback variant");
            fallback_variants(blocked_prompt)
        }
    };
    variants.truncate(max_variants);

    let mut bypasses = 0u64;
    for variant in &variants {
        let verdict = membrane.check(variant).await;
        if !verdict.is_safe {
            continue;
        }
        // The membrane thinks a variation of a blocked prompt is fine:
        // that is a bypass. Patch it.
        let rule_id = format!("auto_rule_{}", &uuid::Uuid::new_v4().to_string()[..8]);
        membrane.learn(variant, &format!("Antibody for {rule_id}")).await;
        bypasses += 1;
    }

    if bypasses > 0 {
        info!(
            bypasses,
            probed = variants.len(),
            prompt = blocked_prompt,
            "hardened membrane against bypassing variants"
        );
    } else {
        debug!(probed = variants.len(), "no variant bypassed the membrane");
    }
    bypasses
}

/// Deterministic minimal variant set used when the generator fails or comes
/// back empty; the loop must never probe zero variants.
fn fallback_variants(blocked_prompt: &str) -> Vec<String> {
    vec![format!("{blocked_prompt} [SYSTEM_MODE]")]
}
