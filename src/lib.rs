//! aegis — self-hardening prompt firewall for LLM backends.
//! membrane → intent → forward, with background red-team hardening.

pub mod api;
pub mod config;
pub mod error;
pub mod hardening;
pub mod intent;
pub mod membrane;
pub mod pipeline;
pub mod providers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::IntentConfig;
use crate::hardening::HardeningLoop;
use crate::intent::IntentTracker;
use crate::membrane::Membrane;
use crate::pipeline::Pipeline;
use crate::providers::JudgeProvider;

/// One conversation's tracker. The tokio mutex serializes turns within the
/// conversation while other conversations proceed in parallel.
pub type SharedTracker = Arc<tokio::sync::Mutex<IntentTracker>>;

pub type Conversations = Arc<parking_lot::Mutex<HashMap<String, SharedTracker>>>;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub membrane: Arc<Membrane>,
    pub hardening: HardeningLoop,
    pub judge: Arc<dyn JudgeProvider>,
    pub intent_cfg: IntentConfig,
    pub conversations: Conversations,
    pub api_key: Option<String>,
    pub started_at: Instant,
}

impl AppState {
    /// Fetch or create the tracker for a conversation id.
    pub fn tracker_for(&self, conversation: &str) -> SharedTracker {
        let mut map = self.conversations.lock();
        map.entry(conversation.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(IntentTracker::new(
                    self.judge.clone(),
                    self.intent_cfg.clone(),
                )))
            })
            .clone()
    }
}
