//! Provider seams for everything that talks to a model: embeddings, risk
//! judging, red-team variant generation, and the downstream LLM itself.
//!
//! Each dependency is a trait selected once at construction; there is no
//! simulation flag inside component logic. `http` holds the networked
//! implementations, `offline` the deterministic ones used for tests and
//! no-network deployments.

pub mod http;
pub mod offline;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::AegisError;

/// Risk verdict from a judge. Missing fields decode to score 0 and reason
/// "Unknown" so a sloppy model cannot fail a request closed.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Judgement {
    #[serde(default)]
    pub risk_score: u8,
    #[serde(default = "unknown_reason")]
    pub reason: String,
}

fn unknown_reason() -> String {
    "Unknown".into()
}

/// Streamed downstream output: a finite, non-restartable chunk sequence.
pub type ChunkStream = BoxStream<'static, Result<String, AegisError>>;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one text. Dimensionality is fixed per provider instance.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AegisError>;
}

#[async_trait]
pub trait JudgeProvider: Send + Sync {
    /// Score the current prompt given the rendered conversation history.
    async fn judge(&self, history_context: &str, prompt: &str)
        -> Result<Judgement, AegisError>;
}

#[async_trait]
pub trait VariationGenerator: Send + Sync {
    /// Produce adversarial rephrasings of a blocked prompt.
    async fn generate(&self, blocked_prompt: &str) -> Result<Vec<String>, AegisError>;
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Start downstream generation. The request has already been admitted by
    /// the time this is called; the returned stream is the response body.
    async fn generate(&self, prompt: &str) -> Result<ChunkStream, AegisError>;
}
