//! Component configuration, resolved once at startup and passed into
//! constructors. Nothing reads these values from ambient global state.

use crate::error::AegisError;

/// Cosine similarity above which the membrane declares a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.75;

/// Safe-anchor similarity above which the intent check is skipped entirely.
/// Kept below the match threshold: an anchor must first be a match at all.
pub const DEFAULT_SKIP_THRESHOLD: f32 = 0.70;

/// Risk score above which a prompt is blocked outright.
pub const DEFAULT_BLOCK_THRESHOLD: u8 = 70;

/// Risk score at or above which clarification is requested (inclusive).
pub const DEFAULT_AMBIGUOUS_THRESHOLD: u8 = 40;

/// Embedding dimensionality of the offline hashing embedder.
pub const DEFAULT_EMBED_DIM: usize = 384;

#[derive(Debug, Clone)]
pub struct MembraneConfig {
    /// Fallback vector dimensionality when the embedding provider fails.
    pub embed_dim: usize,
    pub match_threshold: f32,
    /// Capacity of the query-embedding LRU cache.
    pub cache_size: usize,
}

impl Default for MembraneConfig {
    fn default() -> Self {
        Self {
            embed_dim: DEFAULT_EMBED_DIM,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            cache_size: 128,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntentConfig {
    pub block_threshold: u8,
    pub ambiguous_threshold: u8,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            block_threshold: DEFAULT_BLOCK_THRESHOLD,
            ambiguous_threshold: DEFAULT_AMBIGUOUS_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HardeningConfig {
    /// Pending blocked-prompt events beyond this are dropped, not queued.
    pub queue_capacity: usize,
    /// Upper bound on adversarial variants probed per event.
    pub max_variants: usize,
}

impl Default for HardeningConfig {
    fn default() -> Self {
        Self { queue_capacity: 32, max_variants: 5 }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub skip_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { skip_threshold: DEFAULT_SKIP_THRESHOLD }
    }
}

/// Validate cross-field invariants. Called once at startup; a failure here
/// aborts boot rather than surfacing mid-request.
pub fn validate(
    membrane: &MembraneConfig,
    intent: &IntentConfig,
    hardening: &HardeningConfig,
    pipeline: &PipelineConfig,
) -> Result<(), AegisError> {
    if membrane.embed_dim == 0 {
        return Err(AegisError::Config("embed_dim must be non-zero".into()));
    }
    if !(0.0..=1.0).contains(&membrane.match_threshold) {
        return Err(AegisError::Config(format!(
            "match_threshold {} outside [0, 1]",
            membrane.match_threshold
        )));
    }
    if !(0.0..=1.0).contains(&pipeline.skip_threshold) {
        return Err(AegisError::Config(format!(
            "skip_threshold {} outside [0, 1]",
            pipeline.skip_threshold
        )));
    }
    if intent.block_threshold > 100 {
        return Err(AegisError::Config(format!(
            "block_threshold {} exceeds 100",
            intent.block_threshold
        )));
    }
    if intent.ambiguous_threshold > intent.block_threshold {
        return Err(AegisError::Config(format!(
            "ambiguous_threshold {} above block_threshold {}",
            intent.ambiguous_threshold, intent.block_threshold
        )));
    }
    if hardening.queue_capacity == 0 || hardening.max_variants == 0 {
        return Err(AegisError::Config(
            "hardening queue_capacity and max_variants must be non-zero".into(),
        ));
    }
    Ok(())
}

/// Parse an env var override, falling back to `default` when unset or bad.
pub fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
