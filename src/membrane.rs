//! Semantic antibody store: the fast first-line filter.
//!
//! Labeled reference vectors ("antibodies") answer nearest-match queries by
//! brute-force cosine scan. The store is append-only and insertion-ordered;
//! among equally similar antibodies the earliest-inserted wins. Every
//! successful append rewrites the whole store file.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MembraneConfig;
use crate::error::AegisError;
use crate::providers::EmbeddingProvider;

/// Threats seeded into a fresh store so the firewall is never born blind.
const SEED_THREATS: [(&str, &str); 3] = [
    ("Ignore previous instructions", "Prompt Injection"),
    ("Drop all tables", "SQL Injection"),
    ("Make a bomb", "Dangerous Content"),
];

/// Label prefix marking a known-benign pattern.
const SAFE_PREFIX: &str = "SAFE:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AntibodyKind {
    Threat,
    SafeAnchor,
}

impl AntibodyKind {
    pub fn from_label(label: &str) -> Self {
        if label.starts_with(SAFE_PREFIX) {
            Self::SafeAnchor
        } else {
            Self::Threat
        }
    }
}

#[derive(Debug, Clone)]
pub struct Antibody {
    pub vector: Vec<f32>,
    pub label: String,
    pub kind: AntibodyKind,
}

impl Antibody {
    fn new(vector: Vec<f32>, label: String) -> Self {
        let kind = AntibodyKind::from_label(&label);
        Self { vector, label, kind }
    }
}

/// Outcome of a membrane check. `matched` is `None` when nothing cleared the
/// match threshold (including the empty-store case).
#[derive(Debug, Clone)]
pub struct MembraneVerdict {
    pub is_safe: bool,
    pub reason: String,
    pub similarity: f32,
    pub matched: Option<AntibodyKind>,
}

/// On-disk layout: two index-aligned sequences, overwritten wholesale.
#[derive(Serialize, Deserialize)]
struct StoredMembrane {
    vectors: Vec<Vec<f32>>,
    labels: Vec<String>,
}

pub struct Membrane {
    antibodies: RwLock<Vec<Antibody>>,
    path: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    cfg: MembraneConfig,
}

impl Membrane {
    /// Load the store from `path`, or seed the default threats if the file is
    /// absent or unreadable. Load failure is not an error; the store starts
    /// over from the seeds.
    pub async fn open(
        path: impl AsRef<Path>,
        embedder: Arc<dyn EmbeddingProvider>,
        cfg: MembraneConfig,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        let cache_size = NonZeroUsize::new(cfg.cache_size.max(1)).expect("non-zero");
        let membrane = Self {
            antibodies: RwLock::new(Vec::new()),
            path,
            embedder,
            cache: Mutex::new(LruCache::new(cache_size)),
            cfg,
        };

        match membrane.load() {
            Ok(count) => {
                info!(count, "loaded antibody store");
            }
            Err(e) => {
                debug!(error = %e, "no usable antibody store, seeding defaults");
                for (text, label) in SEED_THREATS {
                    membrane.learn(text, label).await;
                }
            }
        }
        membrane
    }

    fn load(&self) -> Result<usize, AegisError> {
        let bytes = std::fs::read(&self.path)
            .map_err(|e| AegisError::Persistence(e.to_string()))?;
        let stored: StoredMembrane = serde_json::from_slice(&bytes)
            .map_err(|e| AegisError::Persistence(e.to_string()))?;
        if stored.vectors.len() != stored.labels.len() {
            return Err(AegisError::Persistence(format!(
                "store misaligned: {} vectors, {} labels",
                stored.vectors.len(),
                stored.labels.len()
            )));
        }

        let antibodies: Vec<Antibody> = stored
            .vectors
            .into_iter()
            .zip(stored.labels)
            .map(|(vector, label)| Antibody::new(vector, label))
            .collect();
        let count = antibodies.len();
        *self.antibodies.write() = antibodies;
        Ok(count)
    }

    /// Check a prompt against every stored antibody.
    ///
    /// The embedding is computed before any lock is taken; the read lock only
    /// covers the scan.
    pub async fn check(&self, prompt: &str) -> MembraneVerdict {
        let query = self.embed_or_zero(prompt).await;

        let antibodies = self.antibodies.read();
        if antibodies.is_empty() {
            return MembraneVerdict {
                is_safe: true,
                reason: "Safe (No Rules)".into(),
                similarity: 0.0,
                matched: None,
            };
        }

        // Strict > keeps the earliest-inserted antibody on ties.
        let mut best = &antibodies[0];
        let mut best_sim = cosine_similarity(&query, &best.vector);
        for ab in &antibodies[1..] {
            let sim = cosine_similarity(&query, &ab.vector);
            if sim > best_sim {
                best_sim = sim;
                best = ab;
            }
        }

        if best_sim > self.cfg.match_threshold {
            match best.kind {
                AntibodyKind::SafeAnchor => MembraneVerdict {
                    is_safe: true,
                    reason: format!("Semantic match to Safe Anchor: {}", best.label),
                    similarity: best_sim,
                    matched: Some(AntibodyKind::SafeAnchor),
                },
                AntibodyKind::Threat => MembraneVerdict {
                    is_safe: false,
                    reason: format!("Semantic match to: {}", best.label),
                    similarity: best_sim,
                    matched: Some(AntibodyKind::Threat),
                },
            }
        } else {
            MembraneVerdict {
                is_safe: true,
                reason: "Safe".into(),
                similarity: best_sim,
                matched: None,
            }
        }
    }

    /// Append a new antibody and persist the whole store.
    ///
    /// The write lock covers append + persist so concurrent readers observe
    /// either the pre- or post-append store, never a partial one. Persist
    /// failure is logged; the in-memory append stands.
    pub async fn learn(&self, text: &str, label: &str) {
        let vector = self.embed_or_zero(text).await;
        let antibody = Antibody::new(vector, label.to_string());

        let mut antibodies = self.antibodies.write();
        antibodies.push(antibody);
        if let Err(e) = self.save(&antibodies) {
            warn!(error = %e, "antibody store persist failed, in-memory state stands");
        }
        debug!(count = antibodies.len(), label, "learned antibody");
    }

    fn save(&self, antibodies: &[Antibody]) -> Result<(), AegisError> {
        let stored = StoredMembrane {
            vectors: antibodies.iter().map(|a| a.vector.clone()).collect(),
            labels: antibodies.iter().map(|a| a.label.clone()).collect(),
        };
        let bytes = serde_json::to_vec(&stored)
            .map_err(|e| AegisError::Persistence(e.to_string()))?;
        std::fs::write(&self.path, bytes)
            .map_err(|e| AegisError::Persistence(e.to_string()))
    }

    /// Embed with the LRU cache in front; a provider failure degrades to the
    /// zero vector, which matches nothing.
    async fn embed_or_zero(&self, text: &str) -> Vec<f32> {
        if let Some(hit) = self.cache.lock().get(text) {
            return hit.clone();
        }
        match self.embedder.embed(text).await {
            Ok(v) => {
                self.cache.lock().put(text.to_string(), v.clone());
                v
            }
            Err(e) => {
                warn!(error = %e, "embedding provider failed, using zero vector");
                vec![0.0; self.cfg.embed_dim]
            }
        }
    }

    pub fn antibody_count(&self) -> usize {
        self.antibodies.read().len()
    }

    /// Labels in insertion order, for introspection.
    pub fn labels(&self) -> Vec<String> {
        self.antibodies.read().iter().map(|a| a.label.clone()).collect()
    }
}

/// Cosine similarity with f64 accumulation. Mismatched or zero-norm inputs
/// (including the fallback zero vector) score 0.0 rather than NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (ai, bi) = (a[i] as f64, b[i] as f64);
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (dot / denom) as f32
    }
}
