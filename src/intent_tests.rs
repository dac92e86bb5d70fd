use std::sync::Arc;

use async_trait::async_trait;

use crate::config::IntentConfig;
use crate::error::AegisError;
use crate::intent::IntentTracker;
use crate::providers::{Judgement, JudgeProvider};

/// Judge that always returns a fixed score.
struct FixedJudge(u8);

#[async_trait]
impl JudgeProvider for FixedJudge {
    async fn judge(&self, _ctx: &str, _prompt: &str) -> Result<Judgement, AegisError> {
        Ok(Judgement { risk_score: self.0, reason: "fixed".into() })
    }
}

/// Judge that always fails at the transport level.
struct BrokenJudge;

#[async_trait]
impl JudgeProvider for BrokenJudge {
    async fn judge(&self, _ctx: &str, _prompt: &str) -> Result<Judgement, AegisError> {
        Err(AegisError::Provider("connection refused".into()))
    }
}

/// Judge that records the context it was handed.
struct CapturingJudge(parking_lot::Mutex<Vec<String>>);

#[async_trait]
impl JudgeProvider for CapturingJudge {
    async fn judge(&self, ctx: &str, _prompt: &str) -> Result<Judgement, AegisError> {
        self.0.lock().push(ctx.to_string());
        Ok(Judgement { risk_score: 10, reason: "ok".into() })
    }
}

fn tracker(judge: Arc<dyn JudgeProvider>) -> IntentTracker {
    IntentTracker::new(judge, IntentConfig::default())
}

#[tokio::test]
async fn pass_appends_history() {
    let mut t = tracker(Arc::new(FixedJudge(10)));
    let v = t.analyze("hello").await;
    assert!(v.allowed);
    assert_eq!(v.reason, "PASS");
    assert_eq!(t.history_len(), 1);
}

#[tokio::test]
async fn ambiguous_is_inclusive_at_lower_bound() {
    let mut t = tracker(Arc::new(FixedJudge(40)));
    let v = t.analyze("hmm").await;
    assert!(v.allowed);
    assert!(v.reason.starts_with("AMBIGUOUS: "));
    assert_eq!(t.history_len(), 1);
}

#[tokio::test]
async fn block_threshold_is_exclusive() {
    // 70 is still ambiguous; 71 blocks.
    let mut t = tracker(Arc::new(FixedJudge(70)));
    assert!(t.analyze("a").await.allowed);

    let mut t = tracker(Arc::new(FixedJudge(71)));
    let v = t.analyze("b").await;
    assert!(!v.allowed);
    assert!(v.reason.starts_with("BLOCK: "));
}

#[tokio::test]
async fn blocked_prompt_never_appended() {
    let mut t = tracker(Arc::new(FixedJudge(90)));
    let v = t.analyze("bad").await;
    assert!(!v.allowed);
    assert_eq!(t.history_len(), 0);
}

#[tokio::test]
async fn judge_failure_fails_open_without_append() {
    let mut t = tracker(Arc::new(BrokenJudge));
    let v = t.analyze("anything").await;
    assert!(v.allowed);
    assert_eq!(v.risk_score, 0);
    assert_eq!(v.reason, "Inference Error (Fail Open)");
    assert_eq!(t.history_len(), 0);
}

#[tokio::test]
async fn reset_clears_history() {
    let mut t = tracker(Arc::new(FixedJudge(10)));
    t.analyze("one").await;
    t.analyze("two").await;
    assert_eq!(t.history_len(), 2);
    t.reset();
    assert_eq!(t.history_len(), 0);
}

#[tokio::test]
async fn context_carries_prior_scores_in_order() {
    let judge = Arc::new(CapturingJudge(parking_lot::Mutex::new(Vec::new())));
    let mut t = IntentTracker::new(judge.clone(), IntentConfig::default());
    t.analyze("first").await;
    t.analyze("second").await;

    let seen = judge.0.lock();
    assert_eq!(seen[0], "");
    assert_eq!(seen[1], "[risk=10] first\n");
}
