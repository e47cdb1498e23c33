// Keystone Engine — In-Stream Observer
// Rate-limited monitor that rides along the token stream. Rule checks are
// always on: cited filenames are cross-referenced against the documents
// actually retrieved this turn, and degeneration patterns end the stream.
// The optional LLM-backed review adds judgment; when it errors the observer
// downgrades itself to rule-only for the rest of the stream.
//
// At most 6 invocations per stream, at least 15 s apart, so the observer
// can never dominate generation cost.

use crate::atoms::config::ObserverConfig;
use crate::engine::loopdetect;
use crate::engine::providers::{ChatMessage, ChatRequest, ModelBackend};
use log::{debug, warn};
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum ObserverVerdict {
    Pass,
    /// Flag for annotation; stream continues.
    Caution(String),
    /// Terminate the stream at the next yield.
    Block(String),
}

fn filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([\w\-][\w\-/]*\.(?:md|txt|rs|py|json|yaml|yml|toml|pdf|csv|log))\b").unwrap()
    })
}

/// Pure rule pass: citation verification + fast degeneration checks.
pub fn rule_check(accumulated: &str, retrieved_docs: &[String]) -> ObserverVerdict {
    // Token degeneration or phrase loops end the stream outright
    if loopdetect::score_token_pattern(accumulated) >= 0.9 {
        return ObserverVerdict::Block("token degeneration in stream".into());
    }

    // Filenames the model cites must exist among retrieved documents
    for cap in filename_re().captures_iter(accumulated) {
        let cited = cap[1].to_string();
        let base = cited.rsplit('/').next().unwrap_or(&cited);
        let known = retrieved_docs.iter().any(|d| {
            let d_base = d.rsplit('/').next().unwrap_or(d);
            d_base == base
        });
        if !known {
            return ObserverVerdict::Caution(format!("citation unverifiable: {cited}"));
        }
    }
    ObserverVerdict::Pass
}

pub struct StreamObserver {
    cfg: ObserverConfig,
    retrieved_docs: Vec<String>,
    review_model: Option<Arc<dyn ModelBackend>>,
    invocations: u32,
    last_check: Option<Instant>,
    llm_disabled: bool,
}

impl StreamObserver {
    pub fn new(
        cfg: ObserverConfig,
        retrieved_docs: Vec<String>,
        review_model: Option<Arc<dyn ModelBackend>>,
    ) -> Self {
        StreamObserver { cfg, retrieved_docs, review_model, invocations: 0, last_check: None, llm_disabled: false }
    }

    pub fn invocations(&self) -> u32 {
        self.invocations
    }

    /// Whether the rate limiter allows a check right now.
    fn due(&self) -> bool {
        if !self.cfg.enabled || self.invocations >= self.cfg.max_invocations {
            return false;
        }
        match self.last_check {
            None => true,
            Some(at) => at.elapsed().as_secs() >= self.cfg.min_interval_secs,
        }
    }

    /// Run a check if one is due. Called by the pipeline between chunks.
    pub async fn maybe_check(&mut self, accumulated: &str) -> ObserverVerdict {
        if !self.due() {
            return ObserverVerdict::Pass;
        }
        self.invocations += 1;
        self.last_check = Some(Instant::now());
        self.check(accumulated).await
    }

    async fn check(&mut self, accumulated: &str) -> ObserverVerdict {
        let rules = rule_check(accumulated, &self.retrieved_docs);
        if rules != ObserverVerdict::Pass {
            debug!("[observer] rule verdict: {:?}", rules);
            return rules;
        }

        if !self.cfg.llm_review || self.llm_disabled {
            return ObserverVerdict::Pass;
        }
        let Some(model) = self.review_model.clone() else {
            return ObserverVerdict::Pass;
        };

        let req = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "You review an in-progress assistant response. Reply with exactly one word: \
                     OK if it is coherent and grounded, CAUTION if it may contain unsupported \
                     claims, BLOCK only if it is degenerating or fabricating wholesale.",
                ),
                ChatMessage::user(accumulated.chars().take(2000).collect::<String>()),
            ],
            temperature: Some(0.0),
            top_p: None,
            max_tokens: Some(8),
        };
        match model.chat(req).await {
            Ok(reply) => {
                let word = reply.trim().to_uppercase();
                if word.starts_with("BLOCK") {
                    ObserverVerdict::Block("reviewer blocked the stream".into())
                } else if word.starts_with("CAUTION") {
                    ObserverVerdict::Caution("content may be incomplete or unsupported".into())
                } else {
                    ObserverVerdict::Pass
                }
            }
            Err(e) => {
                // Review model trouble must never take the stream down
                warn!("[observer] llm review failed, downgrading to rule-only: {e}");
                self.llm_disabled = true;
                ObserverVerdict::Pass
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_citation_verified_against_retrieved() {
        let docs = vec!["raven.md".to_string(), "notes/lighthouse.txt".to_string()];
        assert_eq!(rule_check("As raven.md says, nevermore.", &docs), ObserverVerdict::Pass);
        assert_eq!(
            rule_check("According to lighthouse.txt the lamp rotates.", &docs),
            ObserverVerdict::Pass
        );
        match rule_check("According to secrets.md, the code is 42.", &docs) {
            ObserverVerdict::Caution(msg) => assert!(msg.contains("secrets.md")),
            other => panic!("expected caution, got {other:?}"),
        }
    }

    #[test]
    fn test_degeneration_blocks() {
        match rule_check(&"x".repeat(50), &[]) {
            ObserverVerdict::Block(_) => {}
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invocation_cap() {
        let cfg = ObserverConfig { min_interval_secs: 0, llm_review: false, ..Default::default() };
        let mut obs = StreamObserver::new(cfg, vec![], None);
        for _ in 0..10 {
            obs.maybe_check("all fine here").await;
        }
        assert_eq!(obs.invocations(), 6, "observer must stop at 6 invocations per stream");
    }

    #[tokio::test]
    async fn test_rate_limit_interval() {
        let cfg = ObserverConfig { min_interval_secs: 3600, llm_review: false, ..Default::default() };
        let mut obs = StreamObserver::new(cfg, vec![], None);
        obs.maybe_check("first").await;
        obs.maybe_check("second immediately after").await;
        assert_eq!(obs.invocations(), 1, "second check inside the interval must be skipped");
    }

    #[tokio::test]
    async fn test_llm_failure_downgrades_to_rules() {
        use crate::engine::providers::testing::ScriptedBackend;
        let cfg = ObserverConfig { min_interval_secs: 0, ..Default::default() };
        let failing: Arc<dyn ModelBackend> = Arc::new(ScriptedBackend::failing("reviewer"));
        let mut obs = StreamObserver::new(cfg, vec![], Some(failing));
        let v = obs.maybe_check("some healthy text").await;
        assert_eq!(v, ObserverVerdict::Pass);
        // Downgraded: later checks skip the LLM entirely and still pass
        let v = obs.maybe_check("more healthy text").await;
        assert_eq!(v, ObserverVerdict::Pass);
        assert!(obs.llm_disabled);
    }

    #[tokio::test]
    async fn test_llm_block_verdict() {
        use crate::engine::providers::testing::ScriptedBackend;
        let cfg = ObserverConfig { min_interval_secs: 0, ..Default::default() };
        let reviewer: Arc<dyn ModelBackend> = Arc::new(ScriptedBackend::new("reviewer", vec!["BLOCK"]));
        let mut obs = StreamObserver::new(cfg, vec![], Some(reviewer));
        match obs.maybe_check("suspicious text").await {
            ObserverVerdict::Block(_) => {}
            other => panic!("expected block, got {other:?}"),
        }
    }
}
