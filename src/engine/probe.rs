// Keystone Engine — Semantic Probe
// Pre-cognition pass: pull candidate phrases out of the raw prompt with
// pure heuristics, embed the ones we haven't seen recently, and rank them
// against every known vector collection. The best collection becomes the
// turn's primary context; the rest become supplemental.
//
// Probe failure is non-fatal — the pipeline continues with an empty result.

use crate::atoms::config::SemanticProbeConfig;
use crate::atoms::error::EngineResult;
use crate::engine::providers::TextEmbedder;
use crate::engine::vectors::VectorIndex;
use log::debug;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

// ── Phrase extraction ──────────────────────────────────────────────────────

/// Common English words that never make useful probe phrases.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "if", "then", "else", "when", "while", "of", "to",
    "in", "on", "at", "by", "for", "with", "about", "into", "over", "after", "before", "is",
    "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does", "did",
    "will", "would", "can", "could", "should", "may", "might", "must", "shall", "this", "that",
    "these", "those", "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us",
    "them", "my", "your", "his", "its", "our", "their", "what", "which", "who", "whom", "how",
    "why", "where", "there", "here", "not", "no", "yes", "so", "as", "than", "too", "very",
    "just", "also", "some", "any", "all", "each", "both", "few", "more", "most", "other",
    "such", "only", "own", "same", "please", "tell", "show", "give", "make", "know", "think",
    "want", "need", "like", "time", "people", "thing", "things", "good", "new", "first",
    "last", "long", "great", "little", "right", "really", "something", "anything",
];

/// Inputs the probe never runs on.
const REFLEX_COMMANDS: &[&str] = &["exit", "quit", "help", "status", "ping"];

fn capitalized_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Multi-word capitalized sequences, possessives included
    RE.get_or_init(|| Regex::new(r"\b([A-Z][\w']+(?:\s+[A-Z][\w']+)+)").unwrap())
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""([^"]{3,80})"|'([^']{3,80})'"#).unwrap())
}

fn notation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Domain notation: dotted files, module paths, snake_case identifiers
    RE.get_or_init(|| Regex::new(r"\b\w+(?:(?:\.|::|_|/)\w+)+\b").unwrap())
}

/// Heuristic candidate-phrase extraction. Order of discovery is preserved;
/// duplicates collapse case-insensitively.
pub fn extract_phrases(prompt: &str, max_phrases: usize, min_len: usize) -> Vec<String> {
    let mut phrases: Vec<String> = Vec::new();
    let mut seen: HashMap<String, ()> = HashMap::new();

    let mut push = |candidate: &str| {
        let trimmed = candidate.trim();
        if trimmed.len() < min_len {
            return;
        }
        let key = trimmed.to_lowercase();
        if STOPWORDS.contains(&key.as_str()) {
            return;
        }
        if seen.insert(key, ()).is_none() {
            phrases.push(trimmed.to_string());
        }
    };

    for cap in capitalized_re().captures_iter(prompt) {
        push(&cap[1]);
    }
    for cap in quoted_re().captures_iter(prompt) {
        if let Some(m) = cap.get(1).or_else(|| cap.get(2)) {
            push(m.as_str());
        }
    }
    for m in notation_re().find_iter(prompt) {
        push(m.as_str());
    }
    // Rare standalone words: long enough, alphabetic, not common
    for word in prompt.split_whitespace() {
        let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if cleaned.len() >= 5
            && cleaned.chars().next().map(|c| c.is_lowercase()).unwrap_or(false)
            && !STOPWORDS.contains(&cleaned.to_lowercase().as_str())
        {
            push(&cleaned);
        }
    }

    phrases.truncate(max_phrases);
    phrases
}

/// Whether the probe should run at all for this input.
pub fn should_skip(prompt: &str, previous_prompt: Option<&str>) -> bool {
    let trimmed = prompt.trim().to_lowercase();
    if REFLEX_COMMANDS.contains(&trimmed.as_str()) {
        return true;
    }
    if prompt.split_whitespace().count() < 3 {
        return true;
    }
    if let Some(prev) = previous_prompt {
        if prev.trim().eq_ignore_ascii_case(prompt.trim()) {
            return true;
        }
    }
    false
}

// ── Probe result ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeHit {
    pub collection: String,
    pub doc_id: String,
    pub score: f32,
    pub phrase: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeResult {
    pub phrases: Vec<String>,
    pub hits: Vec<ProbeHit>,
    pub primary_collection: Option<String>,
    pub supplemental_collections: Vec<String>,
    pub cache_hits: usize,
    pub lookup_ms: u64,
}

// ── Per-session cache ──────────────────────────────────────────────────────

struct CachedPhrase {
    hits: Vec<ProbeHit>,
    turn: u64,
}

#[derive(Default)]
struct SessionCache {
    phrases: HashMap<String, CachedPhrase>,
}

// ── The probe ──────────────────────────────────────────────────────────────

pub struct SemanticProbe {
    cfg: SemanticProbeConfig,
    caches: Mutex<HashMap<String, SessionCache>>,
}

impl SemanticProbe {
    pub fn new(cfg: SemanticProbeConfig) -> Self {
        SemanticProbe { cfg, caches: Mutex::new(HashMap::new()) }
    }

    /// Run the probe for one turn. `collections` is every open vector index
    /// keyed by collection name.
    pub async fn probe(
        &self,
        session_id: &str,
        turn: u64,
        prompt: &str,
        previous_prompt: Option<&str>,
        embedder: &dyn TextEmbedder,
        collections: &[(String, &VectorIndex)],
    ) -> EngineResult<Option<ProbeResult>> {
        if should_skip(prompt, previous_prompt) {
            debug!("[probe] skipping trivial input for {}", session_id);
            return Ok(None);
        }
        let started = Instant::now();
        let phrases = extract_phrases(prompt, self.cfg.max_phrases, 3);
        if phrases.is_empty() {
            return Ok(None);
        }

        let mut hits: Vec<ProbeHit> = Vec::new();
        let mut cache_hits = 0usize;

        for phrase in &phrases {
            if let Some(cached) = self.cached(session_id, phrase, turn) {
                cache_hits += 1;
                hits.extend(cached);
                continue;
            }
            let vector = embedder.embed(phrase).await?;
            let mut phrase_hits = Vec::new();
            for (name, index) in collections {
                for hit in index.query(&vector, self.cfg.top_k_per_phrase) {
                    if hit.score >= self.cfg.similarity_threshold {
                        phrase_hits.push(ProbeHit {
                            collection: name.clone(),
                            doc_id: hit.id,
                            score: hit.score,
                            phrase: phrase.clone(),
                            meta: hit.meta,
                        });
                    }
                }
            }
            self.remember(session_id, phrase, turn, &phrase_hits);
            hits.extend(phrase_hits);
        }

        // Aggregate score per collection decides primary vs supplemental
        let mut aggregate: HashMap<String, f32> = HashMap::new();
        for hit in &hits {
            *aggregate.entry(hit.collection.clone()).or_insert(0.0) += hit.score;
        }
        let mut ranked: Vec<(String, f32)> = aggregate.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let primary_collection = ranked.first().map(|(name, _)| name.clone());
        let supplemental_collections =
            ranked.iter().skip(1).map(|(name, _)| name.clone()).collect();

        Ok(Some(ProbeResult {
            phrases,
            hits,
            primary_collection,
            supplemental_collections,
            cache_hits,
            lookup_ms: started.elapsed().as_millis() as u64,
        }))
    }

    fn cached(&self, session_id: &str, phrase: &str, turn: u64) -> Option<Vec<ProbeHit>> {
        let caches = self.caches.lock();
        let cache = caches.get(session_id)?;
        let entry = cache.phrases.get(&phrase.to_lowercase())?;
        if turn.saturating_sub(entry.turn) > self.cfg.cache_max_age_turns {
            return None;
        }
        Some(entry.hits.clone())
    }

    fn remember(&self, session_id: &str, phrase: &str, turn: u64, hits: &[ProbeHit]) {
        let mut caches = self.caches.lock();
        let cache = caches.entry(session_id.to_string()).or_default();
        cache.phrases.insert(
            phrase.to_lowercase(),
            CachedPhrase { hits: hits.to_vec(), turn },
        );
    }

    /// Drop cache entries older than the configured age. Called from the
    /// scheduler tick.
    pub fn evict_stale(&self, session_turns: &HashMap<String, u64>) {
        let mut caches = self.caches.lock();
        for (session, cache) in caches.iter_mut() {
            let Some(current) = session_turns.get(session) else { continue };
            cache
                .phrases
                .retain(|_, v| current.saturating_sub(v.turn) <= self.cfg.cache_max_age_turns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::providers::TextEmbedder;
    use async_trait::async_trait;
    use serde_json::json;

    #[test]
    fn test_extracts_capitalized_sequences() {
        let phrases = extract_phrases("Tell me about The Raven by Edgar Allan Poe", 8, 3);
        assert!(phrases.iter().any(|p| p == "The Raven"));
        assert!(phrases.iter().any(|p| p == "Edgar Allan Poe"));
    }

    #[test]
    fn test_extracts_quoted_and_notation() {
        let phrases = extract_phrases(r#"What does "graceful shutdown" mean in sleep_manager.rs?"#, 8, 3);
        assert!(phrases.iter().any(|p| p == "graceful shutdown"));
        assert!(phrases.iter().any(|p| p == "sleep_manager.rs"));
    }

    #[test]
    fn test_phrase_cap_and_min_len() {
        let long = "Alpha Beta Gamma Delta Epsilon Zeta Eta Theta Iota Kappa Lambda Municipality";
        let phrases = extract_phrases(long, 8, 3);
        assert!(phrases.len() <= 8);
        let phrases = extract_phrases("is it ok", 8, 3);
        assert!(phrases.is_empty() || phrases.iter().all(|p| p.len() >= 3));
    }

    #[test]
    fn test_skip_rules() {
        assert!(should_skip("exit", None));
        assert!(should_skip("help", None));
        assert!(should_skip("hi there", None), "under three words skips");
        assert!(should_skip("tell me more", Some("tell me more")), "duplicate turn skips");
        assert!(!should_skip("tell me about rust lifetimes", None));
    }

    struct FixedEmbedder;

    #[async_trait]
    impl TextEmbedder for FixedEmbedder {
        async fn embed(&self, text: &str) -> crate::atoms::error::EngineResult<Vec<f32>> {
            // "poetry"-flavored phrases point one way, others the opposite
            if text.to_lowercase().contains("raven") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }
    }

    fn poetry_index(dir: &std::path::Path) -> VectorIndex {
        let mut idx = VectorIndex::open(&dir.join("poetry.json")).unwrap();
        idx.add("raven.md", vec![1.0, 0.0], json!({"file": "raven.md"}));
        idx
    }

    fn ops_index(dir: &std::path::Path) -> VectorIndex {
        let mut idx = VectorIndex::open(&dir.join("ops.json")).unwrap();
        idx.add("runbook.md", vec![0.0, 1.0], json!({"file": "runbook.md"}));
        idx
    }

    #[tokio::test]
    async fn test_probe_groups_by_collection() {
        let tmp = tempfile::tempdir().unwrap();
        let poetry = poetry_index(tmp.path());
        let ops = ops_index(tmp.path());
        let collections =
            vec![("poetry".to_string(), &poetry), ("ops".to_string(), &ops)];

        let probe = SemanticProbe::new(SemanticProbeConfig::default());
        let result = probe
            .probe("web_a", 1, "Recite The Raven for me tonight", None, &FixedEmbedder, &collections)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.primary_collection.as_deref(), Some("poetry"));
        assert!(result.hits.iter().any(|h| h.doc_id == "raven.md"));
    }

    #[tokio::test]
    async fn test_probe_cache_hits_on_second_turn() {
        let tmp = tempfile::tempdir().unwrap();
        let poetry = poetry_index(tmp.path());
        let collections = vec![("poetry".to_string(), &poetry)];
        let probe = SemanticProbe::new(SemanticProbeConfig::default());

        let first = probe
            .probe("web_a", 1, "Recite The Raven for me tonight", None, &FixedEmbedder, &collections)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.cache_hits, 0);

        let second = probe
            .probe("web_a", 2, "More about The Raven please today", None, &FixedEmbedder, &collections)
            .await
            .unwrap()
            .unwrap();
        assert!(second.cache_hits >= 1, "repeated phrase should hit the cache");
    }

    #[tokio::test]
    async fn test_probe_skips_reflex() {
        let probe = SemanticProbe::new(SemanticProbeConfig::default());
        let out = probe.probe("web_a", 1, "status", None, &FixedEmbedder, &[]).await.unwrap();
        assert!(out.is_none());
    }
}
