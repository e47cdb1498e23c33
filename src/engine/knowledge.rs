// Keystone Engine — Knowledge Layer
// Persona/KB selection, retrieval enrichment, and ingestion detection.
// Persona follows context: the probe's primary collection picks it when
// there is one, a keyword table catches the rest. Retrieval reuses probe
// hits when they already cover the intended collection so the embedder
// isn't paid twice for the same turn.

use crate::atoms::config::KnowledgeBaseConfig;
use crate::atoms::constants::{KNOWLEDGE_DUPLICATE_PROBE_CHARS, KNOWLEDGE_DUPLICATE_THRESHOLD};
use crate::atoms::error::EngineResult;
use crate::engine::probe::ProbeResult;
use crate::engine::tool_routing::ToolRelay;
use log::{debug, info};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

// ── Persona / KB selection ─────────────────────────────────────────────────

/// Pick the knowledge base (and its persona) for this turn. Probe-driven
/// first, keyword table second, none otherwise.
pub fn select_persona(
    probe: Option<&ProbeResult>,
    prompt: &str,
    knowledge_bases: &BTreeMap<String, KnowledgeBaseConfig>,
) -> Option<(String, String)> {
    if let Some(primary) = probe.and_then(|p| p.primary_collection.as_ref()) {
        if let Some(kb) = knowledge_bases.get(primary) {
            debug!("[knowledge] probe selected KB '{}' → persona '{}'", primary, kb.persona);
            return Some((primary.clone(), kb.persona.clone()));
        }
    }
    let lower = prompt.to_lowercase();
    for (name, kb) in knowledge_bases {
        if kb.keywords.iter().any(|k| lower.contains(&k.to_lowercase())) {
            debug!("[knowledge] keyword match selected KB '{}'", name);
            return Some((name.clone(), kb.persona.clone()));
        }
    }
    None
}

// ── Retrieval enrichment ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetrievedDocument {
    pub file: String,
    pub content: String,
    pub score: f32,
}

/// Reuse probe hits when ≥2 already came from the intended collection;
/// otherwise query the tool server. Dedup is by filename either way.
pub async fn enrich_retrieval(
    probe: Option<&ProbeResult>,
    intended_collection: Option<&str>,
    prompt: &str,
    relay: &dyn ToolRelay,
    top_k: usize,
) -> EngineResult<Vec<RetrievedDocument>> {
    if let (Some(probe), Some(collection)) = (probe, intended_collection) {
        let from_collection: Vec<&crate::engine::probe::ProbeHit> =
            probe.hits.iter().filter(|h| h.collection == collection).collect();
        if from_collection.len() >= 2 {
            debug!("[knowledge] reusing {} probe hit(s) from '{}'", from_collection.len(), collection);
            let mut docs: Vec<RetrievedDocument> = Vec::new();
            for hit in from_collection {
                let file = hit
                    .meta
                    .get("file")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&hit.doc_id)
                    .to_string();
                if docs.iter().any(|d| d.file == file) {
                    continue;
                }
                let content = hit
                    .meta
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                docs.push(RetrievedDocument { file, content, score: hit.score });
            }
            return Ok(docs);
        }
    }

    let result = relay
        .call("embedding_query", &json!({"query": prompt, "top_k": top_k}))
        .await?;
    let mut docs: Vec<RetrievedDocument> = Vec::new();
    if let Some(hits) = result.get("hits").and_then(|v| v.as_array()) {
        for hit in hits {
            let file = hit["file"].as_str().unwrap_or_default().to_string();
            if file.is_empty() || docs.iter().any(|d| d.file == file) {
                continue;
            }
            docs.push(RetrievedDocument {
                file,
                content: hit["content"].as_str().unwrap_or_default().to_string(),
                score: hit["score"].as_f64().unwrap_or(0.0) as f32,
            });
        }
    }
    Ok(docs)
}

// ── Ingestion detection ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum IngestionDecision {
    /// Explicit save request: write and embed now.
    SaveNow { category: String },
    /// Auto-detected candidate: tag the packet so the response offers it.
    OfferSave { category: String },
    None,
}

fn explicit_save_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(remember this|save this|add (this |these )?to (your |the )?knowledge)")
            .unwrap()
    })
}

/// Crude entity density: share of capitalized non-initial words.
fn entity_density(text: &str) -> f64 {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < 2 {
        return 0.0;
    }
    let caps = words
        .iter()
        .skip(1)
        .filter(|w| w.chars().next().map(|c| c.is_uppercase()).unwrap_or(false))
        .count();
    caps as f64 / (words.len() - 1) as f64
}

fn classify_category(text: &str) -> String {
    let lower = text.to_lowercase();
    if lower.contains("birthday") || lower.contains("my name") || lower.contains("i live") {
        "personal".to_string()
    } else if lower.contains("deploy") || lower.contains("server") || lower.contains("config") {
        "operations".to_string()
    } else if lower.contains("poem") || lower.contains("book") || lower.contains("stanza") {
        "literature".to_string()
    } else {
        "general".to_string()
    }
}

/// Decide whether this turn should ingest knowledge. The near-duplicate
/// check embeds only the head of the content.
pub async fn detect_ingestion(
    prompt: &str,
    active_kb: Option<&str>,
    relay: &dyn ToolRelay,
) -> EngineResult<IngestionDecision> {
    let explicit = explicit_save_re().is_match(prompt.trim());
    let auto = !explicit
        && active_kb.is_some()
        && prompt.chars().count() > 300
        && entity_density(prompt) > 0.15;
    if !explicit && !auto {
        return Ok(IngestionDecision::None);
    }

    // Near-duplicate probe against what's already stored
    let head: String = prompt.chars().take(KNOWLEDGE_DUPLICATE_PROBE_CHARS).collect();
    let result = relay.call("embedding_query", &json!({"query": head, "top_k": 1})).await;
    if let Ok(v) = result {
        let top_sim = v["hits"]
            .as_array()
            .and_then(|hits| hits.first())
            .and_then(|h| h["score"].as_f64())
            .unwrap_or(0.0) as f32;
        if top_sim >= KNOWLEDGE_DUPLICATE_THRESHOLD {
            info!("[knowledge] near-duplicate (sim {:.2}) — skipping ingestion", top_sim);
            return Ok(IngestionDecision::None);
        }
    }

    let category = classify_category(prompt);
    if explicit {
        Ok(IngestionDecision::SaveNow { category })
    } else {
        Ok(IngestionDecision::OfferSave { category })
    }
}

/// Perform the explicit save: write the document and embed it.
pub async fn save_knowledge(
    content: &str,
    category: &str,
    relay: &dyn ToolRelay,
) -> EngineResult<String> {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let path = format!("/knowledge/{category}/{stamp}.md");
    relay
        .call("write_file", &json!({"path": path, "content": content}))
        .await?;
    relay.call("embed_documents", &json!({"paths": [path]})).await?;
    info!("[knowledge] saved and embedded {}", path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::error::EngineError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedRelay {
        responses: Mutex<Vec<Value>>,
        pub calls: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedRelay {
        fn new(responses: Vec<Value>) -> Self {
            ScriptedRelay {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolRelay for ScriptedRelay {
        async fn call(&self, tool: &str, params: &Value) -> EngineResult<Value> {
            self.calls.lock().push((tool.to_string(), params.clone()));
            self.responses
                .lock()
                .pop()
                .ok_or_else(|| EngineError::tool(tool, "no scripted response"))
        }
    }

    fn kbs() -> BTreeMap<String, KnowledgeBaseConfig> {
        let mut m = BTreeMap::new();
        m.insert(
            "poetry".to_string(),
            KnowledgeBaseConfig { persona: "archivist".into(), keywords: vec!["poem".into(), "stanza".into()] },
        );
        m
    }

    #[test]
    fn test_persona_from_probe() {
        let probe = ProbeResult { primary_collection: Some("poetry".into()), ..Default::default() };
        let got = select_persona(Some(&probe), "whatever", &kbs());
        assert_eq!(got, Some(("poetry".into(), "archivist".into())));
    }

    #[test]
    fn test_persona_keyword_fallback() {
        let got = select_persona(None, "what rhymes in that stanza?", &kbs());
        assert_eq!(got, Some(("poetry".into(), "archivist".into())));
        assert_eq!(select_persona(None, "how is the weather", &kbs()), None);
    }

    #[tokio::test]
    async fn test_enrich_reuses_probe_hits() {
        use crate::engine::probe::ProbeHit;
        let probe = ProbeResult {
            primary_collection: Some("poetry".into()),
            hits: vec![
                ProbeHit {
                    collection: "poetry".into(),
                    doc_id: "raven.md".into(),
                    score: 0.8,
                    phrase: "The Raven".into(),
                    meta: json!({"file": "raven.md", "content": "nevermore"}),
                },
                ProbeHit {
                    collection: "poetry".into(),
                    doc_id: "raven.md".into(),
                    score: 0.7,
                    phrase: "Poe".into(),
                    meta: json!({"file": "raven.md", "content": "nevermore"}),
                },
                ProbeHit {
                    collection: "poetry".into(),
                    doc_id: "bells.md".into(),
                    score: 0.6,
                    phrase: "The Bells".into(),
                    meta: json!({"file": "bells.md", "content": "tintinnabulation"}),
                },
            ],
            ..Default::default()
        };
        let relay = ScriptedRelay::new(vec![]);
        let docs = enrich_retrieval(Some(&probe), Some("poetry"), "prompt", &relay, 5)
            .await
            .unwrap();
        // Deduped by filename, no relay call made
        assert_eq!(docs.len(), 2);
        assert!(relay.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_enrich_queries_when_probe_thin() {
        let relay = ScriptedRelay::new(vec![json!({
            "hits": [
                {"file": "tides.md", "content": "high at noon", "score": 0.6},
                {"file": "tides.md", "content": "dup", "score": 0.5}
            ]
        })]);
        let docs = enrich_retrieval(None, None, "tide tables", &relay, 5).await.unwrap();
        assert_eq!(docs.len(), 1, "filename dedup applies to relay results too");
        assert_eq!(relay.calls.lock()[0].0, "embedding_query");
    }

    #[tokio::test]
    async fn test_explicit_save_detected() {
        let relay = ScriptedRelay::new(vec![json!({"hits": []})]);
        let decision = detect_ingestion("Remember this: my cat is named Ada", None, &relay)
            .await
            .unwrap();
        assert!(matches!(decision, IngestionDecision::SaveNow { .. }));
    }

    #[tokio::test]
    async fn test_near_duplicate_suppresses_save() {
        let relay = ScriptedRelay::new(vec![json!({"hits": [{"file": "x.md", "score": 0.9}]})]);
        let decision = detect_ingestion("Remember this: my cat is named Ada", None, &relay)
            .await
            .unwrap();
        assert_eq!(decision, IngestionDecision::None);
    }

    #[tokio::test]
    async fn test_auto_detect_requires_density_and_kb() {
        let relay = ScriptedRelay::new(vec![json!({"hits": []})]);
        let long_dense = "The Lighthouse Preservation Society met with Director Helena Marsh and \
            Engineer Tom Okafor at Cape Espichel on Tuesday. They reviewed the Fresnel Lens \
            restoration plan, the Lantern Room repairs, and the Keeper Quarters budget approved \
            by the Setubal Council. Further visits to Cabo Sardao and Cabo Carvoeiro are planned \
            with the Maritime Heritage Board before the October storm season begins in earnest."
            .to_string();
        let decision = detect_ingestion(&long_dense, Some("maritime"), &relay).await.unwrap();
        assert!(matches!(decision, IngestionDecision::OfferSave { .. }), "got {decision:?}");

        // Without an active KB the auto path never fires
        let relay = ScriptedRelay::new(vec![]);
        let decision = detect_ingestion(&long_dense, None, &relay).await.unwrap();
        assert_eq!(decision, IngestionDecision::None);
    }

    #[tokio::test]
    async fn test_save_knowledge_writes_then_embeds() {
        let relay = ScriptedRelay::new(vec![json!("ok"), json!("ok")]);
        let path = save_knowledge("my cat is named Ada", "personal", &relay).await.unwrap();
        assert!(path.starts_with("/knowledge/personal/"));
        let calls = relay.calls.lock();
        assert_eq!(calls[0].0, "write_file");
        assert_eq!(calls[1].0, "embed_documents");
    }
}
