// Keystone Engine — Intent Detection
// Three classifiers in preference order: the embedding exemplar bank when
// an embedder is reachable, Lite-based classification when a model is, and
// keyword heuristics as the floor that always answers.
//
// The result is a closed intent plus a read-only flag; the tool catalog a
// later step offers the selector depends on both.

use crate::atoms::config::EmbedIntentConfig;
use crate::atoms::packet::{DetectedIntent, IntentBlock};
use crate::engine::probe::ProbeResult;
use crate::engine::providers::{ChatMessage, ChatRequest, ModelBackend, TextEmbedder};
use crate::engine::vectors::cosine_similarity;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;

// ── Exemplar bank ──────────────────────────────────────────────────────────

/// Labeled exemplars for the embedding classifier. Three per intent keeps
/// the bank cheap to embed at first use.
const EXEMPLARS: &[(DetectedIntent, &[&str])] = &[
    (DetectedIntent::Chat, &[
        "how are you doing today",
        "tell me something interesting about lighthouses",
        "what do you think about this idea",
    ]),
    (DetectedIntent::Recite, &[
        "recite the first three stanzas of the raven",
        "quote the opening of moby dick word for word",
        "give me the full text of that sonnet",
    ]),
    (DetectedIntent::FileRead, &[
        "read the config file and tell me what's in it",
        "show me the contents of notes.md",
        "open the changelog and summarize it",
    ]),
    (DetectedIntent::FileWrite, &[
        "write that summary to a file called summary.txt",
        "save this list into todo.md",
        "create a file with these settings",
    ]),
    (DetectedIntent::Shell, &[
        "run ls on the knowledge directory",
        "execute df -h and show me disk usage",
        "run that command and give me the output",
    ]),
    (DetectedIntent::Search, &[
        "search the web for recent lighthouse restorations",
        "look up the current weather in lisbon",
        "find online sources about this poem",
    ]),
    (DetectedIntent::KnowledgeSave, &[
        "remember this for later",
        "save this into the knowledge base",
        "add these notes to what you know about the project",
    ]),
    (DetectedIntent::KnowledgeUpdate, &[
        "update what you know about the deployment process",
        "correct the knowledge entry about my birthday",
        "revise the saved notes on this topic",
    ]),
    (DetectedIntent::Introspect, &[
        "show me the engine logs from the last hour",
        "why did the orchestrator restart",
        "what is your gpu status right now",
    ]),
    (DetectedIntent::Reflection, &[
        "reflect on how this conversation has gone",
        "what have we accomplished this week",
        "summarize what you learned today",
    ]),
];

pub struct IntentDetector {
    cfg: EmbedIntentConfig,
    /// Exemplar embeddings, computed once per process on first use.
    bank: Mutex<Option<Vec<(DetectedIntent, Vec<f32>)>>>,
}

impl IntentDetector {
    pub fn new(cfg: EmbedIntentConfig) -> Self {
        IntentDetector { cfg, bank: Mutex::new(None) }
    }

    /// Classify the prompt. Falls through embed → LLM → keywords; keywords
    /// always produce an answer.
    pub async fn detect(
        &self,
        prompt: &str,
        probe: Option<&ProbeResult>,
        embedder: Option<&dyn TextEmbedder>,
        lite: Option<Arc<dyn ModelBackend>>,
    ) -> IntentBlock {
        if self.cfg.enabled {
            if let Some(embedder) = embedder {
                match self.classify_by_embedding(prompt, embedder).await {
                    Ok(Some(intent)) => return block_for(intent, prompt, probe),
                    Ok(None) => debug!("[intent] embedding classifier below threshold"),
                    Err(e) => warn!("[intent] embedding classifier unavailable: {e}"),
                }
            }
        }
        if let Some(lite) = lite {
            if let Some(intent) = classify_by_llm(prompt, lite).await {
                return block_for(intent, prompt, probe);
            }
        }
        block_for(classify_by_keywords(prompt), prompt, probe)
    }

    async fn classify_by_embedding(
        &self,
        prompt: &str,
        embedder: &dyn TextEmbedder,
    ) -> crate::atoms::error::EngineResult<Option<DetectedIntent>> {
        let query = embedder.embed(prompt).await?;

        // Build the bank lazily; hold the lock only around the cache check
        if self.bank.lock().is_none() {
            let mut bank = Vec::new();
            for (intent, examples) in EXEMPLARS {
                for ex in *examples {
                    bank.push((*intent, embedder.embed(ex).await?));
                }
            }
            *self.bank.lock() = Some(bank);
        }

        let bank = self.bank.lock();
        let bank = bank.as_ref().expect("bank populated above");

        let mut best: Option<(DetectedIntent, f32)> = None;
        for (intent, _) in EXEMPLARS {
            // Top-k average over this intent's exemplars
            let mut sims: Vec<f32> = bank
                .iter()
                .filter(|(i, _)| i == intent)
                .map(|(_, v)| cosine_similarity(&query, v))
                .collect();
            sims.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            sims.truncate(self.cfg.top_k);
            if sims.is_empty() {
                continue;
            }
            let avg = sims.iter().sum::<f32>() / sims.len() as f32;
            if best.map(|(_, s)| avg > s).unwrap_or(true) {
                best = Some((*intent, avg));
            }
        }
        Ok(best.and_then(|(intent, score)| {
            (score >= self.cfg.confidence_threshold).then_some(intent)
        }))
    }
}

fn block_for(intent: DetectedIntent, prompt: &str, probe: Option<&ProbeResult>) -> IntentBlock {
    let primary_goal = probe
        .and_then(|p| p.primary_collection.as_ref())
        .map(|c| format!("{intent:?} within {c}").to_lowercase())
        .unwrap_or_else(|| format!("{intent:?}").to_lowercase());
    IntentBlock {
        primary_goal,
        detected_intent: intent,
        read_only: !intent.is_mutating(),
    }
}

// ── LLM classifier ─────────────────────────────────────────────────────────

const INTENT_LABELS: &[(&str, DetectedIntent)] = &[
    ("chat", DetectedIntent::Chat),
    ("recite", DetectedIntent::Recite),
    ("file_read", DetectedIntent::FileRead),
    ("file_write", DetectedIntent::FileWrite),
    ("shell", DetectedIntent::Shell),
    ("search", DetectedIntent::Search),
    ("knowledge_save", DetectedIntent::KnowledgeSave),
    ("knowledge_update", DetectedIntent::KnowledgeUpdate),
    ("introspect", DetectedIntent::Introspect),
    ("reflection", DetectedIntent::Reflection),
    ("other", DetectedIntent::Other),
];

async fn classify_by_llm(prompt: &str, lite: Arc<dyn ModelBackend>) -> Option<DetectedIntent> {
    let labels: Vec<&str> = INTENT_LABELS.iter().map(|(l, _)| *l).collect();
    let req = ChatRequest {
        messages: vec![
            ChatMessage::system(format!(
                "Classify the user message into exactly one of: {}. Reply with the label only.",
                labels.join(", ")
            )),
            ChatMessage::user(prompt),
        ],
        temperature: Some(0.0),
        top_p: None,
        max_tokens: Some(8),
    };
    match lite.chat(req).await {
        Ok(reply) => {
            let label = reply.trim().to_lowercase();
            INTENT_LABELS
                .iter()
                .find(|(l, _)| label.contains(l))
                .map(|(_, intent)| *intent)
        }
        Err(e) => {
            warn!("[intent] llm classification failed: {e}");
            None
        }
    }
}

// ── Keyword floor ──────────────────────────────────────────────────────────

pub fn classify_by_keywords(prompt: &str) -> DetectedIntent {
    let lower = prompt.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has(&["recite", "full text", "word for word", "quote the"]) {
        DetectedIntent::Recite
    } else if has(&["update what you know", "correct the knowledge", "revise the saved"]) {
        DetectedIntent::KnowledgeUpdate
    } else if has(&["remember this", "save this", "add to your knowledge", "save to the knowledge"]) {
        DetectedIntent::KnowledgeSave
    } else if has(&["read the file", "read file", "show me the contents", "open the file", "what's in the file"]) {
        DetectedIntent::FileRead
    } else if has(&["write to", "write a file", "save into", "create a file", "write that to"]) {
        DetectedIntent::FileWrite
    } else if has(&["run ", "execute ", "shell"]) && has(&["command", "run ls", "df -", "script", "execute"]) {
        DetectedIntent::Shell
    } else if has(&["search the web", "look up", "search for", "find online", "google"]) {
        DetectedIntent::Search
    } else if has(&["your logs", "the logs", "gpu status", "why did the", "introspect", "engine status"]) {
        DetectedIntent::Introspect
    } else if has(&["reflect on", "what have we accomplished", "what did you learn"]) {
        DetectedIntent::Reflection
    } else {
        DetectedIntent::Chat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::providers::testing::ScriptedBackend;

    #[test]
    fn test_keyword_floor() {
        assert_eq!(classify_by_keywords("Recite the first stanza of The Raven"), DetectedIntent::Recite);
        assert_eq!(classify_by_keywords("read the file /etc/hosts please"), DetectedIntent::FileRead);
        assert_eq!(classify_by_keywords("search the web for tide tables"), DetectedIntent::Search);
        assert_eq!(classify_by_keywords("remember this: my cat is named Ada"), DetectedIntent::KnowledgeSave);
        assert_eq!(classify_by_keywords("good morning!"), DetectedIntent::Chat);
    }

    #[test]
    fn test_read_only_follows_intent() {
        let block = block_for(DetectedIntent::FileWrite, "write it", None);
        assert!(!block.read_only);
        let block = block_for(DetectedIntent::Recite, "recite it", None);
        assert!(block.read_only);
    }

    #[tokio::test]
    async fn test_llm_classifier_parses_label() {
        let lite: Arc<dyn ModelBackend> = Arc::new(ScriptedBackend::new("lite", vec!["file_read"]));
        let intent = classify_by_llm("open config and summarize", lite).await;
        assert_eq!(intent, Some(DetectedIntent::FileRead));
    }

    #[tokio::test]
    async fn test_llm_failure_falls_to_keywords() {
        let detector = IntentDetector::new(EmbedIntentConfig { enabled: false, ..Default::default() });
        let lite: Arc<dyn ModelBackend> = Arc::new(ScriptedBackend::failing("lite"));
        let block = detector
            .detect("search the web for tide tables", None, None, Some(lite))
            .await;
        assert_eq!(block.detected_intent, DetectedIntent::Search);
    }

    #[tokio::test]
    async fn test_embedding_classifier_with_hash_embedder() {
        use crate::engine::providers::testing::HashEmbedder;
        // The hash embedder maps identical text to identical vectors, so a
        // prompt that IS an exemplar classifies to that exemplar's intent.
        let detector = IntentDetector::new(EmbedIntentConfig::default());
        let block = detector
            .detect(
                "recite the first three stanzas of the raven",
                None,
                Some(&HashEmbedder),
                None,
            )
            .await;
        assert_eq!(block.detected_intent, DetectedIntent::Recite);
    }
}
