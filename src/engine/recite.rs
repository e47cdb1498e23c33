// Keystone Engine — Recitation Helper
// Verbatim-text requests ("recite the first three stanzas…") that miss the
// local collections go to the web: build a full-text query from the probe
// phrases, search, fetch the best trusted hit, and validate that what came
// back is substantial enough to recite from.

use crate::atoms::error::EngineResult;
use crate::engine::tool_routing::ToolRelay;
use log::{debug, info};
use serde_json::json;

/// Minimum plausible length for fetched source text.
const MIN_SOURCE_CHARS: usize = 200;

/// Build the search query: the work/author phrases the probe extracted,
/// with "full text" appended so results favor primary sources.
pub fn build_query(prompt: &str, phrases: &[String]) -> String {
    let mut parts: Vec<String> = phrases
        .iter()
        .filter(|p| p.chars().next().map(|c| c.is_uppercase()).unwrap_or(false))
        .take(3)
        .cloned()
        .collect();
    if parts.is_empty() {
        // Fall back to the prompt minus the instruction verbs
        parts = prompt
            .split_whitespace()
            .filter(|w| {
                !matches!(
                    w.to_lowercase().trim_matches(|c: char| !c.is_alphanumeric()),
                    "recite" | "quote" | "the" | "first" | "of" | "stanzas" | "stanza" | "lines"
                )
            })
            .take(6)
            .map(String::from)
            .collect();
    }
    parts.push("full text".to_string());
    parts.join(" ")
}

/// Whether fetched content is usable as a recitation source.
pub fn validate_source(text: &str) -> bool {
    text.chars().count() > MIN_SOURCE_CHARS
}

/// Run the search-then-fetch path. Returns the source text when a usable
/// one was found; None is a normal outcome (the model declines honestly).
pub async fn fetch_source(
    relay: &dyn ToolRelay,
    prompt: &str,
    phrases: &[String],
) -> EngineResult<Option<String>> {
    let query = build_query(prompt, phrases);
    info!("[recite] searching for source: '{}'", query);

    let search = relay
        .call("web_search", &json!({"query": query, "max_results": 5}))
        .await?;
    let Some(results) = search["results"].as_array() else {
        return Ok(None);
    };

    for result in results {
        let Some(url) = result["url"].as_str() else { continue };
        match relay.call("web_fetch", &json!({"url": url})).await {
            Ok(page) => {
                let text = page["text"].as_str().unwrap_or_default();
                if validate_source(text) {
                    info!("[recite] usable source from {}", url);
                    return Ok(Some(text.to_string()));
                }
                debug!("[recite] {} too thin ({} chars)", url, text.len());
            }
            Err(e) => debug!("[recite] fetch of {} failed: {}", url, e),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::error::EngineError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    #[test]
    fn test_build_query_from_phrases() {
        let phrases = vec!["The Raven".to_string(), "Edgar Allan Poe".to_string()];
        let q = build_query("Recite the first three stanzas of The Raven", &phrases);
        assert_eq!(q, "The Raven Edgar Allan Poe full text");
    }

    #[test]
    fn test_build_query_without_phrases() {
        let q = build_query("recite Ozymandias please", &[]);
        assert!(q.contains("Ozymandias"));
        assert!(q.ends_with("full text"));
        assert!(!q.to_lowercase().starts_with("recite"));
    }

    #[test]
    fn test_validate_source() {
        assert!(!validate_source("too short"));
        let poem = "Once upon a midnight dreary, while I pondered, weak and weary, ".repeat(5);
        assert!(validate_source(&poem));
    }

    struct ScriptedRelay {
        responses: Mutex<Vec<Value>>,
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolRelay for ScriptedRelay {
        async fn call(&self, tool: &str, _params: &Value) -> crate::atoms::error::EngineResult<Value> {
            self.calls.lock().push(tool.to_string());
            self.responses
                .lock()
                .pop()
                .ok_or_else(|| EngineError::tool(tool, "no scripted response"))
        }
    }

    #[tokio::test]
    async fn test_fetch_source_happy_path() {
        let poem = format!(
            "Once upon a midnight dreary, while I pondered, weak and weary {}",
            "over many a quaint and curious volume of forgotten lore ".repeat(5)
        );
        let relay = ScriptedRelay {
            responses: Mutex::new(vec![
                serde_json::json!({"text": poem, "url": "https://gutenberg.org/raven", "truncated": false}),
                serde_json::json!({"results": [{"url": "https://gutenberg.org/raven", "title": "The Raven", "snippet": "", "tier": "trusted"}]}),
            ]),
            calls: Mutex::new(Vec::new()),
        };
        let phrases = vec!["The Raven".to_string(), "Edgar Allan Poe".to_string()];
        let source = fetch_source(&relay, "Recite the first three stanzas of The Raven", &phrases)
            .await
            .unwrap()
            .unwrap();
        assert!(source.contains("midnight dreary"));
        assert_eq!(*relay.calls.lock(), vec!["web_search", "web_fetch"]);
    }

    #[tokio::test]
    async fn test_fetch_source_rejects_thin_pages() {
        let relay = ScriptedRelay {
            responses: Mutex::new(vec![
                serde_json::json!({"text": "404", "url": "https://x", "truncated": false}),
                serde_json::json!({"results": [{"url": "https://en.wikipedia.org/raven", "title": "", "snippet": "", "tier": "trusted"}]}),
            ]),
            calls: Mutex::new(Vec::new()),
        };
        let out = fetch_source(&relay, "recite the raven", &[]).await.unwrap();
        assert!(out.is_none());
    }
}
