// Keystone Tool Server — Embedding Capabilities
// embedding_query reads the knowledge collections directly (read-only);
// embed_documents is forwarded to the training service, which is the sole
// writer of vector indices.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::providers::TextEmbedder;
use crate::engine::vectors::VectorIndex;
use crate::shared::layout::SharedVolume;
use log::debug;
use serde_json::{json, Value};
use std::time::Duration;

/// Rank every knowledge collection against the query; results carry file
/// metadata and scores, flattened and sorted best-first.
pub async fn embedding_query(
    volume: &SharedVolume,
    embedder: &dyn TextEmbedder,
    query: &str,
    top_k: usize,
) -> EngineResult<Value> {
    let vector = embedder.embed(query).await?;
    let dir = volume.knowledge_vectors_dir();
    let mut hits: Vec<Value> = Vec::new();
    if dir.is_dir() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let collection = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let index = VectorIndex::open(&path)?;
            for hit in index.query(&vector, top_k) {
                hits.push(json!({
                    "collection": collection,
                    "file": hit.meta.get("file").and_then(|f| f.as_str()).unwrap_or(&hit.id),
                    "content": hit.meta.get("content").and_then(|c| c.as_str()).unwrap_or(""),
                    "score": hit.score,
                }));
            }
        }
    }
    hits.sort_by(|a, b| {
        b["score"]
            .as_f64()
            .partial_cmp(&a["score"].as_f64())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(top_k);
    debug!("[tools] embedding_query '{}' → {} hit(s)", query, hits.len());
    Ok(json!({ "hits": hits }))
}

/// Relay document embedding to the trainer's index writer.
pub async fn embed_documents(
    client: &reqwest::Client,
    trainer_url: &str,
    paths: &[String],
) -> EngineResult<Value> {
    let url = format!("{}/index/embed", trainer_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .timeout(Duration::from_secs(60))
        .json(&json!({ "paths": paths }))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(EngineError::tool(
            "embed_documents",
            format!("trainer returned HTTP {}", response.status().as_u16()),
        ));
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::providers::testing::HashEmbedder;

    #[tokio::test]
    async fn test_query_ranks_across_collections() {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        volume.ensure_dirs().unwrap();

        let embedder = HashEmbedder;
        let poem_vec = embedder.embed("the raven poem").await.unwrap();
        let ops_vec = embedder.embed("deployment runbook").await.unwrap();

        let mut poetry = VectorIndex::open(&volume.knowledge_vector_file("poetry")).unwrap();
        poetry.add("raven.md", poem_vec, json!({"file": "raven.md", "content": "nevermore"}));
        poetry.save().unwrap();
        let mut ops = VectorIndex::open(&volume.knowledge_vector_file("ops")).unwrap();
        ops.add("runbook.md", ops_vec, json!({"file": "runbook.md", "content": "restart it"}));
        ops.save().unwrap();

        let out = embedding_query(&volume, &embedder, "the raven poem", 2).await.unwrap();
        let hits = out["hits"].as_array().unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0]["file"], "raven.md", "identical text must rank first");
    }

    #[tokio::test]
    async fn test_query_with_no_collections() {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        volume.ensure_dirs().unwrap();
        let out = embedding_query(&volume, &HashEmbedder, "anything", 5).await.unwrap();
        assert_eq!(out["hits"].as_array().unwrap().len(), 0);
    }
}
