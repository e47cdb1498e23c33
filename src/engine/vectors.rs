// Keystone Engine — Flat Vector Index
// A small embedded cosine store, one JSON file per collection. The embedding
// model is injected by the caller; this layer only stores and ranks vectors.
// A flat scan is acceptable at current scale (hundreds of entries per
// session, thousands per knowledge base).

use crate::atoms::error::EngineResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub meta: Value,
}

#[derive(Debug)]
pub struct VectorIndex {
    path: PathBuf,
    entries: Vec<VectorEntry>,
}

impl VectorIndex {
    /// Open an index file, or start empty when it doesn't exist yet.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };
        Ok(VectorIndex { path: path.to_path_buf(), entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace by id.
    pub fn add(&mut self, id: &str, vector: Vec<f32>, meta: Value) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.id == id) {
            existing.vector = vector;
            existing.meta = meta;
        } else {
            self.entries.push(VectorEntry { id: id.to_string(), vector, meta });
        }
    }

    /// Rank all entries against the query vector, best first.
    pub fn query(&self, vector: &[f32], top_k: usize) -> Vec<VectorHit> {
        let mut hits: Vec<VectorHit> = self
            .entries
            .iter()
            .map(|e| VectorHit {
                id: e.id.clone(),
                score: cosine_similarity(vector, &e.vector),
                meta: e.meta.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        hits
    }

    /// Persist to the index file (write-then-rename so readers never see a
    /// torn file).
    pub fn save(&self) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(&self.entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Cosine similarity of two vectors; 0.0 when dimensions mismatch or either
/// side has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_add_query_ordering() {
        let tmp = tempfile::tempdir().unwrap();
        let mut idx = VectorIndex::open(&tmp.path().join("idx.json")).unwrap();
        idx.add("exact", vec![1.0, 0.0, 0.0], json!({"file": "a.md"}));
        idx.add("near", vec![0.9, 0.1, 0.0], json!({"file": "b.md"}));
        idx.add("far", vec![0.0, 0.0, 1.0], json!({"file": "c.md"}));

        let hits = idx.query(&[1.0, 0.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "exact");
        assert_eq!(hits[1].id, "near");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_add_replaces_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        let mut idx = VectorIndex::open(&tmp.path().join("idx.json")).unwrap();
        idx.add("doc", vec![1.0, 0.0], json!({"v": 1}));
        idx.add("doc", vec![0.0, 1.0], json!({"v": 2}));
        assert_eq!(idx.len(), 1);
        let hits = idx.query(&[0.0, 1.0], 1);
        assert_eq!(hits[0].meta["v"], 2);
    }

    #[test]
    fn test_save_and_reopen_lossless() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("idx.json");
        {
            let mut idx = VectorIndex::open(&path).unwrap();
            idx.add("doc", vec![0.5, 0.5], json!({"file": "a.md"}));
            idx.save().unwrap();
        }
        let idx = VectorIndex::open(&path).unwrap();
        assert_eq!(idx.len(), 1);
        let hits = idx.query(&[0.5, 0.5], 1);
        assert_eq!(hits[0].id, "doc");
        assert!(hits[0].score > 0.99);
    }
}
