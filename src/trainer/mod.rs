// Keystone Trainer — training/index service surface.
// The platform's sole writer of vector indices and adapter artifacts.
// Training-loop internals are out of scope here; what this service owns is
// the handoff-readiness contract with the orchestrator and the index
// writer the tool server relays embed_documents to.

pub mod server;

use crate::atoms::config::{BackendKind, PlatformConfig};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::providers::{EmbedBackend, TextEmbedder};
use crate::engine::vectors::VectorIndex;
use crate::shared::layout::SharedVolume;
use log::info;
use parking_lot::Mutex;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

pub struct Trainer {
    pub cfg: PlatformConfig,
    pub volume: SharedVolume,
    /// Whether the orchestrator has granted this service the GPU.
    gpu_held: Mutex<bool>,
    embedder: Option<Arc<EmbedBackend>>,
}

impl Trainer {
    pub fn new(cfg: PlatformConfig) -> EngineResult<Arc<Self>> {
        let volume = SharedVolume::new(cfg.shared_volume.clone());
        volume.ensure_dirs()?;
        let embedder = cfg
            .model_configs
            .iter()
            .find(|(_, m)| m.backend == BackendKind::Embedder)
            .map(|(name, m)| Arc::new(EmbedBackend::new(name, m)));
        Ok(Arc::new(Trainer { gpu_held: Mutex::new(false), embedder, volume, cfg }))
    }

    pub fn gpu_held(&self) -> bool {
        *self.gpu_held.lock()
    }

    /// Orchestrator says the device is drained and ours.
    pub fn gpu_ready(&self) {
        *self.gpu_held.lock() = true;
        info!("[trainer] gpu granted — study window open");
    }

    /// Orchestrator wants the device back; drop everything resident.
    pub fn gpu_release(&self) {
        *self.gpu_held.lock() = false;
        info!("[trainer] gpu released — caches cleared");
    }

    /// Embed documents into their knowledge collections. Collection names
    /// derive from the path layout /knowledge/<collection>/<file>.
    pub async fn embed_documents(&self, paths: &[String]) -> EngineResult<serde_json::Value> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| EngineError::Config("no embedder configured".into()))?;
        let mut embedded = 0usize;
        for raw in paths {
            let path = Path::new(raw);
            let content = std::fs::read_to_string(path)?;
            let collection = collection_for(path);
            let vector = embedder.embed(&content).await?;
            let index_path = self.volume.knowledge_vector_file(&collection);
            let mut index = VectorIndex::open(&index_path)?;
            let file_name =
                path.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default();
            index.add(
                &file_name,
                vector,
                json!({"file": file_name, "content": content.chars().take(2000).collect::<String>()}),
            );
            index.save()?;
            embedded += 1;
        }
        info!("[trainer] embedded {} document(s)", embedded);
        Ok(json!({"embedded": embedded}))
    }
}

fn collection_for(path: &Path) -> String {
    let mut components = path.components();
    // /knowledge/<collection>/... → <collection>
    while let Some(c) = components.next() {
        if c.as_os_str() == "knowledge" {
            if let Some(next) = components.next() {
                let name = next.as_os_str().to_string_lossy().to_string();
                if !name.contains('.') {
                    return name;
                }
            }
            break;
        }
    }
    "general".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_derivation() {
        assert_eq!(collection_for(Path::new("/knowledge/poetry/raven.md")), "poetry");
        assert_eq!(collection_for(Path::new("/knowledge/note.md")), "general");
        assert_eq!(collection_for(Path::new("/elsewhere/file.md")), "general");
    }

    #[test]
    fn test_gpu_handoff_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = PlatformConfig::default();
        cfg.shared_volume = tmp.path().to_path_buf();
        let trainer = Trainer::new(cfg).unwrap();
        assert!(!trainer.gpu_held());
        trainer.gpu_ready();
        assert!(trainer.gpu_held());
        trainer.gpu_release();
        assert!(!trainer.gpu_held());
    }
}
