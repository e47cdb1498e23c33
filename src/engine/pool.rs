// Keystone Engine — Model Pool
// Owns every backend handle plus the role→name alias map. Roles ("prime",
// "lite") resolve through the alias chain and fall back down a configured
// list when an entry is unavailable, so callers never hard-code a backend.
//
// GPU release demotes vLLM-backed entries in place (names stashed for
// restore) rather than dropping them; reclaim reloads the same entries and
// leaves the alias map exactly as it was.

use crate::atoms::config::{BackendKind, PlatformConfig};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::providers::{build_backend, EmbedBackend, ModelBackend, TextEmbedder, TokenUsage};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Unloaded,
    Ready,
    Busy,
    GpuReleased,
}

struct PoolEntry {
    backend: Arc<dyn ModelBackend>,
    status: ModelStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub gpu_released: bool,
    pub gpu_models_loaded: Vec<String>,
    pub statuses: BTreeMap<String, ModelStatus>,
    pub aliases: BTreeMap<String, String>,
}

pub struct ModelPool {
    entries: Mutex<HashMap<String, PoolEntry>>,
    aliases: Mutex<BTreeMap<String, String>>,
    fallback_chains: BTreeMap<String, Vec<String>>,
    /// Names demoted by release_gpu(), kept for reclaim.
    stashed: Mutex<Vec<String>>,
    embedder: Option<Arc<EmbedBackend>>,
    usage_totals: Mutex<HashMap<String, TokenUsage>>,
}

impl ModelPool {
    /// Build the pool from config. Backends are constructed eagerly but not
    /// loaded; `ensure_model_loaded` is lazy and idempotent.
    pub fn from_config(cfg: &PlatformConfig) -> EngineResult<Self> {
        let mut entries = HashMap::new();
        let mut embedder = None;
        for (name, model_cfg) in &cfg.model_configs {
            if model_cfg.backend == BackendKind::Embedder {
                embedder = Some(Arc::new(EmbedBackend::new(name, model_cfg)));
                continue;
            }
            let backend = build_backend(name, model_cfg)?;
            entries.insert(name.clone(), PoolEntry { backend, status: ModelStatus::Unloaded });
        }
        info!("[pool] built {} backend(s), embedder={}", entries.len(), embedder.is_some());
        Ok(ModelPool {
            entries: Mutex::new(entries),
            aliases: Mutex::new(cfg.model_aliases.clone()),
            fallback_chains: cfg.fallback_chains.clone(),
            stashed: Mutex::new(Vec::new()),
            embedder,
            usage_totals: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        backends: Vec<(String, Arc<dyn ModelBackend>)>,
        aliases: BTreeMap<String, String>,
        fallback_chains: BTreeMap<String, Vec<String>>,
    ) -> Self {
        let entries = backends
            .into_iter()
            .map(|(name, backend)| (name, PoolEntry { backend, status: ModelStatus::Ready }))
            .collect();
        ModelPool {
            entries: Mutex::new(entries),
            aliases: Mutex::new(aliases),
            fallback_chains,
            stashed: Mutex::new(Vec::new()),
            embedder: None,
            usage_totals: Mutex::new(HashMap::new()),
        }
    }

    pub fn embedder(&self) -> Option<Arc<dyn TextEmbedder>> {
        self.embedder.clone().map(|e| e as Arc<dyn TextEmbedder>)
    }

    /// Resolve a role through the alias map ("prime" → "gpu_prime").
    pub fn resolve_alias(&self, role: &str) -> String {
        self.aliases.lock().get(role).cloned().unwrap_or_else(|| role.to_string())
    }

    /// Lazy-load by name. Idempotent; reports failure without poisoning the
    /// entry.
    pub async fn ensure_model_loaded(&self, name: &str) -> EngineResult<()> {
        let backend = {
            let entries = self.entries.lock();
            let entry = entries
                .get(name)
                .ok_or_else(|| EngineError::Config(format!("unknown model '{name}'")))?;
            if entry.status == ModelStatus::Ready || entry.status == ModelStatus::Busy {
                return Ok(());
            }
            if entry.status == ModelStatus::GpuReleased {
                return Err(EngineError::State(format!("'{name}' is demoted while GPU is released")));
            }
            entry.backend.clone()
        };
        backend.ensure_loaded().await?;
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.status = ModelStatus::Ready;
        }
        Ok(())
    }

    /// The fallback chain for a role, filtered to entries that can serve
    /// right now (not demoted). First usable candidate is the primary.
    pub fn candidates_for_role(&self, role: &str) -> Vec<(String, Arc<dyn ModelBackend>)> {
        let chain: Vec<String> = self
            .fallback_chains
            .get(role)
            .cloned()
            .unwrap_or_else(|| vec![self.resolve_alias(role)]);
        let entries = self.entries.lock();
        let mut seen = HashSet::new();
        chain
            .into_iter()
            .filter(|name| seen.insert(name.clone()))
            .filter_map(|name| {
                let entry = entries.get(&name)?;
                if entry.status == ModelStatus::GpuReleased {
                    return None;
                }
                Some((name, entry.backend.clone()))
            })
            .collect()
    }

    /// Resolve a role to one usable backend, marking GPU-backed entries
    /// busy. Falls through the chain on load failure.
    pub async fn acquire_for_role(&self, role: &str) -> EngineResult<(String, Arc<dyn ModelBackend>)> {
        for (name, backend) in self.candidates_for_role(role) {
            {
                let entries = self.entries.lock();
                if let Some(entry) = entries.get(&name) {
                    // Local GPU entries serve one stream at a time
                    if entry.status == ModelStatus::Busy && backend.gpu_backed() {
                        continue;
                    }
                }
            }
            match self.ensure_model_loaded(&name).await {
                Ok(()) => {
                    if backend.gpu_backed() {
                        if let Some(entry) = self.entries.lock().get_mut(&name) {
                            entry.status = ModelStatus::Busy;
                        }
                    }
                    return Ok((name, backend));
                }
                Err(e) => {
                    warn!("[pool] '{}' unavailable for role '{}': {}", name, role, e);
                }
            }
        }
        Err(EngineError::Provider {
            provider: role.to_string(),
            message: "no backend in the fallback chain is available".to_string(),
        })
    }

    /// Mark an entry idle again.
    pub fn release(&self, name: &str) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            if entry.status == ModelStatus::Busy {
                entry.status = ModelStatus::Ready;
            }
        }
    }

    /// Demote every GPU-backed entry. Names are stashed so reclaim_gpu can
    /// restore exactly what was released.
    pub fn release_gpu(&self) -> Vec<String> {
        let mut released = Vec::new();
        {
            let mut entries = self.entries.lock();
            for (name, entry) in entries.iter_mut() {
                if entry.backend.gpu_backed() && entry.status != ModelStatus::GpuReleased {
                    entry.status = ModelStatus::GpuReleased;
                    released.push(name.clone());
                }
            }
        }
        *self.stashed.lock() = released.clone();
        info!("[pool] gpu released, demoted: {:?}", released);
        released
    }

    /// Reload previously released entries and restore their status. The
    /// alias map was never touched, so role resolution is back to its
    /// pre-release state once the entries are ready.
    pub async fn reclaim_gpu(&self) -> EngineResult<Vec<String>> {
        let stashed: Vec<String> = self.stashed.lock().drain(..).collect();
        for name in &stashed {
            {
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get_mut(name) {
                    entry.status = ModelStatus::Unloaded;
                }
            }
            if let Err(e) = self.ensure_model_loaded(name).await {
                warn!("[pool] reclaim: '{}' not yet loadable: {}", name, e);
            }
        }
        info!("[pool] gpu reclaimed, restored: {:?}", stashed);
        Ok(stashed)
    }

    /// Record per-model token usage (logged totals, served by /gpu/status).
    pub fn record_usage(&self, name: &str, usage: &TokenUsage) {
        let mut totals = self.usage_totals.lock();
        let t = totals.entry(name.to_string()).or_default();
        t.input_tokens += usage.input_tokens;
        t.output_tokens += usage.output_tokens;
        t.total_tokens += usage.total_tokens;
    }

    pub fn usage_total(&self, name: &str) -> TokenUsage {
        self.usage_totals.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let entries = self.entries.lock();
        let statuses: BTreeMap<String, ModelStatus> =
            entries.iter().map(|(k, v)| (k.clone(), v.status)).collect();
        let gpu_models_loaded = entries
            .iter()
            .filter(|(_, v)| v.backend.gpu_backed() && v.status != ModelStatus::GpuReleased)
            .map(|(k, _)| k.clone())
            .collect();
        let gpu_released = entries
            .iter()
            .any(|(_, v)| v.status == ModelStatus::GpuReleased);
        PoolSnapshot {
            gpu_released,
            gpu_models_loaded,
            statuses,
            aliases: self.aliases.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::providers::testing::ScriptedBackend;
    use crate::engine::providers::{ChatMessage, ChatRequest};

    fn test_pool() -> ModelPool {
        let prime: Arc<dyn ModelBackend> =
            Arc::new(ScriptedBackend::new("gpu_prime", vec!["prime says hi"]).gpu());
        let lite: Arc<dyn ModelBackend> =
            Arc::new(ScriptedBackend::new("cpu_lite", vec!["lite says hi"]));
        let mut aliases = BTreeMap::new();
        aliases.insert("prime".to_string(), "gpu_prime".to_string());
        aliases.insert("lite".to_string(), "cpu_lite".to_string());
        let mut chains = BTreeMap::new();
        chains.insert("prime".to_string(), vec!["gpu_prime".to_string(), "cpu_lite".to_string()]);
        chains.insert("lite".to_string(), vec!["cpu_lite".to_string()]);
        ModelPool::for_tests(
            vec![("gpu_prime".to_string(), prime), ("cpu_lite".to_string(), lite)],
            aliases,
            chains,
        )
    }

    #[tokio::test]
    async fn test_acquire_resolves_alias_chain() {
        let pool = test_pool();
        let (name, backend) = pool.acquire_for_role("prime").await.unwrap();
        assert_eq!(name, "gpu_prime");
        let text = backend.chat(ChatRequest::new(vec![ChatMessage::user("hi")])).await.unwrap();
        assert_eq!(text, "prime says hi");
        pool.release(&name);
    }

    #[tokio::test]
    async fn test_release_gpu_falls_back_to_lite() {
        let pool = test_pool();
        let released = pool.release_gpu();
        assert_eq!(released, vec!["gpu_prime".to_string()]);

        let (name, _) = pool.acquire_for_role("prime").await.unwrap();
        assert_eq!(name, "cpu_lite", "prime role must fall through to lite while released");

        let snap = pool.snapshot();
        assert!(snap.gpu_released);
        assert!(snap.gpu_models_loaded.is_empty());
    }

    #[tokio::test]
    async fn test_release_then_reclaim_restores_aliases() {
        let pool = test_pool();
        let before = pool.snapshot().aliases;
        pool.release_gpu();
        let restored = pool.reclaim_gpu().await.unwrap();
        assert_eq!(restored, vec!["gpu_prime".to_string()]);
        let after = pool.snapshot().aliases;
        assert_eq!(before, after, "alias map must survive a release/reclaim cycle");
        let (name, _) = pool.acquire_for_role("prime").await.unwrap();
        assert_eq!(name, "gpu_prime");
    }

    #[tokio::test]
    async fn test_busy_gpu_entry_is_skipped() {
        let pool = test_pool();
        let (first, _) = pool.acquire_for_role("prime").await.unwrap();
        assert_eq!(first, "gpu_prime");
        // Second acquisition while prime is busy falls through the chain
        let (second, _) = pool.acquire_for_role("prime").await.unwrap();
        assert_eq!(second, "cpu_lite");
        pool.release(&first);
        let (third, _) = pool.acquire_for_role("prime").await.unwrap();
        assert_eq!(third, "gpu_prime");
    }

    #[tokio::test]
    async fn test_usage_accounting() {
        let pool = test_pool();
        pool.record_usage("cpu_lite", &TokenUsage { input_tokens: 5, output_tokens: 7, total_tokens: 12 });
        pool.record_usage("cpu_lite", &TokenUsage { input_tokens: 1, output_tokens: 2, total_tokens: 3 });
        let total = pool.usage_total("cpu_lite");
        assert_eq!(total.total_tokens, 15);
    }
}
