// Keystone Tool Server — capability execution behind one RPC entry point.
// File I/O under allowlisted roots, tokenized shell execution, domain-
// tiered web research, log introspection, embeddings, and the approval
// queue for everything sensitive.

pub mod approvals;
pub mod embed;
pub mod files;
pub mod logs;
pub mod rpc;
pub mod shell;
pub mod web;

use crate::atoms::config::{BackendKind, PlatformConfig};
use crate::atoms::error::EngineResult;
use crate::engine::providers::EmbedBackend;
use crate::shared::layout::SharedVolume;
use crate::shared::registry::ToolRegistry;
use crate::toolserver::approvals::ApprovalQueue;
use crate::toolserver::web::{HourlyRateLimiter, HtmlSearchProvider, SearchProvider};
use std::sync::Arc;

pub struct ToolServer {
    pub cfg: PlatformConfig,
    pub volume: SharedVolume,
    pub registry: ToolRegistry,
    pub approvals: ApprovalQueue,
    pub search_limiter: HourlyRateLimiter,
    pub fetch_limiter: HourlyRateLimiter,
    pub embedder: Option<Arc<EmbedBackend>>,
    pub search: Arc<dyn SearchProvider>,
    pub http: reqwest::Client,
}

impl ToolServer {
    pub fn new(cfg: PlatformConfig) -> EngineResult<Arc<Self>> {
        let volume = SharedVolume::new(cfg.shared_volume.clone());
        volume.ensure_dirs()?;
        let approvals = ApprovalQueue::open(&volume)?;
        let embedder = cfg
            .model_configs
            .iter()
            .find(|(_, m)| m.backend == BackendKind::Embedder)
            .map(|(name, m)| Arc::new(EmbedBackend::new(name, m)));
        Ok(Arc::new(ToolServer {
            search_limiter: HourlyRateLimiter::new(cfg.web_research.search_hourly_limit),
            fetch_limiter: HourlyRateLimiter::new(cfg.web_research.fetch_hourly_limit),
            registry: ToolRegistry::builtin(),
            approvals,
            embedder,
            search: Arc::new(HtmlSearchProvider::new()),
            http: reqwest::Client::new(),
            volume,
            cfg,
        }))
    }
}
