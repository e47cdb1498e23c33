// Keystone Engine — the cognition service.
// `Engine` wires the per-turn pipeline's collaborators together and owns
// the lifecycle orchestration around it: sleep/wake, GPU release/reclaim,
// checkpointing, and the scheduler tick.

pub mod council;
pub mod epistemic;
pub mod history;
pub mod intent;
pub mod knowledge;
pub mod loopdetect;
pub mod observer;
pub mod pipeline;
pub mod pool;
pub mod probe;
pub mod prompt;
pub mod providers;
pub mod recite;
pub mod server;
pub mod sessions;
pub mod sleep;
pub mod tool_routing;
pub mod vectors;

use crate::atoms::config::PlatformConfig;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::packet::{CognitionPacket, DataField, DataFieldKind};
use crate::engine::council::CouncilStore;
use crate::engine::history::HistoryReviewer;
use crate::engine::intent::IntentDetector;
use crate::engine::loopdetect::LoopDetector;
use crate::engine::pool::ModelPool;
use crate::engine::probe::SemanticProbe;
use crate::engine::providers::{ChatMessage, ChatRequest};
use crate::engine::sessions::SessionStore;
use crate::engine::sleep::SleepManager;
use crate::engine::tool_routing::{HttpToolRelay, ToolRelay};
use crate::engine::vectors::VectorIndex;
use crate::shared::layout::SharedVolume;
use crate::shared::registry::ToolRegistry;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Engine {
    pub cfg: PlatformConfig,
    pub volume: SharedVolume,
    pub sessions: SessionStore,
    pub pool: ModelPool,
    pub probe: SemanticProbe,
    pub intent: IntentDetector,
    pub history: HistoryReviewer,
    pub council: CouncilStore,
    pub sleep: SleepManager,
    pub loops: LoopDetector,
    pub registry: ToolRegistry,
    pub relay: Arc<dyn ToolRelay>,
    /// Knowledge-base collections, loaded once and refreshed by the
    /// scheduler tick. Arc'd so the probe can snapshot them without
    /// holding the lock across embed calls.
    pub knowledge_indices: Mutex<HashMap<String, Arc<VectorIndex>>>,
    /// Packets that arrived while sleeping; drained on wake.
    pub sleep_queue: Mutex<Vec<CognitionPacket>>,
    /// Wake context (council notes, checkpoints) waiting to be injected
    /// into the next processed turns.
    pub wake_fields: Mutex<Vec<DataField>>,
    pub http: reqwest::Client,
}

impl Engine {
    pub fn new(cfg: PlatformConfig) -> EngineResult<Arc<Self>> {
        let volume = SharedVolume::new(cfg.shared_volume.clone());
        volume.ensure_dirs()?;
        let sessions = SessionStore::open(volume.clone())?;
        let pool = ModelPool::from_config(&cfg)?;
        let relay: Arc<dyn ToolRelay> = Arc::new(HttpToolRelay::new(&cfg.services.tool_server));
        let engine = Engine {
            probe: SemanticProbe::new(cfg.semantic_probe.clone()),
            intent: IntentDetector::new(cfg.embed_intent.clone()),
            history: HistoryReviewer::new(cfg.history_review.clone()),
            council: CouncilStore::new(volume.clone(), cfg.council.clone()),
            sleep: SleepManager::new(volume.clone()),
            loops: LoopDetector::new(cfg.loop_detection.clone()),
            registry: ToolRegistry::builtin(),
            relay,
            knowledge_indices: Mutex::new(HashMap::new()),
            sleep_queue: Mutex::new(Vec::new()),
            wake_fields: Mutex::new(Vec::new()),
            http: reqwest::Client::new(),
            sessions,
            pool,
            volume,
            cfg,
        };
        engine.load_knowledge_indices()?;
        Ok(Arc::new(engine))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        cfg: PlatformConfig,
        volume: SharedVolume,
        pool: ModelPool,
        relay: Arc<dyn ToolRelay>,
    ) -> EngineResult<Arc<Self>> {
        volume.ensure_dirs()?;
        let sessions = SessionStore::open(volume.clone())?;
        Ok(Arc::new(Engine {
            probe: SemanticProbe::new(cfg.semantic_probe.clone()),
            intent: IntentDetector::new(cfg.embed_intent.clone()),
            history: HistoryReviewer::new(cfg.history_review.clone()),
            council: CouncilStore::new(volume.clone(), cfg.council.clone()),
            sleep: SleepManager::new(volume.clone()),
            loops: LoopDetector::new(cfg.loop_detection.clone()),
            registry: ToolRegistry::builtin(),
            relay,
            knowledge_indices: Mutex::new(HashMap::new()),
            sleep_queue: Mutex::new(Vec::new()),
            wake_fields: Mutex::new(Vec::new()),
            http: reqwest::Client::new(),
            sessions,
            pool,
            volume,
            cfg,
        }))
    }

    /// Load (or reload) every KB collection index from the shared volume.
    pub fn load_knowledge_indices(&self) -> EngineResult<()> {
        let mut indices = HashMap::new();
        for name in self.cfg.knowledge_bases.keys() {
            let path = self.volume.knowledge_vector_file(name);
            match VectorIndex::open(&path) {
                Ok(idx) => {
                    indices.insert(name.clone(), Arc::new(idx));
                }
                Err(e) => warn!("[engine] could not open KB index '{}': {}", name, e),
            }
        }
        info!("[engine] loaded {} knowledge collection(s)", indices.len());
        *self.knowledge_indices.lock() = indices;
        Ok(())
    }

    /// The session's vector index, opened on demand.
    pub fn session_index(&self, session_id: &str) -> EngineResult<VectorIndex> {
        VectorIndex::open(&self.volume.session_vector_file(session_id))
    }

    // ── Sleep / wake orchestration ─────────────────────────────────────────

    /// Drive the full entering-sleep sequence: checkpoint narratives, GPU
    /// release, orchestrator notification.
    pub async fn enter_sleep(&self) -> EngineResult<()> {
        self.sleep.begin_entering_sleep()?;
        let narrative = self.narrate_checkpoint().await;
        let lite_entry = "Went to sleep after a quiet stretch; queue drained.".to_string();
        self.sleep.complete_sleep(&narrative, &lite_entry)?;
        self.pool.release_gpu();
        self.notify_orchestrator("/handoff/prime-to-study").await;
        Ok(())
    }

    /// Drive the wake sequence and process anything that queued up.
    pub async fn wake(self: &Arc<Self>) -> EngineResult<()> {
        self.sleep.begin_wake()?;
        self.notify_orchestrator("/handoff/study-to-prime").await;
        if let Err(e) = self.pool.reclaim_gpu().await {
            warn!("[engine] gpu reclaim incomplete: {e}");
        }
        let ctx = self.sleep.complete_wake(&self.council)?;

        // Stash wake context as data fields for the next turns
        let mut fields = Vec::new();
        for note in &ctx.council_notes {
            fields.push(DataField {
                key: format!("council_note_{}", note.timestamp.format("%H%M%S")),
                value: json!(format!(
                    "While you slept: \"{}\" — Lite answered: {} (escalated: {})",
                    note.user_prompt, note.lite_quick_take, note.escalation_reason
                )),
                kind: DataFieldKind::CouncilNote,
                source: "wake".to_string(),
            });
        }
        if let Some(prime) = &ctx.prime_checkpoint {
            fields.push(DataField {
                key: "prime_checkpoint".to_string(),
                value: json!(prime.clone()),
                kind: DataFieldKind::Checkpoint,
                source: "wake".to_string(),
            });
        }
        if let Some(lite) = &ctx.lite_journal {
            fields.push(DataField {
                key: "lite_journal".to_string(),
                value: json!(lite.clone()),
                kind: DataFieldKind::Checkpoint,
                source: "wake".to_string(),
            });
        }
        *self.wake_fields.lock() = fields;

        // Drain the sleep queue through the pipeline
        let queued: Vec<CognitionPacket> = self.sleep_queue.lock().drain(..).collect();
        if !queued.is_empty() {
            info!("[engine] processing {} packet(s) queued during sleep", queued.len());
        }
        for packet in queued {
            let engine = self.clone();
            // Boxed to break the process_packet ↔ wake future-type cycle
            let task: futures::future::BoxFuture<'static, ()> = Box::pin(async move {
                match engine.process_packet(packet).await {
                    Ok(done) => engine.route_to_gateway(&done).await,
                    Err(e) => warn!("[engine] queued packet failed: {e}"),
                }
            });
            tokio::spawn(task);
        }
        Ok(())
    }

    /// Ask a model for the self-narrated checkpoint; fall back to a static
    /// line when no backend is reachable.
    pub async fn narrate_checkpoint(&self) -> String {
        let recent: Vec<String> = self
            .sessions
            .session_ids()
            .into_iter()
            .take(5)
            .flat_map(|id| {
                self.sessions
                    .history(&id, 6)
                    .into_iter()
                    .map(move |m| format!("[{}] {}: {}", id, m.role, m.content))
            })
            .collect();
        if recent.is_empty() {
            return "No salient interactions since the last checkpoint.".to_string();
        }
        let req = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "Write a terse third-person account (3-6 sentences) of the salient recent \
                     interactions below, as a note to your future self. No preamble.",
                ),
                ChatMessage::user(recent.join("\n")),
            ],
            temperature: Some(0.4),
            top_p: None,
            max_tokens: Some(300),
        };
        match self.pool.acquire_for_role("lite").await {
            Ok((name, backend)) => {
                let out = backend.chat(req).await;
                self.pool.release(&name);
                out.unwrap_or_else(|_| "Recent interactions could not be summarized.".to_string())
            }
            Err(_) => "Recent interactions could not be summarized.".to_string(),
        }
    }

    /// Fire-and-forget notification to the orchestrator; sleep transitions
    /// must not hang on it.
    async fn notify_orchestrator(&self, path: &str) {
        let url = format!("{}{}", self.cfg.services.orchestrator.trim_end_matches('/'), path);
        match self.http.post(&url).json(&json!({})).send().await {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => warn!("[engine] orchestrator {} answered HTTP {}", path, r.status().as_u16()),
            Err(e) => warn!("[engine] orchestrator unreachable for {}: {}", path, e),
        }
    }

    /// POST a completed packet to the gateway's output router.
    pub async fn route_to_gateway(&self, packet: &CognitionPacket) {
        let url = format!("{}/output_router", self.cfg.services.gateway.trim_end_matches('/'));
        if let Err(e) = self.http.post(&url).json(packet).send().await {
            warn!("[engine] output routing failed for {}: {}", packet.header.packet_id, e);
        }
    }

    /// SIGTERM path: synchronous checkpoint within the stop-grace window.
    pub async fn graceful_shutdown(&self) -> EngineResult<()> {
        info!("[engine] SIGTERM — writing checkpoints before exit");
        let narrative = self.narrate_checkpoint().await;
        self.sleep.checkpoint_now(&narrative, "Shut down gracefully; journal flushed.")?;
        Ok(())
    }

    /// Periodic housekeeping: council TTL eviction and probe-cache aging.
    pub fn scheduler_tick(&self) {
        if let Err(e) = self.council.evict_expired() {
            warn!("[engine] council eviction failed: {e}");
        }
        let turns: HashMap<String, u64> = self
            .sessions
            .session_ids()
            .into_iter()
            .map(|id| {
                let t = self.sessions.turn_count(&id);
                (id, t)
            })
            .collect();
        self.probe.evict_stale(&turns);
    }

    /// Reject obviously malformed packets at ingress (400, never a crash).
    pub fn validate_ingress(packet: &CognitionPacket) -> EngineResult<()> {
        if packet.header.packet_id.is_empty() {
            return Err(EngineError::Other("packet_id is required".into()));
        }
        if packet.header.session_id.is_empty() {
            return Err(EngineError::Other("session_id is required".into()));
        }
        Ok(())
    }
}
