// Keystone Orchestrator — cross-service coordination.
// Owns the GPU ownership state machine, drives container-level handoff
// between the generation backend and the training service, runs the health
// watchdog, and replicates session state to the HA standby.

pub mod docker;
pub mod gpu;
pub mod server;
pub mod sync;
pub mod vram;
pub mod watchdog;

use crate::atoms::config::PlatformConfig;
use crate::atoms::error::EngineResult;
use crate::orchestrator::docker::ContainerControl;
use crate::orchestrator::gpu::{HandoffManager, HttpSignal, ServiceSignal};
use crate::orchestrator::vram::{NvidiaSmiProbe, VramProbe};
use crate::orchestrator::watchdog::{WatchTarget, Watchdog};
use crate::shared::layout::SharedVolume;
use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct Orchestrator {
    pub cfg: PlatformConfig,
    pub handoff: HandoffManager,
    pub watchdog: Watchdog,
    pub live_volume: SharedVolume,
    pub candidate_volume: SharedVolume,
    pub last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(cfg: PlatformConfig) -> EngineResult<Arc<Self>> {
        let containers: Arc<dyn ContainerControl> = Arc::new(docker::BollardControl::connect()?);
        let vram: Arc<dyn VramProbe> = Arc::new(NvidiaSmiProbe);
        let signal: Arc<dyn ServiceSignal> = Arc::new(HttpSignal::new());
        Ok(Self::with_parts(cfg, containers, vram, signal))
    }

    pub fn with_parts(
        cfg: PlatformConfig,
        containers: Arc<dyn ContainerControl>,
        vram: Arc<dyn VramProbe>,
        signal: Arc<dyn ServiceSignal>,
    ) -> Arc<Self> {
        let live_volume = SharedVolume::new(cfg.shared_volume.clone());
        let candidate_volume = SharedVolume::new(cfg.orchestrator.candidate_volume.clone());
        let targets = vec![
            WatchTarget {
                name: "engine".into(),
                live_url: cfg.services.engine.clone(),
                candidate_url: Some(cfg.services.engine_candidate.clone()),
            },
            WatchTarget {
                name: "gateway".into(),
                live_url: cfg.services.gateway.clone(),
                candidate_url: None,
            },
            WatchTarget {
                name: "tool_server".into(),
                live_url: cfg.services.tool_server.clone(),
                candidate_url: None,
            },
            WatchTarget {
                name: "trainer".into(),
                live_url: cfg.services.trainer.clone(),
                candidate_url: None,
            },
            WatchTarget {
                name: "generation".into(),
                live_url: cfg.services.generation_backend.clone(),
                candidate_url: None,
            },
        ];
        let watchdog = Watchdog::new(targets, live_volume.clone());
        let handoff = HandoffManager::new(&cfg, containers, vram, signal);
        Arc::new(Orchestrator {
            handoff,
            watchdog,
            live_volume,
            candidate_volume,
            last_sync: Mutex::new(None),
            cfg,
        })
    }

    /// One watchdog cycle: poll health, then replicate session state when
    /// the engine pair is HA-active and maintenance mode is off.
    pub async fn run_cycle(&self) {
        let health = self.watchdog.poll_once().await;
        let engine_active = health.iter().any(|h| {
            h.name == "engine"
                && matches!(
                    h.ha_status,
                    watchdog::HaStatus::Active | watchdog::HaStatus::FailoverActive
                )
        });
        if engine_active {
            match sync::sync_session_state(&self.live_volume, &self.candidate_volume) {
                Ok(report) if !report.skipped => {
                    *self.last_sync.lock() = Some(Utc::now());
                }
                Ok(_) => {}
                Err(e) => warn!("[orchestrator] session sync failed: {e}"),
            }
        }
    }
}
