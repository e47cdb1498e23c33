// Keystone Orchestrator — Health Watchdog
// Polls every target service's /health on a fixed cycle, tracks
// consecutive-failure counts (not binary state), and derives the HA status
// of each live/candidate pair. Degraded and failed pairs surface through
// logs, the /status dashboard, and an optional self-narrated observation
// appended to prime.md.

use crate::atoms::error::EngineResult;
use crate::shared::layout::SharedVolume;
use chrono::{SecondsFormat, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

// ── Targets & status ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub name: String,
    pub live_url: String,
    /// HA standby, when this service has one.
    pub candidate_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaStatus {
    /// Live healthy, candidate healthy (or no candidate configured).
    Active,
    /// Live healthy, candidate unhealthy — failover would fail.
    Degraded,
    /// Live unhealthy, candidate healthy — traffic is on the standby.
    FailoverActive,
    /// Both unhealthy.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub healthy: bool,
    pub consec_failures: u32,
    pub ha_status: HaStatus,
}

#[derive(Default)]
struct TargetState {
    consec_failures: u32,
    candidate_consec_failures: u32,
    last_ha_status: Option<HaStatus>,
}

// ── Watchdog ───────────────────────────────────────────────────────────────

pub struct Watchdog {
    targets: Vec<WatchTarget>,
    states: Mutex<BTreeMap<String, TargetState>>,
    snapshot: Mutex<Vec<ServiceHealth>>,
    client: reqwest::Client,
    volume: SharedVolume,
}

impl Watchdog {
    pub fn new(targets: Vec<WatchTarget>, volume: SharedVolume) -> Self {
        Watchdog {
            targets,
            states: Mutex::new(BTreeMap::new()),
            snapshot: Mutex::new(Vec::new()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            volume,
        }
    }

    /// Latest per-service health, for the /status dashboard.
    pub fn snapshot(&self) -> Vec<ServiceHealth> {
        self.snapshot.lock().clone()
    }

    /// One polling cycle over every target.
    pub async fn poll_once(&self) -> Vec<ServiceHealth> {
        let mut results = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let live_ok = self.check(&target.live_url).await;
            let candidate_ok = match &target.candidate_url {
                Some(url) => Some(self.check(url).await),
                None => None,
            };
            results.push(self.record(target, live_ok, candidate_ok));
        }
        *self.snapshot.lock() = results.clone();
        results
    }

    async fn check(&self, base_url: &str) -> bool {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r
                .json::<serde_json::Value>()
                .await
                .map(|v| v["status"].as_str() == Some("healthy"))
                .unwrap_or(false),
            _ => false,
        }
    }

    fn record(&self, target: &WatchTarget, live_ok: bool, candidate_ok: Option<bool>) -> ServiceHealth {
        let mut states = self.states.lock();
        let state = states.entry(target.name.clone()).or_default();

        if live_ok {
            state.consec_failures = 0;
        } else {
            state.consec_failures += 1;
        }
        match candidate_ok {
            Some(true) | None => state.candidate_consec_failures = 0,
            Some(false) => state.candidate_consec_failures += 1,
        }

        let ha_status = match (live_ok, candidate_ok) {
            (true, Some(true)) | (true, None) => HaStatus::Active,
            (true, Some(false)) => HaStatus::Degraded,
            (false, Some(true)) => HaStatus::FailoverActive,
            (false, _) => HaStatus::Failed,
        };

        if state.last_ha_status != Some(ha_status) {
            match ha_status {
                HaStatus::Active => info!("[watchdog] {} is active", target.name),
                HaStatus::Degraded => {
                    warn!("[watchdog] {} degraded: candidate unhealthy — failover would fail", target.name);
                    self.narrate_observation(&format!(
                        "Noticed the {} standby is unhealthy; failover would not hold.",
                        target.name
                    ));
                }
                HaStatus::FailoverActive => {
                    warn!("[watchdog] {} live is down; candidate carrying traffic", target.name);
                    self.narrate_observation(&format!(
                        "The live {} went quiet; the standby is carrying its load.",
                        target.name
                    ));
                }
                HaStatus::Failed => {
                    warn!("[watchdog] {} failed on both sides", target.name);
                }
            }
            state.last_ha_status = Some(ha_status);
        }

        ServiceHealth {
            name: target.name.clone(),
            healthy: live_ok,
            consec_failures: state.consec_failures,
            ha_status,
        }
    }

    /// Append a self-narrated observation to prime.md so the model hears
    /// about infrastructure trouble in its own voice on next wake.
    fn narrate_observation(&self, observation: &str) {
        let path = self.volume.prime_checkpoint();
        if let Err(e) = append_observation(&path, observation) {
            warn!("[watchdog] could not narrate observation: {e}");
        }
    }
}

fn append_observation(path: &std::path::Path, observation: &str) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = std::fs::read_to_string(path).unwrap_or_default();
    body.push_str(&format!(
        "\n> Observed {}: {}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        observation
    ));
    std::fs::write(path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog() -> (tempfile::TempDir, Watchdog) {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        volume.ensure_dirs().unwrap();
        let targets = vec![WatchTarget {
            name: "engine".into(),
            live_url: "http://127.0.0.1:1".into(),
            candidate_url: Some("http://127.0.0.1:2".into()),
        }];
        (tmp, Watchdog::new(targets, volume))
    }

    #[test]
    fn test_ha_status_matrix() {
        let (_tmp, w) = watchdog();
        let target = w.targets[0].clone();

        assert_eq!(w.record(&target, true, Some(true)).ha_status, HaStatus::Active);
        assert_eq!(w.record(&target, true, Some(false)).ha_status, HaStatus::Degraded);
        assert_eq!(w.record(&target, false, Some(true)).ha_status, HaStatus::FailoverActive);
        assert_eq!(w.record(&target, false, Some(false)).ha_status, HaStatus::Failed);
        // No candidate configured: live health alone decides
        let solo = WatchTarget { name: "tools".into(), live_url: "x".into(), candidate_url: None };
        assert_eq!(w.record(&solo, true, None).ha_status, HaStatus::Active);
        assert_eq!(w.record(&solo, false, None).ha_status, HaStatus::Failed);
    }

    #[test]
    fn test_consecutive_failures_count_not_binary() {
        let (_tmp, w) = watchdog();
        let target = w.targets[0].clone();
        assert_eq!(w.record(&target, false, Some(true)).consec_failures, 1);
        assert_eq!(w.record(&target, false, Some(true)).consec_failures, 2);
        assert_eq!(w.record(&target, false, Some(true)).consec_failures, 3);
        // Recovery resets the counter
        assert_eq!(w.record(&target, true, Some(true)).consec_failures, 0);
    }

    #[test]
    fn test_degraded_narrates_to_prime() {
        let (tmp, w) = watchdog();
        let target = w.targets[0].clone();
        w.record(&target, true, Some(false));
        let body =
            std::fs::read_to_string(SharedVolume::new(tmp.path()).prime_checkpoint()).unwrap();
        assert!(body.contains("standby is unhealthy"));

        // Only narrated on the transition, not every cycle
        w.record(&target, true, Some(false));
        let body2 =
            std::fs::read_to_string(SharedVolume::new(tmp.path()).prime_checkpoint()).unwrap();
        assert_eq!(body.matches("standby is unhealthy").count(), body2.matches("standby is unhealthy").count());
    }

    #[tokio::test]
    async fn test_poll_once_against_closed_ports() {
        let (_tmp, w) = watchdog();
        let results = w.poll_once().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].healthy);
        assert_eq!(results[0].ha_status, HaStatus::Failed);
        assert_eq!(w.snapshot().len(), 1);
    }
}
