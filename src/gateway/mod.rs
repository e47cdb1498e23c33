// Keystone Gateway — external ingress and output routing.
// Builds cognition packets from inbound messages, reaches the engine with
// retry-then-single-fallback (maintenance-gated), parks messages while the
// engine sleeps, and dispatches completed packets to their destinations
// exactly once per packet_id.

pub mod queue;
pub mod server;

use crate::atoms::config::PlatformConfig;
use crate::atoms::error::EngineResult;
use crate::atoms::packet::{CognitionPacket, PacketOrigin};
use crate::shared::client::post_with_retry;
use crate::shared::layout::SharedVolume;
use log::info;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// A completed delivery, kept for surfaces that poll for output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Delivery {
    pub packet_id: String,
    pub destination: String,
    pub text: String,
}

pub struct Gateway {
    pub cfg: PlatformConfig,
    pub volume: SharedVolume,
    pub client: reqwest::Client,
    /// packet_ids already routed; re-POSTs of the same packet are no-ops.
    delivered_ids: Mutex<HashSet<String>>,
    /// Delivery order is preserved for pollers.
    outbox: Mutex<Vec<Delivery>>,
}

impl Gateway {
    pub fn new(cfg: PlatformConfig) -> Arc<Self> {
        let volume = SharedVolume::new(cfg.shared_volume.clone());
        Arc::new(Gateway {
            client: reqwest::Client::new(),
            volume,
            delivered_ids: Mutex::new(HashSet::new()),
            outbox: Mutex::new(Vec::new()),
            cfg,
        })
    }

    /// Build a packet for an inbound message.
    pub fn packet_for(&self, session_id: &str, text: &str, destination: &str) -> CognitionPacket {
        CognitionPacket::new(session_id, text, PacketOrigin::User, destination)
    }

    /// Send a packet to the engine with the full failover discipline:
    /// sleep-aware wait, retries against the live engine, and one
    /// maintenance-gated attempt against the candidate.
    pub async fn send_to_engine(&self, packet: CognitionPacket) -> EngineResult<CognitionPacket> {
        let engine = self.cfg.services.engine.clone();
        if queue::engine_is_sleeping(&self.client, &engine).await {
            info!(
                "[gateway] engine sleeping — holding {} while it wakes",
                packet.header.packet_id
            );
            queue::wait_until_awake(&self.client, &engine).await;
        }
        let url = format!("{}/process_packet", engine.trim_end_matches('/'));
        let fallback = format!(
            "{}/process_packet",
            self.cfg.services.engine_candidate.trim_end_matches('/')
        );
        post_with_retry(&self.client, &url, Some(&fallback), &packet, &self.volume).await
    }

    /// Route a completed packet to its destinations. Deduped by packet_id:
    /// the first delivery wins, repeats are acknowledged but not re-sent.
    pub fn route_output(&self, packet: &CognitionPacket) -> bool {
        {
            let mut seen = self.delivered_ids.lock();
            if !seen.insert(packet.header.packet_id.clone()) {
                info!("[gateway] duplicate output for {} ignored", packet.header.packet_id);
                return false;
            }
            // The set only ever grows by one entry per turn; cap it so a
            // long-lived gateway doesn't hold every id forever.
            if seen.len() > 10_000 {
                seen.clear();
            }
        }
        let text = packet.response.candidate.clone();
        let mut destinations = vec![packet.header.output_routing.primary.clone()];
        destinations.extend(packet.header.output_routing.fan_out.iter().cloned());
        let mut outbox = self.outbox.lock();
        for destination in destinations {
            info!(
                "[gateway] delivering {} to {}",
                packet.header.packet_id, destination
            );
            outbox.push(Delivery {
                packet_id: packet.header.packet_id.clone(),
                destination,
                text: text.clone(),
            });
        }
        true
    }

    /// Drain deliveries for a destination (surface adapters poll this).
    pub fn take_deliveries(&self, destination: &str) -> Vec<Delivery> {
        let mut outbox = self.outbox.lock();
        let (matched, rest): (Vec<Delivery>, Vec<Delivery>) =
            outbox.drain(..).partition(|d| d.destination == destination);
        *outbox = rest;
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> (tempfile::TempDir, Arc<Gateway>) {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = PlatformConfig::default();
        cfg.shared_volume = tmp.path().to_path_buf();
        (tmp, Gateway::new(cfg))
    }

    #[test]
    fn test_output_routing_dedupes_by_packet_id() {
        let (_tmp, gw) = gateway();
        let mut packet = gw.packet_for("discord_dm_kay", "hello", "discord_dm_kay");
        packet.response.candidate = "[Prime] hi".into();

        assert!(gw.route_output(&packet));
        assert!(!gw.route_output(&packet), "second POST of the same packet must not deliver");
        let deliveries = gw.take_deliveries("discord_dm_kay");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].text, "[Prime] hi");
    }

    #[test]
    fn test_fan_out_destinations() {
        let (_tmp, gw) = gateway();
        let mut packet = gw.packet_for("web_a", "hello", "web_a");
        packet.header.output_routing.fan_out = vec!["audit_log".into()];
        packet.response.candidate = "[Lite] hi".into();

        gw.route_output(&packet);
        assert_eq!(gw.take_deliveries("web_a").len(), 1);
        assert_eq!(gw.take_deliveries("audit_log").len(), 1);
    }

    #[test]
    fn test_take_deliveries_preserves_others() {
        let (_tmp, gw) = gateway();
        let mut a = gw.packet_for("web_a", "one", "web_a");
        a.response.candidate = "r1".into();
        let mut b = gw.packet_for("web_b", "two", "web_b");
        b.response.candidate = "r2".into();
        gw.route_output(&a);
        gw.route_output(&b);

        assert_eq!(gw.take_deliveries("web_a").len(), 1);
        // web_b's delivery is still waiting
        assert_eq!(gw.take_deliveries("web_b").len(), 1);
    }
}
