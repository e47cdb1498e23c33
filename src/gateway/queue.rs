// Keystone Gateway — Sleep-Aware Queueing
// When the engine reports SLEEPING, inbound messages wait here while the
// gateway shows a typing indicator and polls /sleep/status. The wait is
// bounded; a message whose wait expires is sent anyway and takes its
// chances with the engine-side queue.

use crate::atoms::constants::{SLEEP_POLL_INTERVAL_SECS, SLEEP_QUEUE_WAIT_SECS};
use log::{debug, info};
use serde_json::Value;
use std::time::Duration;

/// Current engine sleep state, or None when the engine is unreachable.
pub async fn sleep_state(client: &reqwest::Client, engine_url: &str) -> Option<String> {
    let url = format!("{}/sleep/status", engine_url.trim_end_matches('/'));
    let resp = client.get(&url).timeout(Duration::from_secs(5)).send().await.ok()?;
    let v: Value = resp.json().await.ok()?;
    v["state"].as_str().map(String::from)
}

/// True when the engine is reachable and not AWAKE.
pub async fn engine_is_sleeping(client: &reqwest::Client, engine_url: &str) -> bool {
    matches!(
        sleep_state(client, engine_url).await.as_deref(),
        Some("SLEEPING") | Some("ENTERING_SLEEP") | Some("WAKING")
    )
}

/// Poll until the engine reports AWAKE. Returns true when it woke inside
/// the window, false when the wait expired.
pub async fn wait_until_awake(client: &reqwest::Client, engine_url: &str) -> bool {
    wait_until_awake_with(client, engine_url, Duration::from_secs(SLEEP_QUEUE_WAIT_SECS), Duration::from_secs(SLEEP_POLL_INTERVAL_SECS)).await
}

pub async fn wait_until_awake_with(
    client: &reqwest::Client,
    engine_url: &str,
    max_wait: Duration,
    interval: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        match sleep_state(client, engine_url).await.as_deref() {
            Some("AWAKE") => {
                info!("[gateway] engine is awake, releasing queued message");
                return true;
            }
            state => debug!("[gateway] engine state {:?}, still waiting", state),
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_engine_reads_as_not_sleeping() {
        let client = reqwest::Client::new();
        // Nothing listens here; an unreachable engine must not be treated
        // as sleeping (that would queue messages forever).
        assert!(!engine_is_sleeping(&client, "http://127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn test_wait_expires_against_unreachable_engine() {
        let client = reqwest::Client::new();
        let woke = wait_until_awake_with(
            &client,
            "http://127.0.0.1:1",
            Duration::from_millis(80),
            Duration::from_millis(20),
        )
        .await;
        assert!(!woke);
    }
}
