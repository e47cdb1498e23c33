// ── Keystone Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the platform, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, Network, Provider, Tool…).
//   • `#[from]` wires std/external error conversions automatically.
//   • `EngineError` → `String` via `Display` so HTTP handler boundaries can
//     call `.to_string()` without boilerplate.
//   • No variant carries secret material (API keys, tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Docker daemon / container API failure.
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Model backend HTTP or API-level failure (non-secret detail only).
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Tool execution failure.
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Platform configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Security policy violation (path escape, approval denial, rate limit).
    #[error("Security error: {0}")]
    Security(String),

    /// Owned state machine rejected a transition (GPU ownership, sleep state).
    #[error("State error: {0}")]
    State(String),

    /// A timed wait elapsed before its condition was met.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a provider error with name and message.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    /// Create a tool error with name and message.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool { tool: tool.into(), message: message.into() }
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

/// Canonical result alias used across the library.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_provider() {
        let e = EngineError::provider("groq", "HTTP 500");
        assert_eq!(e.to_string(), "Provider error: groq: HTTP 500");
    }

    #[test]
    fn test_from_string() {
        let e: EngineError = "something odd".to_string().into();
        assert!(matches!(e, EngineError::Other(_)));
    }
}
