// Keystone Shared — conventions every service relies on: the failover
// client, the shared-volume layout, the maintenance flag, and the tool
// registry.

pub mod client;
pub mod layout;
pub mod maintenance;
pub mod registry;

use crate::atoms::error::{EngineError, EngineResult};

/// Derive a bind address ("host:port") from a configured service URL.
pub fn listen_addr(service_url: &str) -> EngineResult<String> {
    let parsed = url::Url::parse(service_url)
        .map_err(|e| EngineError::Config(format!("bad service url '{service_url}': {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| EngineError::Config(format!("no host in '{service_url}'")))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| EngineError::Config(format!("no port in '{service_url}'")))?;
    Ok(format!("{host}:{port}"))
}
