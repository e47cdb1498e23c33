// keystone-tools — capability server binary.
// Single JSON-RPC entry point for file, shell, web, log, and embedding
// capabilities, with the approval queue guarding sensitive tools.

use keystone::atoms::config::PlatformConfig;
use keystone::shared::listen_addr;
use keystone::toolserver::{rpc, ToolServer};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match PlatformConfig::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("[tools] configuration error: {e}");
            std::process::exit(1);
        }
    };
    let addr = match listen_addr(&cfg.services.tool_server) {
        Ok(a) => a,
        Err(e) => {
            error!("[tools] {e}");
            std::process::exit(1);
        }
    };

    let server = match ToolServer::new(cfg) {
        Ok(s) => s,
        Err(e) => {
            error!("[tools] startup failed: {e}");
            std::process::exit(1);
        }
    };
    info!("[tools] starting on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("[tools] cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, rpc::router(server)).await {
        error!("[tools] server error: {e}");
        std::process::exit(1);
    }
}
