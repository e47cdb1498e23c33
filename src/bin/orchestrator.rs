// keystone-orchestrator — cross-service coordination binary.
// Serves the handoff/status endpoints and runs the watchdog + HA sync
// cycle in the background.

use keystone::atoms::config::PlatformConfig;
use keystone::orchestrator::{server, Orchestrator};
use keystone::shared::listen_addr;
use log::{error, info};
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match PlatformConfig::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("[orchestrator] configuration error: {e}");
            std::process::exit(1);
        }
    };
    let addr = match listen_addr(&cfg.services.orchestrator) {
        Ok(a) => a,
        Err(e) => {
            error!("[orchestrator] {e}");
            std::process::exit(1);
        }
    };
    let interval = Duration::from_secs(cfg.orchestrator.watchdog_interval_secs);

    let orchestrator = match Orchestrator::new(cfg) {
        Ok(o) => o,
        Err(e) => {
            error!("[orchestrator] startup failed (docker reachable?): {e}");
            std::process::exit(1);
        }
    };
    info!("[orchestrator] starting on {}", addr);

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                orchestrator.run_cycle().await;
            }
        });
    }

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("[orchestrator] cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, server::router(orchestrator)).await {
        error!("[orchestrator] server error: {e}");
        std::process::exit(1);
    }
}
