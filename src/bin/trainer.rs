// keystone-trainer — training/index service binary.
// Exposes handoff-readiness endpoints and the vector-index writer. The
// actual training loop is external; this process is its doorman.

use keystone::atoms::config::PlatformConfig;
use keystone::shared::listen_addr;
use keystone::trainer::{server, Trainer};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match PlatformConfig::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("[trainer] configuration error: {e}");
            std::process::exit(1);
        }
    };
    let addr = match listen_addr(&cfg.services.trainer) {
        Ok(a) => a,
        Err(e) => {
            error!("[trainer] {e}");
            std::process::exit(1);
        }
    };

    let trainer = match Trainer::new(cfg) {
        Ok(t) => t,
        Err(e) => {
            error!("[trainer] startup failed: {e}");
            std::process::exit(1);
        }
    };
    info!("[trainer] starting on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("[trainer] cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, server::router(trainer)).await {
        error!("[trainer] server error: {e}");
        std::process::exit(1);
    }
}
