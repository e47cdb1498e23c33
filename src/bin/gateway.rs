// keystone-gateway — external ingress binary.
// Accepts surface messages, reaches the engine with failover, and routes
// completed packets to their destinations.

use keystone::atoms::config::PlatformConfig;
use keystone::gateway::{server, Gateway};
use keystone::shared::listen_addr;
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match PlatformConfig::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("[gateway] configuration error: {e}");
            std::process::exit(1);
        }
    };
    let addr = match listen_addr(&cfg.services.gateway) {
        Ok(a) => a,
        Err(e) => {
            error!("[gateway] {e}");
            std::process::exit(1);
        }
    };

    let gateway = Gateway::new(cfg);
    info!("[gateway] starting on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("[gateway] cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, server::router(gateway)).await {
        error!("[gateway] server error: {e}");
        std::process::exit(1);
    }
}
