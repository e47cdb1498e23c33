// keystone-engine — the cognition service binary.
// Runs the per-turn pipeline behind HTTP, ticks the scheduler, and writes
// cognitive checkpoints on SIGTERM. The container must run this binary as
// PID 1 (exec-form entrypoint) so the signal actually arrives.

use keystone::atoms::config::PlatformConfig;
use keystone::engine::{server, Engine};
use keystone::shared::listen_addr;
use log::{error, info};
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match PlatformConfig::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("[engine] configuration error: {e}");
            std::process::exit(1);
        }
    };
    let addr = match listen_addr(&cfg.services.engine) {
        Ok(a) => a,
        Err(e) => {
            error!("[engine] {e}");
            std::process::exit(1);
        }
    };

    let engine = match Engine::new(cfg) {
        Ok(engine) => engine,
        Err(e) => {
            error!("[engine] startup failed: {e}");
            std::process::exit(1);
        }
    };

    // On a fresh start, any checkpoint left behind by the previous process
    // is context worth injecting; wake_fields consume it lazily.
    info!("[engine] starting on {}", addr);

    // Scheduler: council TTL eviction and probe-cache aging
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                engine.scheduler_tick();
            }
        });
    }

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("[engine] cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    let shutdown_engine = engine.clone();
    let result = axum::serve(listener, server::router(engine))
        .with_graceful_shutdown(async move {
            wait_for_sigterm().await;
            // Checkpoints must land inside the 25 s stop-grace window
            if let Err(e) = shutdown_engine.graceful_shutdown().await {
                error!("[engine] checkpoint on shutdown failed: {e}");
            }
        })
        .await;

    if let Err(e) = result {
        error!("[engine] server error: {e}");
        std::process::exit(1);
    }
    info!("[engine] stopped");
}

async fn wait_for_sigterm() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
