use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use fedround_core::{clear_ready, init_tracing, load_config, mark_ready, InMemoryRoundStore, Orchestrator, ProgressBus, RoundStore, SledRoundStore};

mod api;
mod demo;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config()?;
    init_tracing(&cfg.service_name)?;
    info!(?cfg, "config_loaded");

    let store: Arc<dyn RoundStore> = match &cfg.sled_path {
        Some(path) => { info!(%path, "using sled store"); Arc::new(SledRoundStore::open(path)?) }
        None => Arc::new(InMemoryRoundStore::new()),
    };
    let bus = Arc::new(ProgressBus::new(cfg.orchestrator.observer_buffer));
    let orchestrator = Orchestrator::new(store.clone(), bus, cfg.orchestrator.clone());

    if cfg.seed_demo {
        let round_id = demo::seed(store.as_ref()).await?;
        info!(%round_id, "demo_round_seeded");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "round-coordinator listening");
    mark_ready();

    axum::serve(listener, api::router(orchestrator))
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            clear_ready();
        })
        .await?;
    info!("shutdown");
    Ok(())
}
