use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use nidrs::api::{self, AppState};
use nidrs::config::{ConfigChangeEvent, ConfigManager};
use nidrs::health::HealthCheckManager;
use nidrs::logging::init_tracing;
use nidrs::pipeline::{Engine, IngestionPipeline};
use nidrs::query::QueryFacade;
use nidrs::sweeper::spawn_sweeper;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv().ok();

    let config_manager = ConfigManager::new().await?;
    let config = config_manager.get_config().await;

    init_tracing(&config.observability.logging)?;

    // Engine and ingestion worker
    let engine = Arc::new(Engine::new(&config));
    let (pipeline, ingest) = IngestionPipeline::new(engine.clone(), &config);
    tokio::spawn(pipeline.run());

    let _sweeper = spawn_sweeper(engine.clone(), Duration::from_secs(config.sweeper.interval_seconds));

    // Hot reload: new rules go to the worker, which also triggers a recompute.
    let mut changes = config_manager.watch_changes().await?;
    let reload_handle = ingest.clone();
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            match change {
                ConfigChangeEvent::Updated(new_config) => {
                    if let Err(e) = reload_handle.reconfigure(*new_config) {
                        tracing::error!(error = %e, "Could not apply reloaded configuration");
                    }
                }
                ConfigChangeEvent::ValidationFailed(e) | ConfigChangeEvent::LoadFailed(e) => {
                    tracing::warn!(error = %e, "Configuration change ignored");
                }
            }
        }
    });

    let health = Arc::new(HealthCheckManager::new(engine.clone(), ingest.clone()));
    health.validate_startup_dependencies().await?;

    let state = AppState {
        queries: QueryFacade::new(engine),
        ingest,
        health,
    };
    let app = api::create_router(state, &config.observability.metrics);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "NIDRS engine listening");

    axum::serve(listener, app).await?;

    Ok(())
}
