use log::{error, info};
use rcv_engine::config::EngineConfig;
use rcv_engine::directory::StaticDirectory;
use rcv_engine::Engine;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    // Initialize logging
    env_logger::init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    // Standalone host: names fall back to ids.
    let directory = Arc::new(StaticDirectory::default());

    let engine = match Engine::start(&config, directory.clone(), directory).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };
    info!(
        "Ready with {} recompute worker(s), waiting for shutdown signal",
        config.recompute_workers
    );

    if let Err(why) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {:?}", why);
    }

    info!("Shutting down");
    engine.shutdown().await;
}
