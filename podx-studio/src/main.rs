use std::sync::Arc;

use podx_studio::api::ApiServer;
use podx_studio::api::server::{ApiServerConfig, AppState};
use podx_studio::config::EngineConfig;
use podx_studio::database::{
    self,
    repositories::{PresetRepository, SqlxPresetRepository, SqlxRunRepository},
};
use podx_studio::logging;
use podx_studio::pipeline::RunManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env_or_default();
    config.validate()?;

    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;

    // Initialize database
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let runs = Arc::new(SqlxRunRepository::new(pool.clone()));
    let presets = Arc::new(SqlxPresetRepository::new(pool.clone()));
    presets.ensure_builtin().await?;

    let manager = Arc::new(RunManager::from_config(&config, runs, presets));
    manager.recover_interrupted().await?;

    tokio::fs::create_dir_all(&config.output_root).await?;

    let state = AppState::new()
        .with_run_manager(manager.clone())
        .with_logging_config(logging_config);
    let server = ApiServer::with_state(ApiServerConfig::from_env_or_default(), state);

    let cancel = server.cancel_token();
    let shutdown_manager = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
            shutdown_manager.shutdown().await;
            cancel.cancel();
        }
    });

    tracing::info!(
        max_concurrent_runs = config.max_concurrent_runs,
        output_root = %config.output_root.display(),
        "podx-studio initialized successfully"
    );

    server.run().await?;
    pool.close().await;

    Ok(())
}
