//! tasklink - HTTP Server Entry Point
//!
//! Builds the task store from configuration and serves the task API.

use std::sync::Arc;

use tasklink::{api, config::Config, create_task_store, EventBus, TaskManager};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasklink=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: store={:?}, data_dir={}",
        config.store_type,
        config.data_dir.display()
    );

    let store = create_task_store(config.store_type, config.data_dir.clone()).await?;
    let events = Arc::new(EventBus::new(config.event_capacity));
    let manager = Arc::new(TaskManager::new(store, events));

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting server on {}", addr);

    api::serve(config, manager).await?;

    Ok(())
}
