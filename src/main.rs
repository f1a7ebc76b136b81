//! KlineHub binary
//!
//! Loads configuration, connects storage and the broker, runs the hub until
//! Ctrl-C or SIGTERM and then shuts every stage down in order.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use kline_hub::config::AppConfig;
use kline_hub::hub::Hub;
use kline_hub::logging;
use kline_hub::persistence::{KlineStore, MemoryStore, MySqlStore};
use kline_hub::transport::{AmqpConnector, MemoryBroker, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    logging::init(&config.logging)?;
    info!(config = %config.digest(), "🚀 KlineHub starting");

    let store: Arc<dyn KlineStore> = match config.persistence.backend.as_str() {
        "mysql" => {
            let store = MySqlStore::connect(
                &config.persistence.database_url,
                config.persistence.max_connections,
            )
            .await
            .context("Failed to connect to MySQL")?;
            store.ensure_schema().await.context("Failed to create schema")?;
            Arc::new(store)
        }
        _ => Arc::new(MemoryStore::new()),
    };

    let transport_config = config.transport_config();
    let transport = match config.broker.backend.as_str() {
        "amqp" => {
            let connector = AmqpConnector::new(&config.broker.url, &config.broker.app_id);
            Transport::start(connector, transport_config).await
        }
        _ => Transport::start(MemoryBroker::new(), transport_config).await,
    }
    .context("Failed to connect to broker")?;

    transport
        .handle()
        .declare_exchange(&config.broker.exchange)
        .await
        .context("Failed to declare exchange")?;

    let mut hub = Hub::from_config(&config, store, transport)?;
    hub.start().await?;

    shutdown_signal().await;
    hub.stop().await;
    info!("👋 KlineHub exited");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl-C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
