use std::sync::Arc;

use serde::Deserialize;
use tokio::io::AsyncReadExt;

use pulse_common::config::PushConfig;
use pulse_common::db;
use pulse_common::types::{DispatchOptions, NotificationPayload};
use pulse_notifier::{
    FileDeadLetterStore, HttpDeliveryClient, PgDeadLetterStore, PgTokenStore, PushDispatcher,
};

/// One bulk dispatch, as read from a file argument or stdin.
#[derive(Debug, Deserialize)]
struct DispatchRequest {
    addresses: Vec<String>,
    #[serde(default)]
    payload: NotificationPayload,
    #[serde(default)]
    options: DispatchOptions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Pulse notifier starting...");

    let config = PushConfig::from_env()?;
    let client = Arc::new(HttpDeliveryClient::from_config(&config)?);

    let builder = PushDispatcher::builder(config.clone(), client);
    let builder = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::connect(url, config.db_max_connections).await?;
            builder
                .token_store(Arc::new(PgTokenStore::new(pool.clone())))
                .dead_letter_store(Arc::new(PgDeadLetterStore::new(pool)))
        }
        None => {
            tracing::info!(path = %config.dlq_path, "No DATABASE_URL, using file dead-letter store");
            builder.dead_letter_store(Arc::new(FileDeadLetterStore::new(&config.dlq_path)))
        }
    };
    let dispatcher = builder.build();

    let request = read_request(std::env::args().nth(1)).await?;
    let result = dispatcher
        .dispatch(&request.addresses, request.payload, request.options)
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    let pending = dispatcher.pending_redrives().await;
    if pending > 0 {
        tracing::info!(pending, "Waiting for retry queue to drain");
        tokio::select! {
            () = wait_for_drain(&dispatcher) => {
                tracing::info!("Retry queue drained");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, stopping gracefully...");
            }
        }
    }

    dispatcher.shutdown().await;

    let remaining = dispatcher.pending_redrives().await;
    if remaining > 0 {
        tracing::warn!(remaining, "Exiting with undelivered chunks still queued");
    }

    tracing::info!("Pulse notifier stopped.");
    Ok(())
}

async fn read_request(path: Option<String>) -> anyhow::Result<DispatchRequest> {
    let raw = match path {
        Some(path) => tokio::fs::read_to_string(&path).await?,
        None => {
            let mut raw = String::new();
            tokio::io::stdin().read_to_string(&mut raw).await?;
            raw
        }
    };
    Ok(serde_json::from_str(&raw)?)
}

async fn wait_for_drain(dispatcher: &PushDispatcher) {
    let mut check = tokio::time::interval(dispatcher.config().queue_poll_interval());
    loop {
        check.tick().await;
        if dispatcher.pending_redrives().await == 0 {
            return;
        }
    }
}
