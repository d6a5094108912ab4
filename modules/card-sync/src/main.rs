use std::sync::Arc;

use axum::Router;
use card_sync::config::Config;
use card_sync::dispatcher::{self, Dispatcher};
use card_sync::intake::{self, IntakeState};
use card_sync::{health, metrics::Metrics, retry_worker};
use extractor::llm::LlmExtractor;
use source_client::trello::TrelloClient;
use store_adapter::bigquery::{BigQueryStore, BigQueryTables};
use store_adapter::memory::InMemoryStore;
use store_adapter::Store;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    tracing::info!(host = %config.host, port = config.port, "configuration loaded");

    let store: Arc<dyn Store> = if std::env::var("CARD_SYNC_IN_MEMORY_STORE").as_deref() == Ok("1") {
        tracing::warn!("running with the in-memory store; analytical rows will not persist");
        Arc::new(InMemoryStore::new())
    } else {
        tracing::info!("connecting to BigQuery...");
        Arc::new(
            BigQueryStore::connect(
                &config.bigquery_service_account_key_path,
                config.bigquery_project_id.clone(),
                config.bigquery_dataset_id.clone(),
                BigQueryTables::default(),
            )
            .await?,
        )
    };

    let source_client = Arc::new(TrelloClient::from_env()?);
    let extractor = Arc::new(LlmExtractor::from_env()?);
    let metrics = Arc::new(Metrics::new());

    let card_dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        source_client,
        extractor,
        metrics.clone(),
        config.retry_max_retries,
    ));

    let (tx, rx) = mpsc::channel(config.intake_channel_capacity);
    let worker_handle = dispatcher::spawn_workers(card_dispatcher, rx, config.dispatcher_worker_count);

    let retry_handle = tokio::spawn(retry_worker::run(
        store.clone(),
        metrics.clone(),
        retry_worker::RetryWorkerConfig {
            tick: config.retry_tick,
            batch_size: config.retry_batch_size,
            max_retries: config.retry_max_retries,
        },
    ));

    let intake_state = Arc::new(IntakeState {
        tx,
        webhook_secret: config.webhook_secret.clone(),
        callback_url: config.source_callback_url.clone(),
        metrics: metrics.clone(),
    });

    let health_router = Router::new()
        .route("/healthz", axum::routing::get(health::healthz))
        .route("/metrics", axum::routing::get(health::metrics))
        .with_state(metrics.clone());

    let app = Router::new()
        .merge(intake::router(intake_state))
        .merge(health_router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "card-sync listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // `app` (and with it the router's last `Arc<IntakeState>`, hence `tx`)
    // was consumed by `axum::serve` above and is dropped once that future
    // resolves, so the intake channel is already closed here: the worker
    // pool's `rx.recv()` loop will end as soon as it drains whatever was
    // still queued. Give it a grace period to finish in-flight dispatcher
    // work before giving up on it.
    match tokio::time::timeout(config.shutdown_grace_period, worker_handle).await {
        Ok(Ok(())) => tracing::info!("dispatcher worker pool drained cleanly"),
        Ok(Err(e)) => tracing::error!(error = %e, "dispatcher worker pool task panicked"),
        Err(_) => tracing::warn!(
            grace_period_secs = config.shutdown_grace_period.as_secs(),
            "dispatcher worker pool did not drain within the grace period; abandoning in-flight work"
        ),
    }

    // One more retry-worker pass picks up anything the drain above deferred,
    // before the background tick loop is torn down.
    if let Err(e) = retry_worker::run_once(
        &store,
        &metrics,
        &retry_worker::RetryWorkerConfig {
            tick: config.retry_tick,
            batch_size: config.retry_batch_size,
            max_retries: config.retry_max_retries,
        },
    )
    .await
    {
        tracing::error!(error = %e, "final retry worker pass before shutdown failed");
    }
    retry_handle.abort();

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received, no longer accepting new connections");
}
