//! Operational CLI for card-sync: webhook subscription management against
//! the source platform, and analytical-store migrations. Not part of the
//! hot path — run by operators, not by the service itself.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use source_client::trello::TrelloConfig;
use store_adapter::bigquery::{BigQueryStore, BigQueryTables};

#[derive(Parser)]
#[command(name = "card_sync_cli", about = "Operational tooling for card-sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage webhook subscriptions registered with the source platform.
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },
    /// Create the analytical-store tables if they don't already exist.
    Migrate {
        #[arg(long, env = "BIGQUERY_PROJECT_ID")]
        project_id: String,
        #[arg(long, env = "BIGQUERY_DATASET_ID")]
        dataset_id: String,
        #[arg(long, env = "BIGQUERY_SERVICE_ACCOUNT_KEY_PATH")]
        service_account_key_path: String,
    },
}

#[derive(Subcommand)]
enum WebhookAction {
    /// Register a new webhook pointing at `callback_url` for `model_id`.
    Register {
        #[arg(long)]
        model_id: String,
        #[arg(long)]
        callback_url: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List webhooks currently registered under this token.
    List,
    /// Delete a webhook by its id.
    Delete {
        #[arg(long)]
        webhook_id: String,
    },
}

#[derive(Deserialize, Debug)]
struct WebhookRecord {
    id: String,
    description: Option<String>,
    #[serde(rename = "idModel")]
    model_id: String,
    #[serde(rename = "callbackURL")]
    callback_url: String,
    active: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Webhook { action } => run_webhook_action(action).await,
        Command::Migrate {
            project_id,
            dataset_id,
            service_account_key_path,
        } => run_migrate(project_id, dataset_id, service_account_key_path).await,
    }
}

async fn run_migrate(project_id: String, dataset_id: String, key_path: String) -> Result<()> {
    let store = BigQueryStore::connect(&key_path, project_id, dataset_id, BigQueryTables::default())
        .await
        .context("connecting to BigQuery")?;
    store.migrate().await.context("running migrations")?;
    println!("migrations applied");
    Ok(())
}

async fn run_webhook_action(action: WebhookAction) -> Result<()> {
    let config = TrelloConfig::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let http = reqwest::Client::new();

    match action {
        WebhookAction::Register {
            model_id,
            callback_url,
            description,
        } => {
            let url = format!(
                "{}/webhooks?key={}&token={}",
                config.base_url, config.api_key, config.api_token
            );
            let body = serde_json::json!({
                "description": description.unwrap_or_else(|| "card-sync".to_string()),
                "callbackURL": callback_url,
                "idModel": model_id,
            });
            let response = http.post(&url).json(&body).send().await?;
            if !response.status().is_success() {
                bail!(
                    "registering webhook failed: {} {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                );
            }
            let record: WebhookRecord = response.json().await?;
            println!("registered webhook {} for model {}", record.id, record.model_id);
        }
        WebhookAction::List => {
            let url = format!(
                "{}/tokens/{}/webhooks?key={}",
                config.base_url, config.api_token, config.api_key
            );
            let response = http.get(&url).send().await?;
            if !response.status().is_success() {
                bail!(
                    "listing webhooks failed: {} {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                );
            }
            let records: Vec<WebhookRecord> = response.json().await?;
            if records.is_empty() {
                println!("no webhooks registered");
            }
            for record in records {
                println!(
                    "{}  model={}  active={}  callback={}",
                    record.id, record.model_id, record.active, record.callback_url
                );
            }
        }
        WebhookAction::Delete { webhook_id } => {
            let url = format!(
                "{}/webhooks/{}?key={}&token={}",
                config.base_url, webhook_id, config.api_key, config.api_token
            );
            let response = http.delete(&url).send().await?;
            if !response.status().is_success() {
                bail!(
                    "deleting webhook failed: {} {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                );
            }
            println!("deleted webhook {webhook_id}");
        }
    }
    Ok(())
}
