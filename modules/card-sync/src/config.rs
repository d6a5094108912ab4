use std::env;
use std::time::Duration;

/// Application configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,

    pub bigquery_project_id: String,
    pub bigquery_dataset_id: String,
    pub bigquery_service_account_key_path: String,

    pub webhook_secret: String,
    pub source_callback_url: String,

    pub intake_channel_capacity: usize,
    pub dispatcher_worker_count: usize,

    pub retry_tick: Duration,
    pub retry_batch_size: usize,
    pub retry_max_retries: u32,

    pub shutdown_grace_period: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8095".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let bigquery_project_id = env::var("BIGQUERY_PROJECT_ID")
            .map_err(|_| "BIGQUERY_PROJECT_ID must be set".to_string())?;
        let bigquery_dataset_id = env::var("BIGQUERY_DATASET_ID")
            .map_err(|_| "BIGQUERY_DATASET_ID must be set".to_string())?;
        let bigquery_service_account_key_path = env::var("BIGQUERY_SERVICE_ACCOUNT_KEY_PATH")
            .map_err(|_| "BIGQUERY_SERVICE_ACCOUNT_KEY_PATH must be set".to_string())?;

        let webhook_secret = env::var("SOURCE_WEBHOOK_SECRET")
            .map_err(|_| "SOURCE_WEBHOOK_SECRET must be set".to_string())?;
        let source_callback_url = env::var("SOURCE_CALLBACK_URL")
            .map_err(|_| "SOURCE_CALLBACK_URL must be set".to_string())?;

        let intake_channel_capacity: usize = env::var("INTAKE_CHANNEL_CAPACITY")
            .unwrap_or_else(|_| "1024".to_string())
            .parse()
            .map_err(|_| "INTAKE_CHANNEL_CAPACITY must be a valid usize".to_string())?;

        let dispatcher_worker_count: usize = env::var("DISPATCHER_WORKER_COUNT")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .map_err(|_| "DISPATCHER_WORKER_COUNT must be a valid usize".to_string())?;

        let retry_tick_secs: u64 = env::var("RETRY_TICK_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| "RETRY_TICK_SECS must be a valid u64".to_string())?;

        let retry_batch_size: usize = env::var("RETRY_BATCH_SIZE")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .map_err(|_| "RETRY_BATCH_SIZE must be a valid usize".to_string())?;

        let retry_max_retries: u32 = env::var("RETRY_MAX_RETRIES")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| "RETRY_MAX_RETRIES must be a valid u32".to_string())?;

        let shutdown_grace_period_secs: u64 = env::var("SHUTDOWN_GRACE_PERIOD_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| "SHUTDOWN_GRACE_PERIOD_SECS must be a valid u64".to_string())?;

        Ok(Config {
            host,
            port,
            log_level,
            bigquery_project_id,
            bigquery_dataset_id,
            bigquery_service_account_key_path,
            webhook_secret,
            source_callback_url,
            intake_channel_capacity,
            dispatcher_worker_count,
            retry_tick: Duration::from_secs(retry_tick_secs),
            retry_batch_size,
            retry_max_retries,
            shutdown_grace_period: Duration::from_secs(shutdown_grace_period_secs),
        })
    }
}
