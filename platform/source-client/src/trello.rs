use std::time::Duration;

use rand::Rng;
use reqwest::{Client, StatusCode};

use crate::{
    ratelimit::SourceRateLimiter, Card, SourceClient, SourceClientError, SourceClientResult,
};

#[derive(Debug, Clone)]
pub struct TrelloConfig {
    pub api_key: String,
    pub api_token: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl TrelloConfig {
    pub fn from_env() -> Result<Self, SourceClientError> {
        let api_key = std::env::var("TRELLO_API_KEY")
            .map_err(|_| SourceClientError::Protocol("missing TRELLO_API_KEY".into()))?;
        let api_token = std::env::var("TRELLO_API_TOKEN")
            .map_err(|_| SourceClientError::Protocol("missing TRELLO_API_TOKEN".into()))?;
        let base_url = std::env::var("TRELLO_BASE_URL")
            .unwrap_or_else(|_| "https://api.trello.com/1".to_string());
        let source_fetch_timeout_s: u64 = std::env::var("SOURCE_FETCH_TIMEOUT_S")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| SourceClientError::Protocol("SOURCE_FETCH_TIMEOUT_S must be a valid u64".into()))?;

        Ok(Self {
            api_key,
            api_token,
            base_url,
            request_timeout: Duration::from_secs(source_fetch_timeout_s),
            max_retries: 3,
        })
    }
}

/// HTTP-backed [`SourceClient`] for Trello-shaped source platforms.
pub struct TrelloClient {
    config: TrelloConfig,
    http: Client,
    limiter: SourceRateLimiter,
}

impl TrelloClient {
    pub fn new(config: TrelloConfig) -> SourceClientResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SourceClientError::Transport(e.to_string()))?;

        Ok(Self {
            config,
            http,
            limiter: SourceRateLimiter::default(),
        })
    }

    pub fn from_env() -> SourceClientResult<Self> {
        Self::new(TrelloConfig::from_env()?)
    }

    fn card_url(&self, card_id: &str) -> String {
        format!(
            "{}/cards/{}?fields=all&attachments=true&actions=all&key={}&token={}",
            self.config.base_url, card_id, self.config.api_key, self.config.api_token
        )
    }

    async fn jittered_backoff(attempt: u32) {
        let base_ms = 200u64 * 2u64.pow(attempt);
        let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
        tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}

#[async_trait::async_trait]
impl SourceClient for TrelloClient {
    async fn fetch_card(&self, card_id: &str) -> SourceClientResult<Card> {
        let url = self.card_url(card_id);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            self.limiter.acquire().await;

            let response = match self.http.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(SourceClientError::Transport(e.to_string()));
                    if attempt < self.config.max_retries {
                        Self::jittered_backoff(attempt).await;
                        continue;
                    }
                    break;
                }
            };

            match response.status() {
                StatusCode::NOT_FOUND => {
                    return Err(SourceClientError::CardAbsent(card_id.to_string()))
                }
                status if status.is_success() => {
                    return response
                        .json::<Card>()
                        .await
                        .map_err(|e| SourceClientError::Protocol(e.to_string()))
                }
                status if status.is_server_error() => {
                    last_err = Some(SourceClientError::Transport(format!(
                        "source platform returned {status}"
                    )));
                    if attempt < self.config.max_retries {
                        Self::jittered_backoff(attempt).await;
                        continue;
                    }
                }
                status => {
                    return Err(SourceClientError::Protocol(format!(
                        "unexpected status {status}"
                    )));
                }
            }
        }

        Err(last_err.unwrap_or(SourceClientError::Transport("exhausted retries".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> TrelloConfig {
        TrelloConfig {
            api_key: "k".into(),
            api_token: "t".into(),
            base_url,
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn fetch_card_returns_card_absent_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/cards/.*"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = TrelloClient::new(test_config(server.uri())).unwrap();
        let err = client.fetch_card("missing-card").await.unwrap_err();
        assert!(matches!(err, SourceClientError::CardAbsent(_)));
    }

    #[tokio::test]
    async fn fetch_card_parses_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/cards/.*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "C1",
                "name": "Order #42",
                "desc": "1x Sign $100",
                "closed": false,
                "idBoard": "B1",
                "idList": "L1",
                "labels": [{"name": "urgent"}],
            })))
            .mount(&server)
            .await;

        let client = TrelloClient::new(test_config(server.uri())).unwrap();
        let card = client.fetch_card("C1").await.unwrap();
        assert_eq!(card.id, "C1");
        assert_eq!(card.label_names(), vec!["urgent".to_string()]);
    }

    #[tokio::test]
    async fn fetch_card_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/cards/.*"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/cards/.*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "C1",
                "name": "Retried",
                "desc": "",
                "closed": false,
                "idBoard": "B1",
            })))
            .mount(&server)
            .await;

        let client = TrelloClient::new(test_config(server.uri())).unwrap();
        let card = client.fetch_card("C1").await.unwrap();
        assert_eq!(card.name, "Retried");
    }
}
