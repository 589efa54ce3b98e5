//! Advisory HTTP client
//!
//! One POST per request with a bounded timeout. Transient failures (timeouts,
//! connection errors, 429, 5xx) are retried with a linearly growing, capped
//! delay. 401/403 stop immediately; any other 4xx is not retried.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::models::{AdvisoryOpinion, OpinionRequest};

#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("advisory service rejected credentials (status {0})")]
    Unauthorized(u16),
    #[error("advisory service refused the request (status {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("advisory request failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("invalid advisory response: {0}")]
    Decode(String),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Advisory service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    /// Strategy name used for fusion weights
    pub name: String,
    pub url: String,
    /// Bearer token; `ADVISORY_API_KEY` is used when unset
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Recent bars sent with each request
    pub snapshot_bars: usize,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            name: "llm".to_string(),
            url: "http://127.0.0.1:8080/opinion".to_string(),
            api_key: None,
            timeout_secs: 10,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 3000,
            snapshot_bars: 50,
        }
    }
}

/// Fixed attempts, delay = base × attempt, capped
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.cap)
    }
}

enum Failure {
    Fatal(AdvisoryError),
    Transient(String),
}

pub struct AdvisoryClient {
    client: Client,
    name: String,
    url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
    snapshot_bars: usize,
}

impl AdvisoryClient {
    pub fn new(config: &AdvisoryConfig) -> Result<Self, AdvisoryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("ADVISORY_API_KEY").ok());
        Ok(Self {
            client,
            name: config.name.clone(),
            url: config.url.clone(),
            api_key,
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                base: Duration::from_millis(config.backoff_base_ms),
                cap: Duration::from_millis(config.backoff_cap_ms),
            },
            snapshot_bars: config.snapshot_bars,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot_bars(&self) -> usize {
        self.snapshot_bars
    }

    /// Ask for an opinion, retrying transient failures
    pub async fn request_opinion(&self, request: &OpinionRequest) -> Result<AdvisoryOpinion, AdvisoryError> {
        let mut last = String::new();
        for attempt in 1..=self.retry.max_attempts {
            match self.send_once(request).await {
                Ok(opinion) => {
                    debug!(
                        "Advisory {} for {}: {} ({:.2})",
                        self.name, request.symbol, opinion.direction, opinion.confidence
                    );
                    return Ok(opinion);
                }
                Err(Failure::Fatal(e)) => return Err(e),
                Err(Failure::Transient(msg)) => {
                    last = msg;
                    if attempt < self.retry.max_attempts {
                        let delay = self.retry.delay(attempt);
                        warn!(
                            "Advisory attempt {}/{} failed: {} (retrying in {:?})",
                            attempt, self.retry.max_attempts, last, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        info!("Advisory {} gave up after {} attempts", self.name, self.retry.max_attempts);
        Err(AdvisoryError::Exhausted {
            attempts: self.retry.max_attempts,
            last,
        })
    }

    async fn send_once(&self, request: &OpinionRequest) -> Result<AdvisoryOpinion, Failure> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => return Err(Failure::Transient(e.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            return response
                .json::<AdvisoryOpinion>()
                .await
                .map_err(|e| Failure::Fatal(AdvisoryError::Decode(e.to_string())));
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(Failure::Fatal(AdvisoryError::Unauthorized(status.as_u16())))
            }
            StatusCode::TOO_MANY_REQUESTS => Err(Failure::Transient(format!("status {}", status))),
            s if s.is_server_error() => Err(Failure::Transient(format!("status {}", status))),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(Failure::Fatal(AdvisoryError::Rejected {
                    status: status.as_u16(),
                    body,
                }))
            }
        }
    }
}
