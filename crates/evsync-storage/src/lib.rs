//! Persistence + HTTP fetch utilities for evsync: retrying fetcher,
//! checkpoint store, event/settings stores.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

mod checkpoint;
mod postgres;
mod store;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use postgres::PgStore;
pub use store::{EventStore, MemoryStore, SettingsStore, UpsertOutcome};

pub const CRATE_NAME: &str = "evsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx is transient; every other non-success status is permanent.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the failed attempt `attempt_index` (0-based): `base * 2^attempt_index`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FetchedJson<T> {
    pub status: StatusCode,
    pub body: T,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempt(s): {source}")]
    Request {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("malformed response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request { source, .. } => source.status().map(|s| s.as_u16()),
            FetchError::Decode { .. } => None,
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retry(url).instrument(span).await
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<FetchedJson<T>, FetchError> {
        let fetched = self.fetch_bytes(url).await?;
        let body = serde_json::from_slice(&fetched.body).map_err(|source| FetchError::Decode {
            url: fetched.final_url.clone(),
            source,
        })?;
        Ok(FetchedJson {
            status: fetched.status,
            body,
        })
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|source| FetchError::Request {
                                attempts: attempt + 1,
                                source,
                            })?
                            .to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            attempt = attempt + 1,
                            status = status.as_u16(),
                            delay_ms = delay.as_millis() as u64,
                            "fetch failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        attempts: attempt + 1,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            attempt = attempt + 1,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "fetch failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }
}
