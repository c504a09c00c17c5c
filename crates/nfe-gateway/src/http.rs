//! HTTP client for the portal sidecar.
//!
//! The sidecar exposes `GET {base}/companies/{tax_id}/documents?since=YYYY-MM-DD`
//! and answers `{"documents": [...], "checkpoint": "YYYY-MM-DD"}`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use nfe_core::{BackoffPolicy, Checkpoint, RawDocumentDescriptor, TaxId};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::{resolve_checkpoint, GatewayError, PortalBatch, PortalGateway};

/// Maps a non-success portal status onto the failure taxonomy.
pub fn classify_status(status: StatusCode) -> GatewayError {
    let detail = format!("http status {status}");
    if status == StatusCode::TOO_MANY_REQUESTS {
        GatewayError::RateLimited(detail)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        GatewayError::Transient(detail)
    } else {
        GatewayError::Permanent(detail)
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        GatewayError::Transient(err.to_string())
    } else if err.is_decode() {
        // A garbled body is usually a sidecar mid-deploy.
        GatewayError::Transient(format!("decoding portal response: {err}"))
    } else {
        GatewayError::Permanent(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// In-call retries for retryable statuses. The scheduler's own backoff
    /// takes over once these are spent.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
    /// Window requested when a company has no checkpoint yet.
    pub initial_lookback_days: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            user_agent: Some(format!("nfe-monitor/{}", env!("CARGO_PKG_VERSION"))),
            global_concurrency: 4,
            max_retries: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
            initial_lookback_days: 30,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits for a token. Partial refill periods carry over, so a caller that
    /// arrives mid-period waits only for the rest of it.
    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
            if refills >= u128::from(self.capacity) {
                state.tokens = self.capacity;
                state.last_refill = now;
            } else if refills > 0 {
                let refills = refills as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every * refills;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let next_refill = state.last_refill + self.refill_every;
            drop(state);
            tokio::time::sleep_until(next_refill).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct PortalResponse {
    #[serde(default)]
    documents: Vec<RawDocumentDescriptor>,
    #[serde(default)]
    checkpoint: Option<Checkpoint>,
}

#[derive(Debug)]
pub struct HttpPortalGateway {
    client: reqwest::Client,
    base_url: String,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    max_retries: u32,
    backoff: BackoffPolicy,
    initial_lookback_days: u32,
}

impl HttpPortalGateway {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building portal http client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            max_retries: config.max_retries,
            backoff: config.backoff,
            initial_lookback_days: config.initial_lookback_days,
        })
    }

    fn since_param(&self, checkpoint: Option<&Checkpoint>) -> String {
        match checkpoint {
            Some(checkpoint) => checkpoint.as_str().to_string(),
            None => {
                let since = Utc::now().date_naive()
                    - chrono::Duration::days(i64::from(self.initial_lookback_days));
                since.format("%Y-%m-%d").to_string()
            }
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        since: &str,
        timeout: Duration,
    ) -> Result<PortalResponse, GatewayError> {
        let response = self
            .client
            .get(url)
            .query(&[("since", since)])
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        response
            .json::<PortalResponse>()
            .await
            .map_err(|err| classify_reqwest_error(&err))
    }
}

#[async_trait]
impl PortalGateway for HttpPortalGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(
        &self,
        tax_id: &TaxId,
        checkpoint: Option<&Checkpoint>,
        timeout: Duration,
    ) -> Result<PortalBatch, GatewayError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| GatewayError::Transient("portal client is shutting down".into()))?;
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let url = format!("{}/companies/{}/documents", self.base_url, tax_id);
        let since = self.since_param(checkpoint);
        let span = info_span!("portal_fetch", %tax_id, since = %since);

        async {
            let mut attempt = 0;
            loop {
                match self.fetch_once(&url, &since, timeout).await {
                    Ok(body) => {
                        let checkpoint =
                            resolve_checkpoint(checkpoint, body.checkpoint, &body.documents);
                        debug!(candidates = body.documents.len(), "portal fetch complete");
                        return Ok(PortalBatch {
                            candidates: body.documents,
                            checkpoint,
                        });
                    }
                    Err(err) if err.is_retryable() && attempt < self.max_retries => {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(attempt, kind = err.kind(), error = %err, "retrying portal fetch");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_onto_the_failure_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            GatewayError::RateLimited(_)
        ));
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            assert!(matches!(classify_status(status), GatewayError::Transient(_)));
        }
        for status in [StatusCode::NOT_FOUND, StatusCode::UNAUTHORIZED, StatusCode::GONE] {
            assert!(matches!(classify_status(status), GatewayError::Permanent(_)));
        }
    }

    #[test]
    fn missing_checkpoint_requests_the_lookback_window() {
        let gateway = HttpPortalGateway::new(HttpClientConfig {
            initial_lookback_days: 30,
            ..HttpClientConfig::default()
        })
        .unwrap();
        let expected = (Utc::now().date_naive() - chrono::Duration::days(30))
            .format("%Y-%m-%d")
            .to_string();
        assert_eq!(gateway.since_param(None), expected);
        assert_eq!(
            gateway.since_param(Some(&Checkpoint::new("2024-06-01"))),
            "2024-06-01"
        );
    }

    #[tokio::test]
    async fn unreachable_portal_is_transient() {
        let gateway = HttpPortalGateway::new(HttpClientConfig {
            base_url: "http://127.0.0.1:9".into(),
            max_retries: 0,
            ..HttpClientConfig::default()
        })
        .unwrap();
        let tax_id = TaxId::parse("12345678000190").unwrap();
        let err = gateway
            .fetch(&tax_id, None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }

    #[tokio::test]
    async fn token_bucket_hands_out_capacity_then_waits() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(20));
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_millis(20));
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_keeps_the_unused_part_of_a_period() {
        let bucket = SimpleTokenBucket::new(1, Duration::from_millis(100));
        let start = Instant::now();
        bucket.take().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        bucket.take().await;
        bucket.take().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(200), "{waited:?}");
        assert!(waited < Duration::from_millis(250), "{waited:?}");
    }
}
