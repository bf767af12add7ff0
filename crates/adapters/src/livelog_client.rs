//! HTTP log-sink client.
//!
//! Speaks the log-stream wire protocol: POST opens a stream, PUT appends
//! a batch of lines, POST /blob uploads the final history, DELETE closes
//! the stream. Idempotent calls retry with exponential backoff inside a
//! ten second budget; 4xx responses are permanent and never retried.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use tracing::debug;

use hodei_runner_ports::{Line, LogStreamClient, LogStreamError};

const RETRY_BUDGET: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

pub struct HttpLogStreamClient {
    client: reqwest::Client,
    endpoint: String,
    account_id: String,
    token: String,
}

impl HttpLogStreamClient {
    pub fn new(
        endpoint: impl Into<String>,
        account_id: impl Into<String>,
        token: impl Into<String>,
        skip_verify: bool,
    ) -> Self {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(skip_verify)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            account_id: account_id.into(),
            token: token.into(),
        }
    }

    fn stream_url(&self, key: &str) -> String {
        format!(
            "{}/stream?accountID={}&key={}",
            self.endpoint, self.account_id, key
        )
    }

    fn blob_url(&self, key: &str) -> String {
        format!(
            "{}/blob?accountID={}&key={}",
            self.endpoint, self.account_id, key
        )
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&[Line]>,
    ) -> Result<(), LogStreamError> {
        let mut request = self
            .client
            .request(method, url)
            .header("X-Harness-Token", &self.token);
        if let Some(lines) = body {
            request = request.json(lines);
        }
        let response = request
            .send()
            .await
            .map_err(|e| LogStreamError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LogStreamError::Status(status.as_u16()));
        }
        Ok(())
    }

    // retries the request with exponential backoff until it succeeds,
    // fails permanently, or the budget expires.
    async fn send_retry(
        &self,
        method: Method,
        url: &str,
        body: Option<&[Line]>,
    ) -> Result<(), LogStreamError> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.send(method.clone(), url, body).await {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    if started.elapsed() + backoff > RETRY_BUDGET {
                        return Err(err);
                    }
                    debug!(url = %url, error = %err, "retrying log sink call");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

#[async_trait]
impl LogStreamClient for HttpLogStreamClient {
    async fn open(&self, key: &str) -> Result<(), LogStreamError> {
        self.send_retry(Method::POST, &self.stream_url(key), None)
            .await
    }

    async fn batch(&self, key: &str, lines: &[Line]) -> Result<(), LogStreamError> {
        self.send(Method::PUT, &self.stream_url(key), Some(lines))
            .await
    }

    async fn upload(&self, key: &str, lines: &[Line]) -> Result<(), LogStreamError> {
        self.send_retry(Method::POST, &self.blob_url(key), Some(lines))
            .await
    }

    async fn close(&self, key: &str) -> Result<(), LogStreamError> {
        self.send(Method::DELETE, &self.stream_url(key), None).await
    }
}
