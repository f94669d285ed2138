use bytes::Bytes;
use futures::StreamExt;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{FetchError, RetryPolicy};

const USER_AGENT: &str = concat!("claude-plugins/", env!("CARGO_PKG_VERSION"));

/// Upper bound for JSON documents such as search results or release metadata.
const MAX_JSON_SIZE: u64 = 4 * 1024 * 1024;

/// reqwest client paired with the shared retry policy.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(retry: RetryPolicy) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| FetchError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, retry))
    }

    pub fn with_client(client: reqwest::Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// GETs `url` into memory, refusing bodies above `limit` bytes.
    pub async fn get_bytes(
        &self,
        url: &str,
        auth: Option<&SecretString>,
        limit: u64,
    ) -> Result<Bytes, FetchError> {
        self.retry
            .run(url, || self.attempt(url, auth, limit, None))
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        auth: Option<&SecretString>,
    ) -> Result<T, FetchError> {
        let body = self
            .retry
            .run(url, || {
                self.attempt(url, auth, MAX_JSON_SIZE, Some("application/json"))
            })
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| FetchError::Network(format!("invalid JSON from {url}: {e}")))
    }

    async fn attempt(
        &self,
        url: &str,
        auth: Option<&SecretString>,
        limit: u64,
        accept: Option<&str>,
    ) -> Result<Bytes, FetchError> {
        debug!(url, "Fetching");

        let mut request = self.client.get(url);
        if let Some(token) = auth {
            request = request.bearer_auth(token.expose_secret());
        }
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        let response = request.send().await.map_err(|e| map_reqwest(url, e))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        download_with_limit(url, response, limit).await
    }
}

async fn download_with_limit(
    url: &str,
    response: reqwest::Response,
    limit: u64,
) -> Result<Bytes, FetchError> {
    if let Some(len) = response.content_length()
        && len > limit
    {
        return Err(FetchError::TooLarge { size: len, limit });
    }

    let capacity = usize::try_from(response.content_length().unwrap_or(0).min(limit)).unwrap_or(0);
    let mut buffer = Vec::with_capacity(capacity);
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| map_reqwest(url, e))?;
        buffer.extend_from_slice(&chunk);
        let size = buffer.len() as u64;
        if size > limit {
            return Err(FetchError::TooLarge { size, limit });
        }
    }

    Ok(Bytes::from(buffer))
}

fn map_reqwest(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout {
            locator: url.to_string(),
            after: std::time::Duration::ZERO,
        }
    } else {
        FetchError::Network(format!("{url}: {error}"))
    }
}
