use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::FetchResult;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Non-2xx statuses come back as a normal result; only transport
    /// failures are errors.
    async fn fetch(&self, url: &str) -> Result<FetchResult>;
}

pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResult> {
        if url.trim().is_empty() {
            return Err(Error::Fetch {
                url: String::new(),
                message: "url is empty".into(),
            });
        }

        let fail = |message: String| Error::Fetch {
            url: url.to_string(),
            message,
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| fail(format!("send request: {}", e)))?;
        let status_code = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| fail(format!("read response: {}", e)))?;

        debug!(url, status_code, bytes = body.len(), "fetched page");
        Ok(FetchResult {
            url: url.to_string(),
            status_code,
            body,
        })
    }
}
