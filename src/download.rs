use async_trait::async_trait;
use url::Url;

use crate::error::{Error, Result};
use crate::models::{ArchiveBytes, Outcome, Stage};
use crate::run::RunContext;

#[async_trait]
pub trait ArchiveDownload: Send + Sync {
    async fn download(&self, link: &str, source_url: &str, ctx: &RunContext) -> Result<ArchiveBytes>;
}

pub struct HttpDownloader {
    http: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn get(&self, url: &str) -> Result<ArchiveBytes> {
        let fail = |status: Option<u16>, message: String| Error::Download {
            url: url.to_string(),
            status,
            message,
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| fail(None, format!("send request: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fail(
                Some(status.as_u16()),
                format!("download failed with status {}", status.as_u16()),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| fail(Some(status.as_u16()), format!("read body: {}", e)))?;

        Ok(ArchiveBytes {
            resolved_url: url.to_string(),
            status_code: status.as_u16(),
            raw_bytes: bytes.to_vec(),
        })
    }
}

#[async_trait]
impl ArchiveDownload for HttpDownloader {
    async fn download(&self, link: &str, source_url: &str, ctx: &RunContext) -> Result<ArchiveBytes> {
        let url = match resolve_archive_url(link, source_url) {
            Ok(url) => url,
            Err(e) => {
                ctx.record(Stage::ZipDownload, Outcome::Fail, e.to_string()).await;
                return Err(e);
            }
        };

        match ctx.guard(self.get(&url)).await {
            Ok(archive) => {
                ctx.record(
                    Stage::ZipDownload,
                    Outcome::Success,
                    format!(
                        "status={} url={} bytes={}",
                        archive.status_code,
                        archive.resolved_url,
                        archive.raw_bytes.len()
                    ),
                )
                .await;
                Ok(archive)
            }
            Err(e) => {
                ctx.record(Stage::ZipDownload, Outcome::Fail, e.to_string()).await;
                Err(e)
            }
        }
    }
}

/// Resolve `link` against the page it was found on and require a `.zip`
/// target. Runs before any network call.
pub fn resolve_archive_url(link: &str, source_url: &str) -> Result<String> {
    let link = link.trim();
    if link.is_empty() {
        return Err(Error::InvalidLink("link is empty".into()));
    }

    let resolved = match Url::parse(link) {
        Ok(absolute) => absolute,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            if source_url.trim().is_empty() {
                return Err(Error::InvalidLink(format!(
                    "relative link {} without a source url",
                    link
                )));
            }
            let base = Url::parse(source_url.trim())
                .map_err(|e| Error::InvalidLink(format!("parse source url {}: {}", source_url, e)))?;
            base.join(link)
                .map_err(|e| Error::InvalidLink(format!("join {}: {}", link, e)))?
        }
        Err(e) => return Err(Error::InvalidLink(format!("parse link {}: {}", link, e))),
    };

    let resolved = resolved.to_string();
    if !resolved.to_lowercase().ends_with(".zip") {
        return Err(Error::InvalidLink(format!(
            "url does not end with .zip: {}",
            resolved
        )));
    }
    Ok(resolved)
}
