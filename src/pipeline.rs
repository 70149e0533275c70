use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::download::ArchiveDownload;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::html::links;
use crate::link_extractor::LinkExtractor;
use crate::models::{Outcome, Source, SpreadsheetPayload, Stage};
use crate::normalize::RowNormalizer;
use crate::run::RunContext;
use crate::spreadsheet::WorkbookExtract;
use crate::traits::{AuditLog, DedupTracker, ResultStore, SourceCatalog};

/// Collaborators the orchestrator drives, one per stage.
pub struct Stages {
    pub catalog: Arc<dyn SourceCatalog>,
    pub fetcher: Arc<dyn Fetcher>,
    pub link_extractor: LinkExtractor,
    pub downloader: Arc<dyn ArchiveDownload>,
    pub workbooks: Arc<dyn WorkbookExtract>,
    pub normalizer: RowNormalizer,
    pub store: Arc<dyn ResultStore>,
    pub dedup: Arc<dyn DedupTracker>,
    pub audit: Arc<dyn AuditLog>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub sources: usize,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub rows_stored: usize,
}

pub struct Pipeline {
    stages: Stages,
    running: Mutex<()>,
}

impl Pipeline {
    pub fn new(stages: Stages) -> Self {
        Self {
            stages,
            running: Mutex::new(()),
        }
    }

    /// One full pass over the catalog. Every source is attempted; the first
    /// error met anywhere in the run is returned once all of them are done.
    pub async fn refresh(&self, cancel: CancellationToken) -> Result<RunReport> {
        let _guard = self.running.try_lock().map_err(|_| Error::RefreshInProgress)?;
        let ctx = RunContext::new(self.stages.audit.clone(), cancel);
        self.run(&ctx).await
    }

    async fn run(&self, ctx: &RunContext) -> Result<RunReport> {
        let mut report = RunReport {
            run_id: ctx.run_id().to_string(),
            ..Default::default()
        };
        ctx.record(Stage::DataRetrieval, Outcome::Success, "pipeline refresh started")
            .await;

        let sources = match self.stages.catalog.list_sources().await {
            Ok(sources) => sources,
            Err(e) => {
                ctx.record(Stage::DataRetrieval, Outcome::Fail, format!("list sources: {}", e))
                    .await;
                return Err(e);
            }
        };
        report.sources = sources.len();

        let mut first_error: Option<Error> = None;
        for source in &sources {
            if ctx.is_cancelled() {
                keep_first(&mut first_error, Error::Cancelled);
                break;
            }
            match self.process_source(source, ctx, &mut report).await {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    warn!(run_id = ctx.run_id(), url = %source.url, "refresh cancelled");
                    keep_first(&mut first_error, Error::Cancelled);
                    break;
                }
                Err(e) => {
                    warn!(run_id = ctx.run_id(), url = %source.url, error = %e, "source failed");
                    keep_first(&mut first_error, e);
                }
            }
        }

        info!(
            run_id = ctx.run_id(),
            sources = report.sources,
            files_processed = report.files_processed,
            files_skipped = report.files_skipped,
            rows_stored = report.rows_stored,
            ok = first_error.is_none(),
            "refresh finished"
        );

        if let Some(e) = first_error.or_else(|| ctx.take_log_failure()) {
            return Err(e);
        }
        Ok(report)
    }

    async fn process_source(&self, source: &Source, ctx: &RunContext, report: &mut RunReport) -> Result<()> {
        let url = source.url.trim();
        if url.is_empty() {
            let e = Error::Source(format!("source {} has an empty url", source.id));
            ctx.record(Stage::DataRetrieval, Outcome::Fail, e.to_string()).await;
            return Err(e);
        }

        let page = match ctx.guard(self.stages.fetcher.fetch(url)).await {
            Ok(page) => page,
            Err(e) => {
                ctx.record(Stage::DataRetrieval, Outcome::Fail, e.to_string()).await;
                return Err(e);
            }
        };
        let message = format!("url={} status={} bytes={}", url, page.status_code, page.body.len());
        if !page.is_success() {
            ctx.record(Stage::DataRetrieval, Outcome::Fail, message).await;
            return Err(Error::Fetch {
                url: url.to_string(),
                message: format!("request failed with status {}", page.status_code),
            });
        }
        ctx.record(Stage::DataRetrieval, Outcome::Success, message).await;

        // A blank body goes to the extractor as-is so it reports EMPTY_HTML.
        let html = if page.body.trim().is_empty() {
            page.body
        } else {
            match links::resolve(url, &page.body) {
                Ok(html) => html,
                Err(e) => {
                    ctx.record(Stage::DataRetrieval, Outcome::Fail, format!("url={}: {}", url, e))
                        .await;
                    return Err(e);
                }
            }
        };

        let link = self.stages.link_extractor.extract_link(&html, ctx).await?;
        if !link.is_found() {
            return Err(Error::LinkNotFound {
                url: url.to_string(),
                status: link.error_code,
            });
        }

        let archive = self.stages.downloader.download(&link.link, url, ctx).await?;

        let contents = match self.stages.workbooks.extract(&archive) {
            Ok(contents) => contents,
            Err(e) => {
                ctx.record(
                    Stage::ZipProcess,
                    Outcome::Fail,
                    format!("url={}: {}", archive.resolved_url, e),
                )
                .await;
                return Err(e);
            }
        };
        ctx.record(
            Stage::ZipProcess,
            Outcome::Success,
            format!(
                "url={} spreadsheets={} skipped={}",
                archive.resolved_url,
                contents.payloads.len(),
                contents.skipped.len()
            ),
        )
        .await;

        let mut first_error = None;
        for e in contents.skipped {
            ctx.record(Stage::ZipProcess, Outcome::Fail, e.to_string()).await;
            keep_first(&mut first_error, e);
        }

        for payload in &contents.payloads {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.process_entry(payload, ctx, report).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => keep_first(&mut first_error, e),
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Dedup gate, normalization, store, and processed marker for one
    /// spreadsheet entry.
    async fn process_entry(
        &self,
        payload: &SpreadsheetPayload,
        ctx: &RunContext,
        report: &mut RunReport,
    ) -> Result<()> {
        let file = payload.source_filename.as_str();

        match self.stages.dedup.is_processed(file).await {
            Ok(true) => {
                ctx.record(
                    Stage::ZipProcess,
                    Outcome::Success,
                    format!("already processed source_file={}", file),
                )
                .await;
                report.files_skipped += 1;
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                ctx.record(
                    Stage::ZipProcess,
                    Outcome::Fail,
                    format!("dedup check source_file={}: {}", file, e),
                )
                .await;
                return Err(e);
            }
        }

        let normalized = self.stages.normalizer.normalize(payload, ctx).await?;

        let stored = match self
            .stages
            .store
            .store_rows(file, payload.participant_count, &normalized.rows)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                ctx.record(
                    Stage::DataStore,
                    Outcome::Fail,
                    format!("store source_file={}: {}", file, e),
                )
                .await;
                return Err(e);
            }
        };
        ctx.record(
            Stage::DataStore,
            Outcome::Success,
            format!("stored rows={} source_file={}", stored, file),
        )
        .await;
        report.rows_stored += stored;

        if let Err(e) = self.stages.dedup.mark_processed(file).await {
            ctx.record(
                Stage::DataStore,
                Outcome::Fail,
                format!("mark processed source_file={}: {}", file, e),
            )
            .await;
            return Err(e);
        }
        report.files_processed += 1;

        // Rows from the batches that worked are kept; the failed batch still
        // counts against the run.
        normalized.error.map_or(Ok(()), Err)
    }
}

fn keep_first(slot: &mut Option<Error>, e: Error) {
    if slot.is_none() {
        *slot = Some(e);
    }
}
