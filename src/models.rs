use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One catalog-configured page expected to link to an archive of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub status_code: u16,
    pub body: String,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Status values the model may return instead of a link.
pub const NO_RESULTS: &str = "NO_RESULTS";
pub const EMPTY_HTML: &str = "EMPTY_HTML";

/// Link-extraction result. Serialized field names are the JSON contract
/// the language model answers with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLink {
    #[serde(rename = "error", default)]
    pub error_code: String,
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: String,
}

impl ResolvedLink {
    pub fn not_found(code: &str) -> Self {
        Self {
            error_code: code.to_string(),
            ..Default::default()
        }
    }

    pub fn is_found(&self) -> bool {
        self.error_code.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveBytes {
    pub resolved_url: String,
    pub status_code: u16,
    pub raw_bytes: Vec<u8>,
}

/// Raw tabular data lifted from one spreadsheet entry of an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct SpreadsheetPayload {
    pub source_filename: String,
    pub participant_count: i64,
    pub header_row: Vec<String>,
    pub data_rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRow {
    pub year: i32,
    pub month: u32,
    pub region: String,
    pub technology: String,
    pub total_volume_auctioned: f64,
    pub total_volume_sold: f64,
    pub weighted_avg_price: f64,
    pub owner_volume: Option<f64>,
    pub owner_weighted_avg_price: Option<f64>,
    pub winner_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFileRecord {
    pub filename: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DataRetrieval,
    LinkExtract,
    RowsParse,
    ZipDownload,
    ZipProcess,
    DataStore,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DataRetrieval => "DATA_RETRIEVAL",
            Stage::LinkExtract => "LLM_HTML_EXTRACT",
            Stage::RowsParse => "LLM_ROWS_PARSE",
            Stage::ZipDownload => "ZIP_DOWNLOAD",
            Stage::ZipProcess => "ZIP_PROCESS",
            Stage::DataStore => "DATA_STORE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Fail,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Fail => "FAIL",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit entry emitted at a stage boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    pub run_id: Option<String>,
    pub stage: Stage,
    pub outcome: Outcome,
    pub message: Option<String>,
}

/// Stored audit entry, as read back for the `logs` command.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub run_id: Option<String>,
    pub datetime: DateTime<Utc>,
    pub stage: String,
    pub outcome: String,
    pub message: Option<String>,
}
