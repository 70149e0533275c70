use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::{strip_code_blocks, ChatModel};
use crate::models::{CanonicalRow, Outcome, SpreadsheetPayload, Stage};
use crate::run::RunContext;

pub const MAX_ROWS_PER_BATCH: usize = 500;
pub const TOKEN_BUDGET: usize = 8000;
const SYNTHETIC_CELL_CHARS: usize = 8;
const CHARS_PER_TOKEN: usize = 4;

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

/// Where canonical rows get their year and month from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YearMonthMode {
    /// The model returns year/month on every row.
    Inline,
    /// Parsed from the `<MonthName>_<Year>` tokens of the source filename.
    #[default]
    Filename,
}

/// Rows from the batches that succeeded, plus the first batch failure.
#[derive(Debug)]
pub struct Normalized {
    pub rows: Vec<CanonicalRow>,
    pub error: Option<Error>,
}

pub struct RowNormalizer {
    model: Arc<dyn ChatModel>,
    attempts: u32,
    max_rows_per_batch: usize,
    token_budget: usize,
    mode: YearMonthMode,
}

impl RowNormalizer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            attempts: 3,
            max_rows_per_batch: MAX_ROWS_PER_BATCH,
            token_budget: TOKEN_BUDGET,
            mode: YearMonthMode::default(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_batching(mut self, max_rows_per_batch: usize, token_budget: usize) -> Self {
        self.max_rows_per_batch = max_rows_per_batch.max(1);
        self.token_budget = token_budget;
        self
    }

    pub fn with_mode(mut self, mode: YearMonthMode) -> Self {
        self.mode = mode;
        self
    }

    /// Normalize a payload batch by batch. A failing batch does not stop the
    /// others; the call only errors when the payload is unusable up front or
    /// no batch produced rows.
    pub async fn normalize(&self, payload: &SpreadsheetPayload, ctx: &RunContext) -> Result<Normalized> {
        let file_period = match self.prepare(payload) {
            Ok(period) => period,
            Err(e) => {
                ctx.record(
                    Stage::RowsParse,
                    Outcome::Fail,
                    format!("source_file={}: {}", payload.source_filename, e),
                )
                .await;
                return Err(e);
            }
        };

        let batches: Vec<&[Vec<String>]> = payload.data_rows.chunks(self.max_rows_per_batch).collect();
        let estimate = estimate_tokens(batches[0].len(), payload.header_row.len());
        let ok = estimate <= self.token_budget;
        ctx.record(
            Stage::RowsParse,
            if ok { Outcome::Success } else { Outcome::Fail },
            format!(
                "source_file={} rows={} batches={} estimate={} budget={} max_rows={} ok={}",
                payload.source_filename,
                payload.data_rows.len(),
                batches.len(),
                estimate,
                self.token_budget,
                self.max_rows_per_batch,
                ok
            ),
        )
        .await;
        if !ok {
            return Err(Error::PayloadTooLarge {
                estimate,
                budget: self.token_budget,
            });
        }

        let schema = response_schema(self.mode);
        let mut rows = Vec::new();
        let mut first_error = None;

        for (i, batch) in batches.iter().enumerate() {
            let batch_no = i + 1;
            let prompt = build_prompt(payload, batch, batch_no, self.mode);

            let result = match self.call_with_retry(&prompt, &schema, ctx, payload, batch_no).await {
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => Err(e),
                Ok(content) => parse_batch(&content, file_period),
            };

            match result {
                Ok(batch_rows) => {
                    ctx.record(
                        Stage::RowsParse,
                        Outcome::Success,
                        format!(
                            "source_file={} batch={} rows={}",
                            payload.source_filename,
                            batch_no,
                            batch_rows.len()
                        ),
                    )
                    .await;
                    rows.extend(batch_rows);
                }
                Err(e) => {
                    ctx.record(
                        Stage::RowsParse,
                        Outcome::Fail,
                        format!("source_file={} batch={}: {}", payload.source_filename, batch_no, e),
                    )
                    .await;
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if rows.is_empty() {
            return Err(first_error.unwrap_or_else(|| Error::Validation("model returned no rows".into())));
        }
        Ok(Normalized {
            rows,
            error: first_error,
        })
    }

    fn prepare(&self, payload: &SpreadsheetPayload) -> Result<Option<(i32, u32)>> {
        validate_payload(payload)?;
        match self.mode {
            YearMonthMode::Filename => year_month_from_filename(&payload.source_filename).map(Some),
            YearMonthMode::Inline => Ok(None),
        }
    }

    async fn call_with_retry(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        ctx: &RunContext,
        payload: &SpreadsheetPayload,
        batch_no: usize,
    ) -> Result<String> {
        let mut attempt = 1;
        loop {
            match ctx.guard(self.model.complete(prompt, Some(schema))).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    ctx.record(
                        Stage::RowsParse,
                        Outcome::Fail,
                        format!(
                            "source_file={} batch={} attempt={}/{}: {}",
                            payload.source_filename, batch_no, attempt, self.attempts, e
                        ),
                    )
                    .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn validate_payload(payload: &SpreadsheetPayload) -> Result<()> {
    if payload.source_filename.trim().is_empty() {
        return Err(Error::Validation("source file is empty".into()));
    }
    if payload.participant_count <= 0 {
        return Err(Error::Validation("participants must be positive".into()));
    }
    if payload.header_row.is_empty() {
        return Err(Error::Validation("headers are empty".into()));
    }
    if payload.data_rows.is_empty() {
        return Err(Error::Validation("rows are empty".into()));
    }
    Ok(())
}

/// Rough pre-flight cost: every cell counted as eight characters, four
/// characters per token.
pub fn estimate_tokens(rows: usize, columns: usize) -> usize {
    rows * columns * SYNTHETIC_CELL_CHARS / CHARS_PER_TOKEN
}

/// `(year, month)` from a `<MonthName>_<Year>` token pair in a filename,
/// e.g. `20251119_August_2025_83_GLOBAL_Results.xlsx` gives `(2025, 8)`.
pub fn year_month_from_filename(name: &str) -> Result<(i32, u32)> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let stem = base.rsplit_once('.').map_or(base, |(stem, _)| stem);
    let tokens: Vec<&str> = stem.split('_').map(str::trim).collect();

    for (i, token) in tokens.iter().enumerate() {
        let lower = token.to_lowercase();
        let Some(month) = MONTHS.iter().position(|m| *m == lower) else {
            continue;
        };
        let year_token = tokens
            .get(i + 1)
            .ok_or_else(|| Error::Validation(format!("{}: year token missing after month", name)))?;
        let year = year_token
            .parse::<i32>()
            .map_err(|_| Error::Validation(format!("{}: year {:?} is not a number", name, year_token)))?;
        return Ok((year, month as u32 + 1));
    }

    Err(Error::Validation(format!("{}: month not found in filename", name)))
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    source_file: &'a str,
    participants: i64,
    headers: &'a [String],
    rows: &'a [Vec<String>],
    batch: usize,
}

fn build_prompt(payload: &SpreadsheetPayload, rows: &[Vec<String>], batch: usize, mode: YearMonthMode) -> String {
    let request = BatchRequest {
        source_file: &payload.source_filename,
        participants: payload.participant_count,
        headers: &payload.header_row,
        rows,
        batch,
    };
    let body = serde_json::to_string(&request).unwrap_or_else(|_| "{}".into());

    let period_rule = match mode {
        YearMonthMode::Filename => "Do not include year or month fields; they are derived from source_file.",
        YearMonthMode::Inline => {
            "Set integer year and month (1-12) on every row, taken from source_file or the data."
        }
    };

    format!(
        r#"Instructions:
1. Convert the provided rows into the auction_results schema.
2. Map the headers, whatever their wording, to the canonical field names.
3. Convert decimal commas to decimal points.
4. Convert "-" or empty cells to null.
5. Coerce numeric strings to numbers.
6. {}
7. Return only JSON that matches the provided schema.

Payload:
{}"#,
        period_rule, body
    )
}

fn response_schema(mode: YearMonthMode) -> serde_json::Value {
    let mut properties = json!({
        "region": { "type": "string" },
        "technology": { "type": "string" },
        "total_volume_auctioned": { "type": ["number", "null"] },
        "total_volume_sold": { "type": ["number", "null"] },
        "weighted_avg_price": { "type": ["number", "null"] },
        "owner_volume": { "type": ["number", "null"] },
        "owner_weighted_avg_price": { "type": ["number", "null"] },
        "winner_count": { "type": ["integer", "null"] }
    });
    let mut required = vec![
        "region",
        "technology",
        "total_volume_auctioned",
        "total_volume_sold",
        "weighted_avg_price",
        "owner_volume",
        "owner_weighted_avg_price",
        "winner_count",
    ];
    if mode == YearMonthMode::Inline {
        properties["year"] = json!({ "type": "integer" });
        properties["month"] = json!({ "type": "integer" });
        required.extend(["year", "month"]);
    }

    json!({
        "name": "auction_results",
        "strict": true,
        "schema": {
            "type": "object",
            "properties": {
                "source_file": { "type": "string" },
                "participants": { "type": "integer" },
                "rows": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                        "additionalProperties": false
                    }
                }
            },
            "required": ["source_file", "participants", "rows"],
            "additionalProperties": false
        }
    })
}

#[derive(Debug, Deserialize)]
struct RawResults {
    #[serde(default)]
    rows: Vec<RawRow>,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    year: Option<f64>,
    month: Option<f64>,
    region: Option<String>,
    technology: Option<String>,
    total_volume_auctioned: Option<f64>,
    total_volume_sold: Option<f64>,
    weighted_avg_price: Option<f64>,
    owner_volume: Option<f64>,
    owner_weighted_avg_price: Option<f64>,
    winner_count: Option<f64>,
}

fn parse_batch(content: &str, file_period: Option<(i32, u32)>) -> Result<Vec<CanonicalRow>> {
    let raw: RawResults = serde_json::from_str(strip_code_blocks(content))
        .map_err(|e| Error::Validation(format!("parse rows json: {}", e)))?;
    if raw.rows.is_empty() {
        return Err(Error::Validation("rows are empty".into()));
    }
    debug!(rows = raw.rows.len(), "model rows decoded");

    raw.rows
        .into_iter()
        .enumerate()
        .map(|(i, row)| to_canonical(i, row, file_period))
        .collect()
}

fn to_canonical(index: usize, row: RawRow, file_period: Option<(i32, u32)>) -> Result<CanonicalRow> {
    let invalid = |what: &str| Error::Validation(format!("row {} {}", index, what));

    let (year, month) = match file_period {
        Some((year, month)) => (year, month),
        None => {
            let year = exact_int(row.year)
                .and_then(|y| i32::try_from(y).ok())
                .ok_or_else(|| invalid("year is missing or not an integer"))?;
            let month = exact_int(row.month)
                .and_then(|m| u32::try_from(m).ok())
                .ok_or_else(|| invalid("month is missing or not an integer"))?;
            (year, month)
        }
    };
    if year == 0 {
        return Err(invalid("year is zero"));
    }
    if !(1..=12).contains(&month) {
        return Err(invalid("month is out of range"));
    }

    let region = row.region.unwrap_or_default().trim().to_string();
    if region.is_empty() {
        return Err(invalid("region is empty"));
    }
    let technology = row.technology.unwrap_or_default().trim().to_string();
    if technology.is_empty() {
        return Err(invalid("technology is empty"));
    }

    let winner_count = match row.winner_count {
        None => None,
        Some(_) => Some(exact_int(row.winner_count).ok_or_else(|| invalid("winner_count is not an integer"))?),
    };

    Ok(CanonicalRow {
        year,
        month,
        region,
        technology,
        total_volume_auctioned: row.total_volume_auctioned.unwrap_or(0.0),
        total_volume_sold: row.total_volume_sold.unwrap_or(0.0),
        weighted_avg_price: row.weighted_avg_price.unwrap_or(0.0),
        owner_volume: row.owner_volume,
        owner_weighted_avg_price: row.owner_weighted_avg_price,
        winner_count,
    })
}

fn exact_int(value: Option<f64>) -> Option<i64> {
    let v = value?;
    (v.is_finite() && v.fract() == 0.0).then_some(v as i64)
}
