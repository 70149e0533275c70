//! Ingests Guarantee of Origin auction results: fetch each configured page,
//! let a language model pick the results archive, pull the spreadsheets out
//! of it and store normalized rows, skipping files already ingested.

pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod fetch;
pub mod html;
pub mod link_extractor;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod run;
pub mod spreadsheet;
pub mod traits;

#[cfg(test)]
mod testing;

pub use error::{Error, ErrorKind, Result};
pub use pipeline::{Pipeline, RunReport, Stages};
