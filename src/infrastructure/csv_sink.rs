//! Destination for completed CSV captures.
//!
//! A sink receives the whole captured blob and answers with the parsed
//! table: header row as the column list, every following line as one
//! record keyed by column name.

use crate::domain::models::CsvTable;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("No CSV data received")]
    Empty,

    #[error("CSV parsing failed: {0}")]
    Malformed(String),

    #[error("failed to store CSV: {0}")]
    Io(#[from] std::io::Error),
}

impl From<csv::Error> for SinkError {
    fn from(error: csv::Error) -> Self {
        SinkError::Malformed(error.to_string())
    }
}

#[async_trait]
pub trait CsvSink: Send + Sync {
    async fn submit(&self, csv: &str) -> Result<CsvTable, SinkError>;
}

/// Parse a CSV blob into a table. Blank lines are skipped; short records
/// are padded with empty fields, long ones are rejected.
pub fn parse_table(data: &str) -> Result<CsvTable, SinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data.as_bytes());

    let columns: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();
    if columns.is_empty() {
        return Err(SinkError::Empty);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.len() > columns.len() {
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            return Err(SinkError::Malformed(format!(
                "expected {} fields in line {}, saw {}",
                columns.len(),
                line,
                record.len()
            )));
        }
        let row: BTreeMap<String, String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| (column.clone(), record.get(i).unwrap_or_default().to_owned()))
            .collect();
        rows.push(row);
    }

    Ok(CsvTable { columns, rows })
}

/// Stores every capture as a timestamped file under one directory
pub struct FileCsvSink {
    dir: PathBuf,
}

impl FileCsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CsvSink for FileCsvSink {
    async fn submit(&self, csv: &str) -> Result<CsvTable, SinkError> {
        if csv.trim().is_empty() {
            return Err(SinkError::Empty);
        }
        let table = parse_table(csv)?;

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let path = self.dir.join(format!("capture_{}.csv", millis));

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, csv).await?;
        debug!(bytes = csv.len(), "CSV written");
        info!("CSV capture saved to {}", path.display());

        Ok(table)
    }
}
