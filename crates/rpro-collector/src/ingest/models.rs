//! Collector data model
//!
//! Types that flow through one collection cycle: the file pulled off an IHM,
//! the rows parsed out of it, and the per-file outcome reported back to callers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Number of product slots in a feed production record
pub const PRODUCT_SLOTS: usize = 40;

/// Production line a collector instance serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductionLine {
    /// Animal feed batches ("ração")
    Racao,
    /// Peanut intake/output weighing ("amendoim")
    Amendoim,
}

impl ProductionLine {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductionLine::Racao => "racao",
            ProductionLine::Amendoim => "amendoim",
        }
    }

    /// Record layout the line's IHMs export
    pub fn expected_kind(&self) -> FileKind {
        match self {
            ProductionLine::Racao => FileKind::Production,
            ProductionLine::Amendoim => FileKind::Flow,
        }
    }
}

impl std::fmt::Display for ProductionLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProductionLine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "racao" | "ração" | "feed" => Ok(ProductionLine::Racao),
            "amendoim" | "peanut" => Ok(ProductionLine::Amendoim),
            other => Err(anyhow::anyhow!("Unknown production line: {}", other)),
        }
    }
}

/// Direction of a peanut weighing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowRole {
    Entrada,
    Saida,
}

impl FlowRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowRole::Entrada => "entrada",
            FlowRole::Saida => "saida",
        }
    }

    /// Role implied by a scale identifier, falling back to the endpoint default
    ///
    /// Scales 1 and 2 weigh intake, scale 3 weighs output.
    pub fn classify(scale: Option<&str>, default: FlowRole) -> FlowRole {
        match scale.map(str::trim) {
            Some("1") | Some("2") => FlowRole::Entrada,
            Some("3") => FlowRole::Saida,
            _ => default,
        }
    }
}

impl std::fmt::Display for FlowRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlowRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "entrada" => Ok(FlowRole::Entrada),
            "saida" | "saída" => Ok(FlowRole::Saida),
            other => Err(anyhow::anyhow!("Unknown flow role: {}", other)),
        }
    }
}

/// A CSV export downloaded to a local temp file
///
/// Owned by the pipeline until processed; the temp copy is deleted afterwards
/// and the descriptor itself is never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedFile {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub modified: Option<DateTime<Utc>>,
    pub size: u64,
    /// Lowercase hex SHA-256 of the downloaded bytes
    pub hash: String,
    /// Identifier of the IHM the file came from
    pub source: String,
}

/// Record layout of an export file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// Feed batch report: date, time, formula, two codes, up to 40 quantities
    Production,
    /// Peanut weighing log with fixed column offsets
    Flow,
    Unknown,
}

/// One feed batch line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRow {
    pub date: String,
    pub time: String,
    pub label: String,
    pub code1: Option<i32>,
    pub code2: Option<i32>,
    /// Quantity per product slot, in column order; never longer than 40
    pub quantities: Vec<f64>,
}

impl ProductionRow {
    /// Quantities spread over the 40 product slots, missing ones at zero
    ///
    /// Index `i` holds product slot `i + 1`.
    pub fn product_slots(&self) -> [f64; PRODUCT_SLOTS] {
        let mut slots = [0.0; PRODUCT_SLOTS];
        for (slot, value) in slots.iter_mut().zip(&self.quantities) {
            *slot = *value;
        }
        slots
    }
}

/// One peanut weighing line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRow {
    pub date: String,
    pub time: String,
    pub product_code: String,
    pub product_name: String,
    /// Always >= 0
    pub weight: f64,
    pub scale: Option<String>,
}

/// A parsed line, tagged by layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParsedRow {
    Production(ProductionRow),
    Flow(FlowRow),
}

/// Outcome of processing a single collected file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub file_name: String,
    pub source: String,
    pub success: bool,
    /// Lines accepted by the parser
    pub rows_processed: usize,
    /// Rows the store reported as newly inserted
    pub rows_saved: usize,
    /// Accepted rows the store already held
    pub rows_duplicated: usize,
    /// Malformed lines skipped, or 1 when the whole file failed
    pub rows_errored: usize,
    pub error_message: Option<String>,
    pub duration: Duration,
    pub finished_at: DateTime<Utc>,
}

impl ProcessResult {
    pub fn succeeded(
        file: &CollectedFile,
        rows_processed: usize,
        rows_saved: usize,
        rows_errored: usize,
        duration: Duration,
    ) -> Self {
        Self {
            file_name: file.name.clone(),
            source: file.source.clone(),
            success: true,
            rows_processed,
            rows_saved,
            rows_duplicated: rows_processed.saturating_sub(rows_saved),
            rows_errored,
            error_message: None,
            duration,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        file: &CollectedFile,
        rows_processed: usize,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            file_name: file.name.clone(),
            source: file.source.clone(),
            success: false,
            rows_processed,
            rows_saved: 0,
            rows_duplicated: 0,
            rows_errored: 1,
            error_message: Some(message.into()),
            duration,
            finished_at: Utc::now(),
        }
    }
}

/// Snapshot of a collector's state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorStatus {
    pub is_running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub files_processed: u64,
    pub total_rows_saved: u64,
    pub last_error: Option<String>,
    /// Newest first, at most 10 entries
    pub recent_results: Vec<ProcessResult>,
}

/// Parse a feed report date ("01/03/2024")
pub fn parse_production_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%d/%m/%Y").ok()
}

/// Parse a peanut log date ("01-03-24")
pub fn parse_flow_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%d-%m-%y")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
        .ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn collected(name: &str) -> CollectedFile {
        CollectedFile {
            name: name.to_string(),
            local_path: PathBuf::from("/tmp").join(name),
            remote_path: format!("/InternalStorage/data/{}", name),
            modified: None,
            size: 10,
            hash: "abc".to_string(),
            source: "IHM1".to_string(),
        }
    }

    #[test]
    fn test_product_slots_pad_with_zero() {
        let row = ProductionRow {
            date: "01/03/2024".to_string(),
            time: "07:30".to_string(),
            label: "FormulaX".to_string(),
            code1: Some(5),
            code2: Some(9),
            quantities: vec![100.0, 200.0, 50.0],
        };

        let slots = row.product_slots();
        assert_eq!(slots.len(), PRODUCT_SLOTS);
        assert_eq!(&slots[..3], &[100.0, 200.0, 50.0]);
        assert!(slots[3..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_flow_role_classification() {
        assert_eq!(FlowRole::classify(Some("1"), FlowRole::Saida), FlowRole::Entrada);
        assert_eq!(FlowRole::classify(Some("2"), FlowRole::Saida), FlowRole::Entrada);
        assert_eq!(FlowRole::classify(Some("3"), FlowRole::Entrada), FlowRole::Saida);
        assert_eq!(FlowRole::classify(Some("7"), FlowRole::Saida), FlowRole::Saida);
        assert_eq!(FlowRole::classify(None, FlowRole::Entrada), FlowRole::Entrada);
    }

    #[test]
    fn test_process_result_counts_duplicates() {
        let file = collected("relatorio.csv");
        let result = ProcessResult::succeeded(&file, 10, 7, 2, Duration::from_millis(5));
        assert!(result.success);
        assert_eq!(result.rows_duplicated, 3);
        assert_eq!(result.rows_errored, 2);

        let failed = ProcessResult::failed(&file, 4, "store offline", Duration::ZERO);
        assert!(!failed.success);
        assert_eq!(failed.rows_saved, 0);
        assert_eq!(failed.rows_errored, 1);
        assert_eq!(failed.error_message.as_deref(), Some("store offline"));
    }

    #[test]
    fn test_line_and_role_from_str() {
        assert_eq!("Ração".parse::<ProductionLine>().unwrap(), ProductionLine::Racao);
        assert_eq!("AMENDOIM".parse::<ProductionLine>().unwrap(), ProductionLine::Amendoim);
        assert!("soja".parse::<ProductionLine>().is_err());
        assert_eq!("saída".parse::<FlowRole>().unwrap(), FlowRole::Saida);
    }

    #[test]
    fn test_date_formats() {
        assert_eq!(
            parse_production_date("01/03/2024"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(parse_flow_date("01-03-24"), NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(parse_flow_date("garbage"), None);
    }
}
