//! One collection cycle
//!
//! For each endpoint in configured order: download new exports, parse them,
//! insert the rows and report a [`ProcessResult`] per file. A failing file
//! never stops the cycle. The cycle as a whole fails when every endpoint
//! failed, or when the store rejected every file it was given.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{NewFlowRecord, NewProductionRecord, RecordStore};
use crate::error::{CollectorError, CollectorResult};

use super::config::CollectorConfig;
use super::dedup::DeduplicationIndex;
use super::ftp::{ConnectionCheck, SourceProvider};
use super::models::{CollectedFile, FlowRole, ParsedRow, ProcessResult};
use super::parser::RecordParser;
use super::status::StatusBoard;

/// Role used for weighings from an endpoint without a configured role
const FALLBACK_ROLE: FlowRole = FlowRole::Entrada;

/// How one file ended
struct FileOutcome {
    result: ProcessResult,
    /// The store refused the rows, as opposed to a local read failure
    store_rejected: bool,
}

/// Rows of one file ready for the store
#[derive(Debug, Default)]
struct MappedRows {
    production: Vec<NewProductionRecord>,
    flow: Vec<NewFlowRecord>,
}

pub struct IngestionPipeline {
    config: CollectorConfig,
    store: Arc<dyn RecordStore>,
    sources: Arc<dyn SourceProvider>,
    parser: RecordParser,
    status: Arc<StatusBoard>,
}

impl IngestionPipeline {
    pub fn new(
        config: CollectorConfig,
        store: Arc<dyn RecordStore>,
        sources: Arc<dyn SourceProvider>,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            config,
            store,
            sources,
            parser: RecordParser::new(),
            status,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Check every endpoint, in configured order
    pub async fn test_connections(&self) -> Vec<(String, ConnectionCheck)> {
        let mut checks = Vec::with_capacity(self.config.endpoints.len());
        for endpoint in &self.config.endpoints {
            let source = self.sources.source_for(endpoint, &self.config.temp_dir);
            let check = source.test_connection().await;
            info!(ihm = %source.identifier(), ok = check.ok, "{}", check.message);
            checks.push((source.identifier().to_string(), check));
        }
        checks
    }

    /// Run one cycle over every configured endpoint
    ///
    /// Hashes of successfully processed files are added to `index`. Returns
    /// the per-file results in processing order. Fails with
    /// [`CollectorError::AllEndpointsFailed`] when no endpoint could be read and
    /// with [`CollectorError::StoreUnavailable`] when files were collected but
    /// the store rejected all of them; results are recorded in either case.
    #[instrument(skip_all, fields(line = %self.config.line))]
    pub async fn run_cycle(
        &self,
        index: &mut DeduplicationIndex,
    ) -> CollectorResult<Vec<ProcessResult>> {
        self.status.cycle_started(Utc::now());

        let mut results = Vec::new();
        let mut failures = Vec::new();
        let mut store_rejections = 0;
        let mut last_store_error = None;

        for endpoint in &self.config.endpoints {
            let source = self.sources.source_for(endpoint, &self.config.temp_dir);

            let files = match source.find_new_files(index.snapshot()).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(ihm = %source.identifier(), "Endpoint unavailable: {:#}", e);
                    failures.push(format!("{}: {:#}", source.identifier(), e));
                    continue;
                },
            };

            debug!(ihm = %source.identifier(), files = files.len(), "Processing new files");

            for file in files {
                let outcome = self.ingest_file(&file, source.role()).await;
                if outcome.result.success {
                    index.insert(file.hash.clone());
                }
                if outcome.store_rejected {
                    store_rejections += 1;
                    last_store_error = outcome.result.error_message.clone();
                }
                discard_local_copy(&file.local_path).await;
                self.status.record_result(outcome.result.clone());
                results.push(outcome.result);
            }
        }

        if !failures.is_empty() {
            let message = failures.join("; ");
            if failures.len() == self.config.endpoints.len() {
                return Err(CollectorError::AllEndpointsFailed(message));
            }
            self.status.record_error(message);
        }

        if !results.is_empty() && store_rejections == results.len() {
            let message = last_store_error.unwrap_or_else(|| "batch rejected".to_string());
            warn!(files = results.len(), "Store rejected every file of the cycle");
            return Err(CollectorError::StoreUnavailable { message, results });
        }

        info!(
            files = results.len(),
            saved = results.iter().map(|r| r.rows_saved).sum::<usize>(),
            failed = results.iter().filter(|r| !r.success).count(),
            "Collection cycle finished"
        );
        self.status.cycle_completed();

        Ok(results)
    }

    /// Parse one downloaded file and store its rows
    ///
    /// `role` is the endpoint's default flow role; rows that carry a known
    /// scale identifier override it.
    #[instrument(skip_all, fields(file = %file.name, ihm = %file.source))]
    pub async fn process_file(&self, file: &CollectedFile, role: Option<FlowRole>) -> ProcessResult {
        self.ingest_file(file, role).await.result
    }

    async fn ingest_file(&self, file: &CollectedFile, role: Option<FlowRole>) -> FileOutcome {
        let started = Instant::now();

        let bytes = match tokio::fs::read(&file.local_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to read downloaded file: {}", e);
                return FileOutcome {
                    result: ProcessResult::failed(
                        file,
                        0,
                        format!("Failed to read {}: {}", file.local_path.display(), e),
                        started.elapsed(),
                    ),
                    store_rejected: false,
                };
            },
        };

        let parsed = self.parser.parse_file(&bytes, self.config.line.expected_kind());
        let rows_processed = parsed.outcome.rows.len();
        let rows_errored = parsed.outcome.skipped_lines;
        let mapped = map_rows(parsed.outcome.rows, file, role.unwrap_or(FALLBACK_ROLE));

        match self.store_rows(&mapped).await {
            Ok(rows_saved) => {
                info!(
                    rows = rows_processed,
                    saved = rows_saved,
                    duplicated = rows_processed - rows_saved.min(rows_processed),
                    skipped = rows_errored,
                    "File processed"
                );
                FileOutcome {
                    result: ProcessResult::succeeded(
                        file,
                        rows_processed,
                        rows_saved,
                        rows_errored,
                        started.elapsed(),
                    ),
                    store_rejected: false,
                }
            },
            Err(e) => {
                error!("Failed to store rows: {:#}", e);
                FileOutcome {
                    result: ProcessResult::failed(
                        file,
                        rows_processed,
                        format!("{:#}", e),
                        started.elapsed(),
                    ),
                    store_rejected: true,
                }
            },
        }
    }

    async fn store_rows(&self, rows: &MappedRows) -> anyhow::Result<usize> {
        let mut saved = 0;
        if !rows.production.is_empty() {
            saved += self.store.insert_production(&rows.production).await?;
        }
        if !rows.flow.is_empty() {
            saved += self.store.insert_flow(&rows.flow).await?;
        }
        Ok(saved)
    }
}

fn map_rows(rows: Vec<ParsedRow>, file: &CollectedFile, default_role: FlowRole) -> MappedRows {
    let mut mapped = MappedRows::default();
    for row in rows {
        match row {
            ParsedRow::Production(row) => {
                mapped.production.push(NewProductionRecord::from_row(&row, file));
            },
            ParsedRow::Flow(row) => {
                let role = FlowRole::classify(row.scale.as_deref(), default_role);
                mapped.flow.push(NewFlowRecord::from_row(&row, role, file));
            },
        }
    }
    mapped
}

async fn discard_local_copy(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "Failed to delete temp file: {}", e);
        }
    }
}
