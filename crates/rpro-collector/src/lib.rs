//! RPRO Collector Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Pulls CSV exports from the production-line IHM terminals over FTP, parses
//! them into feed batch and peanut weighing records and stores them in
//! PostgreSQL.
//!
//! # Overview
//!
//! - **Ingest**: FTP sources, parser, dedup index, pipeline and scheduler
//! - **Database**: record store contract with PostgreSQL and in-memory backends
//! - **Configuration**: environment-based configuration with `.env` support
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rpro_collector::db::InMemoryRecordStore;
//! use rpro_collector::ingest::{Collector, CollectorConfig, IhmEndpoint};
//!
//! # async fn run() -> rpro_collector::CollectorResult<()> {
//! let config = CollectorConfig::racao(IhmEndpoint::new("IHM1", "192.168.0.10"), 60);
//! let collector = Collector::with_ftp(config, Arc::new(InMemoryRecordStore::new()));
//!
//! for result in collector.run_once().await? {
//!     println!("{}: {} rows saved", result.file_name, result.rows_saved);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;

pub use error::{CollectorError, CollectorResult};
