//! IHM export collection
//!
//! - **ftp**: remote file sources, one per IHM endpoint
//! - **parser**: encoding, separator and layout detection, line parsing
//! - **dedup**: content-hash index of files already ingested
//! - **pipeline**: one collection cycle from download to store
//! - **scheduler**: recurring background loop, manual runs, stop
//! - **status**: status snapshots and event publication

pub mod config;
pub mod dedup;
pub mod ftp;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod scheduler;
pub mod status;

pub use config::{CollectorConfig, IhmEndpoint};
pub use dedup::DeduplicationIndex;
pub use ftp::{ConnectionCheck, FileSource, FtpSourceProvider, IhmFtpSource, SourceProvider};
pub use models::{
    CollectedFile, CollectorStatus, FileKind, FlowRole, FlowRow, ParsedRow, ProcessResult,
    ProductionLine, ProductionRow,
};
pub use parser::RecordParser;
pub use pipeline::IngestionPipeline;
pub use scheduler::Collector;
pub use status::{CollectorEvent, StatusBoard};
