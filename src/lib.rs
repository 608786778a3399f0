// E-commerce Transaction ETL - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod data_quality; // Schema + row rules, valid/invalid partition
pub mod db; // SQLite warehouse: staging, fact, quarantine, products, run log
pub mod error;
pub mod ingest; // Raw CSV drops → Batch
pub mod load; // Run coordinator
pub mod record;
pub mod store; // Traits the coordinator runs against
pub mod watermark; // Incremental merge on updated_at

// Re-export commonly used types
pub use config::PipelineConfig;
pub use data_quality::{
    check_completeness, check_referential, check_schema, check_uniqueness, check_validity,
    validate, Partition, Rejection, RuleOutcome, RuleViolation,
};
pub use db::{load_products_csv, setup_database, Product, RunRecord, SqliteWarehouse, Table};
pub use error::{ConfigError, SchemaMismatch, StoreError};
pub use ingest::{file_checksum, latest_source_file, read_batch, IngestError};
pub use load::{
    FailureCause, LoadCoordinator, LoadError, LoadResult, LoadStatus, RunKind, RunStage, SinkKind,
};
pub use record::{Batch, FactRecord, QuarantineRecord, TransactionRecord, EXPECTED_COLUMNS};
pub use store::{
    FactSink, ProductCatalog, QuarantineSink, StagingSink, StagingSource, WatermarkSource,
};
pub use watermark::{classify, merge, merge_with_summary, MergeDecision, MergeSummary, WatermarkMap};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
