// 🔌 Store seams - what the engine needs from the outside world
//
// The coordinator only talks to these traits. `db::SqliteWarehouse` implements all
// of them on SQLite; tests substitute their own.

use crate::error::StoreError;
use crate::record::{Batch, QuarantineRecord, TransactionRecord};
use crate::watermark::WatermarkMap;
use std::collections::HashSet;

/// Full current contents of the staging area
pub trait StagingSource {
    fn fetch_staging(&self) -> Result<Batch, StoreError>;
}

/// Current set of valid product identifiers
pub trait ProductCatalog {
    fn valid_products(&self) -> Result<HashSet<String>, StoreError>;
}

/// Existing `(transaction_id, updated_at)` pairs for watermark comparison
pub trait WatermarkSource {
    fn fact_watermarks(&self) -> Result<WatermarkMap, StoreError>;

    fn staging_watermarks(&self) -> Result<WatermarkMap, StoreError>;
}

/// Conditional insert keyed by `(transaction_id, error_message)`.
///
/// One call is one transaction: every row commits or none do. Returns the
/// number of rows actually inserted (existing keys are a no-op).
pub trait QuarantineSink {
    fn insert_quarantine(&mut self, rows: &[QuarantineRecord]) -> Result<usize, StoreError>;
}

/// Conditional upsert keyed by `(transaction_id, transaction_date)`.
///
/// Insert if absent; on conflict overwrite non-key fields only when the
/// incoming `updated_at` is strictly newer. One call is one transaction.
/// Returns the number of rows inserted or updated.
pub trait FactSink {
    fn upsert_facts(&mut self, rows: &[TransactionRecord]) -> Result<usize, StoreError>;
}

/// Conditional upsert into staging keyed by `transaction_id`, same
/// newer-wins condition as [`FactSink`].
pub trait StagingSink {
    fn upsert_staging(&mut self, rows: &[TransactionRecord]) -> Result<usize, StoreError>;
}
