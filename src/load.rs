// 🚚 Load Coordinator - sequences validation, watermark merge and sink writes
//
// Per run: Idle → FetchingExisting → Validating → WritingQuarantine →
// WritingFact (or WritingStaging for ingestion) → Done. Any failure moves the
// coordinator to Failed. The sink call in progress is rolled back by the
// store; sink writes committed earlier in the same run stay committed.

use crate::data_quality::{check_schema, validate, RuleViolation};
use crate::db::RunRecord;
use crate::error::{SchemaMismatch, StoreError};
use crate::ingest::{file_checksum, read_batch, IngestError};
use crate::record::{Batch, QuarantineRecord, TransactionRecord};
use crate::store::{
    FactSink, ProductCatalog, QuarantineSink, StagingSink, StagingSource, WatermarkSource,
};
use crate::watermark::{merge_with_summary, WatermarkMap};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// RUN STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStage {
    Idle,
    FetchingExisting,
    Validating,
    WritingQuarantine,
    WritingFact,
    WritingStaging,
    Done,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Idle => "idle",
            RunStage::FetchingExisting => "fetching_existing",
            RunStage::Validating => "validating",
            RunStage::WritingQuarantine => "writing_quarantine",
            RunStage::WritingFact => "writing_fact",
            RunStage::WritingStaging => "writing_staging",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunKind {
    /// Raw file → staging
    Ingest,
    /// Staging → fact + quarantine
    Load,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Ingest => "ingest",
            RunKind::Load => "load",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadStatus {
    /// Every stage completed
    Success,
    /// Empty input or nothing new; informational
    NoOp,
    /// New quarantine rows committed, the following write failed
    Partial,
    Failed,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Success => "success",
            LoadStatus::NoOp => "no_op",
            LoadStatus::Partial => "partial",
            LoadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SinkKind {
    Quarantine,
    Fact,
    Staging,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Quarantine => f.write_str("quarantine"),
            SinkKind::Fact => f.write_str("fact"),
            SinkKind::Staging => f.write_str("staging"),
        }
    }
}

// ============================================================================
// LOAD RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadResult {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: LoadStatus,
    /// Last stage entered; on failure, the stage that failed
    pub stage: RunStage,
    pub input_count: usize,
    pub valid_count: usize,
    /// Invalid-output entries (one per row and violated rule)
    pub invalid_count: usize,
    /// Distinct rows with at least one violation
    pub rejected_rows: usize,
    pub incremental_count: usize,
    /// Rows dropped by the watermark merge as stale
    pub skipped_count: usize,
    /// Quarantine rows actually inserted (existing keys excluded)
    pub quarantined_rows: usize,
    /// Fact or staging rows inserted or updated
    pub rows_written: usize,
    /// Existing-state lookup failed and the batch was taken as fully incremental
    pub lookup_degraded: bool,
    pub source_file: Option<String>,
    pub source_sha256: Option<String>,
    pub message: Option<String>,
}

impl LoadResult {
    fn new(kind: RunKind) -> Self {
        LoadResult {
            run_id: Uuid::new_v4(),
            kind,
            started_at: Utc::now(),
            finished_at: None,
            status: LoadStatus::Failed,
            stage: RunStage::Idle,
            input_count: 0,
            valid_count: 0,
            invalid_count: 0,
            rejected_rows: 0,
            incremental_count: 0,
            skipped_count: 0,
            quarantined_rows: 0,
            rows_written: 0,
            lookup_degraded: false,
            source_file: None,
            source_sha256: None,
            message: None,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} run {}: {} input, {} valid, {} invalid, {} incremental, {} written ({})",
            self.kind,
            self.status,
            self.input_count,
            self.valid_count,
            self.invalid_count,
            self.incremental_count,
            self.rows_written,
            self.stage
        )
    }

    /// Audit-trail form for the `load_runs` table
    pub fn to_run_record(&self) -> RunRecord {
        RunRecord {
            run_id: self.run_id.to_string(),
            kind: self.kind.as_str().to_string(),
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
            status: self.status.as_str().to_string(),
            stage: self.stage.as_str().to_string(),
            input_count: self.input_count as i64,
            valid_count: self.valid_count as i64,
            invalid_count: self.invalid_count as i64,
            incremental_count: self.incremental_count as i64,
            rows_written: self.rows_written as i64,
            source_file: self.source_file.clone(),
            source_sha256: self.source_sha256.clone(),
            detail: serde_json::json!({
                "rejected_rows": self.rejected_rows,
                "skipped_count": self.skipped_count,
                "quarantined_rows": self.quarantined_rows,
                "lookup_degraded": self.lookup_degraded,
                "message": self.message,
            }),
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Why a run aborted
#[derive(Error, Debug)]
pub enum FailureCause {
    #[error(transparent)]
    Schema(#[from] SchemaMismatch),

    #[error("failed to fetch {what}")]
    Fetch {
        what: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("{sink} write rolled back")]
    SinkWrite {
        sink: SinkKind,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// Fatal run failure, carrying the counts gathered before the abort
#[derive(Error, Debug)]
#[error("{} run {} ({})", .result.kind, .result.status, .result.stage)]
pub struct LoadError {
    result: Box<LoadResult>,
    #[source]
    cause: FailureCause,
}

impl LoadError {
    pub fn status(&self) -> LoadStatus {
        self.result.status
    }

    pub fn result(&self) -> &LoadResult {
        &self.result
    }

    pub fn cause(&self) -> &FailureCause {
        &self.cause
    }

    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self.cause, FailureCause::Schema(_))
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Drives one run at a time against a store. Runs against the same store
/// must be serialized by the caller.
pub struct LoadCoordinator<S> {
    store: S,
    stage: RunStage,
}

impl<S> LoadCoordinator<S> {
    pub fn new(store: S) -> Self {
        LoadCoordinator {
            store,
            stage: RunStage::Idle,
        }
    }

    /// Stage of the current (or last) run
    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn begin(&mut self, kind: RunKind) -> LoadResult {
        self.stage = RunStage::Idle;
        let result = LoadResult::new(kind);
        info!(run_id = %result.run_id, kind = kind.as_str(), "Run started");
        result
    }

    fn advance(&mut self, result: &mut LoadResult, next: RunStage) {
        debug!(
            run_id = %result.run_id,
            from = self.stage.as_str(),
            to = next.as_str(),
            "Stage transition"
        );
        self.stage = next;
        result.stage = next;
    }

    fn finish(&mut self, mut result: LoadResult, status: LoadStatus) -> LoadResult {
        self.advance(&mut result, RunStage::Done);
        result.status = status;
        result.finished_at = Some(Utc::now());
        info!(
            run_id = %result.run_id,
            status = status.as_str(),
            valid = result.valid_count,
            invalid = result.invalid_count,
            incremental = result.incremental_count,
            written = result.rows_written,
            "Run finished"
        );
        result
    }

    /// Failed is terminal; `result.stage` keeps the stage that failed
    fn abort(&mut self, mut result: LoadResult, status: LoadStatus, cause: FailureCause) -> LoadError {
        error!(
            run_id = %result.run_id,
            stage = result.stage.as_str(),
            status = status.as_str(),
            error = %cause,
            "Run failed"
        );
        self.stage = RunStage::Failed;
        result.status = status;
        result.finished_at = Some(Utc::now());
        result.message = Some(cause.to_string());
        LoadError {
            result: Box::new(result),
            cause,
        }
    }
}

impl<S> LoadCoordinator<S>
where
    S: QuarantineSink + FactSink,
{
    /// Validate `staging_snapshot`, merge its valid rows against
    /// `existing_fact_state`, then write quarantine and fact rows.
    pub fn run_load(
        &mut self,
        staging_snapshot: &Batch,
        valid_products: &HashSet<String>,
        existing_fact_state: &WatermarkMap,
    ) -> Result<LoadResult, LoadError> {
        let mut result = self.begin(RunKind::Load);
        // Existing state supplied by the caller
        self.advance(&mut result, RunStage::FetchingExisting);
        self.load_snapshot(result, staging_snapshot, valid_products, existing_fact_state)
    }

    fn load_snapshot(
        &mut self,
        mut result: LoadResult,
        staging: &Batch,
        valid_products: &HashSet<String>,
        existing: &WatermarkMap,
    ) -> Result<LoadResult, LoadError> {
        self.advance(&mut result, RunStage::Validating);
        result.input_count = staging.len();

        if let Err(mismatch) = check_schema(&staging.columns) {
            return Err(self.abort(result, LoadStatus::Failed, mismatch.into()));
        }
        if staging.is_empty() {
            info!(run_id = %result.run_id, "No records in staging");
            result.message = Some("no records in staging".to_string());
            return Ok(self.finish(result, LoadStatus::NoOp));
        }

        let partition = match validate(staging, valid_products) {
            Ok(partition) => partition,
            Err(mismatch) => return Err(self.abort(result, LoadStatus::Failed, mismatch.into())),
        };
        let (incremental, merge) = merge_with_summary(&partition.valid, existing);

        result.valid_count = partition.valid.len();
        result.invalid_count = partition.invalid.len();
        result.rejected_rows = partition.rejected_rows;
        result.incremental_count = incremental.len();
        result.skipped_count = merge.skipped;
        info!(
            run_id = %result.run_id,
            valid = result.valid_count,
            invalid = result.invalid_count,
            incremental = result.incremental_count,
            skipped = result.skipped_count,
            "Batch validated"
        );

        self.advance(&mut result, RunStage::WritingQuarantine);
        let quarantine = partition.to_quarantine();
        if quarantine.is_empty() {
            info!(run_id = %result.run_id, "No invalid records to quarantine");
        } else {
            match self.store.insert_quarantine(&quarantine) {
                Ok(inserted) => result.quarantined_rows = inserted,
                Err(source) => {
                    let cause = FailureCause::SinkWrite {
                        sink: SinkKind::Quarantine,
                        source,
                    };
                    return Err(self.abort(result, LoadStatus::Failed, cause));
                }
            }
        }

        self.advance(&mut result, RunStage::WritingFact);
        if incremental.is_empty() {
            info!(run_id = %result.run_id, "No valid records to load into fact table");
        } else {
            match self.store.upsert_facts(&incremental) {
                Ok(written) => result.rows_written = written,
                Err(source) => {
                    let status = if result.quarantined_rows > 0 {
                        LoadStatus::Partial
                    } else {
                        LoadStatus::Failed
                    };
                    let cause = FailureCause::SinkWrite {
                        sink: SinkKind::Fact,
                        source,
                    };
                    return Err(self.abort(result, status, cause));
                }
            }
        }

        Ok(self.finish(result, LoadStatus::Success))
    }
}

impl<S> LoadCoordinator<S>
where
    S: StagingSource + ProductCatalog + WatermarkSource + QuarantineSink + FactSink,
{
    /// Fetch staging, the product catalog and fact watermarks, then load.
    ///
    /// A failed watermark lookup degrades to "everything is incremental";
    /// the fact sink's own newer-wins condition keeps that safe.
    pub fn run(&mut self) -> Result<LoadResult, LoadError> {
        let mut result = self.begin(RunKind::Load);
        self.advance(&mut result, RunStage::FetchingExisting);

        let staging = match self.store.fetch_staging() {
            Ok(batch) => batch,
            Err(source) => {
                let cause = FailureCause::Fetch {
                    what: "staging snapshot",
                    source,
                };
                return Err(self.abort(result, LoadStatus::Failed, cause));
            }
        };

        let products = match self.store.valid_products() {
            Ok(products) => products,
            Err(source) => {
                let cause = FailureCause::Fetch {
                    what: "product catalog",
                    source,
                };
                return Err(self.abort(result, LoadStatus::Failed, cause));
            }
        };

        let existing = match self.store.fact_watermarks() {
            Ok(existing) => existing,
            Err(e) => {
                warn!(
                    run_id = %result.run_id,
                    error = %e,
                    "Existing fact state lookup failed; treating batch as fully incremental"
                );
                result.lookup_degraded = true;
                WatermarkMap::new()
            }
        };

        self.load_snapshot(result, &staging, &products, &existing)
    }
}

impl<S> LoadCoordinator<S>
where
    S: WatermarkSource + QuarantineSink + StagingSink,
{
    /// Read `path`, then ingest it like [`run_ingest`](Self::run_ingest).
    /// The result records the file name and its SHA-256.
    pub fn ingest_file(&mut self, path: &Path) -> Result<LoadResult, LoadError> {
        let mut result = self.begin(RunKind::Ingest);
        result.source_file = Some(path.display().to_string());
        info!(run_id = %result.run_id, file = %path.display(), "Processing file");

        let batch = match read_batch(path) {
            Ok(batch) => batch,
            Err(IngestError::Schema(mismatch)) => {
                return Err(self.abort(result, LoadStatus::Failed, mismatch.into()))
            }
            Err(e) => return Err(self.abort(result, LoadStatus::Failed, e.into())),
        };
        match file_checksum(path) {
            Ok(sum) => result.source_sha256 = Some(sum),
            Err(e) => return Err(self.abort(result, LoadStatus::Failed, e.into())),
        }

        self.ingest_batch(result, &batch)
    }

    /// Watermark-merge `batch` against staging and upsert the incremental
    /// subset. Rows without a `transaction_id` cannot be keyed in staging
    /// and go straight to quarantine.
    pub fn run_ingest(&mut self, batch: &Batch) -> Result<LoadResult, LoadError> {
        let result = self.begin(RunKind::Ingest);
        self.ingest_batch(result, batch)
    }

    fn ingest_batch(&mut self, mut result: LoadResult, batch: &Batch) -> Result<LoadResult, LoadError> {
        result.input_count = batch.len();
        if batch.is_empty() {
            info!(run_id = %result.run_id, "Source file is empty");
            result.message = Some("source file is empty".to_string());
            return Ok(self.finish(result, LoadStatus::NoOp));
        }
        if let Err(mismatch) = check_schema(&batch.columns) {
            return Err(self.abort(result, LoadStatus::Failed, mismatch.into()));
        }

        self.advance(&mut result, RunStage::FetchingExisting);
        let existing = match self.store.staging_watermarks() {
            Ok(existing) => existing,
            Err(e) => {
                warn!(
                    run_id = %result.run_id,
                    error = %e,
                    "Existing staging lookup failed; treating batch as fully incremental"
                );
                result.lookup_degraded = true;
                WatermarkMap::new()
            }
        };

        self.advance(&mut result, RunStage::Validating);
        let (keyed, unkeyed): (Vec<TransactionRecord>, Vec<TransactionRecord>) = batch
            .records
            .iter()
            .cloned()
            .partition(|r| r.key().is_some());
        let (incremental, merge) = merge_with_summary(&keyed, &existing);

        result.valid_count = keyed.len();
        result.invalid_count = unkeyed.len();
        result.rejected_rows = unkeyed.len();
        result.incremental_count = incremental.len();
        result.skipped_count = merge.skipped;

        if incremental.is_empty() && unkeyed.is_empty() {
            info!(run_id = %result.run_id, "No new or updated records to process");
            result.message = Some("no new or updated records".to_string());
            return Ok(self.finish(result, LoadStatus::NoOp));
        }

        self.advance(&mut result, RunStage::WritingQuarantine);
        if !unkeyed.is_empty() {
            let rows: Vec<QuarantineRecord> = unkeyed
                .into_iter()
                .map(|r| QuarantineRecord::new(r, RuleViolation::MissingRequiredField.message()))
                .collect();
            match self.store.insert_quarantine(&rows) {
                Ok(inserted) => result.quarantined_rows = inserted,
                Err(source) => {
                    let cause = FailureCause::SinkWrite {
                        sink: SinkKind::Quarantine,
                        source,
                    };
                    return Err(self.abort(result, LoadStatus::Failed, cause));
                }
            }
        }

        self.advance(&mut result, RunStage::WritingStaging);
        if !incremental.is_empty() {
            match self.store.upsert_staging(&incremental) {
                Ok(written) => result.rows_written = written,
                Err(source) => {
                    let status = if result.quarantined_rows > 0 {
                        LoadStatus::Partial
                    } else {
                        LoadStatus::Failed
                    };
                    let cause = FailureCause::SinkWrite {
                        sink: SinkKind::Staging,
                        source,
                    };
                    return Err(self.abort(result, status, cause));
                }
            }
        }

        info!(
            run_id = %result.run_id,
            processed = result.rows_written,
            "Ingestion completed"
        );
        Ok(self.finish(result, LoadStatus::Success))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Product, SqliteWarehouse, Table};
    use crate::record::{parse_date, parse_timestamp};
    use rust_decimal::Decimal;

    fn record(id: &str, amount: i64, product: &str, updated_at: &str) -> TransactionRecord {
        TransactionRecord::new(
            id,
            "C1",
            product,
            Decimal::new(amount, 0),
            parse_date("2026-02-16").unwrap(),
            "completed",
            parse_timestamp(updated_at).unwrap(),
        )
    }

    fn products() -> HashSet<String> {
        ["P001".to_string()].into_iter().collect()
    }

    fn seeded_warehouse() -> SqliteWarehouse {
        let mut wh = SqliteWarehouse::open_in_memory().unwrap();
        wh.seed_products(&[Product {
            product_id: "P001".to_string(),
            name: Some("Widget".to_string()),
        }])
        .unwrap();
        wh
    }

    fn boom() -> StoreError {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "connection lost",
        ))
    }

    /// Warehouse wrapper with switchable failures
    struct FlakyStore {
        inner: SqliteWarehouse,
        fail_quarantine: bool,
        fail_fact: bool,
        fail_staging: bool,
        fail_watermarks: bool,
    }

    impl FlakyStore {
        fn new(inner: SqliteWarehouse) -> Self {
            FlakyStore {
                inner,
                fail_quarantine: false,
                fail_fact: false,
                fail_staging: false,
                fail_watermarks: false,
            }
        }
    }

    impl StagingSource for FlakyStore {
        fn fetch_staging(&self) -> Result<Batch, StoreError> {
            self.inner.fetch_staging()
        }
    }

    impl ProductCatalog for FlakyStore {
        fn valid_products(&self) -> Result<HashSet<String>, StoreError> {
            self.inner.valid_products()
        }
    }

    impl WatermarkSource for FlakyStore {
        fn fact_watermarks(&self) -> Result<WatermarkMap, StoreError> {
            if self.fail_watermarks {
                return Err(boom());
            }
            self.inner.fact_watermarks()
        }

        fn staging_watermarks(&self) -> Result<WatermarkMap, StoreError> {
            if self.fail_watermarks {
                return Err(boom());
            }
            self.inner.staging_watermarks()
        }
    }

    impl QuarantineSink for FlakyStore {
        fn insert_quarantine(&mut self, rows: &[QuarantineRecord]) -> Result<usize, StoreError> {
            if self.fail_quarantine {
                return Err(boom());
            }
            self.inner.insert_quarantine(rows)
        }
    }

    impl FactSink for FlakyStore {
        fn upsert_facts(&mut self, rows: &[TransactionRecord]) -> Result<usize, StoreError> {
            if self.fail_fact {
                return Err(boom());
            }
            self.inner.upsert_facts(rows)
        }
    }

    impl StagingSink for FlakyStore {
        fn upsert_staging(&mut self, rows: &[TransactionRecord]) -> Result<usize, StoreError> {
            if self.fail_staging {
                return Err(boom());
            }
            self.inner.upsert_staging(rows)
        }
    }

    #[test]
    fn test_run_load_routes_valid_and_invalid() {
        let mut coordinator = LoadCoordinator::new(seeded_warehouse());
        let staging = Batch::new(vec![
            record("T1", 100, "P001", "2026-02-16 10:00:00"),
            record("T2", -10, "P001", "2026-02-16 10:00:00"),
        ]);

        let result = coordinator
            .run_load(&staging, &products(), &WatermarkMap::new())
            .unwrap();

        assert_eq!(result.status, LoadStatus::Success);
        assert_eq!(result.stage, RunStage::Done);
        assert_eq!(coordinator.stage(), RunStage::Done);
        assert_eq!(result.valid_count, 1);
        assert_eq!(result.invalid_count, 1);
        assert_eq!(result.incremental_count, 1);
        assert_eq!(result.rows_written, 1);

        let wh = coordinator.store();
        let facts = wh.fetch_facts().unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].key(), Some("T1"));
        let quarantine = wh.fetch_quarantine().unwrap();
        assert_eq!(quarantine.len(), 1);
        assert_eq!(quarantine[0].key(), ("T2", "non-positive amount"));
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let mut wh = seeded_warehouse();
        wh.upsert_staging(&[
            record("T1", 100, "P001", "2026-02-16 10:00:00"),
            record("T2", -10, "P999", "2026-02-16 10:00:00"),
        ])
        .unwrap();
        let mut coordinator = LoadCoordinator::new(wh);

        let first = coordinator.run().unwrap();
        let quarantine_after_first = coordinator.store().fetch_quarantine().unwrap();
        let second = coordinator.run().unwrap();

        assert_eq!(first.quarantined_rows, 2);
        assert_eq!(second.quarantined_rows, 0);
        assert_eq!(second.invalid_count, 2);
        assert_eq!(coordinator.store().fetch_quarantine().unwrap(), quarantine_after_first);

        // the fact row is already current, so the merge skips it
        assert_eq!(second.incremental_count, 0);
        assert_eq!(second.skipped_count, 1);
        assert_eq!(second.status, LoadStatus::Success);
        assert_eq!(coordinator.store().count_rows(Table::Fact).unwrap(), 1);
    }

    #[test]
    fn test_empty_staging_is_noop() {
        let mut coordinator = LoadCoordinator::new(seeded_warehouse());

        let result = coordinator.run().unwrap();

        assert_eq!(result.status, LoadStatus::NoOp);
        assert_eq!(result.input_count, 0);
        assert!(result.message.is_some());
    }

    #[test]
    fn test_schema_mismatch_aborts_without_writes() {
        let mut coordinator = LoadCoordinator::new(seeded_warehouse());
        let mut staging = Batch::new(vec![record("T1", 100, "P001", "2026-02-16 10:00:00")]);
        staging.columns.push("discount".to_string());

        let err = coordinator
            .run_load(&staging, &products(), &WatermarkMap::new())
            .unwrap_err();

        assert!(err.is_schema_mismatch());
        assert_eq!(err.status(), LoadStatus::Failed);
        assert_eq!(err.result().stage, RunStage::Validating);
        assert_eq!(coordinator.stage(), RunStage::Failed);
        assert_eq!(coordinator.store().count_rows(Table::Fact).unwrap(), 0);
        assert_eq!(coordinator.store().count_rows(Table::Quarantine).unwrap(), 0);
    }

    #[test]
    fn test_schema_mismatch_wins_over_empty_batch() {
        let mut coordinator = LoadCoordinator::new(seeded_warehouse());
        let staging = Batch::with_columns(vec!["transaction_id".to_string()], Vec::new());

        let err = coordinator
            .run_load(&staging, &products(), &WatermarkMap::new())
            .unwrap_err();
        assert!(err.is_schema_mismatch());
    }

    #[test]
    fn test_fact_failure_after_quarantine_is_partial() {
        let mut store = FlakyStore::new(seeded_warehouse());
        store.fail_fact = true;
        let mut coordinator = LoadCoordinator::new(store);
        let staging = Batch::new(vec![
            record("T1", 100, "P001", "2026-02-16 10:00:00"),
            record("T2", -10, "P001", "2026-02-16 10:00:00"),
        ]);

        let err = coordinator
            .run_load(&staging, &products(), &WatermarkMap::new())
            .unwrap_err();

        assert_eq!(err.status(), LoadStatus::Partial);
        assert_eq!(err.result().stage, RunStage::WritingFact);
        assert!(matches!(
            err.cause(),
            FailureCause::SinkWrite { sink: SinkKind::Fact, .. }
        ));
        assert_eq!(coordinator.stage(), RunStage::Failed);
        // quarantine stays committed, fact has nothing
        assert_eq!(coordinator.store().inner.count_rows(Table::Quarantine).unwrap(), 1);
        assert_eq!(coordinator.store().inner.count_rows(Table::Fact).unwrap(), 0);
    }

    #[test]
    fn test_fact_failure_without_quarantine_is_failed() {
        let mut store = FlakyStore::new(seeded_warehouse());
        store.fail_fact = true;
        let mut coordinator = LoadCoordinator::new(store);
        let staging = Batch::new(vec![record("T1", 100, "P001", "2026-02-16 10:00:00")]);

        let err = coordinator
            .run_load(&staging, &products(), &WatermarkMap::new())
            .unwrap_err();

        assert_eq!(err.status(), LoadStatus::Failed);
    }

    #[test]
    fn test_quarantine_failure_stops_before_fact() {
        let mut store = FlakyStore::new(seeded_warehouse());
        store.fail_quarantine = true;
        let mut coordinator = LoadCoordinator::new(store);
        let staging = Batch::new(vec![
            record("T1", 100, "P001", "2026-02-16 10:00:00"),
            record("T2", -10, "P001", "2026-02-16 10:00:00"),
        ]);

        let err = coordinator
            .run_load(&staging, &products(), &WatermarkMap::new())
            .unwrap_err();

        assert_eq!(err.status(), LoadStatus::Failed);
        assert_eq!(err.result().stage, RunStage::WritingQuarantine);
        assert_eq!(err.result().valid_count, 1);
        assert_eq!(coordinator.store().inner.count_rows(Table::Fact).unwrap(), 0);
    }

    #[test]
    fn test_lookup_failure_degrades_to_full_batch() {
        let mut inner = seeded_warehouse();
        let newer = record("T1", 500, "P001", "2026-02-16 12:00:00");
        inner.upsert_facts(&[newer.clone()]).unwrap();
        inner
            .upsert_staging(&[record("T1", 100, "P001", "2026-02-16 10:00:00")])
            .unwrap();

        let mut store = FlakyStore::new(inner);
        store.fail_watermarks = true;
        let mut coordinator = LoadCoordinator::new(store);

        let result = coordinator.run().unwrap();

        assert!(result.lookup_degraded);
        assert_eq!(result.status, LoadStatus::Success);
        assert_eq!(result.incremental_count, 1);
        // the sink's own condition keeps the newer fact
        assert_eq!(result.rows_written, 0);
        assert_eq!(coordinator.store().inner.fetch_facts().unwrap(), vec![newer]);
    }

    #[test]
    fn test_ingest_merges_against_staging() {
        let mut coordinator = LoadCoordinator::new(seeded_warehouse());

        let first = coordinator
            .run_ingest(&Batch::new(vec![
                record("T1", 100, "P001", "2026-02-16 10:00:00"),
                record("T2", 200, "P001", "2026-02-16 10:00:00"),
            ]))
            .unwrap();
        assert_eq!(first.status, LoadStatus::Success);
        assert_eq!(first.rows_written, 2);

        let replay = coordinator
            .run_ingest(&Batch::new(vec![record("T1", 100, "P001", "2026-02-16 10:00:00")]))
            .unwrap();
        assert_eq!(replay.status, LoadStatus::NoOp);
        assert_eq!(replay.skipped_count, 1);

        let update = coordinator
            .run_ingest(&Batch::new(vec![
                record("T1", 150, "P001", "2026-02-16 11:00:00"),
                record("T2", 1, "P001", "2026-02-16 09:00:00"),
            ]))
            .unwrap();
        assert_eq!(update.incremental_count, 1);
        assert_eq!(update.rows_written, 1);

        let staging = coordinator.store().fetch_staging().unwrap();
        let t1 = staging.records.iter().find(|r| r.key() == Some("T1")).unwrap();
        assert_eq!(t1.amount, Some(Decimal::new(150, 0)));
        assert_eq!(staging.len(), 2);
    }

    #[test]
    fn test_ingest_quarantines_rows_without_id() {
        let mut coordinator = LoadCoordinator::new(seeded_warehouse());
        let mut anonymous = record("X", 100, "P001", "2026-02-16 10:00:00");
        anonymous.transaction_id = None;

        let result = coordinator
            .run_ingest(&Batch::new(vec![
                anonymous,
                record("T1", 100, "P001", "2026-02-16 10:00:00"),
            ]))
            .unwrap();

        assert_eq!(result.invalid_count, 1);
        assert_eq!(result.quarantined_rows, 1);
        assert_eq!(result.rows_written, 1);
        let quarantine = coordinator.store().fetch_quarantine().unwrap();
        assert_eq!(quarantine[0].key(), ("", "missing required field"));
    }

    #[test]
    fn test_ingest_staging_failure_reports_failed() {
        let mut store = FlakyStore::new(seeded_warehouse());
        store.fail_staging = true;
        let mut coordinator = LoadCoordinator::new(store);

        let err = coordinator
            .run_ingest(&Batch::new(vec![record("T1", 100, "P001", "2026-02-16 10:00:00")]))
            .unwrap_err();

        assert_eq!(err.status(), LoadStatus::Failed);
        assert_eq!(err.result().stage, RunStage::WritingStaging);
        assert_eq!(err.to_string(), "ingest run failed (writing_staging)");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "staging write rolled back");
    }

    #[test]
    fn test_ingest_lookup_failure_degrades_to_full_batch() {
        let mut inner = seeded_warehouse();
        let newer = record("T1", 500, "P001", "2026-02-16 12:00:00");
        inner.upsert_staging(&[newer.clone()]).unwrap();

        let mut store = FlakyStore::new(inner);
        store.fail_watermarks = true;
        let mut coordinator = LoadCoordinator::new(store);

        let result = coordinator
            .run_ingest(&Batch::new(vec![record("T1", 100, "P001", "2026-02-16 10:00:00")]))
            .unwrap();

        assert!(result.lookup_degraded);
        assert_eq!(result.status, LoadStatus::Success);
        assert_eq!(result.incremental_count, 1);
        // the staging sink keeps the newer row
        assert_eq!(result.rows_written, 0);
        assert_eq!(coordinator.store().inner.fetch_staging().unwrap().records, vec![newer]);
    }

    #[test]
    fn test_fact_failure_with_only_known_quarantine_keys_is_failed() {
        let mut inner = seeded_warehouse();
        inner
            .upsert_staging(&[
                record("T1", 100, "P001", "2026-02-16 10:00:00"),
                record("T2", -10, "P001", "2026-02-16 10:00:00"),
            ])
            .unwrap();
        let mut coordinator = LoadCoordinator::new(FlakyStore::new(inner));
        coordinator.run().unwrap();

        // T1 moves forward; T2 is already quarantined
        coordinator
            .store_mut()
            .inner
            .upsert_staging(&[record("T1", 150, "P001", "2026-02-16 11:00:00")])
            .unwrap();
        coordinator.store_mut().fail_fact = true;

        let err = coordinator.run().unwrap_err();

        assert_eq!(err.result().invalid_count, 1);
        assert_eq!(err.result().quarantined_rows, 0);
        assert_eq!(err.status(), LoadStatus::Failed);
        assert_eq!(err.result().stage, RunStage::WritingFact);
    }

    #[test]
    fn test_run_record_reflects_result() {
        let mut coordinator = LoadCoordinator::new(seeded_warehouse());
        let staging = Batch::new(vec![record("T1", 100, "P001", "2026-02-16 10:00:00")]);
        let result = coordinator
            .run_load(&staging, &products(), &WatermarkMap::new())
            .unwrap();

        let run = result.to_run_record();
        coordinator.store().insert_run_record(&run).unwrap();

        assert_eq!(run.status, "success");
        assert_eq!(run.stage, "done");
        assert_eq!(run.rows_written, 1);
        assert_eq!(coordinator.store().recent_runs(5).unwrap()[0].run_id, result.run_id.to_string());
        assert!(!result.summary().is_empty());
    }
}
