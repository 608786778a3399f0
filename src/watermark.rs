//! Last-write-wins watermark merge.
//!
//! Compares an incoming batch with stored `(transaction_id, updated_at)`
//! pairs and keeps only the rows that are new or strictly newer. Ordering is
//! by `updated_at` (logical time), never by arrival order, so callers must
//! supply a trustworthy per-key monotonic timestamp.
//!
//! Pure, no IO: the existing-state snapshot is fetched by the caller.

use crate::record::TransactionRecord;
use chrono::NaiveDateTime;
use std::collections::HashMap;

/// Stored watermark per `transaction_id`
pub type WatermarkMap = HashMap<String, NaiveDateTime>;

// ---------------------------------------------------------------------------
// Per-record decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Key not present in stored state
    Insert,
    /// Incoming `updated_at` is strictly newer than the stored one
    Update,
    /// Stored version is as new or newer; dropped without error
    Skip,
}

impl MergeDecision {
    pub fn is_incremental(&self) -> bool {
        !matches!(self, MergeDecision::Skip)
    }
}

/// Decide what to do with one incoming record.
///
/// A record without a `transaction_id` cannot match stored state and is
/// treated as an insert; validation is what rejects it.
pub fn classify(record: &TransactionRecord, existing: &WatermarkMap) -> MergeDecision {
    match record.key().and_then(|k| existing.get(k)) {
        None => MergeDecision::Insert,
        Some(stored) if record.updated_at > *stored => MergeDecision::Update,
        Some(_) => MergeDecision::Skip,
    }
}

// ---------------------------------------------------------------------------
// Batch merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserts: usize,
    pub updates: usize,
    pub skipped: usize,
}

impl MergeSummary {
    pub fn incremental(&self) -> usize {
        self.inserts + self.updates
    }
}

/// Incremental subset of `incoming`, in input order.
pub fn merge(incoming: &[TransactionRecord], existing: &WatermarkMap) -> Vec<TransactionRecord> {
    merge_with_summary(incoming, existing).0
}

/// [`merge`] plus insert/update/skip counts for reporting.
pub fn merge_with_summary(
    incoming: &[TransactionRecord],
    existing: &WatermarkMap,
) -> (Vec<TransactionRecord>, MergeSummary) {
    let mut summary = MergeSummary::default();

    if existing.is_empty() {
        summary.inserts = incoming.len();
        return (incoming.to_vec(), summary);
    }

    let incremental: Vec<TransactionRecord> = incoming
        .iter()
        .filter(|record| {
            let decision = classify(record, existing);
            match decision {
                MergeDecision::Insert => summary.inserts += 1,
                MergeDecision::Update => summary.updates += 1,
                MergeDecision::Skip => summary.skipped += 1,
            }
            decision.is_incremental()
        })
        .cloned()
        .collect();

    (incremental, summary)
}
