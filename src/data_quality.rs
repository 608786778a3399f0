// ✅ Data Quality Engine - partitions a batch into valid and quarantined rows
//
// Rules run in a fixed order: schema, uniqueness, completeness, validity,
// referential integrity. Schema is whole-batch and fatal; the other four
// are per-row and non-exclusive, so a row collects one rejection per rule
// it breaks.

use crate::error::SchemaMismatch;
use crate::record::{Batch, QuarantineRecord, TransactionRecord, EXPECTED_COLUMNS};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

// ============================================================================
// RULE VIOLATIONS
// ============================================================================

/// Row-level rule violations. These are data, not errors: they end up in
/// quarantine and never abort a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleViolation {
    /// `transaction_id` occurs more than once in the batch
    DuplicateKey,
    /// A required field is absent
    MissingRequiredField,
    /// `amount <= 0`
    NonPositiveAmount,
    /// `product_id` is not in the product catalog
    UnknownProductReference,
}

impl RuleViolation {
    /// Stored as `error_message` in quarantine
    pub fn message(&self) -> &'static str {
        match self {
            RuleViolation::DuplicateKey => "duplicate key",
            RuleViolation::MissingRequiredField => "missing required field",
            RuleViolation::NonPositiveAmount => "non-positive amount",
            RuleViolation::UnknownProductReference => "unknown product reference",
        }
    }

    pub fn rule_name(&self) -> &'static str {
        match self {
            RuleViolation::DuplicateKey => "uniqueness",
            RuleViolation::MissingRequiredField => "completeness",
            RuleViolation::NonPositiveAmount => "validity",
            RuleViolation::UnknownProductReference => "referential_integrity",
        }
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Result of applying one rule to one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Pass,
    Fail(RuleViolation),
}

impl RuleOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, RuleOutcome::Pass)
    }

    fn fail_if(condition: bool, violation: RuleViolation) -> Self {
        if condition {
            RuleOutcome::Fail(violation)
        } else {
            RuleOutcome::Pass
        }
    }
}

// ============================================================================
// PARTITION
// ============================================================================

/// One invalid-output entry: the row and a single reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub record: TransactionRecord,
    pub violation: RuleViolation,
}

impl Rejection {
    pub fn to_quarantine(&self) -> QuarantineRecord {
        QuarantineRecord::new(self.record.clone(), self.violation.message())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    /// Rows with zero violations, in batch order
    pub valid: Vec<TransactionRecord>,
    /// One entry per (row, violation), grouped by rule in rule order
    pub invalid: Vec<Rejection>,
    /// Distinct rows that collected at least one violation
    pub rejected_rows: usize,
}

impl Partition {
    pub fn to_quarantine(&self) -> Vec<QuarantineRecord> {
        self.invalid.iter().map(Rejection::to_quarantine).collect()
    }

    /// Count of invalid entries per violated rule
    pub fn violation_counts(&self) -> HashMap<RuleViolation, usize> {
        let mut counts = HashMap::new();
        for rejection in &self.invalid {
            *counts.entry(rejection.violation).or_insert(0) += 1;
        }
        counts
    }

    pub fn summary(&self) -> String {
        format!(
            "{} valid, {} rejected rows, {} quarantine entries",
            self.valid.len(),
            self.rejected_rows,
            self.invalid.len()
        )
    }
}

// ============================================================================
// RULES
// ============================================================================

/// Rule 1: the column set must equal the expected set (order is irrelevant).
/// A repeated column is an extra field and is reported as unexpected.
pub fn check_schema(columns: &[String]) -> Result<(), SchemaMismatch> {
    let expected: BTreeSet<&str> = EXPECTED_COLUMNS.iter().copied().collect();
    let mut actual: BTreeSet<&str> = BTreeSet::new();
    let mut repeated: BTreeSet<&str> = BTreeSet::new();
    for column in columns.iter().map(|c| c.trim()) {
        if !actual.insert(column) {
            repeated.insert(column);
        }
    }

    let missing: Vec<String> = expected
        .difference(&actual)
        .map(|c| c.to_string())
        .collect();
    let unexpected: Vec<String> = actual
        .difference(&expected)
        .chain(repeated.iter())
        .map(|c| c.to_string())
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        return Ok(());
    }
    Err(SchemaMismatch {
        missing,
        unexpected,
    })
}

/// Rule 2: every occurrence of a repeated `transaction_id` fails, the first
/// one included. Rows without an id are left to the completeness rule.
pub fn check_uniqueness(records: &[TransactionRecord]) -> Vec<RuleOutcome> {
    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    for key in records.iter().filter_map(|r| r.key()) {
        *occurrences.entry(key).or_insert(0) += 1;
    }

    records
        .iter()
        .map(|r| {
            let repeated = r
                .key()
                .map(|k| occurrences.get(k).copied().unwrap_or(0) > 1)
                .unwrap_or(false);
            RuleOutcome::fail_if(repeated, RuleViolation::DuplicateKey)
        })
        .collect()
}

/// Rule 3
pub fn check_completeness(record: &TransactionRecord) -> RuleOutcome {
    RuleOutcome::fail_if(
        !record.missing_required_fields().is_empty(),
        RuleViolation::MissingRequiredField,
    )
}

/// Rule 4: an absent amount is the completeness rule's concern, not this one
pub fn check_validity(record: &TransactionRecord) -> RuleOutcome {
    let non_positive = record.amount.map(|a| a <= Decimal::ZERO).unwrap_or(false);
    RuleOutcome::fail_if(non_positive, RuleViolation::NonPositiveAmount)
}

/// Rule 5: an absent product id is never a known product
pub fn check_referential(record: &TransactionRecord, valid_products: &HashSet<String>) -> RuleOutcome {
    let known = record
        .product_id
        .as_ref()
        .map(|p| valid_products.contains(p))
        .unwrap_or(false);
    RuleOutcome::fail_if(!known, RuleViolation::UnknownProductReference)
}

// ============================================================================
// VALIDATE
// ============================================================================

/// Partition `batch` into valid rows and per-violation rejections.
///
/// Pure: the batch is not modified and nothing is read beyond the arguments.
/// A schema mismatch rejects the batch wholesale with no partition at all.
pub fn validate(batch: &Batch, valid_products: &HashSet<String>) -> Result<Partition, SchemaMismatch> {
    check_schema(&batch.columns)?;

    let records = &batch.records;
    let rule_outcomes: [Vec<RuleOutcome>; 4] = [
        check_uniqueness(records),
        records.iter().map(check_completeness).collect(),
        records.iter().map(check_validity).collect(),
        records
            .iter()
            .map(|r| check_referential(r, valid_products))
            .collect(),
    ];

    let mut rejected = vec![false; records.len()];
    let invalid: Vec<Rejection> = rule_outcomes
        .iter()
        .flat_map(|outcomes| outcomes.iter().enumerate())
        .filter_map(|(row, outcome)| match outcome {
            RuleOutcome::Pass => None,
            RuleOutcome::Fail(violation) => {
                rejected[row] = true;
                Some(Rejection {
                    record: records[row].clone(),
                    violation: *violation,
                })
            }
        })
        .collect();

    let valid = records
        .iter()
        .zip(&rejected)
        .filter(|(_, rejected)| !**rejected)
        .map(|(record, _)| record.clone())
        .collect();

    Ok(Partition {
        valid,
        invalid,
        rejected_rows: rejected.iter().filter(|r| **r).count(),
    })
}

// ============================================================================
// TESTS
// ============================================================================
