// 🧾 Record Model - canonical shape of a transaction row
// Shared by ingestion, validation, merge and the warehouse stores

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// Column set every batch must carry, in canonical order.
pub const EXPECTED_COLUMNS: [&str; 7] = [
    "transaction_id",
    "customer_id",
    "product_id",
    "amount",
    "transaction_date",
    "status",
    "updated_at",
];

/// Fixed-width storage format: text comparison in the store must agree with
/// chronological order, so the fraction is always six digits.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// TRANSACTION RECORD
// ============================================================================

/// One e-commerce transaction as it arrives from upstream.
///
/// The completeness-checked fields are optional so that a null cell survives
/// deserialization and can be reported as a row-level violation instead of
/// failing the whole file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: Option<String>,

    pub customer_id: Option<String>,

    pub product_id: Option<String>,

    #[serde(deserialize_with = "deserialize_amount")]
    pub amount: Option<Decimal>,

    #[serde(deserialize_with = "deserialize_date")]
    pub transaction_date: Option<NaiveDate>,

    pub status: Option<String>,

    /// Watermark: monotonic per `transaction_id`
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub updated_at: NaiveDateTime,
}

impl TransactionRecord {
    /// Build a fully populated record
    pub fn new(
        transaction_id: &str,
        customer_id: &str,
        product_id: &str,
        amount: Decimal,
        transaction_date: NaiveDate,
        status: &str,
        updated_at: NaiveDateTime,
    ) -> Self {
        TransactionRecord {
            transaction_id: Some(transaction_id.to_string()),
            customer_id: Some(customer_id.to_string()),
            product_id: Some(product_id.to_string()),
            amount: Some(amount),
            transaction_date: Some(transaction_date),
            status: Some(status.to_string()),
            updated_at,
        }
    }

    /// Key used by staging, uniqueness and the watermark map
    pub fn key(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Fact table key `(transaction_id, transaction_date)`
    pub fn fact_key(&self) -> Option<(&str, NaiveDate)> {
        match (&self.transaction_id, self.transaction_date) {
            (Some(id), Some(date)) => Some((id.as_str(), date)),
            _ => None,
        }
    }

    /// Names of required fields that are absent
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.transaction_id.is_none() {
            missing.push("transaction_id");
        }
        if self.customer_id.is_none() {
            missing.push("customer_id");
        }
        if self.product_id.is_none() {
            missing.push("product_id");
        }
        if self.amount.is_none() {
            missing.push("amount");
        }
        if self.transaction_date.is_none() {
            missing.push("transaction_date");
        }
        missing
    }
}

/// Rows in the fact table have the transaction shape; only the key differs.
pub type FactRecord = TransactionRecord;

// ============================================================================
// QUARANTINE RECORD
// ============================================================================

/// A rejected row tagged with one violated rule.
/// Keyed by `(transaction_id, error_message)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    #[serde(flatten)]
    pub record: TransactionRecord,
    pub error_message: String,
}

impl QuarantineRecord {
    pub fn new(record: TransactionRecord, error_message: impl Into<String>) -> Self {
        QuarantineRecord {
            record,
            error_message: error_message.into(),
        }
    }

    /// Quarantine key; an absent id is keyed as the empty string
    pub fn key(&self) -> (&str, &str) {
        (self.record.key().unwrap_or(""), self.error_message.as_str())
    }
}

// ============================================================================
// BATCH
// ============================================================================

/// Rows plus the column header of their source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    pub columns: Vec<String>,
    pub records: Vec<TransactionRecord>,
}

impl Batch {
    /// Batch carrying the expected column set
    pub fn new(records: Vec<TransactionRecord>) -> Self {
        Batch {
            columns: EXPECTED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            records,
        }
    }

    pub fn with_columns(columns: Vec<String>, records: Vec<TransactionRecord>) -> Self {
        Batch { columns, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ============================================================================
// TEXT CODECS (CSV cells and stored columns)
// ============================================================================

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Accepts `T` or space separated timestamps, with or without a fraction or
/// a UTC offset. Offsets are folded into UTC. The fraction is truncated to
/// microseconds, the precision `TIMESTAMP_FORMAT` stores, so a value compares
/// equal to its own stored copy.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let parsed = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_utc()))
        .or_else(|| {
            DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z")
                .ok()
                .map(|dt| dt.naive_utc())
        })?;
    Some(parsed.trunc_subsecs(6))
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

pub fn parse_amount(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw.trim()).ok()
}

fn deserialize_amount<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_amount(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {}", s))),
    }
}

fn deserialize_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_date(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid transaction_date: {}", s))),
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_timestamp(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid updated_at: {}", s)))
}
