// 📥 Ingestion - raw daily CSV drops → Batch
//
// Raw files are named `<prefix><timestamp>.csv`, so the lexicographically
// last name is the newest drop.

use crate::data_quality::check_schema;
use crate::error::SchemaMismatch;
use crate::record::{Batch, TransactionRecord};
use csv::{ReaderBuilder, Trim};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read CSV header in {path}: {source}")]
    Header {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to parse CSV line {line} in {path}: {source}")]
    Row {
        path: String,
        line: usize,
        #[source]
        source: csv::Error,
    },

    #[error(transparent)]
    Schema(#[from] SchemaMismatch),
}

fn io_error(path: &Path, source: std::io::Error) -> IngestError {
    IngestError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Newest `*.csv` in `dir` whose file name starts with `prefix`
pub fn latest_source_file(dir: &Path, prefix: &str) -> Result<Option<PathBuf>, IngestError> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_error(dir, e))?;

    let mut latest: Option<(String, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if !is_csv || !name.starts_with(prefix) {
            continue;
        }

        if latest.as_ref().map_or(true, |(best, _)| name > *best) {
            latest = Some((name, path));
        }
    }

    Ok(latest.map(|(_, path)| path))
}

/// Read a raw CSV into a batch.
///
/// The header is checked against the schema before any row is decoded, so a
/// drifted file fails with `SchemaMismatch` rather than a row error. A
/// zero-byte file yields an empty batch. Empty cells become `None`.
pub fn read_batch(path: &Path) -> Result<Batch, IngestError> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let filename = path.display().to_string();

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(file);

    let columns: Vec<String> = reader
        .headers()
        .map_err(|source| IngestError::Header {
            path: filename.clone(),
            source,
        })?
        .iter()
        .map(|h| h.to_string())
        .collect();

    if columns.is_empty() {
        return Ok(Batch::with_columns(columns, Vec::new()));
    }
    check_schema(&columns)?;

    let mut records = Vec::new();
    for (line_num, result) in reader.deserialize::<TransactionRecord>().enumerate() {
        let record = result.map_err(|source| IngestError::Row {
            path: filename.clone(),
            line: line_num + 2, // 1-indexed + header row
            source,
        })?;
        records.push(record);
    }

    Ok(Batch::with_columns(columns, records))
}

/// SHA-256 of the file contents, hex encoded
pub fn file_checksum(path: &Path) -> Result<String, IngestError> {
    let mut file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|e| io_error(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::fs;

    const HEADER: &str = "transaction_id,customer_id,product_id,amount,transaction_date,status,updated_at";

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_latest_source_file_picks_last_name() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "daily_transactions_2026-02-15_10-00-00.csv", HEADER);
        write(dir.path(), "daily_transactions_2026-02-16_09-00-00.csv", HEADER);
        write(dir.path(), "zzz_notes.csv", HEADER);
        write(dir.path(), "daily_transactions_2026-02-17.txt", HEADER);

        let latest = latest_source_file(dir.path(), "daily_transactions_").unwrap().unwrap();

        assert_eq!(
            latest.file_name().unwrap().to_str().unwrap(),
            "daily_transactions_2026-02-16_09-00-00.csv"
        );
    }

    #[test]
    fn test_latest_source_file_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_source_file(dir.path(), "daily_transactions_").unwrap().is_none());
        assert!(latest_source_file(&dir.path().join("missing"), "").is_err());
    }

    #[test]
    fn test_read_batch_parses_rows_and_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!(
            "{}\nT1,CUST_1,P001,45.99,2026-02-16,completed,2026-02-16 10:00:00.123456\nT2,,P002,,2026-02-16,pending,2026-02-16T11:00:00\n",
            HEADER
        );
        let path = write(dir.path(), "daily_transactions_1.csv", &content);

        let batch = read_batch(&path).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].amount, Some(Decimal::new(4599, 2)));
        assert_eq!(batch.records[1].customer_id, None);
        assert_eq!(batch.records[1].amount, None);
        assert_eq!(batch.columns.len(), 7);
    }

    #[test]
    fn test_read_batch_column_order_does_not_matter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "x.csv",
            "updated_at,status,transaction_date,amount,product_id,customer_id,transaction_id\n2026-02-16 10:00:00,completed,2026-02-16,10,P001,C1,T1\n",
        );

        let batch = read_batch(&path).unwrap();
        assert_eq!(batch.records[0].key(), Some("T1"));
    }

    #[test]
    fn test_read_batch_rejects_extra_column_before_rows() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("{},discount\nT1,C1,P001,10,2026-02-16,completed,2026-02-16 10:00:00,5\n", HEADER);
        let path = write(dir.path(), "x.csv", &content);

        let err = read_batch(&path).unwrap_err();
        assert!(matches!(err, IngestError::Schema(ref m) if m.unexpected == vec!["discount".to_string()]));
    }

    #[test]
    fn test_read_batch_rejects_repeated_column() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!(
            "{},status\nT1,C1,P001,10,2026-02-16,completed,2026-02-16 10:00:00,pending\n",
            HEADER
        );
        let path = write(dir.path(), "x.csv", &content);

        let err = read_batch(&path).unwrap_err();
        assert!(matches!(err, IngestError::Schema(ref m) if m.unexpected == vec!["status".to_string()]));
    }

    #[test]
    fn test_read_batch_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!(
            "{}\nT1,C1,P001,10,2026-02-16,completed,2026-02-16 10:00:00\nT2,C1,P001,ten,2026-02-16,completed,2026-02-16 10:00:00\n",
            HEADER
        );
        let path = write(dir.path(), "x.csv", &content);

        let err = read_batch(&path).unwrap_err();
        assert!(matches!(err, IngestError::Row { line: 3, .. }));
    }

    #[test]
    fn test_empty_file_is_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write(dir.path(), "empty.csv", "");
        let header_only = write(dir.path(), "header.csv", &format!("{}\n", HEADER));

        assert!(read_batch(&empty).unwrap().is_empty());
        assert!(read_batch(&header_only).unwrap().is_empty());
    }

    #[test]
    fn test_file_checksum_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "x.csv", "abc");

        let sum = file_checksum(&path).unwrap();
        assert_eq!(sum, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(sum, file_checksum(&path).unwrap());
    }
}
