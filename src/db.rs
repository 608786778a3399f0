use crate::config::PipelineConfig;
use crate::error::StoreError;
use crate::record::{
    format_date, format_timestamp, parse_amount, parse_date, parse_timestamp, Batch,
    FactRecord, QuarantineRecord, TransactionRecord, EXPECTED_COLUMNS,
};
use crate::store::{
    FactSink, ProductCatalog, QuarantineSink, StagingSink, StagingSource, WatermarkSource,
};
use crate::watermark::WatermarkMap;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Product catalog entry
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Product {
    pub product_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Audit record for one ingest or load run
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub stage: String,
    pub input_count: i64,
    pub valid_count: i64,
    pub invalid_count: i64,
    pub incremental_count: i64,
    pub rows_written: i64,
    pub source_file: Option<String>,
    pub source_sha256: Option<String>,
    pub detail: serde_json::Value,
}

/// Tables owned by the warehouse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Staging,
    Fact,
    Quarantine,
    Products,
    Runs,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Staging => "staging_transactions",
            Table::Fact => "fact_transactions",
            Table::Quarantine => "quarantine_transactions",
            Table::Products => "products",
            Table::Runs => "load_runs",
        }
    }
}

pub fn setup_database(conn: &Connection) -> Result<(), StoreError> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Staging: latest version of each ingested transaction
    // Columns must stay exactly the ingestion schema (read back with SELECT *)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS staging_transactions (
            transaction_id TEXT PRIMARY KEY NOT NULL,
            customer_id TEXT,
            product_id TEXT,
            amount TEXT,
            transaction_date TEXT,
            status TEXT,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Fact table, keyed by (transaction_id, transaction_date)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fact_transactions (
            transaction_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            amount TEXT NOT NULL,
            transaction_date TEXT NOT NULL,
            status TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (transaction_id, transaction_date)
        )",
        [],
    )?;

    // ==========================================================================
    // Quarantine: one row per (transaction_id, violated rule)
    // A missing transaction_id is stored as '' so the key stays usable
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS quarantine_transactions (
            transaction_id TEXT NOT NULL,
            customer_id TEXT,
            product_id TEXT,
            amount TEXT,
            transaction_date TEXT,
            status TEXT,
            updated_at TEXT NOT NULL,
            error_message TEXT NOT NULL,
            quarantined_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (transaction_id, error_message)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS products (
            product_id TEXT PRIMARY KEY NOT NULL,
            name TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Run log (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS load_runs (
            run_id TEXT PRIMARY KEY NOT NULL,
            kind TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            status TEXT NOT NULL,
            stage TEXT NOT NULL,
            input_count INTEGER NOT NULL,
            valid_count INTEGER NOT NULL,
            invalid_count INTEGER NOT NULL,
            incremental_count INTEGER NOT NULL,
            rows_written INTEGER NOT NULL,
            source_file TEXT,
            source_sha256 TEXT,
            detail TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fact_updated_at ON fact_transactions(transaction_id, updated_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_runs_started_at ON load_runs(started_at)",
        [],
    )?;

    Ok(())
}

/// Read a `product_id,name` CSV
pub fn load_products_csv(csv_path: &Path) -> Result<Vec<Product>, StoreError> {
    let mut rdr = csv::Reader::from_path(csv_path)?;

    let mut products = Vec::new();
    for result in rdr.deserialize() {
        let product: Product = result?;
        products.push(product);
    }

    Ok(products)
}

// ============================================================================
// ROW CODEC
// ============================================================================

/// Text columns as stored; decoded outside the rusqlite row callback so that
/// a corrupt value surfaces as a StoreError instead of being defaulted.
struct StoredRow {
    transaction_id: Option<String>,
    customer_id: Option<String>,
    product_id: Option<String>,
    amount: Option<String>,
    transaction_date: Option<String>,
    status: Option<String>,
    updated_at: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(StoredRow {
            transaction_id: row.get("transaction_id")?,
            customer_id: row.get("customer_id")?,
            product_id: row.get("product_id")?,
            amount: row.get("amount")?,
            transaction_date: row.get("transaction_date")?,
            status: row.get("status")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn decode(self, table: Table) -> Result<TransactionRecord, StoreError> {
        let corrupt = |column: &'static str, value: &str| StoreError::Corrupt {
            table: table.name(),
            column,
            value: value.to_string(),
        };

        let amount = match self.amount {
            Some(raw) => Some(parse_amount(&raw).ok_or_else(|| corrupt("amount", &raw))?),
            None => None,
        };
        let transaction_date = match self.transaction_date {
            Some(raw) => Some(parse_date(&raw).ok_or_else(|| corrupt("transaction_date", &raw))?),
            None => None,
        };
        let updated_at =
            parse_timestamp(&self.updated_at).ok_or_else(|| corrupt("updated_at", &self.updated_at))?;

        Ok(TransactionRecord {
            transaction_id: self.transaction_id.filter(|id| !id.is_empty()),
            customer_id: self.customer_id,
            product_id: self.product_id,
            amount,
            transaction_date,
            status: self.status,
            updated_at,
        })
    }
}

/// Bind values in column order for the 7 transaction columns
fn record_params(tx: &TransactionRecord) -> (Option<String>, Option<String>, String) {
    (
        tx.amount.map(|a| a.to_string()),
        tx.transaction_date.as_ref().map(format_date),
        format_timestamp(&tx.updated_at),
    )
}

fn decode_watermarks(
    conn: &Connection,
    sql: &str,
    table: Table,
) -> Result<WatermarkMap, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let pairs = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    pairs
        .into_iter()
        .map(|(id, raw)| {
            let ts = parse_timestamp(&raw).ok_or_else(|| StoreError::Corrupt {
                table: table.name(),
                column: "updated_at",
                value: raw.clone(),
            })?;
            Ok((id, ts))
        })
        .collect()
}

// ============================================================================
// SQLITE WAREHOUSE
// ============================================================================

/// SQLite-backed staging, fact, quarantine and product stores
pub struct SqliteWarehouse {
    conn: Connection,
}

impl SqliteWarehouse {
    pub fn open(config: &PipelineConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.database_path)?;
        conn.busy_timeout(config.busy_timeout())?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, creating tables if needed
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        setup_database(&conn)?;
        Ok(SqliteWarehouse { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Insert or rename catalog entries in one transaction
    pub fn seed_products(&mut self, products: &[Product]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO products (product_id, name) VALUES (?1, ?2)
                 ON CONFLICT (product_id) DO UPDATE SET name = excluded.name",
            )?;
            for product in products {
                written += stmt.execute(params![product.product_id, product.name])?;
            }
        }
        tx.commit()?;

        debug!(written, "Product catalog seeded");
        Ok(written)
    }

    pub fn count_rows(&self, table: Table) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn fetch_facts(&self) -> Result<Vec<FactRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_id, customer_id, product_id, amount,
                    transaction_date, status, updated_at
             FROM fact_transactions
             ORDER BY transaction_id, transaction_date",
        )?;

        let rows = stmt
            .query_map([], |row| StoredRow::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(|r| r.decode(Table::Fact)).collect()
    }

    pub fn fetch_quarantine(&self) -> Result<Vec<QuarantineRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_id, customer_id, product_id, amount,
                    transaction_date, status, updated_at, error_message
             FROM quarantine_transactions
             ORDER BY transaction_id, error_message",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let stored = StoredRow::from_row(row)?;
                let message: String = row.get("error_message")?;
                Ok((stored, message))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(stored, message)| {
                Ok(QuarantineRecord::new(stored.decode(Table::Quarantine)?, message))
            })
            .collect()
    }

    /// Insert run into audit trail.
    /// Timestamps are fixed-width so `ORDER BY started_at` is chronological.
    pub fn insert_run_record(&self, run: &RunRecord) -> Result<(), StoreError> {
        let detail_json = serde_json::to_string(&run.detail)?;

        self.conn.execute(
            "INSERT INTO load_runs (
                run_id, kind, started_at, finished_at, status, stage,
                input_count, valid_count, invalid_count, incremental_count, rows_written,
                source_file, source_sha256, detail
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                run.run_id,
                run.kind,
                run.started_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                run.finished_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                run.status,
                run.stage,
                run.input_count,
                run.valid_count,
                run.invalid_count,
                run.incremental_count,
                run.rows_written,
                run.source_file,
                run.source_sha256,
                detail_json,
            ],
        )?;

        Ok(())
    }

    /// Most recent runs first
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, kind, started_at, finished_at, status, stage,
                    input_count, valid_count, invalid_count, incremental_count, rows_written,
                    source_file, source_sha256, detail
             FROM load_runs
             ORDER BY started_at DESC
             LIMIT ?1",
        )?;

        let raw = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    [
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, i64>(10)?,
                    ],
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, String>(13)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let parse_time = |column: &'static str, value: &str| {
            DateTime::parse_from_rfc3339(value)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| StoreError::Corrupt {
                    table: Table::Runs.name(),
                    column,
                    value: value.to_string(),
                })
        };

        raw.into_iter()
            .map(
                |(run_id, kind, started, finished, status, stage, counts, source_file, source_sha256, detail)| {
                    Ok(RunRecord {
                        run_id,
                        kind,
                        started_at: parse_time("started_at", &started)?,
                        finished_at: parse_time("finished_at", &finished)?,
                        status,
                        stage,
                        input_count: counts[0],
                        valid_count: counts[1],
                        invalid_count: counts[2],
                        incremental_count: counts[3],
                        rows_written: counts[4],
                        source_file,
                        source_sha256,
                        detail: serde_json::from_str(&detail)?,
                    })
                },
            )
            .collect()
    }
}

// ============================================================================
// STORE SEAMS
// ============================================================================

impl StagingSource for SqliteWarehouse {
    /// Reads with `SELECT *` so the batch carries the table's real column set.
    /// When that set drifts from the schema the rows are not decoded; the
    /// caller's schema check rejects the batch.
    fn fetch_staging(&self) -> Result<Batch, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM staging_transactions ORDER BY transaction_id")?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let expected: HashSet<&str> = EXPECTED_COLUMNS.iter().copied().collect();
        let actual: HashSet<&str> = columns.iter().map(String::as_str).collect();
        if expected != actual {
            return Ok(Batch::with_columns(columns, Vec::new()));
        }

        let rows = stmt
            .query_map([], |row| StoredRow::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        let records = rows
            .into_iter()
            .map(|r| r.decode(Table::Staging))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Batch::with_columns(columns, records))
    }
}

impl ProductCatalog for SqliteWarehouse {
    fn valid_products(&self) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT product_id FROM products")?;
        let products = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(products)
    }
}

impl WatermarkSource for SqliteWarehouse {
    fn fact_watermarks(&self) -> Result<WatermarkMap, StoreError> {
        decode_watermarks(
            &self.conn,
            "SELECT transaction_id, MAX(updated_at) FROM fact_transactions GROUP BY transaction_id",
            Table::Fact,
        )
    }

    fn staging_watermarks(&self) -> Result<WatermarkMap, StoreError> {
        decode_watermarks(
            &self.conn,
            "SELECT transaction_id, updated_at FROM staging_transactions",
            Table::Staging,
        )
    }
}

impl QuarantineSink for SqliteWarehouse {
    fn insert_quarantine(&mut self, rows: &[QuarantineRecord]) -> Result<usize, StoreError> {
        // Dropping `tx` without commit rolls the whole call back
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO quarantine_transactions (
                    transaction_id, customer_id, product_id, amount,
                    transaction_date, status, updated_at, error_message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT (transaction_id, error_message) DO NOTHING",
            )?;

            for row in rows {
                let record = &row.record;
                let (amount, date, updated_at) = record_params(record);
                inserted += stmt.execute(params![
                    record.key().unwrap_or(""),
                    record.customer_id,
                    record.product_id,
                    amount,
                    date,
                    record.status,
                    updated_at,
                    row.error_message,
                ])?;
            }
        }
        tx.commit()?;

        debug!(submitted = rows.len(), inserted, "Quarantine write committed");
        Ok(inserted)
    }
}

impl FactSink for SqliteWarehouse {
    fn upsert_facts(&mut self, rows: &[TransactionRecord]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO fact_transactions (
                    transaction_id, customer_id, product_id, amount,
                    transaction_date, status, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (transaction_id, transaction_date) DO UPDATE SET
                    customer_id = excluded.customer_id,
                    product_id = excluded.product_id,
                    amount = excluded.amount,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                WHERE fact_transactions.updated_at < excluded.updated_at",
            )?;

            for record in rows {
                let (amount, date, updated_at) = record_params(record);
                written += stmt.execute(params![
                    record.transaction_id,
                    record.customer_id,
                    record.product_id,
                    amount,
                    date,
                    record.status,
                    updated_at,
                ])?;
            }
        }
        tx.commit()?;

        debug!(submitted = rows.len(), written, "Fact upsert committed");
        Ok(written)
    }
}

impl StagingSink for SqliteWarehouse {
    fn upsert_staging(&mut self, rows: &[TransactionRecord]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO staging_transactions (
                    transaction_id, customer_id, product_id, amount,
                    transaction_date, status, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (transaction_id) DO UPDATE SET
                    customer_id = excluded.customer_id,
                    product_id = excluded.product_id,
                    amount = excluded.amount,
                    transaction_date = excluded.transaction_date,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                WHERE staging_transactions.updated_at < excluded.updated_at",
            )?;

            for record in rows {
                let (amount, date, updated_at) = record_params(record);
                written += stmt.execute(params![
                    record.transaction_id,
                    record.customer_id,
                    record.product_id,
                    amount,
                    date,
                    record.status,
                    updated_at,
                ])?;
            }
        }
        tx.commit()?;

        debug!(submitted = rows.len(), written, "Staging upsert committed");
        Ok(written)
    }
}
