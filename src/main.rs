// 🛒 etl - command-line entry point for the transaction pipeline
//
//   etl init                      create the warehouse tables
//   etl seed-products <csv>       load the product catalog
//   etl ingest [--dir <dir>]      newest raw drop → staging
//   etl load                      staging → fact + quarantine
//   etl run                       ingest, then load
//   etl runs [--limit <n>]        recent run log

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ecommerce_etl::{
    latest_source_file, load_products_csv, LoadCoordinator, LoadError, LoadResult,
    PipelineConfig, SqliteWarehouse, Table,
};

#[derive(Parser, Debug)]
#[command(name = "etl")]
#[command(about = "Validate and incrementally load e-commerce transactions")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(short, long, env = "ETL_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite warehouse file (overrides config and ETL_DATABASE_PATH)
    #[arg(long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the warehouse tables
    Init,

    /// Insert or rename products from a `product_id,name` CSV
    SeedProducts { csv: PathBuf },

    /// Ingest the newest raw CSV drop into staging
    Ingest {
        /// Raw drop directory (overrides config and ETL_RAW_DATA_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Validate staging and load the fact and quarantine tables
    Load,

    /// Ingest, then load
    Run {
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Show the most recent runs
    Runs {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

fn main() {
    if let Err(e) = run_cli() {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(database = %config.database_path.display(), "Opening warehouse");
    let warehouse = SqliteWarehouse::open(&config).with_context(|| {
        format!("Failed to open warehouse {}", config.database_path.display())
    })?;

    match cli.command {
        Command::Init => init(&warehouse),
        Command::SeedProducts { csv } => seed_products(warehouse, &csv),
        Command::Ingest { .. } => {
            let mut coordinator = LoadCoordinator::new(warehouse);
            ingest(&mut coordinator, &config).map(|_| ())
        }
        Command::Load => {
            let mut coordinator = LoadCoordinator::new(warehouse);
            load(&mut coordinator)
        }
        Command::Run { .. } => {
            let mut coordinator = LoadCoordinator::new(warehouse);
            ingest(&mut coordinator, &config)?;
            load(&mut coordinator)
        }
        Command::Runs { limit } => show_runs(&warehouse, limit),
    }
}

/// CLI flag > environment > TOML file > default
fn resolve_config(cli: &Cli) -> Result<PipelineConfig> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    let mut config = config.apply_env(|key| std::env::var(key).ok());

    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    match &cli.command {
        Command::Ingest { dir: Some(dir) } | Command::Run { dir: Some(dir) } => {
            config.raw_data_dir = dir.clone();
        }
        _ => {}
    }

    config.validate()?;
    Ok(config)
}

fn init(warehouse: &SqliteWarehouse) -> Result<()> {
    println!("🔧 Warehouse initialized (WAL mode)");
    for table in [Table::Staging, Table::Fact, Table::Quarantine, Table::Products] {
        println!("✓ {:<28} {} rows", table.name(), warehouse.count_rows(table)?);
    }
    Ok(())
}

fn seed_products(mut warehouse: SqliteWarehouse, csv: &Path) -> Result<()> {
    println!("📂 Loading products from {}", csv.display());
    let products = load_products_csv(csv)
        .with_context(|| format!("Failed to read product catalog {}", csv.display()))?;
    let written = warehouse.seed_products(&products)?;
    println!("✓ {} products written, {} in catalog", written, warehouse.count_rows(Table::Products)?);
    Ok(())
}

/// Returns `None` when there is no raw file to ingest
fn ingest(
    coordinator: &mut LoadCoordinator<SqliteWarehouse>,
    config: &PipelineConfig,
) -> Result<Option<LoadResult>> {
    let dir = &config.raw_data_dir;
    let Some(path) = latest_source_file(dir, &config.file_prefix)? else {
        warn!(dir = %dir.display(), "No raw files found");
        println!("⚠️  No raw files in {}", dir.display());
        return Ok(None);
    };

    println!("📥 Ingesting {}", path.display());
    let outcome = coordinator.ingest_file(&path);
    let result = record_outcome(coordinator.store(), outcome)?;
    print_result(&result);
    Ok(Some(result))
}

fn load(coordinator: &mut LoadCoordinator<SqliteWarehouse>) -> Result<()> {
    println!("🚚 Loading staging into fact table");
    let outcome = coordinator.run();
    let result = record_outcome(coordinator.store(), outcome)?;
    print_result(&result);
    Ok(())
}

/// Write the run log entry for both finished and aborted runs
fn record_outcome(
    warehouse: &SqliteWarehouse,
    outcome: Result<LoadResult, LoadError>,
) -> Result<LoadResult> {
    let run = match &outcome {
        Ok(result) => result.to_run_record(),
        Err(err) => err.result().to_run_record(),
    };
    if let Err(e) = warehouse.insert_run_record(&run) {
        warn!(run_id = %run.run_id, error = %e, "Failed to record run");
    }
    outcome.map_err(anyhow::Error::new)
}

fn print_result(result: &LoadResult) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Input rows:        {}", result.input_count);
    println!("✓ Valid rows:        {}", result.valid_count);
    println!("✓ Invalid entries:   {} ({} rows)", result.invalid_count, result.rejected_rows);
    println!("✓ Incremental rows:  {} ({} skipped)", result.incremental_count, result.skipped_count);
    println!("✓ Quarantined:       {}", result.quarantined_rows);
    println!("✓ Rows written:      {}", result.rows_written);
    if result.lookup_degraded {
        println!("⚠️  Existing-state lookup failed; batch treated as fully incremental");
    }
    if let Some(message) = &result.message {
        println!("ℹ️  {}", message);
    }
    println!("✅ {}", result.summary());
}

fn show_runs(warehouse: &SqliteWarehouse, limit: usize) -> Result<()> {
    let runs = warehouse.recent_runs(limit)?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<6} {:<8} {:<18} in={} valid={} invalid={} written={}  {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.kind,
            run.status,
            run.stage,
            run.input_count,
            run.valid_count,
            run.invalid_count,
            run.rows_written,
            run.source_file.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
