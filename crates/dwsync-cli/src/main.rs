//! DWSync CLI - operator entry point
//!
//! Enqueues sync jobs through the same intake validation the worker trusts,
//! inspects job status, and reports worker liveness from the heartbeat key.

use std::process;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use dwsync_common::logging::{init_logging, LogConfig, LogLevel};
use dwsync_engine::config::{DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_HEARTBEAT_STALE_SECS};
use dwsync_engine::dataset::DatasetCatalog;
use dwsync_engine::job::{KeyRange, SyncAction, SyncRequest};
use dwsync_engine::kv::{KvStore, RedisStore};
use dwsync_engine::liveness::{LivenessReporter, SystemClock};
use dwsync_engine::status::JobStore;
use dwsync_engine::target::{ClickHouseClient, ClickHouseConfig};
use dwsync_engine::validate::ConsistencyValidator;

#[derive(Parser, Debug)]
#[command(name = "dwsync")]
#[command(author, version, about = "DWSync operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Job status store / dataset catalog URL
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgresql://localhost/dwsync",
        global = true
    )]
    database_url: String,

    /// Lock/heartbeat store URL
    #[arg(
        long,
        env = "DWSYNC_REDIS_URL",
        default_value = "redis://localhost:6379",
        global = true
    )]
    redis_url: String,
}

#[derive(Parser, Debug)]
enum Command {
    /// Enqueue a sync job
    Trigger {
        /// Dataset to synchronize
        #[arg(short, long)]
        dataset: String,

        /// Sync action (initial_sync, incremental_sync, full_refresh,
        /// manual_sync, partial_refresh, missing_sync, new_records_sync)
        #[arg(short, long)]
        action: String,

        /// Window size in days (partial_refresh)
        #[arg(long)]
        days: Option<u32>,

        /// Primary-key ranges to backfill, e.g. "100:200,500:600" (missing_sync)
        #[arg(long)]
        ranges: Option<String>,

        /// Primary-key column override for range-based actions
        #[arg(long)]
        pk_column: Option<String>,

        /// Exclusive lower bound (new_records_sync)
        #[arg(long)]
        after_id: Option<i64>,

        /// Cap on extracted rows, for bounded diagnostic runs
        #[arg(long)]
        limit: Option<u64>,

        /// Actor reference recorded for audit
        #[arg(long)]
        triggered_by: Option<Uuid>,
    },

    /// Show one job, or the most recent jobs
    Status {
        /// Job id; omit to list recent jobs
        #[arg(long)]
        job_id: Option<Uuid>,

        /// How many recent jobs to list
        #[arg(long, default_value_t = 20)]
        recent: i64,
    },

    /// Report worker liveness from the heartbeat key
    Health,

    /// List dataset ids known to the catalog
    Datasets,

    /// Count target rows for one partition-column date (repeated-load probe)
    Probe {
        /// Target table to probe
        #[arg(long)]
        table: String,

        /// Partition column holding the load date
        #[arg(long)]
        column: String,

        /// Date to probe, YYYY-MM-DD
        #[arg(long)]
        date: String,
    },

    /// Request a duplicate merge on a target table and report rows removed
    Merge {
        /// Target table to compact
        #[arg(long)]
        table: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let base = if cli.verbose {
        LogConfig::default().with_level(LogLevel::Debug)
    } else {
        LogConfig::default().with_level(LogLevel::Warn)
    };
    let log_config = LogConfig::from_env_or(base.with_prefix("dwsync-cli"))
        .unwrap_or_default();
    // The CLI should keep working even if logging cannot initialize.
    let _ = init_logging(&log_config);

    if let Err(e) = execute_command(&cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Trigger {
            dataset,
            action,
            days,
            ranges,
            pk_column,
            after_id,
            limit,
            triggered_by,
        } => {
            let request = SyncRequest {
                dataset_id: dataset.clone(),
                action: SyncAction::from_str(action)?,
                triggered_by: *triggered_by,
                days: *days,
                ranges: ranges.as_deref().map(parse_ranges).transpose()?,
                pk_column: pk_column.clone(),
                after_id: *after_id,
                limit: *limit,
            };
            // Reject malformed requests before any job row exists.
            request.validate()?;

            let jobs = JobStore::new(connect(&cli.database_url).await?);
            let job_id = jobs.create(&request).await?;
            println!("{job_id}");
            Ok(())
        }

        Command::Status { job_id, recent } => {
            let jobs = JobStore::new(connect(&cli.database_url).await?);
            match job_id {
                Some(job_id) => {
                    let record = jobs
                        .get(*job_id)
                        .await?
                        .with_context(|| format!("no job {job_id}"))?;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                None => {
                    for record in jobs.list_recent(*recent).await? {
                        println!(
                            "{}  {:<12} {:<18} {:<10} rows={}",
                            record.id,
                            record.dataset_id,
                            record.action.as_str(),
                            record.status.as_str(),
                            record.rows_processed
                        );
                    }
                }
            }
            Ok(())
        }

        Command::Health => {
            let kv: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&cli.redis_url).await?);
            let reporter = LivenessReporter::new(
                kv,
                Arc::new(SystemClock),
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
                DEFAULT_HEARTBEAT_STALE_SECS,
            );
            let health = reporter.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if !health.is_alive {
                process::exit(2);
            }
            Ok(())
        }

        Command::Datasets => {
            let catalog = DatasetCatalog::new(connect(&cli.database_url).await?);
            for id in catalog.list_ids().await? {
                println!("{id}");
            }
            Ok(())
        }

        Command::Probe {
            table,
            column,
            date,
        } => {
            let date = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .context("date must be YYYY-MM-DD")?;
            let validator = ConsistencyValidator::new(target_client()?);
            let count = validator.count_for_partition_date(table, column, date).await;
            println!("{count}");
            Ok(())
        }

        Command::Merge { table } => {
            let validator = ConsistencyValidator::new(target_client()?);
            let removed = validator.merge_duplicates(table).await;
            println!("{removed} duplicate rows removed");
            Ok(())
        }
    }
}

fn target_client() -> Result<ClickHouseClient> {
    Ok(ClickHouseClient::new(ClickHouseConfig::from_env()?))
}

async fn connect(url: &str) -> Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(2)
        .connect(url)
        .await
        .context("Failed to connect to the status store")
}

/// Parse "start:end[,start:end...]" into key ranges.
fn parse_ranges(spec: &str) -> Result<Vec<KeyRange>> {
    spec.split(',')
        .map(|part| {
            let (start, end) = part
                .split_once(':')
                .with_context(|| format!("range {part:?} is not start:end"))?;
            Ok(KeyRange {
                start: start.trim().parse().context("range start is not an integer")?,
                end: end.trim().parse().context("range end is not an integer")?,
                missing_count: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranges() {
        let ranges = parse_ranges("100:200,500:600").unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, 100);
        assert_eq!(ranges[0].end, 200);
        assert_eq!(ranges[1].start, 500);
        assert_eq!(ranges[1].end, 600);
    }

    #[test]
    fn test_parse_ranges_rejects_garbage() {
        assert!(parse_ranges("100-200").is_err());
        assert!(parse_ranges("a:b").is_err());
    }

    #[test]
    fn test_cli_parses_trigger() {
        let cli = Cli::parse_from([
            "dwsync",
            "trigger",
            "--dataset",
            "sales",
            "--action",
            "new_records_sync",
            "--after-id",
            "500",
            "--limit",
            "2000",
        ]);
        match cli.command {
            Command::Trigger {
                dataset,
                action,
                after_id,
                limit,
                ..
            } => {
                assert_eq!(dataset, "sales");
                assert_eq!(action, "new_records_sync");
                assert_eq!(after_id, Some(500));
                assert_eq!(limit, Some(2000));
            }
            _ => panic!("expected trigger"),
        }
    }
}
