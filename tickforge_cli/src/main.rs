mod cli;

use std::path::Path;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

/// Console logging always; a non-blocking file log next to the
/// database unless disabled. The appender guard must outlive main, so
/// it is leaked.
fn init_tracing(log_dir: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "tickforge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Box::leak(Box::new(guard));
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
        }
        None => registry.init(),
    }
}

fn log_dir_for(db: &Path, no_file_log: bool) -> Option<std::path::PathBuf> {
    if no_file_log {
        return None;
    }
    let dir = match db.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let log_dir = log_dir_for(&args.db, cli.no_file_log);
            init_tracing(log_dir.as_deref());
            let config = args.into_config()?;
            tracing::info!(
                input_dir = %config.input_dir.display(),
                db = %config.store.db_path.display(),
                symbols = config.universe.len(),
                "starting run"
            );
            let summary = tickforge_builtin::run_batch(&config)?;
            println!(
                "attempted {} symbols: {} succeeded, {} failed, {} rows written, {} bars rejected",
                summary.attempted,
                summary.succeeded,
                summary.failed.len(),
                summary.rows_written,
                summary.bars_rejected,
            );
            if !summary.is_clean() {
                for failure in &summary.failed {
                    eprintln!("  {}: {}", failure.symbol, failure.reason);
                }
                bail!("{} symbols failed", summary.failed.len());
            }
            Ok(())
        }
        Command::Gaps(args) => {
            let log_dir = log_dir_for(&args.db, cli.no_file_log);
            init_tracing(log_dir.as_deref());
            let config = args.into_config()?;
            let reports = tickforge_builtin::plan_backfill(&config)?;
            let mut clean = true;
            for report in &reports {
                if report.is_clean() {
                    continue;
                }
                clean = false;
                println!("{}:", report.symbol);
                for date in &report.missing_from_store {
                    println!("  missing from store:  {date}");
                }
                for date in &report.missing_from_source {
                    println!("  missing from source: {date}");
                }
            }
            if clean {
                println!("no coverage gaps across {} symbols", reports.len());
            }
            Ok(())
        }
        Command::Dedup(args) => {
            let log_dir = log_dir_for(&args.db, cli.no_file_log);
            init_tracing(log_dir.as_deref());
            let store_config = tickforge_rs::config::StoreConfig::new(args.db);
            let removed = tickforge_builtin::dedup_store(&store_config)?;
            println!("removed {removed} duplicate rows");
            Ok(())
        }
    }
}
