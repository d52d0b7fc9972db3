//! End-to-end batch runs against real CSV fixtures and a real store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use tickforge_builtin::{plan_backfill, run_batch, run_batch_with_options, RunOptions};
use tickforge_features::catalog;
use tickforge_rs::calendar::AssetClass;
use tickforge_rs::config::{PipelineConfig, StoreConfig, SymbolSpec};
use tickforge_rs::store::FeatureStore;

/// Writes `n` consecutive weekday bars starting 2024-01-08 (a Monday),
/// skipping the zero-based weekday indices in `skip`.
fn write_bars(dir: &std::path::Path, symbol: &str, n: usize, skip: &[usize]) -> Vec<NaiveDate> {
    let mut body = String::from("timestamp,open,high,low,close,volume\n");
    let mut date = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
    let mut written = Vec::new();
    let mut i = 0;
    while i < n {
        if date.weekday() != Weekday::Sat && date.weekday() != Weekday::Sun {
            if !skip.contains(&i) {
                let price = 100.0 + (i as f64 * 0.5).sin() * 3.0 + i as f64 * 0.05;
                body.push_str(&format!(
                    "{date},{:.4},{:.4},{:.4},{:.4},{}\n",
                    price,
                    price + 1.0,
                    price - 1.0,
                    price + 0.3,
                    1_000 + i * 10,
                ));
                written.push(date);
            }
            i += 1;
        }
        date += Duration::days(1);
    }
    std::fs::write(dir.join(format!("{symbol}.csv")), body).unwrap();
    written
}

fn config_for(dir: &std::path::Path, symbols: &[&str]) -> PipelineConfig {
    let store = StoreConfig::new(dir.join("store.duckdb"));
    let mut config = PipelineConfig::new(dir.join("bars"), store);
    config.n_workers = 2;
    for symbol in symbols {
        config.universe.push(SymbolSpec {
            symbol: symbol.to_string(),
            asset_class: AssetClass::Equity,
            sector: Some("Test".to_string()),
            exchange: Some("XTST".to_string()),
        });
    }
    std::fs::create_dir_all(&config.input_dir).unwrap();
    config
}

fn reopen_store(config: &PipelineConfig) -> FeatureStore {
    FeatureStore::open(config.store.clone(), catalog::table_schema()).unwrap()
}

#[test]
fn batch_run_writes_every_symbol() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), &["AAA", "BBB"]);
    write_bars(&config.input_dir, "AAA", 60, &[]);
    write_bars(&config.input_dir, "BBB", 60, &[]);

    let summary = run_batch(&config).unwrap();
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.succeeded, 2);
    assert!(summary.is_clean());
    assert_eq!(summary.rows_written, 120);

    let store = reopen_store(&config);
    assert_eq!(store.row_count().unwrap(), 120);
    assert_eq!(store.distinct_key_count().unwrap(), 120);
}

#[test]
fn rerun_is_idempotent_on_contents() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), &["AAA"]);
    write_bars(&config.input_dir, "AAA", 40, &[]);

    run_batch(&config).unwrap();
    let summary = run_batch(&config).unwrap();
    assert_eq!(summary.succeeded, 1);

    let store = reopen_store(&config);
    assert_eq!(store.row_count().unwrap(), 40);
    assert_eq!(store.distinct_key_count().unwrap(), 40);
}

#[test]
fn one_bad_symbol_does_not_sink_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), &["GOOD", "MISSING"]);
    write_bars(&config.input_dir, "GOOD", 30, &[]);
    // No CSV for MISSING.

    let summary = run_batch(&config).unwrap();
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].symbol, "MISSING");

    let store = reopen_store(&config);
    assert_eq!(store.row_count().unwrap(), 30);
}

#[test]
fn preset_cancellation_attempts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), &["AAA"]);
    write_bars(&config.input_dir, "AAA", 30, &[]);

    let cancel = Arc::new(AtomicBool::new(false));
    cancel.store(true, Ordering::Relaxed);
    let options = RunOptions {
        cancel: Some(cancel),
    };
    let summary = run_batch_with_options(&config, &options).unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.rows_written, 0);
}

#[test]
fn gap_scan_separates_source_gaps_from_store_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path(), &["GAPPY"]);
    // The source never produced weekday slot 2 of the window.
    let written = write_bars(&config.input_dir, "GAPPY", 10, &[2]);
    config.date_start = Some(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap());
    config.date_end = Some(*written.last().unwrap());

    // Before any batch run the store holds nothing: everything the
    // source has is missing from the store.
    let reports = plan_backfill(&config).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].missing_from_store, written);
    // Weekday 2 of the range (2024-01-10) was never delivered.
    assert_eq!(
        reports[0].missing_from_source,
        vec![NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()]
    );

    // After a run the store side is fully covered; the source-side gap
    // remains, reported and never zero-filled.
    run_batch(&config).unwrap();
    let reports = plan_backfill(&config).unwrap();
    assert!(reports[0].missing_from_store.is_empty());
    assert_eq!(
        reports[0].missing_from_source,
        vec![NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()]
    );
}

#[test]
fn gap_scan_reports_a_feed_that_stopped_updating() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path(), &["STALE"]);
    // Last delivered bar is Friday 2024-01-19; the run window expects
    // coverage through Monday 2024-01-22.
    write_bars(&config.input_dir, "STALE", 10, &[]);
    config.date_end = Some(NaiveDate::from_ymd_opt(2024, 1, 22).unwrap());

    run_batch(&config).unwrap();
    let reports = plan_backfill(&config).unwrap();
    assert!(reports[0].missing_from_store.is_empty());
    assert_eq!(
        reports[0].missing_from_source,
        vec![NaiveDate::from_ymd_opt(2024, 1, 22).unwrap()]
    );
}
