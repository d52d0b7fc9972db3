//! Batch orchestration: fan the per-symbol compute out over a thread
//! pool, apply merges sequentially on the single store connection, and
//! isolate every per-symbol failure into the run summary. Only store
//! corruption (schema drift, failure to open) halts a batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use polars::prelude::DataFrame;
use rayon::prelude::*;
use tickforge_features::catalog;
use tickforge_features::engineer::{ComposeOptions, FeatureComposer};
use tickforge_features::sanitize::sanitize_frame;
use tickforge_rs::bars::load_bars_csv;
use tickforge_rs::calendar::{GapPlanner, GapReport, MarketCalendar};
use tickforge_rs::config::{PipelineConfig, SymbolSpec};
use tickforge_rs::error::PipelineError;
use tickforge_rs::store::{fingerprint_file, FeatureStore};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Checked between symbols; a set flag stops the batch cleanly.
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone)]
pub struct SymbolFailure {
    pub symbol: String,
    pub reason: String,
}

/// The single source of truth for how a batch went.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<SymbolFailure>,
    pub rows_written: usize,
    pub bars_rejected: usize,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-symbol compute result handed from the parallel phase to the
/// sequential merge phase.
struct ComputedSymbol {
    frame: DataFrame,
    rejected: usize,
    source_hash: String,
}

pub fn run_batch(config: &PipelineConfig) -> Result<RunSummary> {
    run_batch_with_options(config, &RunOptions::default())
}

pub fn run_batch_with_options(config: &PipelineConfig, options: &RunOptions) -> Result<RunSummary> {
    let store = FeatureStore::open(config.store.clone(), catalog::table_schema())
        .context("failed to open feature store for batch run")?;
    let composer = FeatureComposer::new(ComposeOptions {
        ichimoku_shift: config.ichimoku_shift,
        pivot_window: config.pivot_window,
    })?;

    let mut summary = RunSummary::default();
    let chunk_size = config.n_workers.max(1);
    info!(
        symbols = config.universe.len(),
        workers = chunk_size,
        "starting batch run"
    );

    'outer: for chunk in config.universe.chunks(chunk_size) {
        if cancelled(options) {
            warn!("cancellation requested, stopping before next chunk");
            break;
        }
        let computed: Vec<(&SymbolSpec, Result<ComputedSymbol>)> = chunk
            .par_iter()
            .map(|spec| (spec, compute_symbol(config, &composer, spec)))
            .collect();

        for (spec, result) in computed {
            if cancelled(options) {
                warn!("cancellation requested, stopping before next merge");
                break 'outer;
            }
            summary.attempted += 1;
            let computed = match result {
                Ok(computed) => computed,
                Err(err) => {
                    warn!(symbol = %spec.symbol, error = %format!("{err:#}"), "symbol failed in compute");
                    summary.failed.push(SymbolFailure {
                        symbol: spec.symbol.clone(),
                        reason: format!("{err:#}"),
                    });
                    continue;
                }
            };
            summary.bars_rejected += computed.rejected;
            match merge_with_retry(&store, computed, &spec.symbol) {
                Ok(rows) => {
                    summary.succeeded += 1;
                    summary.rows_written += rows;
                }
                Err(err) => {
                    if err
                        .downcast_ref::<PipelineError>()
                        .map_or(false, PipelineError::is_fatal)
                    {
                        error!(symbol = %spec.symbol, "fatal store error, halting batch");
                        return Err(err);
                    }
                    warn!(symbol = %spec.symbol, error = %format!("{err:#}"), "symbol failed in merge");
                    summary.failed.push(SymbolFailure {
                        symbol: spec.symbol.clone(),
                        reason: format!("{err:#}"),
                    });
                }
            }
        }
    }

    info!(
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        failed = summary.failed.len(),
        rows_written = summary.rows_written,
        bars_rejected = summary.bars_rejected,
        "batch run finished"
    );
    Ok(summary)
}

fn cancelled(options: &RunOptions) -> bool {
    options
        .cancel
        .as_ref()
        .map_or(false, |flag| flag.load(Ordering::Relaxed))
}

fn compute_symbol(
    config: &PipelineConfig,
    composer: &FeatureComposer,
    spec: &SymbolSpec,
) -> Result<ComputedSymbol> {
    let path = config.source_path(&spec.symbol);
    let source_hash = fingerprint_file(&path)?;
    let (mut bars, rejections) = load_bars_csv(&path, &spec.symbol)?;
    bars.retain_date_range(config.date_start, config.date_end);
    let mut frame = composer.compose(&bars, spec, Utc::now())?;
    sanitize_frame(&mut frame, &spec.symbol)?;
    Ok(ComputedSymbol {
        frame,
        rejected: rejections.len(),
        source_hash,
    })
}

/// A merge conflict means a leftover staging table collided with our
/// unique name; the name counter has advanced, so one clean retry is
/// safe and sufficient.
fn merge_with_retry(store: &FeatureStore, mut computed: ComputedSymbol, symbol: &str) -> Result<usize> {
    let outcome = match store.merge_frame(&mut computed.frame, symbol) {
        Ok(outcome) => outcome,
        Err(err)
            if err
                .downcast_ref::<PipelineError>()
                .map_or(false, |e| matches!(e, PipelineError::MergeConflict { .. })) =>
        {
            warn!(symbol, "merge conflict, retrying with a fresh staging table");
            store.merge_frame(&mut computed.frame, symbol)?
        }
        Err(err) => return Err(err),
    };
    store.record_merge(symbol, &computed.source_hash, outcome.rows_written())?;
    Ok(outcome.rows_written())
}

/// Collapses duplicate (symbol, ts) rows left behind by writers that
/// predate the staging merge protocol.
pub fn dedup_store(config: &tickforge_rs::config::StoreConfig) -> Result<usize> {
    let store = FeatureStore::open(config.clone(), catalog::table_schema())
        .context("failed to open feature store for dedup")?;
    store.dedup_legacy()
}

/// Gap reports for the whole universe: what the store is missing from
/// the source, and what the source itself never delivered.
pub fn plan_backfill(config: &PipelineConfig) -> Result<Vec<GapReport>> {
    let store = FeatureStore::open(config.store.clone(), catalog::table_schema())
        .context("failed to open feature store for gap planning")?;
    let mut planner = GapPlanner::new();
    let mut reports = Vec::with_capacity(config.universe.len());
    // Without an explicit end the scan runs to today, so a feed that
    // stopped updating shows up as trailing source gaps.
    let window_end = config.date_end.unwrap_or_else(|| Utc::now().date_naive());
    for spec in &config.universe {
        let path = config.source_path(&spec.symbol);
        let (mut bars, _) = match load_bars_csv(&path, &spec.symbol) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(symbol = %spec.symbol, error = %format!("{err:#}"), "skipping symbol in gap scan");
                continue;
            }
        };
        bars.retain_date_range(config.date_start, config.date_end);
        let calendar = MarketCalendar::for_asset_class(spec.asset_class, &config.extra_holidays);
        let stored = store.coverage_dates(&spec.symbol)?;
        let report = planner.plan(
            &spec.symbol,
            &calendar,
            &bars.dates(),
            &stored,
            config.date_start,
            Some(window_end),
        );
        if !report.is_clean() {
            info!(
                symbol = %spec.symbol,
                missing_from_store = report.missing_from_store.len(),
                missing_from_source = report.missing_from_source.len(),
                "coverage gaps found"
            );
        }
        reports.push(report);
    }
    Ok(reports)
}
