//! Run configuration.
//!
//! Everything a batch run needs is collected here up front so the
//! orchestrator and the store never reach back into the CLI layer.

use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::calendar::AssetClass;

/// Where and how the analytical table lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// DuckDB database file. Created on first open.
    pub db_path: PathBuf,
    /// Name of the analytical table.
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Partition key column, a "YYYY-MM" month bucket.
    #[serde(default = "default_partition_column")]
    pub partition_column: String,
    /// Columns rows are physically ordered by on insert so that
    /// per-symbol range scans stay contiguous.
    #[serde(default = "default_cluster_columns")]
    pub cluster_columns: Vec<String>,
}

fn default_table_name() -> String {
    "features".to_string()
}

fn default_partition_column() -> String {
    "month_bucket".to_string()
}

fn default_cluster_columns() -> Vec<String> {
    vec!["symbol".to_string(), "ts".to_string()]
}

impl StoreConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            db_path: db_path.into(),
            table_name: default_table_name(),
            partition_column: default_partition_column(),
            cluster_columns: default_cluster_columns(),
        }
    }
}

/// One instrument in the processing universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub asset_class: AssetClass,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory of per-symbol OHLCV CSV files, `<SYMBOL>.csv`.
    pub input_dir: PathBuf,
    pub store: StoreConfig,
    pub universe: Vec<SymbolSpec>,
    /// Width of the parallel compute fan-out. Merges stay sequential
    /// regardless.
    #[serde(default = "default_workers")]
    pub n_workers: usize,
    /// Optional inclusive date window applied to source bars.
    #[serde(default)]
    pub date_start: Option<NaiveDate>,
    #[serde(default)]
    pub date_end: Option<NaiveDate>,
    /// Forward displacement of the Ichimoku cloud spans, in bars.
    #[serde(default = "default_ichimoku_shift")]
    pub ichimoku_shift: usize,
    /// Bars on each side a pivot must dominate.
    #[serde(default = "default_pivot_window")]
    pub pivot_window: usize,
    /// Floating exchange holidays not covered by the built-in set.
    #[serde(default)]
    pub extra_holidays: Vec<NaiveDate>,
}

fn default_workers() -> usize {
    4
}

fn default_ichimoku_shift() -> usize {
    26
}

fn default_pivot_window() -> usize {
    5
}

impl PipelineConfig {
    pub fn new(input_dir: impl Into<PathBuf>, store: StoreConfig) -> Self {
        PipelineConfig {
            input_dir: input_dir.into(),
            store,
            universe: Vec::new(),
            n_workers: default_workers(),
            date_start: None,
            date_end: None,
            ichimoku_shift: default_ichimoku_shift(),
            pivot_window: default_pivot_window(),
            extra_holidays: Vec::new(),
        }
    }

    /// Path of the source CSV for one symbol.
    pub fn source_path(&self, symbol: &str) -> PathBuf {
        self.input_dir.join(format!("{symbol}.csv"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_defaults_fill_in_when_omitted() {
        let parsed: StoreConfig =
            serde_json::from_str(r#"{ "db_path": "/tmp/f.duckdb" }"#).unwrap();
        assert_eq!(parsed.table_name, "features");
        assert_eq!(parsed.partition_column, "month_bucket");
        assert_eq!(parsed.cluster_columns, vec!["symbol", "ts"]);
    }

    #[test]
    fn symbol_spec_accepts_sparse_metadata() {
        let parsed: SymbolSpec =
            serde_json::from_str(r#"{ "symbol": "BTC-USD", "asset_class": "crypto" }"#)
                .unwrap();
        assert!(parsed.sector.is_none());
        assert!(parsed.exchange.is_none());
    }

    #[test]
    fn source_path_appends_symbol_csv() {
        let config = PipelineConfig::new("/data/bars", StoreConfig::new("/tmp/f.duckdb"));
        assert_eq!(
            config.source_path("AAPL"),
            PathBuf::from("/data/bars/AAPL.csv")
        );
    }
}
