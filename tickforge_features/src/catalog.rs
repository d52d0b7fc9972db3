//! The versioned column catalog.
//!
//! This is the single authority on what a feature row contains. The
//! composer must produce exactly these columns, the sanitizer walks
//! them by kind, and the store derives its physical table schema from
//! them. Extending the schema means appending columns and bumping
//! `SCHEMA_VERSION`; renaming or removing a column is a breaking change
//! and is not done.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{bail, Result};
use tickforge_rs::schema::{ColumnDef, SqlType, TableSchema};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// The symbol half of the (symbol, ts) row identity.
    SymbolKey,
    /// Epoch-millisecond timestamp, the other half of the identity.
    TimestampKey,
    /// "YYYY-MM" partition bucket derived from ts.
    PartitionBucket,
    /// Epoch-millisecond stamp of when the row was computed.
    AuditStamp,
    /// Optional instrument metadata (sector, exchange).
    Metadata,
    /// Raw OHLCV fields carried through from the source bar.
    Price,
    /// Derived floating-point indicator, nullable.
    Float,
    /// Derived boolean flag, nullable (undefined is not false).
    Flag,
    /// Regime label drawn from a closed set, nullable.
    Label,
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureColumn {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> FeatureColumn {
    FeatureColumn { name, kind }
}

use ColumnKind::*;

/// Every column of a feature row, in physical table order.
pub const COLUMNS: &[FeatureColumn] = &[
    col("symbol", SymbolKey),
    col("ts", TimestampKey),
    col("month_bucket", PartitionBucket),
    col("computed_at", AuditStamp),
    col("sector", Metadata),
    col("exchange", Metadata),
    // Raw bar.
    col("open", Price),
    col("high", Price),
    col("low", Price),
    col("close", Price),
    col("volume", Price),
    // Momentum.
    col("rsi_14", Float),
    col("macd", Float),
    col("macd_signal", Float),
    col("macd_hist", Float),
    col("stoch_k", Float),
    col("stoch_d", Float),
    col("williams_r", Float),
    col("roc_10", Float),
    col("momentum_10", Float),
    col("cci_20", Float),
    col("ppo", Float),
    // Moving averages.
    col("sma_20", Float),
    col("sma_50", Float),
    col("sma_200", Float),
    col("ema_12", Float),
    col("ema_20", Float),
    col("ema_26", Float),
    col("ema_50", Float),
    col("ema_200", Float),
    col("kama_10", Float),
    col("tema_20", Float),
    col("trix_15", Float),
    // Volatility and trend.
    col("bb_upper", Float),
    col("bb_middle", Float),
    col("bb_lower", Float),
    col("bb_bandwidth", Float),
    col("bb_position", Float),
    col("adx_14", Float),
    col("plus_di_14", Float),
    col("minus_di_14", Float),
    col("atr_14", Float),
    col("atr_percent", Float),
    col("supertrend", Float),
    col("supertrend_dir", Float),
    col("csi", Float),
    // Volume.
    col("obv", Float),
    col("obv_slope_10", Float),
    col("pvo", Float),
    col("pvo_signal", Float),
    col("mfi_14", Float),
    col("cmf_20", Float),
    col("vwap_daily", Float),
    col("vwap_weekly", Float),
    col("volume_poc", Float),
    col("volume_vah", Float),
    col("volume_val", Float),
    // Ichimoku.
    col("tenkan_sen", Float),
    col("kijun_sen", Float),
    col("senkou_a", Float),
    col("senkou_b", Float),
    col("chikou", Float),
    // ML-derived.
    col("return_1d", Float),
    col("return_5d", Float),
    col("return_20d", Float),
    col("price_to_sma20", Float),
    col("price_to_sma50", Float),
    col("price_to_sma200", Float),
    col("rsi_delta_1", Float),
    col("macd_hist_delta_1", Float),
    col("adx_delta_1", Float),
    col("volume_zscore_20", Float),
    col("volatility_zscore_20", Float),
    col("close_zscore_20", Float),
    col("atr_zscore_20", Float),
    col("volume_slope_10", Float),
    col("sma20_slope_10", Float),
    col("ema12_26_spread", Float),
    col("high_low_range_pct", Float),
    col("close_open_spread_pct", Float),
    col("gap_pct", Float),
    col("range_atr_ratio", Float),
    // Market structure.
    col("pivot_high", Flag),
    col("pivot_low", Flag),
    col("higher_high", Flag),
    col("higher_low", Flag),
    col("lower_high", Flag),
    col("lower_low", Flag),
    col("trend_strength", Float),
    // Regimes.
    col("trend_regime", Label),
    col("volatility_regime", Label),
    col("volume_regime", Label),
];

pub const TREND_REGIMES: &[&str] = &[
    "STRONG_UPTREND",
    "WEAK_UPTREND",
    "STRONG_DOWNTREND",
    "WEAK_DOWNTREND",
    "CONSOLIDATION",
];
pub const VOLATILITY_REGIMES: &[&str] = &["HIGH", "NORMAL", "LOW"];
pub const VOLUME_REGIMES: &[&str] = &["SURGE", "NORMAL", "DRY"];

/// Allowed labels for a label column.
pub fn label_set(column: &str) -> Option<&'static [&'static str]> {
    match column {
        "trend_regime" => Some(TREND_REGIMES),
        "volatility_regime" => Some(VOLATILITY_REGIMES),
        "volume_regime" => Some(VOLUME_REGIMES),
        _ => None,
    }
}

/// Derived-column dependencies, (input, output). Raw bar fields are
/// implicit inputs everywhere and are not listed. The composer's
/// statement order must be a topological order of this graph, which
/// `validate_dependency_graph` checks is possible at all.
pub const DEPENDENCY_EDGES: &[(&str, &str)] = &[
    ("ema_12", "macd"),
    ("ema_26", "macd"),
    ("macd", "macd_signal"),
    ("macd", "macd_hist"),
    ("macd_signal", "macd_hist"),
    ("ema_12", "ppo"),
    ("ema_26", "ppo"),
    ("ema_12", "ema12_26_spread"),
    ("ema_26", "ema12_26_spread"),
    ("pvo", "pvo_signal"),
    ("atr_14", "atr_percent"),
    ("atr_14", "supertrend"),
    ("atr_14", "csi"),
    ("adx_14", "csi"),
    ("atr_14", "atr_zscore_20"),
    ("atr_percent", "volatility_regime"),
    ("atr_14", "range_atr_ratio"),
    ("sma_20", "price_to_sma20"),
    ("sma_50", "price_to_sma50"),
    ("sma_200", "price_to_sma200"),
    ("sma_20", "sma20_slope_10"),
    ("sma_50", "trend_regime"),
    ("adx_14", "trend_regime"),
    ("adx_14", "adx_delta_1"),
    ("adx_14", "trend_strength"),
    ("rsi_14", "rsi_delta_1"),
    ("macd_hist", "macd_hist_delta_1"),
    ("obv", "obv_slope_10"),
    ("tenkan_sen", "senkou_a"),
    ("kijun_sen", "senkou_a"),
    ("volume_zscore_20", "volume_regime"),
];

pub fn float_columns() -> impl Iterator<Item = &'static str> {
    COLUMNS
        .iter()
        .filter(|c| c.kind == ColumnKind::Float)
        .map(|c| c.name)
}

pub fn flag_columns() -> impl Iterator<Item = &'static str> {
    COLUMNS
        .iter()
        .filter(|c| c.kind == ColumnKind::Flag)
        .map(|c| c.name)
}

pub fn label_columns() -> impl Iterator<Item = &'static str> {
    COLUMNS
        .iter()
        .filter(|c| c.kind == ColumnKind::Label)
        .map(|c| c.name)
}

pub fn column_names() -> impl Iterator<Item = &'static str> {
    COLUMNS.iter().map(|c| c.name)
}

/// Physical table schema the store materializes.
pub fn table_schema() -> TableSchema {
    let columns = COLUMNS
        .iter()
        .map(|c| {
            let (sql_type, not_null, key) = match c.kind {
                ColumnKind::SymbolKey => (SqlType::Varchar, true, true),
                ColumnKind::TimestampKey => (SqlType::Bigint, true, true),
                ColumnKind::PartitionBucket => (SqlType::Varchar, true, false),
                ColumnKind::AuditStamp => (SqlType::Bigint, true, false),
                ColumnKind::Metadata => (SqlType::Varchar, false, false),
                ColumnKind::Price => (SqlType::Double, true, false),
                ColumnKind::Float => (SqlType::Double, false, false),
                ColumnKind::Flag => (SqlType::Boolean, false, false),
                ColumnKind::Label => (SqlType::Varchar, false, false),
            };
            ColumnDef {
                name: c.name,
                sql_type,
                not_null,
                key,
            }
        })
        .collect();
    TableSchema {
        version: SCHEMA_VERSION,
        columns,
    }
}

/// Checks the dependency edges refer only to cataloged derived columns
/// and admit a topological order.
pub fn validate_dependency_graph() -> Result<()> {
    let derived: HashSet<&str> = COLUMNS
        .iter()
        .filter(|c| matches!(c.kind, ColumnKind::Float | ColumnKind::Flag | ColumnKind::Label))
        .map(|c| c.name)
        .collect();

    let mut indegree: HashMap<&str, usize> = derived.iter().map(|&n| (n, 0)).collect();
    let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in DEPENDENCY_EDGES {
        if !derived.contains(from) {
            bail!("dependency edge references unknown column '{from}'");
        }
        if !derived.contains(to) {
            bail!("dependency edge references unknown column '{to}'");
        }
        *indegree.entry(to).or_insert(0) += 1;
        downstream.entry(from).or_default().push(to);
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = 0;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        if let Some(next) = downstream.get(node) {
            for &to in next {
                let d = indegree.get_mut(to).expect("node registered above");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(to);
                }
            }
        }
    }
    if visited != indegree.len() {
        bail!("dependency graph contains a cycle");
    }
    Ok(())
}
