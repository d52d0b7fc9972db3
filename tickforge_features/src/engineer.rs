//! Feature composition: one symbol's bar series in, the full feature
//! frame out.
//!
//! Shared upstream indicators (the EMAs, ATR, ADX, the SMAs) are
//! computed once into `DerivedSeries`, then the grouped builders each
//! fill their slice of the column catalog. The output frame has
//! exactly one row per input bar and exactly the catalog's columns;
//! anything else is a computation error, not a silently different
//! schema.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Utc};
use polars::prelude::*;
use tickforge_rs::bars::BarSeries;
use tickforge_rs::config::SymbolSpec;
use tickforge_rs::error::PipelineError;
use tracing::debug;

use crate::catalog;
use crate::indicators::{self, safe_div};

#[derive(Debug, Clone, Copy)]
pub struct ComposeOptions {
    /// Forward displacement of the Ichimoku cloud, in bars.
    pub ichimoku_shift: usize,
    /// Bars on each side a pivot must dominate.
    pub pivot_window: usize,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        ComposeOptions {
            ichimoku_shift: 26,
            pivot_window: 5,
        }
    }
}

pub struct FeatureComposer {
    options: ComposeOptions,
}

/// Shared upstream indicators computed once per symbol.
struct DerivedSeries {
    ema_12: Vec<f64>,
    ema_26: Vec<f64>,
    sma_20: Vec<f64>,
    sma_50: Vec<f64>,
    sma_200: Vec<f64>,
    atr_14: Vec<f64>,
    atr_percent: Vec<f64>,
    adx: indicators::Adx,
    rsi_14: Vec<f64>,
    macd: Vec<f64>,
    macd_signal: Vec<f64>,
    macd_hist: Vec<f64>,
    obv: Vec<f64>,
    volume_zscore_20: Vec<f64>,
    atr_zscore_20: Vec<f64>,
}

impl DerivedSeries {
    fn compute(bars: &BarSeries) -> Self {
        let close = &bars.close;
        let ema_12 = indicators::ema(close, 12);
        let ema_26 = indicators::ema(close, 26);
        let atr_14 = indicators::atr(&bars.high, &bars.low, close, 14);
        let atr_percent: Vec<f64> = atr_14
            .iter()
            .zip(close.iter())
            .map(|(a, c)| safe_div(a * 100.0, *c))
            .collect();
        let (macd, macd_signal, macd_hist) = indicators::macd(close, 12, 26, 9);
        DerivedSeries {
            sma_20: indicators::sma(close, 20),
            sma_50: indicators::sma(close, 50),
            sma_200: indicators::sma(close, 200),
            adx: indicators::adx(&bars.high, &bars.low, close, 14),
            rsi_14: indicators::rsi(close, 14),
            obv: indicators::obv(close, &bars.volume),
            volume_zscore_20: indicators::rolling_zscore(&bars.volume, 20),
            atr_zscore_20: indicators::rolling_zscore(&atr_percent, 20),
            ema_12,
            ema_26,
            atr_14,
            atr_percent,
            macd,
            macd_signal,
            macd_hist,
        }
    }
}

/// Column accumulators for one frame.
#[derive(Default)]
struct Columns {
    floats: BTreeMap<&'static str, Vec<f64>>,
    flags: BTreeMap<&'static str, Vec<Option<bool>>>,
    labels: BTreeMap<&'static str, Vec<Option<&'static str>>>,
}

impl FeatureComposer {
    pub fn new(options: ComposeOptions) -> Result<Self> {
        catalog::validate_dependency_graph()?;
        Ok(FeatureComposer { options })
    }

    /// Pure transform: one output row per input bar, columns exactly
    /// the catalog.
    pub fn compose(
        &self,
        bars: &BarSeries,
        meta: &SymbolSpec,
        computed_at: DateTime<Utc>,
    ) -> Result<DataFrame> {
        let n = bars.len();
        let derived = DerivedSeries::compute(bars);
        let mut cols = Columns::default();

        self.momentum_features(bars, &derived, &mut cols);
        self.moving_average_features(bars, &derived, &mut cols);
        self.volatility_features(bars, &derived, &mut cols);
        self.volume_features(bars, &derived, &mut cols);
        self.ichimoku_features(bars, &mut cols);
        self.ml_features(bars, &derived, &mut cols);
        self.structure_features(bars, &derived, &mut cols);
        self.regime_features(bars, &derived, &mut cols);

        self.ensure_complete(&cols, &meta.symbol, n)?;

        let mut series: Vec<Series> = Vec::with_capacity(catalog::COLUMNS.len());
        series.push(Series::new("symbol", vec![meta.symbol.as_str(); n]));
        series.push(Series::new(
            "ts",
            bars.ts.iter().map(|t| t.timestamp_millis()).collect::<Vec<i64>>(),
        ));
        series.push(Series::new(
            "month_bucket",
            bars.ts
                .iter()
                .map(|t| format!("{:04}-{:02}", t.year(), t.month()))
                .collect::<Vec<String>>(),
        ));
        series.push(Series::new(
            "computed_at",
            vec![computed_at.timestamp_millis(); n],
        ));
        series.push(Series::new("sector", vec![meta.sector.clone(); n]));
        series.push(Series::new("exchange", vec![meta.exchange.clone(); n]));
        series.push(Series::new("open", bars.open.clone()));
        series.push(Series::new("high", bars.high.clone()));
        series.push(Series::new("low", bars.low.clone()));
        series.push(Series::new("close", bars.close.clone()));
        series.push(Series::new("volume", bars.volume.clone()));

        for (name, values) in &cols.floats {
            series.push(Series::new(name, values.as_slice()));
        }
        for (name, values) in &cols.flags {
            let ca: BooleanChunked = values.iter().copied().collect();
            series.push(ca.with_name(name).into_series());
        }
        for (name, values) in &cols.labels {
            let ca: StringChunked = values.iter().copied().collect();
            series.push(ca.with_name(name).into_series());
        }

        let df = DataFrame::new(series)?;
        debug!(symbol = %meta.symbol, rows = n, cols = df.width(), "composed feature frame");
        Ok(df)
    }

    fn momentum_features(&self, bars: &BarSeries, derived: &DerivedSeries, cols: &mut Columns) {
        let close = &bars.close;
        let (stoch_k, stoch_d) = indicators::stochastic(&bars.high, &bars.low, close, 14, 3);
        cols.floats.insert("rsi_14", derived.rsi_14.clone());
        cols.floats.insert("macd", derived.macd.clone());
        cols.floats.insert("macd_signal", derived.macd_signal.clone());
        cols.floats.insert("macd_hist", derived.macd_hist.clone());
        cols.floats.insert("stoch_k", stoch_k);
        cols.floats.insert("stoch_d", stoch_d);
        cols.floats.insert(
            "williams_r",
            indicators::williams_r(&bars.high, &bars.low, close, 14),
        );
        cols.floats.insert("roc_10", indicators::roc(close, 10));
        cols.floats.insert("momentum_10", indicators::delta(close, 10));
        cols.floats.insert("cci_20", indicators::cci(&bars.high, &bars.low, close, 20));
        cols.floats.insert("ppo", indicators::ppo(close, 12, 26));
    }

    fn moving_average_features(&self, bars: &BarSeries, derived: &DerivedSeries, cols: &mut Columns) {
        let close = &bars.close;
        cols.floats.insert("sma_20", derived.sma_20.clone());
        cols.floats.insert("sma_50", derived.sma_50.clone());
        cols.floats.insert("sma_200", derived.sma_200.clone());
        cols.floats.insert("ema_12", derived.ema_12.clone());
        cols.floats.insert("ema_20", indicators::ema(close, 20));
        cols.floats.insert("ema_26", derived.ema_26.clone());
        cols.floats.insert("ema_50", indicators::ema(close, 50));
        cols.floats.insert("ema_200", indicators::ema(close, 200));
        cols.floats.insert("kama_10", indicators::kama(close, 10, 2, 30));
        cols.floats.insert("tema_20", indicators::tema(close, 20));
        cols.floats.insert("trix_15", indicators::trix(close, 15));
    }

    fn volatility_features(&self, bars: &BarSeries, derived: &DerivedSeries, cols: &mut Columns) {
        let close = &bars.close;
        let bands = indicators::bollinger(close, 20, 2.0);
        let (st_line, st_dir) = indicators::supertrend(&bars.high, &bars.low, close, 10, 3.0);
        cols.floats.insert("bb_upper", bands.upper);
        cols.floats.insert("bb_middle", bands.middle);
        cols.floats.insert("bb_lower", bands.lower);
        cols.floats.insert("bb_bandwidth", bands.bandwidth);
        cols.floats.insert("bb_position", bands.position);
        cols.floats.insert("adx_14", derived.adx.adx.clone());
        cols.floats.insert("plus_di_14", derived.adx.plus_di.clone());
        cols.floats.insert("minus_di_14", derived.adx.minus_di.clone());
        cols.floats.insert("atr_14", derived.atr_14.clone());
        cols.floats.insert("atr_percent", derived.atr_percent.clone());
        cols.floats.insert("supertrend", st_line);
        cols.floats.insert("supertrend_dir", st_dir);
        cols.floats.insert(
            "csi",
            indicators::csi(&derived.adx.adx, &derived.atr_14, close),
        );
    }

    fn volume_features(&self, bars: &BarSeries, derived: &DerivedSeries, cols: &mut Columns) {
        let (pvo, pvo_signal) = indicators::pvo(&bars.volume, 12, 26, 9);
        let day_sessions: Vec<i64> = bars
            .ts
            .iter()
            .map(|t| i64::from(t.date_naive().num_days_from_ce()))
            .collect();
        let week_sessions: Vec<i64> = bars
            .ts
            .iter()
            .map(|t| {
                let week = t.date_naive().iso_week();
                i64::from(week.year()) * 100 + i64::from(week.week())
            })
            .collect();
        let profile = indicators::volume_profile(&bars.close, &bars.volume, 20, 10);

        cols.floats.insert("obv", derived.obv.clone());
        cols.floats.insert("obv_slope_10", indicators::slope(&derived.obv, 10));
        cols.floats.insert("pvo", pvo);
        cols.floats.insert("pvo_signal", pvo_signal);
        cols.floats.insert(
            "mfi_14",
            indicators::mfi(&bars.high, &bars.low, &bars.close, &bars.volume, 14),
        );
        cols.floats.insert(
            "cmf_20",
            indicators::cmf(&bars.high, &bars.low, &bars.close, &bars.volume, 20),
        );
        cols.floats.insert(
            "vwap_daily",
            indicators::vwap(&bars.high, &bars.low, &bars.close, &bars.volume, &day_sessions),
        );
        cols.floats.insert(
            "vwap_weekly",
            indicators::vwap(&bars.high, &bars.low, &bars.close, &bars.volume, &week_sessions),
        );
        cols.floats.insert("volume_poc", profile.poc);
        cols.floats.insert("volume_vah", profile.vah);
        cols.floats.insert("volume_val", profile.val);
    }

    fn ichimoku_features(&self, bars: &BarSeries, cols: &mut Columns) {
        let cloud = indicators::ichimoku(
            &bars.high,
            &bars.low,
            &bars.close,
            9,
            26,
            52,
            self.options.ichimoku_shift,
        );
        cols.floats.insert("tenkan_sen", cloud.tenkan);
        cols.floats.insert("kijun_sen", cloud.kijun);
        cols.floats.insert("senkou_a", cloud.senkou_a);
        cols.floats.insert("senkou_b", cloud.senkou_b);
        cols.floats.insert("chikou", cloud.chikou);
    }

    fn ml_features(&self, bars: &BarSeries, derived: &DerivedSeries, cols: &mut Columns) {
        let n = bars.len();
        let close = &bars.close;
        let ratio_to = |ma: &[f64]| -> Vec<f64> {
            close.iter().zip(ma.iter()).map(|(c, m)| safe_div(*c, *m)).collect()
        };
        let gap_pct: Vec<f64> = (0..n)
            .map(|i| {
                if i == 0 {
                    f64::NAN
                } else {
                    safe_div((bars.open[i] - close[i - 1]) * 100.0, close[i - 1])
                }
            })
            .collect();

        cols.floats.insert("return_1d", indicators::roc(close, 1));
        cols.floats.insert("return_5d", indicators::roc(close, 5));
        cols.floats.insert("return_20d", indicators::roc(close, 20));
        cols.floats.insert("price_to_sma20", ratio_to(&derived.sma_20));
        cols.floats.insert("price_to_sma50", ratio_to(&derived.sma_50));
        cols.floats.insert("price_to_sma200", ratio_to(&derived.sma_200));
        cols.floats.insert("rsi_delta_1", indicators::delta(&derived.rsi_14, 1));
        cols.floats.insert(
            "macd_hist_delta_1",
            indicators::delta(&derived.macd_hist, 1),
        );
        cols.floats.insert("adx_delta_1", indicators::delta(&derived.adx.adx, 1));
        cols.floats.insert("volume_zscore_20", derived.volume_zscore_20.clone());
        cols.floats.insert(
            "volatility_zscore_20",
            indicators::rolling_zscore(&indicators::rolling_std(close, 20), 20),
        );
        cols.floats.insert("close_zscore_20", indicators::rolling_zscore(close, 20));
        cols.floats.insert("atr_zscore_20", derived.atr_zscore_20.clone());
        cols.floats.insert("volume_slope_10", indicators::slope(&bars.volume, 10));
        cols.floats.insert("sma20_slope_10", indicators::slope(&derived.sma_20, 10));
        cols.floats.insert(
            "ema12_26_spread",
            (0..n)
                .map(|i| safe_div((derived.ema_12[i] - derived.ema_26[i]) * 100.0, close[i]))
                .collect(),
        );
        cols.floats.insert(
            "high_low_range_pct",
            (0..n)
                .map(|i| safe_div((bars.high[i] - bars.low[i]) * 100.0, close[i]))
                .collect(),
        );
        cols.floats.insert(
            "close_open_spread_pct",
            (0..n)
                .map(|i| safe_div((close[i] - bars.open[i]) * 100.0, bars.open[i]))
                .collect(),
        );
        cols.floats.insert("gap_pct", gap_pct);
        cols.floats.insert(
            "range_atr_ratio",
            (0..n)
                .map(|i| safe_div(bars.high[i] - bars.low[i], derived.atr_14[i]))
                .collect(),
        );
    }

    fn structure_features(&self, bars: &BarSeries, derived: &DerivedSeries, cols: &mut Columns) {
        let w = self.options.pivot_window;
        cols.flags.insert("pivot_high", indicators::pivot_flags(&bars.high, w, true));
        cols.flags.insert("pivot_low", indicators::pivot_flags(&bars.low, w, false));
        cols.flags.insert("higher_high", indicators::sequential_compare(&bars.high, true));
        cols.flags.insert("higher_low", indicators::sequential_compare(&bars.low, true));
        cols.flags.insert("lower_high", indicators::sequential_compare(&bars.high, false));
        cols.flags.insert("lower_low", indicators::sequential_compare(&bars.low, false));
        cols.floats.insert(
            "trend_strength",
            derived
                .adx
                .adx
                .iter()
                .map(|a| (a / 50.0).clamp(0.0, 1.0))
                .collect(),
        );
    }

    /// Regime classification. Each rule tree is total over its inputs:
    /// whenever every input is defined, exactly one label from the
    /// closed set comes out; otherwise the regime is undefined.
    fn regime_features(&self, bars: &BarSeries, derived: &DerivedSeries, cols: &mut Columns) {
        let n = bars.len();
        let trend: Vec<Option<&'static str>> = (0..n)
            .map(|i| {
                let (close, sma50, adx) = (bars.close[i], derived.sma_50[i], derived.adx.adx[i]);
                if !sma50.is_finite() || !adx.is_finite() {
                    return None;
                }
                let strong = adx > 25.0;
                Some(if close > sma50 {
                    if strong { "STRONG_UPTREND" } else { "WEAK_UPTREND" }
                } else if close < sma50 {
                    if strong { "STRONG_DOWNTREND" } else { "WEAK_DOWNTREND" }
                } else {
                    "CONSOLIDATION"
                })
            })
            .collect();
        let volatility: Vec<Option<&'static str>> = derived
            .atr_zscore_20
            .iter()
            .map(|z| {
                if !z.is_finite() {
                    None
                } else if *z > 1.0 {
                    Some("HIGH")
                } else if *z < -1.0 {
                    Some("LOW")
                } else {
                    Some("NORMAL")
                }
            })
            .collect();
        let volume: Vec<Option<&'static str>> = derived
            .volume_zscore_20
            .iter()
            .map(|z| {
                if !z.is_finite() {
                    None
                } else if *z > 1.0 {
                    Some("SURGE")
                } else if *z < -1.0 {
                    Some("DRY")
                } else {
                    Some("NORMAL")
                }
            })
            .collect();
        cols.labels.insert("trend_regime", trend);
        cols.labels.insert("volatility_regime", volatility);
        cols.labels.insert("volume_regime", volume);
    }

    /// Guards the composer's two output contracts: exactly the
    /// catalog's derived columns, every one with one value per bar.
    fn ensure_complete(&self, cols: &Columns, symbol: &str, n: usize) -> Result<()> {
        let computation_err = |reason: String| {
            anyhow!(PipelineError::Computation {
                symbol: symbol.to_string(),
                reason,
            })
        };
        for name in catalog::float_columns() {
            match cols.floats.get(name) {
                None => return Err(computation_err(format!("missing float column '{name}'"))),
                Some(v) if v.len() != n => {
                    return Err(computation_err(format!(
                        "column '{name}' has {} values for {n} bars",
                        v.len()
                    )))
                }
                _ => {}
            }
        }
        for name in catalog::flag_columns() {
            match cols.flags.get(name) {
                None => return Err(computation_err(format!("missing flag column '{name}'"))),
                Some(v) if v.len() != n => {
                    return Err(computation_err(format!(
                        "column '{name}' has {} values for {n} bars",
                        v.len()
                    )))
                }
                _ => {}
            }
        }
        for name in catalog::label_columns() {
            match cols.labels.get(name) {
                None => return Err(computation_err(format!("missing label column '{name}'"))),
                Some(v) if v.len() != n => {
                    return Err(computation_err(format!(
                        "column '{name}' has {} values for {n} bars",
                        v.len()
                    )))
                }
                _ => {}
            }
        }
        let extra_floats = cols.floats.len() != catalog::float_columns().count();
        let extra_flags = cols.flags.len() != catalog::flag_columns().count();
        let extra_labels = cols.labels.len() != catalog::label_columns().count();
        if extra_floats || extra_flags || extra_labels {
            return Err(computation_err("uncataloged columns produced".to_string()));
        }
        Ok(())
    }
}
