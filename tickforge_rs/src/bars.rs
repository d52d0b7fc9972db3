//! Source bar loading and validation.
//!
//! Bars arrive as per-symbol CSV files with a timestamp column and
//! open/high/low/close/volume. Files in the wild carry timestamps as
//! proper datetimes, as RFC 3339 strings, or as bare dates, so the
//! loader handles all three. Malformed bars are quarantined into a
//! rejection list instead of failing the symbol; the series that comes
//! out is strictly ordered and fully finite.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use polars::prelude::*;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// Candidate names for the timestamp column, checked in order.
const TIMESTAMP_COLUMNS: &[&str] = &["timestamp", "ts", "date"];

/// Validated, strictly-ordered OHLCV history for one symbol.
#[derive(Debug, Clone)]
pub struct BarSeries {
    pub symbol: String,
    pub ts: Vec<DateTime<Utc>>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl BarSeries {
    pub fn empty(symbol: &str) -> Self {
        BarSeries {
            symbol: symbol.to_string(),
            ts: Vec::new(),
            open: Vec::new(),
            high: Vec::new(),
            low: Vec::new(),
            close: Vec::new(),
            volume: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    /// Distinct calendar dates present, ascending.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.ts.iter().map(|t| t.date_naive()).collect();
        dates.dedup();
        dates
    }

    /// Keeps only bars inside the inclusive date window.
    pub fn retain_date_range(&mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) {
        if start.is_none() && end.is_none() {
            return;
        }
        let keep: Vec<bool> = self
            .ts
            .iter()
            .map(|t| {
                let d = t.date_naive();
                start.map_or(true, |s| d >= s) && end.map_or(true, |e| d <= e)
            })
            .collect();
        retain_by_mask(&mut self.ts, &keep);
        retain_by_mask(&mut self.open, &keep);
        retain_by_mask(&mut self.high, &keep);
        retain_by_mask(&mut self.low, &keep);
        retain_by_mask(&mut self.close, &keep);
        retain_by_mask(&mut self.volume, &keep);
    }
}

fn retain_by_mask<T>(values: &mut Vec<T>, keep: &[bool]) {
    let mut idx = 0;
    values.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
}

/// A bar dropped during validation. The error is always
/// `PipelineError::InputData`, so quarantined bars carry the same
/// typed taxonomy as every other per-symbol failure.
#[derive(Debug)]
pub struct BarRejection {
    pub row: usize,
    pub error: PipelineError,
}

impl BarRejection {
    fn new(symbol: &str, row: usize, ts: Option<DateTime<Utc>>, reason: String) -> Self {
        BarRejection {
            row,
            error: PipelineError::InputData {
                symbol: symbol.to_string(),
                ts: ts.map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339()),
                reason,
            },
        }
    }
}

/// Loads and validates one symbol's CSV. Invalid bars are quarantined;
/// an unreadable file is an error.
pub fn load_bars_csv(path: &Path, symbol: &str) -> Result<(BarSeries, Vec<BarRejection>)> {
    let df = CsvReader::from_path(path)
        .with_context(|| format!("failed to open bars CSV at {}", path.display()))?
        .has_header(true)
        .with_try_parse_dates(true)
        .finish()
        .with_context(|| format!("failed to parse bars CSV at {}", path.display()))?;

    let ts_col = TIMESTAMP_COLUMNS
        .iter()
        .find(|name| df.get_column_names().contains(name))
        .ok_or_else(|| {
            anyhow!(
                "no timestamp column in {} (expected one of {TIMESTAMP_COLUMNS:?})",
                path.display()
            )
        })?;

    let timestamps = extract_timestamps(df.column(ts_col)?)?;
    let open = extract_f64(&df, "open")?;
    let high = extract_f64(&df, "high")?;
    let low = extract_f64(&df, "low")?;
    let close = extract_f64(&df, "close")?;
    let volume = extract_f64(&df, "volume")?;

    let mut series = BarSeries::empty(symbol);
    let mut rejections = Vec::new();
    let mut last_ts: Option<DateTime<Utc>> = None;

    for row in 0..df.height() {
        let ts = match timestamps[row] {
            Some(ts) => ts,
            None => {
                rejections.push(BarRejection::new(
                    symbol,
                    row,
                    None,
                    "unparseable timestamp".to_string(),
                ));
                continue;
            }
        };

        let fields = [open[row], high[row], low[row], close[row], volume[row]];
        if let Some(reason) = validate_fields(&fields) {
            rejections.push(BarRejection::new(symbol, row, Some(ts), reason));
            continue;
        }
        if let Some(prev) = last_ts {
            if ts <= prev {
                rejections.push(BarRejection::new(
                    symbol,
                    row,
                    Some(ts),
                    format!("timestamp not after previous bar at {prev}"),
                ));
                continue;
            }
        }

        last_ts = Some(ts);
        series.ts.push(ts);
        series.open.push(fields[0].unwrap_or(f64::NAN));
        series.high.push(fields[1].unwrap_or(f64::NAN));
        series.low.push(fields[2].unwrap_or(f64::NAN));
        series.close.push(fields[3].unwrap_or(f64::NAN));
        series.volume.push(fields[4].unwrap_or(f64::NAN));
    }

    if rejections.is_empty() {
        debug!(symbol, bars = series.len(), "loaded bars");
    } else {
        warn!(
            symbol,
            bars = series.len(),
            rejected = rejections.len(),
            "loaded bars with quarantined rows"
        );
    }
    Ok((series, rejections))
}

fn validate_fields(fields: &[Option<f64>; 5]) -> Option<String> {
    let names = ["open", "high", "low", "close", "volume"];
    for (name, value) in names.iter().zip(fields.iter()) {
        match value {
            None => return Some(format!("missing {name}")),
            Some(v) if !v.is_finite() => return Some(format!("non-finite {name}")),
            Some(v) if *v < 0.0 => return Some(format!("negative {name}")),
            _ => {}
        }
    }
    let (o, h, l, c) = (
        fields[0].unwrap_or(f64::NAN),
        fields[1].unwrap_or(f64::NAN),
        fields[2].unwrap_or(f64::NAN),
        fields[3].unwrap_or(f64::NAN),
    );
    if h < l {
        return Some("high below low".to_string());
    }
    if h < o.max(c) || l > o.min(c) {
        return Some("open/close outside high-low range".to_string());
    }
    if c <= 0.0 {
        return Some("non-positive close".to_string());
    }
    None
}

fn extract_f64(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let series = df
        .column(name)
        .with_context(|| format!("missing required column '{name}'"))?;
    let floats = series
        .cast(&DataType::Float64)
        .with_context(|| format!("column '{name}' is not numeric"))?;
    Ok(floats.f64()?.into_iter().collect())
}

/// Pulls timestamps out of whichever representation the CSV used.
fn extract_timestamps(series: &Series) -> Result<Vec<Option<DateTime<Utc>>>> {
    match series.dtype() {
        DataType::Datetime(unit, _) => {
            let unit = *unit;
            let ca = series.datetime()?;
            Ok(ca
                .into_iter()
                .map(|raw| raw.and_then(|v| datetime_from_units(v, unit)))
                .collect())
        }
        DataType::Date => {
            let ca = series.date()?;
            Ok(ca
                .into_iter()
                .map(|raw| {
                    raw.and_then(|days| {
                        DateTime::from_timestamp(i64::from(days) * 86_400, 0)
                    })
                })
                .collect())
        }
        DataType::String => {
            let ca = series.str()?;
            Ok(ca.into_iter().map(|raw| raw.and_then(parse_timestamp)).collect())
        }
        other => Err(anyhow!("unsupported timestamp dtype {other:?}")),
    }
}

fn datetime_from_units(value: i64, unit: TimeUnit) -> Option<DateTime<Utc>> {
    match unit {
        TimeUnit::Nanoseconds => Some(Utc.timestamp_nanos(value)),
        TimeUnit::Microseconds => DateTime::from_timestamp_micros(value),
        TimeUnit::Milliseconds => DateTime::from_timestamp_millis(value),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&parsed));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| Utc.from_utc_datetime(&ndt))
}
