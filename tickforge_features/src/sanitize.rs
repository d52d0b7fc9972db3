//! Frame sanitation between composition and merge.
//!
//! The kernels promise NaN-not-infinity, but the sanitizer does not
//! trust them: every derived float column is swept and any non-finite
//! value becomes a SQL NULL. Regime labels are checked against their
//! closed sets; an unknown label means a composer bug and fails the
//! symbol rather than landing in the store.

use anyhow::{anyhow, Result};
use polars::prelude::*;
use tickforge_rs::error::PipelineError;
use tracing::warn;

use crate::catalog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    /// Non-finite float values replaced by NULL.
    pub nulled: usize,
}

pub fn sanitize_frame(df: &mut DataFrame, symbol: &str) -> Result<SanitizeReport> {
    let mut report = SanitizeReport::default();

    for name in catalog::float_columns() {
        let column = df
            .column(name)
            .map_err(|_| computation_err(symbol, format!("missing column '{name}'")))?;
        let ca = column
            .f64()
            .map_err(|_| computation_err(symbol, format!("column '{name}' is not f64")))?;
        let mut nulled_here = 0usize;
        let cleaned: Float64Chunked = ca
            .into_iter()
            .map(|value| match value {
                Some(v) if v.is_finite() => Some(v),
                Some(_) => {
                    nulled_here += 1;
                    None
                }
                None => None,
            })
            .collect();
        if nulled_here > 0 {
            report.nulled += nulled_here;
            df.replace(name, cleaned.with_name(name).into_series())?;
        }
    }

    for name in catalog::label_columns() {
        let allowed = catalog::label_set(name)
            .ok_or_else(|| computation_err(symbol, format!("no label set for '{name}'")))?;
        let ca = df
            .column(name)
            .map_err(|_| computation_err(symbol, format!("missing column '{name}'")))?
            .str()
            .map_err(|_| computation_err(symbol, format!("column '{name}' is not a string")))?;
        for label in ca.into_iter().flatten() {
            if !allowed.contains(&label) {
                return Err(computation_err(
                    symbol,
                    format!("unknown label '{label}' in '{name}'"),
                ));
            }
        }
    }

    if report.nulled > 0 {
        warn!(symbol, nulled = report.nulled, "nulled non-finite feature values");
    }
    Ok(report)
}

fn computation_err(symbol: &str, reason: String) -> anyhow::Error {
    anyhow!(PipelineError::Computation {
        symbol: symbol.to_string(),
        reason,
    })
}
