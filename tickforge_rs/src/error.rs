//! Failure taxonomy for the pipeline.
//!
//! Every variant carries enough context to attribute the failure to a
//! symbol (or to the store itself) without re-deriving it from logs.
//! Only schema drift is fatal to a whole batch run; everything else is
//! isolated to the symbol that produced it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A source bar failed validation (non-finite price, inverted
    /// high/low, negative volume, out-of-order timestamp).
    #[error("bad input bar for {symbol} at {ts}: {reason}")]
    InputData {
        symbol: String,
        ts: String,
        reason: String,
    },

    /// Indicator composition produced something structurally wrong,
    /// e.g. a column of the wrong length or an unknown regime label.
    #[error("feature computation failed for {symbol}: {reason}")]
    Computation { symbol: String, reason: String },

    /// The staging-and-merge protocol could not complete, typically a
    /// leftover staging table from a crashed run with the same name.
    #[error("merge conflict for {symbol}: {reason}")]
    MergeConflict { symbol: String, reason: String },

    /// The analytical table on disk no longer matches the compiled-in
    /// column catalog. Nothing may be written until this is resolved.
    #[error("analytical table '{table}' is missing columns: {missing:?}")]
    SchemaDrift { table: String, missing: Vec<String> },
}

impl PipelineError {
    /// Schema drift poisons every subsequent write, so a batch run
    /// must halt instead of skipping to the next symbol.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::SchemaDrift { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_drift_is_the_only_fatal_variant() {
        let drift = PipelineError::SchemaDrift {
            table: "features".into(),
            missing: vec!["rsi_14".into()],
        };
        assert!(drift.is_fatal());

        let bad_bar = PipelineError::InputData {
            symbol: "AAPL".into(),
            ts: "2024-01-03T00:00:00Z".into(),
            reason: "high below low".into(),
        };
        assert!(!bad_bar.is_fatal());

        let conflict = PipelineError::MergeConflict {
            symbol: "AAPL".into(),
            reason: "staging table exists".into(),
        };
        assert!(!conflict.is_fatal());
    }

    #[test]
    fn messages_name_the_symbol() {
        let err = PipelineError::Computation {
            symbol: "MSFT".into(),
            reason: "column length mismatch".into(),
        };
        assert!(err.to_string().contains("MSFT"));
    }
}
