//! Core library for the tickforge feature pipeline: bar loading and
//! validation, run configuration, trading calendars with gap planning,
//! the physical table schema, and the DuckDB-backed feature store.

pub mod bars;
pub mod calendar;
pub mod config;
pub mod error;
pub mod schema;
pub mod store;

pub use bars::{load_bars_csv, BarRejection, BarSeries};
pub use calendar::{AssetClass, GapPlanner, GapReport, MarketCalendar, PlannerState};
pub use config::{PipelineConfig, StoreConfig, SymbolSpec};
pub use error::PipelineError;
pub use schema::{ColumnDef, SqlType, TableSchema};
pub use store::{fingerprint_file, FeatureStore, MergeOutcome};
