//! Indicator library, column catalog, feature composer, and frame
//! sanitizer for the tickforge pipeline.

pub mod catalog;
pub mod engineer;
pub mod indicators;
pub mod sanitize;

pub use catalog::{ColumnKind, FeatureColumn, SCHEMA_VERSION};
pub use engineer::{ComposeOptions, FeatureComposer};
pub use sanitize::{sanitize_frame, SanitizeReport};
