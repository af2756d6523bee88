//! Storage layer: DuckDB tables for tasks, versions, extractions, judgments,
//! the evolution log and the shared pattern library.

mod error;
pub use error::StoreError;

mod duck;
pub use duck::DuckStore;

mod events;
mod extractions;
pub use extractions::UsageTotals;

mod patterns;
pub use patterns::DEFAULT_MIN_PATTERN_CONFIDENCE;

mod registry;
mod tasks;
