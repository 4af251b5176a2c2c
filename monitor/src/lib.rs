//! Provider performance monitoring and selection for Relay.
//!
//! # Architecture
//!
//! - [`OutcomeStore`] - append-only outcome log with aggregate queries;
//!   [`SqliteOutcomeStore`] in production, [`MemoryOutcomeStore`] in tests
//! - [`PerformanceMonitor`] - usage scores in `[0, 100]` from the rolling
//!   24-hour window, cached per provider between outcomes
//! - [`ProviderSelector`] - filtered score ranking; returns
//!   [`Selection::NoneAvailable`] when every provider is excluded,
//!   failure-capped, or quota-exhausted

mod performance;
mod selector;
mod store;

pub use performance::{PerformanceMonitor, ProviderStats};
pub use selector::{ProviderSelector, RankedProvider, Selection};
pub use store::{MemoryOutcomeStore, OutcomeStore, SqliteOutcomeStore, TodayUsage, WindowStats};
