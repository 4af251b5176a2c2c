//! Context preservation for Relay.
//!
//! # Architecture
//!
//! Context flows through this crate in stages:
//!
//! - [`ContextPacker`] turns a transcript plus anchors and key facts into
//!   prioritized [`ContextElement`]s
//! - [`optimize`] prunes elements to a token budget, LOW first, CRITICAL
//!   last and only on explicit request
//! - [`MemorySections`] extracts and compresses the sectioned memory a
//!   handoff prompt carries
//! - [`ContextSnapshot`] + [`validate`] freeze context before and after a
//!   transfer and decide whether integrity held
//! - [`IntegrityStore`] persists snapshots and the integrity-check log
//!
//! Token arithmetic everywhere goes through [`TokenEstimator`];
//! [`TiktokenEstimator`] is the production implementation.

mod element;
mod packer;
mod sections;
mod snapshot;
mod store;
mod token_estimator;
mod transfer;

pub use element::{ContextElement, ElementKind, content_hash, total_tokens};
pub use packer::{ContextPacker, OptimizeOutcome, optimize};
pub use sections::MemorySections;
pub use snapshot::{ContextSnapshot, Verdict, compute_checksum, validate};
pub use store::{IntegrityCheck, IntegrityStats, IntegrityStore};
pub use token_estimator::{HeuristicEstimator, TiktokenEstimator, TokenEstimator};
pub use transfer::{
    END_MARKER, INTEGRITY_MARKER, render_transfer_context, validate_transfer_context,
};
