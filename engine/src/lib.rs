//! Orchestration engine for Relay.
//!
//! # Architecture
//!
//! - [`Orchestrator`] - the facade: selection, fallback walks, handoffs,
//!   hibernation, and integrity tracking behind one API
//! - [`HandoffManager`] - predicts context overflow and builds budgeted,
//!   validated transfer blocks for a larger-window provider
//! - [`HibernationBridge`] - preserves the conversation across total
//!   provider exhaustion and restores it when any provider recovers
//!
//! The engine is generic over [`relay_providers::CompletionClient`] and
//! [`relay_monitor::OutcomeStore`], so tests run against scripted clients
//! and in-memory stores while production uses HTTP and SQLite.

mod bridge;
mod handoff;
mod orchestrator;

pub use bridge::{
    BridgePoll, BridgeResolution, BridgeSession, BridgeStats, BridgeStore, HibernationBridge,
};
pub use handoff::{HandoffDecision, HandoffManager, PreparedHandoff};
pub use orchestrator::{
    CompletionOutcome, HandoffOutcome, Orchestrator, RecoveryOutcome, RelayStats,
};
