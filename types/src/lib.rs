//! Core domain types for Relay.
//!
//! This crate holds the IO-free vocabulary shared by every other crate:
//! provider specifications, observed request outcomes, context priority
//! tiers, handoff and bridge records, tunable policy constants, and the
//! error taxonomy. Nothing here touches the network, the filesystem, or
//! an async runtime.

mod bridge;
mod error;
mod ids;
mod outcome;
mod policy;
mod priority;
mod provider;

pub use bridge::{BridgeState, BridgeStateParseError};
pub use error::RelayError;
pub use ids::{ProviderId, SessionId};
pub use outcome::{ConversationTurn, FailureKind, RequestOutcome, Role};
pub use policy::{
    BridgePolicy, CompressionSplit, HandoffPolicy, RelayPolicy, ScoreWeights, SelectionPolicy,
};
pub use priority::Priority;
pub use provider::{HandoffRecord, ProviderRegistry, ProviderSpec};
