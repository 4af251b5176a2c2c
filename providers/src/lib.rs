//! Completion clients for Relay.
//!
//! # Architecture
//!
//! The orchestration engine talks to backends through one narrow seam:
//!
//! - [`CompletionClient`] - the trait the engine is generic over
//! - [`HttpCompletionClient`] - production implementation speaking the
//!   OpenAI-compatible chat completions protocol
//! - [`ProviderError`] - typed failures, each carrying a [`FailureKind`]
//!   that the performance monitor records
//!
//! # Error Handling
//!
//! Every request has an explicit timeout; a request past the timeout is
//! abandoned and surfaced as [`ProviderError::Timeout`], never retried here.
//! Retry policy (the fallback walk) belongs to the engine, which needs the
//! failure kind to decide which provider to try next.

mod client;
mod error;

use std::future::Future;

pub use client::{CompletionResponse, HttpCompletionClient, http_client};
pub use error::ProviderError;

use relay_types::ProviderSpec;

/// A callable completion backend.
///
/// Implementations issue exactly one request per call: no internal retries,
/// no fallback. The engine owns those decisions.
pub trait CompletionClient: Send + Sync {
    fn issue(
        &self,
        provider: &ProviderSpec,
        prompt: &str,
    ) -> impl Future<Output = Result<CompletionResponse, ProviderError>> + Send;
}
