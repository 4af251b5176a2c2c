//! Token estimation using tiktoken.
//!
//! Counts are **approximate**: the `cl100k_base` encoding matches the
//! tokenizers of some backends exactly and over- or under-counts others by a
//! few percent. The handoff trigger and compression budgets already carry
//! safety margins, so approximate counts are sufficient here.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, cl100k_base};

/// Counts and truncates text in token units.
///
/// The packer, the section compressor, and the handoff predictor all take
/// `&dyn TokenEstimator`; tests substitute [`HeuristicEstimator`] so they
/// never pay the vocabulary-load cost.
pub trait TokenEstimator: Send + Sync {
    fn count(&self, text: &str) -> u32;

    /// Truncates `text` to at most `max_tokens`, cutting at a token boundary
    /// where the encoder allows it.
    fn truncate(&self, text: &str, max_tokens: u32) -> String;
}

/// The tiktoken encoder is expensive to initialize (loads vocabulary data),
/// so it is created once and shared across all estimator instances.
static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn get_encoder() -> Option<&'static CoreBPE> {
    ENCODER.get_or_init(|| cl100k_base().ok()).as_ref()
}

/// Thread-safe estimator backed by tiktoken's `cl100k_base` encoding.
#[derive(Clone, Copy)]
pub struct TiktokenEstimator {
    encoder: Option<&'static CoreBPE>,
}

impl std::fmt::Debug for TiktokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenEstimator")
            .field("encoder", &self.encoder.as_ref().map(|_| "<CoreBPE>"))
            .finish()
    }
}

impl TiktokenEstimator {
    #[must_use]
    pub fn new() -> Self {
        let encoder = get_encoder();
        if encoder.is_none() {
            tracing::error!(
                "Failed to initialize tiktoken cl100k_base encoder. Falling back to byte-length estimates."
            );
        }

        Self { encoder }
    }
}

impl Default for TiktokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn count(&self, text: &str) -> u32 {
        let len = match self.encoder {
            Some(encoder) => encoder.encode_ordinary(text).len(),
            None => text.len().div_ceil(4),
        };

        u32::try_from(len).unwrap_or(u32::MAX)
    }

    fn truncate(&self, text: &str, max_tokens: u32) -> String {
        if self.count(text) <= max_tokens {
            return text.to_string();
        }

        if let Some(encoder) = self.encoder {
            let mut tokens = encoder.encode_ordinary(text);
            tokens.truncate(max_tokens as usize);
            if let Ok(decoded) = encoder.decode(tokens) {
                return decoded;
            }
        }

        // No encoder (or a decode failure on a truncated boundary): fall back
        // to a character prefix at roughly four characters per token.
        char_prefix(text, (max_tokens as usize).saturating_mul(4))
    }
}

/// Byte-length estimator for tests and for the degraded no-encoder path.
///
/// Roughly four characters per token, matching the rule of thumb the
/// tiktoken fallback uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn count(&self, text: &str) -> u32 {
        u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
    }

    fn truncate(&self, text: &str, max_tokens: u32) -> String {
        char_prefix(text, (max_tokens as usize).saturating_mul(4))
    }
}

fn char_prefix(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
