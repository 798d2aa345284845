// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Core streaming types: parsed SSE events, per-stream accumulation
// state, and terminal stream errors.

// ---------------------------------------------------------------------------
// SSE event representation
// ---------------------------------------------------------------------------

/// One logical SSE event reconstructed from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The SSE event type, if an `event:` line was present.
    pub event: Option<String>,
    /// The data payload; multiple `data:` lines join with newlines.
    pub data: String,
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Mutable per-stream state carried across upstream attempts.
///
/// `text_so_far` mirrors exactly the non-thought text already forwarded
/// downstream, after sentinel stripping. `held` is the trailing suffix
/// of received text not yet forwarded because it could still turn out
/// to be (whitespace before) the sentinel token.
#[derive(Debug, Default)]
pub struct Accumulator {
    pub text_so_far: String,
    pub thought_so_far: String,
    pub held: String,
    pub saw_any_text: bool,
    pub last_finish_reason: Option<String>,
    pub blocked: bool,
    pub retries_used: u32,
}

impl Accumulator {
    pub fn new(retries_used: u32) -> Self {
        Self {
            retries_used,
            ..Self::default()
        }
    }

    /// Reset the per-attempt state when a new upstream stream begins.
    /// Accumulated text and the retry count survive. The holdback is
    /// never discarded here: the engine flushes it downstream when an
    /// attempt ends, so losing it would break the splice.
    pub fn begin_attempt(&mut self) {
        self.last_finish_reason = None;
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Terminal outcomes of the stream engine that are not clean success.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The retry budget ran out before a completion signal arrived.
    #[error("retry limit exceeded after {0} attempts")]
    RetryLimitExceeded(u32),

    /// The upstream reported blocked content; not eligible for retry.
    #[error("content blocked by upstream: {0}")]
    Blocked(String),

    /// The downstream client went away.
    #[error("client cancelled")]
    ClientCancelled,
}
