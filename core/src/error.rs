//! Error types surfaced on a change stream.
//!
//! Every error is terminal for the subscription it is delivered on: it is the last item a listener
//! will ever receive from that subscription.

use thiserror::Error;

/// An upstream notification sequence that breaks the Initial-then-Updates contract.
///
/// These indicate a bug in the change feed source, not a runtime condition a consumer can fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("upstream delivered a second initial notification")]
    DuplicateInitial,

    #[error("upstream delivered an update before its initial notification")]
    UpdateBeforeInitial,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// The change feed source reported a failure (eg. its backing store could not be opened)
    #[error("upstream failure: {reason}")]
    Upstream { reason: String },

    /// The change feed source misbehaved
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
}

impl FeedError {
    pub fn upstream(reason: impl Into<String>) -> Self { Self::Upstream { reason: reason.into() } }

    /// True when the error indicates a bug in the upstream source rather than a runtime failure
    pub fn is_protocol_violation(&self) -> bool { matches!(self, Self::Protocol(_)) }
}
