//! Typed errors for the three classes of failure the broadcaster deals
//! with, plus the mapping from error to process exit code.
//!
//! Per-peer I/O failures (connect/read/write/close) are the one class
//! that never reaches this enum: they're always transient, handled by
//! resetting that peer's connection inline where they're observed, and
//! logged as plain strings rather than given their own typed variant.

use thiserror::Error;

use crate::id::PeerId;

/// Errors that mean this process can no longer safely act as leader,
/// or that the deployment is misconfigured. Fatal: the process exits.
#[derive(Debug, Error)]
pub enum BroadcasterError {
    #[error("peer {peer} rejected our candidacy: proposed {proposed}, peer holds {peer_term}")]
    VoteRejected {
        peer: PeerId,
        proposed: crate::id::NodeId,
        peer_term: crate::id::NodeId,
    },

    #[error("peer {peer} reported protocol version {theirs}, we speak {ours}")]
    ProtocolVersionMismatch {
        peer: PeerId,
        ours: u32,
        theirs: u32,
    },

    #[error("primary connection failed: {0}")]
    Primary(#[source] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("primary ended the stream before quorum could be established")]
    PrematureEnd,
}

impl BroadcasterError {
    /// Exit code the binary layer should return for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BroadcasterError::VoteRejected { .. }
            | BroadcasterError::ProtocolVersionMismatch { .. }
            | BroadcasterError::Primary(_)
            | BroadcasterError::Config(_)
            | BroadcasterError::PrematureEnd => 1,
        }
    }
}
