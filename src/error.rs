use thiserror::Error;

use crate::arith::ArithError;
use crate::keys::PeerId;
use crate::review::LogError;

/// Round-level error taxonomy.
///
/// Only `Protocol` and `Malformed` are recoverable (the offending message is
/// discarded and the round keeps running); every other variant is fatal to
/// the round that raised it.
#[derive(Error, Debug)]
pub enum RoundError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed message from peer {peer}: {reason}")]
    Malformed { peer: PeerId, reason: String },

    #[error("proof verification failed: {0}")]
    ProofVerification(String),

    #[error("phase {phase:?} timed out, missing contributions from {missing:?}")]
    Timeout {
        phase: &'static str,
        missing: Vec<PeerId>,
    },

    #[error("roster changed mid-round (peer {0})")]
    RosterChange(PeerId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Arith(#[from] ArithError),
}

impl RoundError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        RoundError::Protocol(msg.into())
    }

    pub fn malformed(peer: PeerId, reason: impl Into<String>) -> Self {
        RoundError::Malformed {
            peer,
            reason: reason.into(),
        }
    }

    /// True when the round may keep running after discarding the message.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RoundError::Protocol(_) | RoundError::Malformed { .. })
    }
}
