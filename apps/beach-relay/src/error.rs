use std::fmt::Display;
use thiserror::Error;

use crate::negotiation::Phase;
use crate::signaling::SignalKind;

/// Errors decoding an inbound frame. Never fatal to the connection.
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("malformed signaling frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unknown signaling message type: {0}")]
    UnknownType(String),
}

/// Failures reported by the media-stack collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("{operation} failed: {reason}")]
    Call {
        operation: &'static str,
        reason: String,
    },
}

impl MediaError {
    pub fn call(operation: &'static str, err: impl Display) -> Self {
        MediaError::Call {
            operation,
            reason: err.to_string(),
        }
    }
}

/// Errors from a negotiation step. The connection stays open.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("media peer rejected negotiation step: {0}")]
    Media(#[from] MediaError),

    #[error("{kind} not accepted while negotiation is {phase}")]
    OutOfOrder { kind: SignalKind, phase: Phase },
}

/// Read/write failures on the underlying connection. Fatal to that connection only.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection read failed: {0}")]
    Read(String),

    #[error("connection write failed: {0}")]
    Write(String),

    #[error("outbound writer is gone")]
    WriterGone,
}
