//! Per-session error taxonomy
//!
//! A clean end of stream and an expected closure are reported through
//! [`CopyOutcome`](crate::copier::CopyOutcome) and never show up here.
//! Everything in [`RelayError`] is an unexpected failure: it is escalated out
//! of the session engine and stops at the session supervisor.

use crate::copier::Direction;
use crate::session::Endpoint;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to connect to remote address {address}: {source}")]
    Dial {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[error("Relay {direction} failed: {source}")]
    Copy {
        direction: Direction,
        source: std::io::Error,
    },

    #[error("Failed to close write half of {endpoint} connection: {source}")]
    HalfClose {
        endpoint: Endpoint,
        source: std::io::Error,
    },

    #[error("Failed to close {endpoint} connection: {reason}")]
    Close { endpoint: Endpoint, reason: String },

    #[error("Relay {direction} task aborted: {reason}")]
    DirectionAborted { direction: Direction, reason: String },
}

impl RelayError {
    /// The endpoint or direction this failure is attributed to, for log fields.
    pub fn origin(&self) -> String {
        match self {
            RelayError::Dial { .. } => Endpoint::Outbound.to_string(),
            RelayError::Copy { direction, .. } | RelayError::DirectionAborted { direction, .. } => {
                direction.to_string()
            }
            RelayError::HalfClose { endpoint, .. } | RelayError::Close { endpoint, .. } => {
                endpoint.to_string()
            }
        }
    }
}
