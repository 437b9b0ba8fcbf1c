//! Error taxonomy for the UDS engines.

use crate::nrc::Nrc;
use crate::transport::TransportError;

/// Result alias used across the crate.
pub type UdsResult<T> = Result<T, UdsError>;

/// Failures surfaced to users of the client and server engines.
#[derive(Debug, thiserror::Error)]
pub enum UdsError {
    /// The transport binding failed synchronously.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No response arrived within the transaction window.
    #[error("timed out waiting for response")]
    Timeout,

    /// The peer answered with a negative response.
    #[error("negative response to 0x{sid:02X}: {nrc}")]
    Negative {
        /// Request service identifier.
        sid: u8,
        /// Negative response code from the wire.
        nrc: Nrc,
    },

    /// A transaction was attempted while another one is outstanding.
    #[error("client busy: transaction in flight")]
    Busy,

    /// The peer answered, but the payload did not parse.
    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),
}

impl UdsError {
    /// The NRC carried by this error, if it is a negative response.
    pub fn nrc(&self) -> Option<Nrc> {
        match self {
            UdsError::Negative { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }
}
