//! Errors associated with creating a downstream sender.

use crate::address::AddressError;

/// Failure attaching a new downstream sender (§4.2, §7).
#[derive(Debug, thiserror::Error)]
pub enum SenderCreationError {
    /// The downstream connection is absent or disconnected.
    #[error("downstream connection is not open")]
    ConnectionNotOpen,

    /// The target address could not be rewritten for downstream attach.
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),

    /// The attach itself failed (link/session/protocol error).
    #[error("sender attach failed: {0}")]
    AttachFailed(String),
}
