//! Error conditions issued upstream and the engine's own public error type.

use std::fmt;

use crate::{connector::ConnectError, sender_factory::SenderCreationError};

/// A named AMQP error condition issued to an upstream receiver.
///
/// Only the condition this adapter itself raises is modeled here; conditions
/// originating from the upstream server layer (authentication, address
/// validation) are that layer's concern, not this crate's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    /// No usable downstream sender exists for the receiver: either none is
    /// registered, the registered one is not open, or the downstream
    /// connection has just disconnected.
    NoDownstreamConsumer,
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDownstreamConsumer => write!(f, "amqp-forward:no-downstream-consumer"),
        }
    }
}

/// Public error type returned by [`crate::engine::ForwardingEngineHandle`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A public operation other than `start` was invoked while the engine
    /// was not in the `Running` state.
    #[error("forwarding engine is not running")]
    NotStarted,

    /// The downstream connection is absent or disconnected.
    #[error("downstream connection is not open")]
    ConnectionNotOpen,

    /// The factory failed to attach a downstream sender.
    #[error("failed to create downstream sender: {0}")]
    SenderCreationFailed(#[from] SenderCreationError),

    /// The downstream connector failed to establish the initial connection
    /// and `waitForDownstreamConnectionEnabled` was set.
    #[error("failed to connect to downstream container: {0}")]
    ConnectFailed(#[from] ConnectError),

    /// The engine's event loop has already terminated.
    #[error("forwarding engine event loop is gone")]
    EngineGone,
}
