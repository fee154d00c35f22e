//! Given an open downstream connection, creates an outbound sender link for
//! a target address at a desired QoS (§4.2).

pub mod error;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub use error::SenderCreationError;

use crate::address::rewrite_address;
use crate::connector::DownstreamConnection;
use crate::downstream::DownstreamSender;
use crate::qos::Qos;

/// Invoked whenever the downstream container sends a FLOW frame for the
/// sender it was registered against. Carries no payload: by the time it
/// fires, the sender's own `credit`/`queued`/`drain_requested` already
/// reflect the FLOW that triggered it, so the engine re-reads them off the
/// `Arc<dyn DownstreamSender>` rather than through the callback.
pub type CreditReplenishHandler = Arc<dyn Fn() + Send + Sync>;

/// Creates outbound sender links against an open downstream connection
/// (§4.2).
#[async_trait]
pub trait SenderFactory: fmt::Debug + Send + Sync {
    /// Rewrite `target_address` (§6.2) using `path_separator`, attach a
    /// sender to the result at `qos`, register `on_credit_replenish` as the
    /// FLOW handler, and return the opened sender. Fails with
    /// [`SenderCreationError::ConnectionNotOpen`] if `connection` is not
    /// actually open, or [`SenderCreationError::InvalidAddress`] if the
    /// rewrite fails.
    async fn create_sender(
        &self,
        connection: &dyn DownstreamConnection,
        target_address: &str,
        path_separator: char,
        qos: Qos,
        on_credit_replenish: CreditReplenishHandler,
    ) -> Result<Arc<dyn DownstreamSender>, SenderCreationError>;
}

/// Helper for [`SenderFactory`] implementations: rewrite `target_address`
/// and map a failure into [`SenderCreationError::InvalidAddress`].
pub fn rewrite_target_address(
    target_address: &str,
    path_separator: char,
) -> Result<String, SenderCreationError> {
    rewrite_address(target_address, path_separator).map_err(SenderCreationError::InvalidAddress)
}
