//! Maintains at-most-one active downstream connection (§4.1).

pub mod error;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use error::ConnectError;

/// Options governing a downstream connect attempt (§4.1, §6.4). Fixed
/// defaults, overridable via [`crate::config::AdapterConfig`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout_ms: u64,
    pub reconnect_attempts: i64,
    pub reconnect_interval_ms: u64,
}

/// Notification raised by a live downstream connection.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// The downstream peer sent a Close frame. The adapter reacts by
    /// issuing its own close, which then triggers [`ConnectorEvent::Disconnected`] (§4.1).
    RemoteClose,
    /// The downstream connection was lost.
    Disconnected,
}

/// A live downstream connection handle. Senders are created against this
/// handle by the [`crate::sender_factory::SenderFactory`].
pub trait DownstreamConnection: fmt::Debug + Send + Sync {
    /// Opaque identifier of the underlying connection, recorded by created
    /// senders in their attachment slot.
    fn id(&self) -> &str;

    /// Narrow downcast hook so a concrete [`crate::sender_factory::SenderFactory`]
    /// can recover its own connection type without widening this trait with
    /// backend-specific methods (implemented by backends that need it; the
    /// default returns `None`).
    fn as_any(&self) -> &dyn std::any::Any {
        &()
    }
}

/// Establishes and tears down the single long-lived session to the
/// downstream container (§4.1).
#[async_trait]
pub trait DownstreamConnector: fmt::Debug + Send + Sync {
    /// Attempt a connection. On success returns the connection handle and a
    /// channel of [`ConnectorEvent`]s for that connection's lifetime — the
    /// idiomatic-Rust translation of the `onRemoteClose`/`onDisconnect`
    /// callback pair from the collaborator contract (§6.1), chosen as the
    /// Open Question resolution recorded in `DESIGN.md`.
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(std::sync::Arc<dyn DownstreamConnection>, mpsc::Receiver<ConnectorEvent>), ConnectError>;

    /// Initiate graceful close; idempotent when already closed.
    async fn close(&self);

    /// `true` iff a connection object exists and is not disconnected.
    fn is_connected(&self) -> bool;
}
