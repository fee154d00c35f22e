//! Collaborator contracts owned by the upstream server layer (§6.1, §3).
//!
//! `UpstreamReceiver` and `Delivery` are implemented by the out-of-scope
//! upstream listener; the engine only ever holds a non-owning
//! `Arc<dyn UpstreamReceiver>` keyed into the [`LinkRegistry`](crate::registry::LinkRegistry).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ErrorCondition;

/// Opaque outbound message payload.
///
/// Content inspection and transformation are explicit non-goals of this
/// adapter (§1), so the message is carried as an opaque byte payload rather
/// than a structured AMQP message type.
#[derive(Debug, Clone)]
pub struct OutboundMessage(pub Bytes);

impl OutboundMessage {
    /// Wrap a byte payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self(payload.into())
    }
}

/// Failure returned by [`UpstreamReceiver::drain`].
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    /// The upstream drain request did not complete within the deadline.
    #[error("drain request timed out")]
    Timeout,
    /// The upstream receiver failed or closed before drain completed.
    #[error("drain request failed: {0}")]
    Failed(String),
}

/// An inbound link from an upstream producer (§3).
///
/// Owned by the upstream server layer; the engine holds only a non-owning
/// reference keyed into the registry.
#[async_trait]
pub trait UpstreamReceiver: fmt::Debug + Send + Sync {
    /// Stable identifier of the underlying upstream connection.
    fn connection_id(&self) -> &str;

    /// Identifier unique per receiver within its connection.
    fn link_id(&self) -> &str;

    /// The AMQP target address the producer attached to, unrewritten.
    fn target_address(&self) -> &str;

    /// Grant `credits` more credit upstream.
    async fn replenish(&self, credits: u32);

    /// Initiate a drain upstream, waiting up to `timeout` for it to
    /// complete. On timeout or failure the caller treats this as a
    /// no-op — the next FLOW reconciles credit (§5).
    async fn drain(&self, timeout: Duration) -> Result<(), DrainError>;

    /// Close the upstream link with the given error condition.
    async fn close(&self, condition: ErrorCondition);
}

/// A per-message delivery handle, used to issue `accepted` or `released`
/// upstream (§3).
#[async_trait]
pub trait Delivery: fmt::Debug + Send + Sync {
    /// Whether the producer sent this delivery pre-settled.
    fn is_remotely_settled(&self) -> bool;

    /// Settle the delivery as accepted.
    async fn accept(self: Box<Self>);

    /// Settle the delivery as released.
    async fn release(self: Box<Self>);

    /// Settle the delivery as rejected, e.g. because the downstream
    /// disposition mirrored back a rejection (event QoS, §4.5).
    async fn reject(self: Box<Self>, description: Option<String>);
}
