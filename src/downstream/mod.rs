//! The downstream-facing link and connection abstractions (§3, §4.1, §4.2).
//!
//! [`amqp`] wires these traits to the real `fe2o3-amqp` crate; the engine
//! itself is generic over the traits so it can be driven by fakes in tests
//! (§8).

pub mod amqp;

use std::fmt;

use async_trait::async_trait;

use crate::upstream::OutboundMessage;

/// Outcome of a downstream send, used by [`crate::qos::QosPolicy::forward_message`]
/// to decide the upstream disposition for AT_LEAST_ONCE delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The downstream peer accepted the delivery.
    Accepted,
    /// The downstream peer released the delivery.
    Released,
    /// The downstream peer rejected the delivery.
    Rejected,
}

/// Failure sending a message on a downstream sender.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The sender was closed concurrently with the send attempt.
    #[error("downstream sender is closed")]
    Closed,
    /// Transport-level failure.
    #[error("downstream send failed: {0}")]
    Transport(String),
}

/// An outbound link to the downstream container (§3).
///
/// A sender is created with `auto-drained` disabled: drain propagation is
/// the engine's responsibility, driven through [`DownstreamSender::mark_drained`].
#[async_trait]
pub trait DownstreamSender: fmt::Debug + Send + Sync {
    /// Current credit granted by the downstream peer.
    fn credit(&self) -> u32;

    /// Messages buffered locally awaiting transmission.
    fn queued(&self) -> u32;

    /// Whether the downstream peer has requested a drain.
    fn drain_requested(&self) -> bool;

    /// Whether the link is still open.
    fn is_open(&self) -> bool;

    /// The upstream connection-id this sender was created for, recorded in
    /// the sender's attachment slot at creation time (§3).
    fn owning_connection_id(&self) -> &str;

    /// Send `message`, pre-settled iff `presettle` is true.
    ///
    /// Returns the eventual disposition; for a pre-settled send this
    /// resolves immediately with [`Disposition::Accepted`].
    async fn send(&self, message: OutboundMessage, presettle: bool) -> Result<Disposition, SendError>;

    /// Declare the sender drained after the engine's drain forwarding
    /// completes successfully (§4.4).
    fn mark_drained(&self);

    /// Close the sender link.
    async fn close(&self);
}

/// `max(0, sender.credit - sender.queued)` — the only credit figure ever
/// granted upstream (§4.4).
pub fn available_downstream_credit(sender: &dyn DownstreamSender) -> u32 {
    sender.credit().saturating_sub(sender.queued())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Fake {
        credit: AtomicU32,
        queued: AtomicU32,
    }

    #[async_trait]
    impl DownstreamSender for Fake {
        fn credit(&self) -> u32 {
            self.credit.load(Ordering::SeqCst)
        }
        fn queued(&self) -> u32 {
            self.queued.load(Ordering::SeqCst)
        }
        fn drain_requested(&self) -> bool {
            false
        }
        fn is_open(&self) -> bool {
            true
        }
        fn owning_connection_id(&self) -> &str {
            "conn"
        }
        async fn send(&self, _message: OutboundMessage, _presettle: bool) -> Result<Disposition, SendError> {
            Ok(Disposition::Accepted)
        }
        fn mark_drained(&self) {}
        async fn close(&self) {}
    }

    #[test]
    fn never_overdraws_when_queued_exceeds_credit() {
        let sender = Fake {
            credit: AtomicU32::new(5),
            queued: AtomicU32::new(9),
        };
        assert_eq!(available_downstream_credit(&sender), 0);
    }

    #[test]
    fn grants_the_difference_when_credit_exceeds_queued() {
        let sender = Fake {
            credit: AtomicU32::new(20),
            queued: AtomicU32::new(7),
        };
        assert_eq!(available_downstream_credit(&sender), 13);
    }
}
