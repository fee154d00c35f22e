//! QoS policy extension points (§4.5).

use async_trait::async_trait;
use tracing::{trace, warn};

use crate::downstream::{Disposition, DownstreamSender};
use crate::upstream::{Delivery, OutboundMessage};

/// Quality of service requested at sender-creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    /// Pre-settled downstream; upstream delivery is settled immediately as
    /// accepted once handed to the sender.
    AtMostOnce,
    /// Unsettled downstream; the downstream disposition is mirrored upstream
    /// once received.
    AtLeastOnce,
}

/// The abstract hooks a concrete endpoint kind (telemetry vs. event) supplies
/// to the engine (§4.5).
#[async_trait]
pub trait QosPolicy: std::fmt::Debug + Send + Sync {
    /// QoS requested at sender creation time.
    fn qos(&self) -> Qos;

    /// Perform the actual send and the upstream disposition/settlement that
    /// follows from it.
    async fn forward_message(
        &self,
        sender: &dyn DownstreamSender,
        message: OutboundMessage,
        delivery: Box<dyn Delivery>,
    );
}

/// AT_MOST_ONCE: send pre-settled downstream; immediately settle upstream as
/// accepted.
#[derive(Debug, Default)]
pub struct TelemetryPolicy;

#[async_trait]
impl QosPolicy for TelemetryPolicy {
    fn qos(&self) -> Qos {
        Qos::AtMostOnce
    }

    async fn forward_message(
        &self,
        sender: &dyn DownstreamSender,
        message: OutboundMessage,
        delivery: Box<dyn Delivery>,
    ) {
        match sender.send(message, true).await {
            Ok(_) => delivery.accept().await,
            Err(error) => {
                warn!(%error, "telemetry send failed after credit check passed");
                delivery.release().await;
            }
        }
    }
}

/// AT_LEAST_ONCE: send unsettled downstream; mirror the downstream
/// disposition (accepted/released/rejected) upstream once received.
#[derive(Debug, Default)]
pub struct EventPolicy;

#[async_trait]
impl QosPolicy for EventPolicy {
    fn qos(&self) -> Qos {
        Qos::AtLeastOnce
    }

    async fn forward_message(
        &self,
        sender: &dyn DownstreamSender,
        message: OutboundMessage,
        delivery: Box<dyn Delivery>,
    ) {
        match sender.send(message, false).await {
            Ok(Disposition::Accepted) => delivery.accept().await,
            Ok(Disposition::Released) => delivery.release().await,
            Ok(Disposition::Rejected) => delivery.reject(None).await,
            Err(error) => {
                trace!(%error, "event send failed, releasing upstream delivery");
                delivery.release().await;
            }
        }
    }
}
