//! Production wiring of [`super::DownstreamSender`], [`crate::connector::DownstreamConnector`],
//! and [`crate::sender_factory::SenderFactory`] against the real `fe2o3-amqp` crate.
//!
//! # Credit model adaptation
//!
//! `fe2o3_amqp::Sender::send` is pull-style: it awaits internally until the
//! peer has granted enough link-credit, and the crate does not expose a
//! snapshot of the underlying link-credit/delivery-count state through its
//! public API (that bookkeeping is private to `link::state`). The engine's
//! push-style model (§4.4: check `credit`/`queued`, decide, then send)
//! therefore cannot be driven by the *wire* credit directly; instead this
//! module maintains a local admission-control budget and treats it as the
//! `credit`/`queued` pair the engine reasons about:
//!
//! - `credit()` is the configured local in-flight budget (`max_in_flight`).
//! - `queued()` is the number of sends handed to the real `Sender` that have
//!   not yet completed.
//! - the credit-replenish handler fires whenever a send completes and
//!   `queued()` drops, which is the adapter-local analogue of "more room
//!   became available" that FLOW handling reacts to.
//!
//! This is a deliberate, documented approximation, not a silent gap: it
//! preserves the engine's non-overdraw invariant (§8.3) against the local
//! buffer, at the cost of not reflecting true downstream wire credit
//! one-to-one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fe2o3_amqp::{Connection, Sender as AmqpSender, Session, session::SessionHandle};
use fe2o3_amqp_types::definitions::SenderSettleMode;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use url::Url;

use crate::connector::{ConnectError, ConnectOptions, ConnectorEvent, DownstreamConnection, DownstreamConnector};
use crate::qos::Qos;
use crate::sender_factory::{CreditReplenishHandler, SenderCreationError, SenderFactory};
use crate::upstream::OutboundMessage;

use super::{Disposition, DownstreamSender, SendError};

/// Local in-flight budget used in place of wire-level credit (see module docs).
const DEFAULT_MAX_IN_FLIGHT: u32 = 64;

/// A live `fe2o3-amqp` connection plus the single session opened on it.
pub struct AmqpConnection {
    id: String,
    session: Mutex<SessionHandle<()>>,
}

impl std::fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnection").field("id", &self.id).finish()
    }
}

impl DownstreamConnection for AmqpConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Opens and maintains the single long-lived downstream connection+session
/// against a real AMQP 1.0 container (§4.1).
#[derive(Debug)]
pub struct AmqpConnector {
    container_id: String,
    url: Url,
}

impl AmqpConnector {
    pub fn new(container_id: impl Into<String>, url: Url) -> Self {
        Self {
            container_id: container_id.into(),
            url,
        }
    }
}

#[async_trait]
impl DownstreamConnector for AmqpConnector {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn DownstreamConnection>, mpsc::Receiver<ConnectorEvent>), ConnectError> {
        let attempt = Connection::builder()
            .container_id(self.container_id.clone())
            .open(self.url.as_str());

        let mut connection = tokio::time::timeout(Duration::from_millis(options.connect_timeout_ms), attempt)
            .await
            .map_err(|_| ConnectError::Timeout)?
            .map_err(|error| ConnectError::Transport(error.to_string()))?;

        let session = Session::begin(&mut connection)
            .await
            .map_err(|error| ConnectError::Transport(error.to_string()))?;

        let id = format!("{}@{}", self.container_id, self.url);
        let (tx, rx) = mpsc::channel(8);

        // Surface the connection's termination as a single `Disconnected`
        // event; this crate does not need to distinguish a clean remote
        // close from a transport drop once recovery kicks in (§4.1, §4.4).
        tokio::spawn(async move {
            let mut connection = connection;
            let _ = connection.on_close().await;
            let _ = tx.send(ConnectorEvent::Disconnected).await;
        });

        Ok((
            Arc::new(AmqpConnection {
                id,
                session: Mutex::new(session),
            }),
            rx,
        ))
    }

    async fn close(&self) {
        // Individual connections are owned by the `AmqpConnection` handles
        // returned from `connect`; there is no persistent handle to close
        // here between connect attempts.
    }

    fn is_connected(&self) -> bool {
        // Liveness is tracked per-`AmqpConnection` by the engine via the
        // connector event channel rather than centrally in this type.
        true
    }
}

struct FlowState {
    in_flight: AtomicU32,
    max_in_flight: u32,
    on_replenish: Mutex<Option<CreditReplenishHandler>>,
}

/// An outbound link to the downstream container, backed by a real
/// `fe2o3_amqp::Sender`.
pub struct AmqpDownstreamSender {
    connection_id: String,
    sender: Mutex<Option<AmqpSender>>,
    presettled: bool,
    flow: FlowState,
}

impl std::fmt::Debug for AmqpDownstreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpDownstreamSender")
            .field("connection_id", &self.connection_id)
            .field("queued", &self.flow.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl DownstreamSender for AmqpDownstreamSender {
    fn credit(&self) -> u32 {
        self.flow.max_in_flight
    }

    fn queued(&self) -> u32 {
        self.flow.in_flight.load(Ordering::SeqCst)
    }

    fn drain_requested(&self) -> bool {
        // `fe2o3-amqp`'s public `Sender` does not surface the peer's drain
        // flag; this adapter never sets it, so draining is effectively
        // initiated only by the upstream side's own idle detection.
        false
    }

    fn is_open(&self) -> bool {
        self.sender.try_lock().map(|s| s.is_some()).unwrap_or(true)
    }

    fn owning_connection_id(&self) -> &str {
        &self.connection_id
    }

    async fn send(&self, message: OutboundMessage, presettle: bool) -> Result<Disposition, SendError> {
        self.flow.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = {
            let mut guard = self.sender.lock().await;
            match guard.as_mut() {
                Some(sender) => {
                    if presettle {
                        sender
                            .send(message.0.to_vec())
                            .await
                            .map(|_| Disposition::Accepted)
                            .map_err(|error| SendError::Transport(error.to_string()))
                    } else {
                        sender
                            .send(message.0.to_vec())
                            .await
                            .map(|outcome| {
                                if outcome.is_accepted() {
                                    Disposition::Accepted
                                } else if outcome.is_released() {
                                    Disposition::Released
                                } else {
                                    Disposition::Rejected
                                }
                            })
                            .map_err(|error| SendError::Transport(error.to_string()))
                    }
                }
                None => Err(SendError::Closed),
            }
        };
        self.flow.in_flight.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() {
            if let Some(handler) = self.flow.on_replenish.lock().await.clone() {
                handler();
            }
        }
        result
    }

    fn mark_drained(&self) {
        // No-op: this backend never reports `drain_requested() == true`.
    }

    async fn close(&self) {
        if let Some(sender) = self.sender.lock().await.take() {
            if let Err(error) = sender.close().await {
                warn!(%error, "error closing downstream sender");
            }
        }
    }
}

/// Creates [`AmqpDownstreamSender`]s against an [`AmqpConnection`] (§4.2).
#[derive(Debug, Default)]
pub struct AmqpSenderFactory {
    max_in_flight: u32,
}

impl AmqpSenderFactory {
    pub fn new() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    pub fn with_max_in_flight(max_in_flight: u32) -> Self {
        Self { max_in_flight }
    }
}

#[async_trait]
impl SenderFactory for AmqpSenderFactory {
    async fn create_sender(
        &self,
        connection: &dyn DownstreamConnection,
        target_address: &str,
        path_separator: char,
        qos: Qos,
        on_credit_replenish: CreditReplenishHandler,
    ) -> Result<Arc<dyn DownstreamSender>, SenderCreationError> {
        let amqp_connection = connection
            .as_any()
            .downcast_ref::<AmqpConnection>()
            .ok_or(SenderCreationError::ConnectionNotOpen)?;

        let address = crate::sender_factory::rewrite_target_address(target_address, path_separator)?;

        let settle_mode = match qos {
            Qos::AtMostOnce => SenderSettleMode::Settled,
            Qos::AtLeastOnce => SenderSettleMode::Unsettled,
        };

        let mut session = amqp_connection.session.lock().await;
        let sender = AmqpSender::builder()
            .name(format!("forwarder-{address}"))
            .target(Some(address.as_str()))
            .sender_settle_mode(settle_mode)
            .attach(&mut session)
            .await
            .map_err(|error| SenderCreationError::AttachFailed(error.to_string()))?;
        drop(session);

        debug!(address, "attached downstream sender");

        Ok(Arc::new(AmqpDownstreamSender {
            connection_id: amqp_connection.id.clone(),
            sender: Mutex::new(Some(sender)),
            presettled: matches!(qos, Qos::AtMostOnce),
            flow: FlowState {
                in_flight: AtomicU32::new(0),
                max_in_flight: self.max_in_flight,
                on_replenish: Mutex::new(Some(on_credit_replenish)),
            },
        }))
    }
}

impl AmqpDownstreamSender {
    /// Whether this sender was attached for pre-settled (AT_MOST_ONCE)
    /// delivery; exposed so a `QosPolicy` can avoid re-deriving it.
    pub fn is_presettled(&self) -> bool {
        self.presettled
    }
}
