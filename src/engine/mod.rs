//! The central state machine: orchestrates the connector, the sender
//! factory, and the link registry; implements `onClientAttach`,
//! `onClientDetach`, `onClientDisconnect`, `processMessage`, and
//! `handleFlow` (§4.4).

pub mod error;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::config::AdapterConfig;
use crate::connector::{ConnectError, ConnectOptions, ConnectorEvent, DownstreamConnection, DownstreamConnector};
use crate::downstream::available_downstream_credit;
use crate::error::{EngineError, ErrorCondition};
use crate::qos::QosPolicy;
use crate::registry::{LinkRegistry, ReceiverKey};
use crate::sender_factory::{CreditReplenishHandler, SenderFactory};
use crate::upstream::{Delivery, OutboundMessage, UpstreamReceiver};

/// Fixed delay before a reconnect attempt after a downstream disconnect
/// (§4.4, §5). Distinct from `reconnect_interval_ms`, which governs the
/// connector's own internal retry spacing, not this scheduling step.
const DISCONNECT_RECONNECT_DELAY_MS: u64 = 300;

/// `Created → Starting → Running → Stopped` (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopped,
}

type ConnectOutcome = Result<(Arc<dyn DownstreamConnection>, mpsc::Receiver<ConnectorEvent>), ConnectError>;

enum Command {
    Start(oneshot::Sender<Result<(), EngineError>>),
    Stop(oneshot::Sender<()>),
    Attach {
        receiver: Arc<dyn UpstreamReceiver>,
        resp: oneshot::Sender<Result<(), EngineError>>,
    },
    Detach {
        receiver: Arc<dyn UpstreamReceiver>,
    },
    Disconnect {
        connection_id: String,
    },
    ProcessMessage {
        receiver: Arc<dyn UpstreamReceiver>,
        delivery: Box<dyn Delivery>,
        message: OutboundMessage,
        resp: oneshot::Sender<Result<(), EngineError>>,
    },
    Flow {
        key: ReceiverKey,
    },
    ConnectResult(ConnectOutcome),
    ConnectorEvent(ConnectorEvent),
    ReconnectTimerFired,
}

/// A cloneable handle to a running [`ForwardingEngine`] actor. This is the
/// `DownstreamAdapter` surface of §6.1.
#[derive(Clone, Debug)]
pub struct ForwardingEngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ForwardingEngineHandle {
    /// Start the engine. If `waitForDownstreamConnectionEnabled` is set in
    /// the engine's configuration, this resolves only after the first
    /// successful downstream connect; otherwise it resolves immediately and
    /// connection proceeds in the background (§4.1).
    pub async fn start(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Start(tx))
            .map_err(|_| EngineError::EngineGone)?;
        rx.await.map_err(|_| EngineError::EngineGone)?
    }

    /// Stop the engine. Synchronous-complete: best-effort closes the
    /// downstream connection and every registered sender, then transitions
    /// to `Stopped`. Idempotent.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Ensure `receiver` has a live downstream sender, reusing an open one
    /// if already registered (§4.4).
    pub async fn on_client_attach(&self, receiver: Arc<dyn UpstreamReceiver>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Attach { receiver, resp: tx })
            .map_err(|_| EngineError::EngineGone)?;
        rx.await.map_err(|_| EngineError::EngineGone)?
    }

    /// Idempotent. Removes `receiver` from the registry and closes its
    /// sender if it was still open.
    pub fn on_client_detach(&self, receiver: Arc<dyn UpstreamReceiver>) {
        let _ = self.commands.send(Command::Detach { receiver });
    }

    /// Idempotent. Detaches every receiver of `connection_id` and closes
    /// each formerly associated open sender.
    pub fn on_client_disconnect(&self, connection_id: impl Into<String>) {
        let _ = self.commands.send(Command::Disconnect {
            connection_id: connection_id.into(),
        });
    }

    /// Apply the decision table of §4.4 to an inbound message.
    pub async fn process_message(
        &self,
        receiver: Arc<dyn UpstreamReceiver>,
        delivery: Box<dyn Delivery>,
        message: OutboundMessage,
    ) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ProcessMessage {
                receiver,
                delivery,
                message,
                resp: tx,
            })
            .map_err(|_| EngineError::EngineGone)?;
        rx.await.map_err(|_| EngineError::EngineGone)?
    }
}

/// Spawns and owns the engine's single-threaded event loop.
///
/// All engine state (connection handle, link registry, lifecycle state) is
/// confined to the task this spawns; every collaborator callback re-enters
/// through the same command channel so no locking is required (§5).
#[derive(Debug)]
pub struct ForwardingEngine;

impl ForwardingEngine {
    /// Construct and spawn the engine's event loop, returning a handle to it.
    pub fn spawn(
        config: AdapterConfig,
        connector: Arc<dyn DownstreamConnector>,
        factory: Arc<dyn SenderFactory>,
        qos_policy: Arc<dyn QosPolicy>,
    ) -> ForwardingEngineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            state: LifecycleState::Created,
            config,
            connector,
            factory,
            qos_policy,
            registry: LinkRegistry::new(),
            connection: None,
            commands: rx,
            command_tx: tx.clone(),
            reconnect_attempts_remaining: None,
            reconnect_timer: None,
            pending_start_resp: None,
        };
        tokio::spawn(actor.run());
        ForwardingEngineHandle { commands: tx }
    }
}

struct Actor {
    state: LifecycleState,
    config: AdapterConfig,
    connector: Arc<dyn DownstreamConnector>,
    factory: Arc<dyn SenderFactory>,
    qos_policy: Arc<dyn QosPolicy>,
    registry: LinkRegistry,
    connection: Option<Arc<dyn DownstreamConnection>>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    reconnect_attempts_remaining: Option<i64>,
    reconnect_timer: Option<tokio::task::JoinHandle<()>>,
    pending_start_resp: Option<oneshot::Sender<Result<(), EngineError>>>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command).await;
            if matches!(self.state, LifecycleState::Stopped) {
                // Drain remaining in-flight commands so their responders
                // observe an explicit answer instead of a dropped channel,
                // then exit: no engine state may be touched after this.
                while let Ok(command) = self.commands.try_recv() {
                    self.reject_while_stopped(command);
                }
                break;
            }
        }
    }

    fn reject_while_stopped(&self, command: Command) {
        match command {
            Command::Start(resp) => {
                let _ = resp.send(Err(EngineError::NotStarted));
            }
            Command::Attach { resp, .. } => {
                let _ = resp.send(Err(EngineError::NotStarted));
            }
            Command::ProcessMessage { resp, .. } => {
                let _ = resp.send(Err(EngineError::NotStarted));
            }
            Command::Stop(resp) => {
                let _ = resp.send(());
            }
            _ => {}
        }
    }

    #[instrument(skip(self, command))]
    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start(resp) => self.handle_start(resp).await,
            Command::Stop(resp) => self.handle_stop(resp).await,
            Command::Attach { receiver, resp } => self.handle_attach(receiver, resp).await,
            Command::Detach { receiver } => self.handle_detach(receiver).await,
            Command::Disconnect { connection_id } => self.handle_disconnect(connection_id).await,
            Command::ProcessMessage {
                receiver,
                delivery,
                message,
                resp,
            } => self.handle_process_message(receiver, delivery, message, resp).await,
            Command::Flow { key } => self.handle_flow(key).await,
            Command::ConnectResult(result) => self.handle_connect_result(result).await,
            Command::ConnectorEvent(event) => self.handle_connector_event(event).await,
            Command::ReconnectTimerFired => self.handle_reconnect_timer_fired().await,
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout_ms: self.config.connect_timeout_ms,
            reconnect_attempts: self.config.reconnect_attempts,
            reconnect_interval_ms: self.config.reconnect_interval_ms,
        }
    }

    /// Spawn the connect attempt in the background; its result re-enters the
    /// event loop as [`Command::ConnectResult`] (§5 suspension points).
    fn spawn_connect(&self) {
        let connector = self.connector.clone();
        let options = self.connect_options();
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(options).await;
            let _ = tx.send(Command::ConnectResult(result));
        });
    }

    async fn handle_start(&mut self, resp: oneshot::Sender<Result<(), EngineError>>) {
        if self.state == LifecycleState::Running {
            let _ = resp.send(Ok(()));
            return;
        }

        info!("forwarding engine starting");
        self.state = LifecycleState::Starting;
        self.reset_reconnect_budget();
        self.spawn_connect();

        if self.config.wait_for_downstream_connection_enabled {
            self.pending_start_resp = Some(resp);
        } else {
            self.state = LifecycleState::Running;
            let _ = resp.send(Ok(()));
        }
    }

    async fn handle_stop(&mut self, resp: oneshot::Sender<()>) {
        if self.state == LifecycleState::Stopped {
            let _ = resp.send(());
            return;
        }

        info!("forwarding engine stopping");
        self.state = LifecycleState::Stopped;

        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(pending) = self.pending_start_resp.take() {
            let _ = pending.send(Err(EngineError::NotStarted));
        }

        for (_receiver, sender) in self.registry.clear() {
            if sender.is_open() {
                sender.close().await;
            }
        }

        if self.connection.take().is_some() {
            self.connector.close().await;
        }

        let _ = resp.send(());
    }

    #[instrument(skip(self, receiver, resp), fields(connection_id = receiver.connection_id(), link_id = receiver.link_id()))]
    async fn handle_attach(
        &mut self,
        receiver: Arc<dyn UpstreamReceiver>,
        resp: oneshot::Sender<Result<(), EngineError>>,
    ) {
        if self.state != LifecycleState::Running {
            let _ = resp.send(Err(EngineError::NotStarted));
            return;
        }

        if let Some(sender) = self.registry.get(receiver.as_ref()) {
            if sender.is_open() {
                let _ = resp.send(Ok(()));
                return;
            }
            // Stale entry for a sender that closed without us hearing about
            // it; drop it and fall through to create a fresh one.
            self.registry.remove(receiver.as_ref());
        }

        let connection = match self.connection.as_ref() {
            Some(connection) if self.connector.is_connected() => connection.clone(),
            _ => {
                let _ = resp.send(Err(EngineError::ConnectionNotOpen));
                return;
            }
        };

        let key = ReceiverKey::of(receiver.as_ref());
        let handler: CreditReplenishHandler = {
            let tx = self.command_tx.clone();
            let key = key.clone();
            Arc::new(move || {
                let _ = tx.send(Command::Flow { key: key.clone() });
            })
        };

        match self
            .factory
            .create_sender(
                connection.as_ref(),
                receiver.target_address(),
                self.config.path_separator,
                self.qos_policy.qos(),
                handler,
            )
            .await
        {
            Ok(sender) => {
                debug!(target_address = receiver.target_address(), "attached downstream sender");
                // Grant an initial credit window rather than waiting for the
                // first FLOW, so a producer isn't stalled if it is delayed.
                let initial_credit = available_downstream_credit(sender.as_ref());
                self.registry.add(receiver.clone(), sender);
                let _ = resp.send(Ok(()));
                tokio::spawn(async move { receiver.replenish(initial_credit).await });
            }
            Err(error) => {
                warn!(%error, "sender creation failed");
                self.registry.remove(receiver.as_ref());
                let _ = resp.send(Err(error.into()));
            }
        }
    }

    async fn handle_detach(&mut self, receiver: Arc<dyn UpstreamReceiver>) {
        if self.state != LifecycleState::Running {
            return;
        }
        if let Some(sender) = self.registry.remove(receiver.as_ref()) {
            if sender.is_open() {
                sender.close().await;
            }
        }
    }

    async fn handle_disconnect(&mut self, connection_id: String) {
        if self.state != LifecycleState::Running {
            return;
        }
        for (_receiver, sender) in self.registry.remove_connection(&connection_id) {
            if sender.is_open() {
                sender.close().await;
            }
        }
    }

    async fn handle_process_message(
        &mut self,
        receiver: Arc<dyn UpstreamReceiver>,
        delivery: Box<dyn Delivery>,
        message: OutboundMessage,
        resp: oneshot::Sender<Result<(), EngineError>>,
    ) {
        if self.state != LifecycleState::Running {
            let _ = resp.send(Err(EngineError::NotStarted));
            return;
        }

        let sender = match self.registry.get(receiver.as_ref()) {
            Some(sender) => sender,
            None => {
                receiver.close(ErrorCondition::NoDownstreamConsumer).await;
                let _ = resp.send(Ok(()));
                return;
            }
        };

        if !sender.is_open() {
            receiver.close(ErrorCondition::NoDownstreamConsumer).await;
            self.registry.remove(receiver.as_ref());
            let _ = resp.send(Ok(()));
            return;
        }

        if sender.credit() == 0 {
            if delivery.is_remotely_settled() {
                delivery.accept().await;
            } else {
                delivery.release().await;
            }
            let _ = resp.send(Ok(()));
            return;
        }

        let grant = available_downstream_credit(sender.as_ref());
        receiver.replenish(grant).await;
        self.qos_policy.forward_message(sender.as_ref(), message, delivery).await;
        let _ = resp.send(Ok(()));
    }

    async fn handle_flow(&mut self, key: ReceiverKey) {
        if self.state != LifecycleState::Running {
            return;
        }
        let Some((receiver, sender)) = self.registry.get_by_key(&key) else {
            return;
        };

        if sender.drain_requested() {
            let timeout = Duration::from_millis(self.config.drain_timeout_ms);
            tokio::spawn(async move {
                if receiver.drain(timeout).await.is_ok() {
                    sender.mark_drained();
                }
                // Timeout or failure completes naturally; the next FLOW
                // reconciles credit (§4.4, §5).
            });
        } else {
            let grant = available_downstream_credit(sender.as_ref());
            tokio::spawn(async move { receiver.replenish(grant).await });
        }
    }

    async fn handle_connect_result(&mut self, result: ConnectOutcome) {
        match result {
            Ok((connection, events)) => {
                info!(connection_id = connection.id(), "downstream connected");
                self.connection = Some(connection);
                self.reset_reconnect_budget();

                let tx = self.command_tx.clone();
                let mut events = events;
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if tx.send(Command::ConnectorEvent(event)).is_err() {
                            break;
                        }
                    }
                });

                if self.state == LifecycleState::Starting {
                    self.state = LifecycleState::Running;
                }
                if let Some(resp) = self.pending_start_resp.take() {
                    let _ = resp.send(Ok(()));
                }
            }
            Err(error) => {
                warn!(%error, "downstream connect failed");
                if let Some(resp) = self.pending_start_resp.take() {
                    self.state = LifecycleState::Stopped;
                    let _ = resp.send(Err(error.into()));
                } else {
                    self.maybe_schedule_reconnect();
                }
            }
        }
    }

    async fn handle_connector_event(&mut self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::RemoteClose => {
                warn!("downstream peer sent close, closing connection");
                self.connector.close().await;
                // The connector's own close triggers a subsequent
                // `Disconnected` event on the same channel (§4.1).
            }
            ConnectorEvent::Disconnected => self.run_disconnect_recovery().await,
        }
    }

    /// §4.4 disconnect recovery procedure.
    async fn run_disconnect_recovery(&mut self) {
        if self.state != LifecycleState::Running {
            return;
        }
        warn!("downstream connection lost, closing upstream receivers");

        for (receiver, _sender) in self.registry.clear() {
            receiver.close(ErrorCondition::NoDownstreamConsumer).await;
        }
        self.connection = None;

        self.maybe_schedule_reconnect();
    }

    fn maybe_schedule_reconnect(&mut self) {
        if !self.config.reconnect_enabled() {
            return;
        }
        if let Some(remaining) = self.reconnect_attempts_remaining {
            if remaining <= 0 {
                warn!("reconnect attempts exhausted, giving up");
                return;
            }
            self.reconnect_attempts_remaining = Some(remaining - 1);
        }
        if self.reconnect_timer.is_some() {
            // At most one outstanding reconnect timer per disconnect event (§9).
            return;
        }

        let tx = self.command_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(DISCONNECT_RECONNECT_DELAY_MS)).await;
            let _ = tx.send(Command::ReconnectTimerFired);
        }));
    }

    async fn handle_reconnect_timer_fired(&mut self) {
        self.reconnect_timer = None;
        if self.state != LifecycleState::Running && self.state != LifecycleState::Starting {
            return;
        }
        self.spawn_connect();
    }

    fn reset_reconnect_budget(&mut self) {
        self.reconnect_attempts_remaining = if self.config.reconnect_unlimited() {
            None
        } else {
            Some(self.config.reconnect_attempts.max(0))
        };
    }
}

#[cfg(test)]
mod tests;
