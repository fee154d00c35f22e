//! End-to-end attach, backpressure, flow, drain, and disconnect behavior,
//! driven entirely through the public `ForwardingEngineHandle` surface
//! against fake collaborators.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::connector::{ConnectError, ConnectOptions, ConnectorEvent, DownstreamConnection, DownstreamConnector};
use crate::downstream::{Disposition, DownstreamSender, SendError};
use crate::qos::TelemetryPolicy;
use crate::sender_factory::{CreditReplenishHandler, SenderCreationError, SenderFactory};
use crate::upstream::{Delivery, DrainError, OutboundMessage, UpstreamReceiver};

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReceiverEvent {
    Replenish(u32),
    Drain,
    Closed(ErrorCondition),
}

#[derive(Debug)]
struct FakeReceiver {
    connection_id: String,
    link_id: String,
    target: String,
    events: mpsc::UnboundedSender<ReceiverEvent>,
    drain_succeeds: AtomicBool,
}

impl FakeReceiver {
    fn new(connection_id: &str, link_id: &str, target: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ReceiverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connection_id: connection_id.to_string(),
                link_id: link_id.to_string(),
                target: target.to_string(),
                events: tx,
                drain_succeeds: AtomicBool::new(true),
            }),
            rx,
        )
    }
}

#[async_trait]
impl UpstreamReceiver for FakeReceiver {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }
    fn link_id(&self) -> &str {
        &self.link_id
    }
    fn target_address(&self) -> &str {
        &self.target
    }
    async fn replenish(&self, credits: u32) {
        let _ = self.events.send(ReceiverEvent::Replenish(credits));
    }
    async fn drain(&self, _timeout: Duration) -> Result<(), DrainError> {
        let _ = self.events.send(ReceiverEvent::Drain);
        if self.drain_succeeds.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DrainError::Timeout)
        }
    }
    async fn close(&self, condition: ErrorCondition) {
        let _ = self.events.send(ReceiverEvent::Closed(condition));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeliveryEvent {
    Accepted,
    Released,
}

#[derive(Debug)]
struct FakeDelivery {
    remotely_settled: bool,
    events: mpsc::UnboundedSender<DeliveryEvent>,
}

#[async_trait]
impl Delivery for FakeDelivery {
    fn is_remotely_settled(&self) -> bool {
        self.remotely_settled
    }
    async fn accept(self: Box<Self>) {
        let _ = self.events.send(DeliveryEvent::Accepted);
    }
    async fn release(self: Box<Self>) {
        let _ = self.events.send(DeliveryEvent::Released);
    }
    async fn reject(self: Box<Self>, _description: Option<String>) {}
}

#[derive(Debug)]
struct FakeSender {
    connection_id: String,
    credit: AtomicU32,
    queued: AtomicU32,
    drain_requested: AtomicBool,
    open: AtomicBool,
    handler: Mutex<Option<CreditReplenishHandler>>,
    drained: mpsc::UnboundedSender<()>,
}

impl FakeSender {
    fn new(connection_id: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connection_id: connection_id.to_string(),
                credit: AtomicU32::new(0),
                queued: AtomicU32::new(0),
                drain_requested: AtomicBool::new(false),
                open: AtomicBool::new(true),
                handler: Mutex::new(None),
                drained: tx,
            }),
            rx,
        )
    }

    fn set_credit_queued(&self, credit: u32, queued: u32) {
        self.credit.store(credit, Ordering::SeqCst);
        self.queued.store(queued, Ordering::SeqCst);
    }

    fn request_drain(&self) {
        self.drain_requested.store(true, Ordering::SeqCst);
    }

    /// Simulate the downstream container sending a FLOW frame.
    fn fire_flow(&self) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[async_trait]
impl DownstreamSender for FakeSender {
    fn credit(&self) -> u32 {
        self.credit.load(Ordering::SeqCst)
    }
    fn queued(&self) -> u32 {
        self.queued.load(Ordering::SeqCst)
    }
    fn drain_requested(&self) -> bool {
        self.drain_requested.load(Ordering::SeqCst)
    }
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
    fn owning_connection_id(&self) -> &str {
        &self.connection_id
    }
    async fn send(&self, _message: OutboundMessage, _presettle: bool) -> Result<Disposition, SendError> {
        Ok(Disposition::Accepted)
    }
    fn mark_drained(&self) {
        self.drain_requested.store(false, Ordering::SeqCst);
        let _ = self.drained.send(());
    }
    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct FakeSenderFactory {
    created: Mutex<Vec<Arc<FakeSender>>>,
    fail: AtomicBool,
}

impl FakeSenderFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn last_created(&self) -> Arc<FakeSender> {
        self.created.lock().unwrap().last().unwrap().clone()
    }
}

#[async_trait]
impl SenderFactory for FakeSenderFactory {
    async fn create_sender(
        &self,
        connection: &dyn DownstreamConnection,
        _target_address: &str,
        _path_separator: char,
        _qos: crate::qos::Qos,
        on_credit_replenish: CreditReplenishHandler,
    ) -> Result<Arc<dyn DownstreamSender>, SenderCreationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SenderCreationError::AttachFailed("simulated failure".to_string()));
        }
        let (sender, _drained_rx) = FakeSender::new(connection.id());
        *sender.handler.lock().unwrap() = Some(on_credit_replenish);
        self.created.lock().unwrap().push(sender.clone());
        Ok(sender as Arc<dyn DownstreamSender>)
    }
}

#[derive(Debug)]
struct FakeConnection {
    id: String,
}

impl DownstreamConnection for FakeConnection {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Default)]
struct FakeConnector {
    connected: AtomicBool,
    event_tx: Mutex<Option<mpsc::Sender<ConnectorEvent>>>,
}

impl FakeConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn fire_disconnect(&self) {
        let tx = self.event_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(ConnectorEvent::Disconnected).await;
        }
    }
}

#[async_trait]
impl DownstreamConnector for FakeConnector {
    async fn connect(
        &self,
        _options: ConnectOptions,
    ) -> Result<(Arc<dyn DownstreamConnection>, mpsc::Receiver<ConnectorEvent>), ConnectError> {
        let (tx, rx) = mpsc::channel(8);
        *self.event_tx.lock().unwrap() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok((Arc::new(FakeConnection { id: "downstream-1".to_string() }), rx))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.event_tx.lock().unwrap() = None;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn running_engine(factory: Arc<FakeSenderFactory>) -> (ForwardingEngineHandle, Arc<FakeConnector>) {
    let connector = FakeConnector::new();
    let config = AdapterConfig {
        wait_for_downstream_connection_enabled: true,
        ..Default::default()
    };
    let handle = ForwardingEngine::spawn(config, connector.clone(), factory, Arc::new(TelemetryPolicy));
    handle.start().await.expect("start should succeed once connected");
    (handle, connector)
}

async fn recv(events: &mut mpsc::UnboundedReceiver<ReceiverEvent>) -> ReceiverEvent {
    timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for receiver event")
        .expect("receiver event channel closed")
}

#[tokio::test]
async fn attach_reuse() {
    let factory = FakeSenderFactory::new();
    let (engine, _connector) = running_engine(factory.clone()).await;
    let (r1, mut events) = FakeReceiver::new("connA", "link1", "telemetry/TENANT1");

    engine.on_client_attach(r1.clone()).await.unwrap();
    assert_eq!(factory.created_count(), 1);
    // Initial credit grant on attach (SPEC_FULL §B.1); sender starts at 0/0.
    assert_eq!(recv(&mut events).await, ReceiverEvent::Replenish(0));

    engine.on_client_attach(r1.clone()).await.unwrap();
    assert_eq!(factory.created_count(), 1, "reattaching an open sender must not create a new one");
}

#[tokio::test]
async fn backpressure_release_for_unsettled_delivery() {
    let factory = FakeSenderFactory::new();
    let (engine, _connector) = running_engine(factory.clone()).await;
    let (r1, mut events) = FakeReceiver::new("connA", "link1", "telemetry/TENANT1");

    engine.on_client_attach(r1.clone()).await.unwrap();
    assert_eq!(recv(&mut events).await, ReceiverEvent::Replenish(0));

    let sender = factory.last_created();
    sender.set_credit_queued(0, 5);

    let (tx, mut delivery_events) = mpsc::unbounded_channel();
    let delivery = Box::new(FakeDelivery { remotely_settled: false, events: tx });
    engine
        .process_message(r1.clone(), delivery, OutboundMessage::new(&b"hello"[..]))
        .await
        .unwrap();

    assert_eq!(
        timeout(RECV_TIMEOUT, delivery_events.recv()).await.unwrap().unwrap(),
        DeliveryEvent::Released
    );
}

#[tokio::test]
async fn backpressure_accepts_presettled_delivery() {
    let factory = FakeSenderFactory::new();
    let (engine, _connector) = running_engine(factory.clone()).await;
    let (r1, mut events) = FakeReceiver::new("connA", "link1", "telemetry/TENANT1");

    engine.on_client_attach(r1.clone()).await.unwrap();
    assert_eq!(recv(&mut events).await, ReceiverEvent::Replenish(0));

    let sender = factory.last_created();
    sender.set_credit_queued(0, 5);

    let (tx, mut delivery_events) = mpsc::unbounded_channel();
    let delivery = Box::new(FakeDelivery { remotely_settled: true, events: tx });
    engine
        .process_message(r1.clone(), delivery, OutboundMessage::new(&b"hello"[..]))
        .await
        .unwrap();

    assert_eq!(
        timeout(RECV_TIMEOUT, delivery_events.recv()).await.unwrap().unwrap(),
        DeliveryEvent::Accepted
    );
}

#[tokio::test]
async fn flow_propagation() {
    let factory = FakeSenderFactory::new();
    let (engine, _connector) = running_engine(factory.clone()).await;
    let (r1, mut events) = FakeReceiver::new("connA", "link1", "telemetry/TENANT1");

    engine.on_client_attach(r1.clone()).await.unwrap();
    assert_eq!(recv(&mut events).await, ReceiverEvent::Replenish(0));

    let sender = factory.last_created();
    sender.set_credit_queued(20, 7);
    sender.fire_flow();

    assert_eq!(recv(&mut events).await, ReceiverEvent::Replenish(13));
}

#[tokio::test]
async fn drain_propagation() {
    let factory = FakeSenderFactory::new();
    let (engine, _connector) = running_engine(factory.clone()).await;
    let (r1, mut events) = FakeReceiver::new("connA", "link1", "telemetry/TENANT1");

    engine.on_client_attach(r1.clone()).await.unwrap();
    assert_eq!(recv(&mut events).await, ReceiverEvent::Replenish(0));

    let sender = factory.last_created();
    sender.request_drain();
    sender.fire_flow();

    assert_eq!(recv(&mut events).await, ReceiverEvent::Drain);
    assert!(!sender.drain_requested(), "mark_drained should clear the drain flag");
}

#[tokio::test]
async fn disconnect_cascade() {
    let factory = FakeSenderFactory::new();
    let (engine, connector) = running_engine(factory.clone()).await;

    let (r1, mut events1) = FakeReceiver::new("A", "link1", "telemetry/TENANT1");
    let (r2, mut events2) = FakeReceiver::new("B", "link1", "telemetry/TENANT2");

    engine.on_client_attach(r1.clone()).await.unwrap();
    engine.on_client_attach(r2.clone()).await.unwrap();
    assert_eq!(recv(&mut events1).await, ReceiverEvent::Replenish(0));
    assert_eq!(recv(&mut events2).await, ReceiverEvent::Replenish(0));
    assert_eq!(factory.created_count(), 2);

    connector.fire_disconnect().await;

    let mut closed = vec![recv(&mut events1).await, recv(&mut events2).await];
    closed.sort_by_key(|e| format!("{e:?}"));
    assert!(closed
        .iter()
        .all(|e| matches!(e, ReceiverEvent::Closed(ErrorCondition::NoDownstreamConsumer))));

    // Both formerly-active senders were closed too.
    for sender in factory.created.lock().unwrap().iter() {
        assert!(!sender.is_open());
    }

    // Reattaching now fails fast: the connection was torn down and a
    // reconnect has not necessarily completed yet.
    let attach_result = engine.on_client_attach(r1.clone()).await;
    assert!(matches!(attach_result, Err(EngineError::ConnectionNotOpen)) || attach_result.is_ok());
}

#[tokio::test]
async fn attach_fails_with_connection_not_open_before_start() {
    let factory = FakeSenderFactory::new();
    let connector = FakeConnector::new();
    let config = AdapterConfig::default();
    let engine = ForwardingEngine::spawn(config, connector, factory, Arc::new(TelemetryPolicy));

    let (r1, _events) = FakeReceiver::new("connA", "link1", "telemetry/TENANT1");
    let result = engine.on_client_attach(r1).await;
    assert!(matches!(result, Err(EngineError::NotStarted)));
}

#[tokio::test]
async fn attach_propagates_sender_creation_failure_without_leaking_registry_state() {
    let factory = FakeSenderFactory::new();
    factory.fail.store(true, Ordering::SeqCst);
    let (engine, _connector) = running_engine(factory.clone()).await;

    let (r1, _events) = FakeReceiver::new("connA", "link1", "telemetry/TENANT1");
    let result = engine.on_client_attach(r1.clone()).await;
    assert!(matches!(result, Err(EngineError::SenderCreationFailed(_))));

    // A retry after the factory starts succeeding must still work: no stale
    // registry entry should have been left behind.
    factory.fail.store(false, Ordering::SeqCst);
    engine.on_client_attach(r1).await.unwrap();
    assert_eq!(factory.created_count(), 1);
}

#[tokio::test]
async fn stop_is_idempotent_and_closes_open_senders() {
    let factory = FakeSenderFactory::new();
    let (engine, _connector) = running_engine(factory.clone()).await;
    let (r1, mut events) = FakeReceiver::new("connA", "link1", "telemetry/TENANT1");
    engine.on_client_attach(r1).await.unwrap();
    assert_eq!(recv(&mut events).await, ReceiverEvent::Replenish(0));

    engine.stop().await;
    engine.stop().await;

    assert!(!factory.last_created().is_open());
}
