#![deny(missing_debug_implementations)]

//! Protocol-level forwarding adapter between many upstream AMQP 1.0 producer
//! links and a single downstream AMQP 1.0 container.
//!
//! For each upstream producer link, [`ForwardingEngine`](engine::ForwardingEngine)
//! multiplexes messages onto a corresponding downstream sender link,
//! propagates credit and drain end-to-end, and settles deliveries according
//! to the configured [`QosPolicy`](qos::QosPolicy).
//!
//! The server-side listener that accepts upstream connections, endpoint
//! routing by address, configuration loading, and TLS/port binding are all
//! external collaborators and are not part of this crate.

pub mod address;
pub mod config;
pub mod connector;
pub mod downstream;
pub mod engine;
pub mod error;
pub mod qos;
pub mod registry;
pub mod sender_factory;
pub mod upstream;

pub use config::AdapterConfig;
pub use engine::{ForwardingEngine, ForwardingEngineHandle};
pub use error::{EngineError, ErrorCondition};
pub use qos::{EventPolicy, Qos, QosPolicy, TelemetryPolicy};
pub use upstream::{Delivery, OutboundMessage, UpstreamReceiver};
