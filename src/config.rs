//! Adapter configuration (§6.4).
//!
//! Loading these values from a file or environment is the embedding
//! binary's responsibility; this crate only defines the recognized options
//! and their defaults.

/// Configuration recognized by the forwarding adapter.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// When `true`, [`ForwardingEngineHandle::start`](crate::engine::ForwardingEngineHandle::start)
    /// completes only after the first successful downstream connect.
    pub wait_for_downstream_connection_enabled: bool,

    /// Character used to replace `/` in the rewritten downstream address.
    pub path_separator: char,

    /// Downstream AMQP connect timeout, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Maximum number of reconnect attempts. `-1` means unlimited, `0`
    /// disables reconnection entirely.
    pub reconnect_attempts: i64,

    /// Spacing between the connector's own internal connect retries, in
    /// milliseconds. Distinct from the fixed one-shot timer the engine arms
    /// after a disconnect (§4.4, §5), which is not configurable.
    pub reconnect_interval_ms: u64,

    /// Upstream drain deadline, in milliseconds.
    pub drain_timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            wait_for_downstream_connection_enabled: false,
            path_separator: '/',
            connect_timeout_ms: 100,
            reconnect_attempts: -1,
            reconnect_interval_ms: 200,
            drain_timeout_ms: 10_000,
        }
    }
}

impl AdapterConfig {
    /// `true` if reconnection is not disabled (`reconnect_attempts != 0`).
    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect_attempts != 0
    }

    /// `true` if the reconnect attempt budget is unbounded.
    pub fn reconnect_unlimited(&self) -> bool {
        self.reconnect_attempts < 0
    }
}
