//! Errors associated with establishing the downstream connection.

/// Failure connecting to the downstream container.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The connect attempt did not complete within `connect_timeout_ms`.
    #[error("downstream connect timed out")]
    Timeout,

    /// Transport or protocol-level failure while connecting.
    #[error("downstream connect failed: {0}")]
    Transport(String),
}
