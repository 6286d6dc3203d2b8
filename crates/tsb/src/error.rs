use thiserror::Error;

/// Errors surfaced by the timeslice-building core.
///
/// Mirrors `tsb-communication::error::QueueError` in shape: one variant per
/// failure kind named in the error-handling design, `thiserror`-derived so
/// every fallible operation that crosses a thread or process boundary can
/// return a plain `Result<_, BuilderError>`.
#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("transport failed on channel {channel}: {reason}")]
    TransportFailed { channel: usize, reason: String },

    #[error("connection rejected: {reason}")]
    ConnectionRejected { reason: String },

    #[error("backpressure full on channel {channel}")]
    BackpressureFull { channel: usize },

    #[error("item distributor backpressure: {outstanding} items outstanding")]
    DistributorBackpressure { outstanding: usize },

    #[error("protocol violation: wr_id {wr_id:#x}: {reason}")]
    ProtocolViolation { wr_id: u64, reason: String },

    #[error("allocation failed: {reason}")]
    AllocationFailed { reason: String },

    #[error("heartbeat timeout on channel {channel}")]
    HeartbeatTimeout { channel: usize },

    #[error("no worker attached to distributor")]
    WorkerAbsent,

    #[error("abort requested on channel {channel}")]
    AbortRequested { channel: usize },
}

impl BuilderError {
    /// Whether this error is recoverable without tearing down the whole
    /// builder, per the policy table in the error-handling design: only
    /// `ProtocolViolation` is fatal to the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }
}
