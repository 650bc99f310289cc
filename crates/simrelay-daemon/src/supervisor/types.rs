//! Supervisor types.

use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;

/// Acknowledgment returned by `start` and `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub message: String,
}

impl Ack {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The running session. Its absence means the supervisor is idle.
#[derive(Debug)]
pub(crate) struct ActiveSession {
    /// Monotonic token distinguishing this spawn from earlier ones.
    pub token: u64,
    pub target: String,
    pub started_at: Instant,
    /// Requests for the exit monitor, which owns the child handle.
    pub control: mpsc::UnboundedSender<Control>,
    pub stop_requested: bool,
    /// The process has been reaped; output is still draining.
    pub exited: bool,
}

/// Signal request handled by the exit monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Graceful shutdown request (SIGINT on unix).
    Interrupt,
    Kill,
}

/// Errors from supervisor commands.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("a run is already in progress")]
    Conflict { target: String },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}
