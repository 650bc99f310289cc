//! Event model published by the supervisor and fanned out to subscribers.
//!
//! Decoded payloads pass through untouched on the wire. Every other variant
//! is a small object discriminated by its `type` field.

use serde::{Serialize, Serializer};
use serde_json::Value;

/// Output stream a `Log` event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// A single classified unit of process output or lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A stdout line that decoded as JSON.
    Data(Value),
    /// A stdout line that failed to decode, or any stderr line.
    Log { channel: Channel, message: String },
    /// Supervisor-level failure, e.g. the process could not be spawned.
    SystemError { message: String },
    /// Terminal event of a session. `code` is `None` when the process was
    /// killed by a signal.
    SessionEnd { target: String, code: Option<i32> },
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum Wire<'a> {
    #[serde(rename = "log")]
    Log { channel: Channel, message: &'a str },
    #[serde(rename = "error_system")]
    SystemError { message: &'a str },
    #[serde(rename = "simulation_end")]
    SessionEnd { bearing: &'a str, code: Option<i32> },
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Data(payload) => payload.serialize(serializer),
            Self::Log { channel, message } => Wire::Log {
                channel: *channel,
                message,
            }
            .serialize(serializer),
            Self::SystemError { message } => Wire::SystemError { message }.serialize(serializer),
            Self::SessionEnd { target, code } => Wire::SessionEnd {
                bearing: target,
                code: *code,
            }
            .serialize(serializer),
        }
    }
}

impl Event {
    pub fn log(channel: Channel, message: impl Into<String>) -> Self {
        Self::Log {
            channel,
            message: message.into(),
        }
    }

    pub fn system_error(message: impl Into<String>) -> Self {
        Self::SystemError {
            message: message.into(),
        }
    }

    pub fn session_end(target: impl Into<String>, code: Option<i32>) -> Self {
        Self::SessionEnd {
            target: target.into(),
            code,
        }
    }

    /// Short variant name for log fields.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::Log { .. } => "log",
            Self::SystemError { .. } => "error_system",
            Self::SessionEnd { .. } => "simulation_end",
        }
    }
}
