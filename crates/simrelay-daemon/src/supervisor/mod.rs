//! Supervision of the external simulation process.
//!
//! At most one session runs at a time. Output and lifecycle events are
//! pushed into the hub's forwarder channel.

pub mod command;
mod manager;
mod types;

pub use manager::Supervisor;
pub use types::{Ack, SupervisorError};
