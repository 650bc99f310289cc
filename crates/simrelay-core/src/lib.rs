//! `simrelay` Core Library
//!
//! Shared functionality for `simrelay` components:
//! - Event model and its JSON wire shape
//! - Line decoding of raw process output into events
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod tracing_init;

pub use config::Config;
pub use decoder::LineDecoder;
pub use error::{Error, Result};
pub use event::{Channel, Event};
