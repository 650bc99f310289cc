//! simrelay Daemon Library
//!
//! Core functionality for the simrelay daemon:
//! - Supervision of the external simulation process
//! - Broadcast hub fanning events out to live subscribers
//! - HTTP/SSE server for clients
pub mod hub;
pub mod server;
pub mod supervisor;
