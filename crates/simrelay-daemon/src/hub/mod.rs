//! Broadcast hub.
//!
//! Keeps the set of live subscribers and fans every published event out to
//! all of them, one event at a time.

mod broadcaster;
mod types;

pub use broadcaster::BroadcastHub;
pub use types::{HubStats, Subscription};
