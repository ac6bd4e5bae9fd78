//! Versioned desired-state store and its watch feed.

pub mod client;
pub mod watch;
