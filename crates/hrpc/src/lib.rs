//! Hub relay client — persistent push channel with reconnect, plus the
//! publisher half that signs tokens and POSTs publish requests.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Exponential backoff with jitter for reconnection.
pub mod backoff;
/// Persistent hub connection with an explicit reconnect state machine.
pub mod client;
/// CLI parsing and TOML configuration.
pub mod config;
/// HTTP publisher: token signing and publish requests.
pub mod publisher;
