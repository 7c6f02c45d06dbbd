//! Hub relay server — WebSocket push gateway with an HTTP publish API.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// HTTP publish API, health, and metrics endpoints.
pub mod api;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Dispatch engine: fan-out of publish requests to live connections.
pub mod dispatch;
/// Error types for relay server operations.
pub mod error;
/// Prometheus metrics collection and health state.
pub mod metrics;
/// Per-connection bounded outbound buffer.
pub mod outbound;
/// Connection registry: live connections and their group/user indexes.
pub mod registry;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
