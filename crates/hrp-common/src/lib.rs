//! Common types shared across the hub relay stack.
//!
//! This crate provides:
//! - JSON wire messages for the client channel ([`message`])
//! - Signed access-token claims and validation ([`token`])
//! - Publish targets and resource paths ([`types`])
//! - Delivery reports returned to publishers ([`report`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod message;
pub mod report;
pub mod token;
pub mod types;

pub use token::AuthError;
pub use types::ConnectionId;
