//! Core type definitions and protocol constants for the hub relay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Query parameter carrying the client access token during the upgrade.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Opaque identifier for a registered connection.
///
/// Allocated from a process-wide counter at accept time and never reused
/// for the lifetime of the process. A reconnect always gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Target of a publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    /// Deliver to every registered connection.
    Broadcast,
    /// Deliver to every connection of one user.
    User(String),
    /// Deliver to the members of one group.
    Group(String),
}

impl PublishTarget {
    /// The HTTP resource path for this target under the given hub.
    ///
    /// This is also the exact audience a publish token must carry.
    #[must_use]
    pub fn resource_path(&self, hub: &str) -> String {
        match self {
            Self::Broadcast => format!("/hubs/{hub}"),
            Self::User(user) => format!("/hubs/{hub}/users/{user}"),
            Self::Group(group) => format!("/hubs/{hub}/groups/{group}"),
        }
    }

    /// Short label for logging and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::User(_) => "user",
            Self::Group(_) => "group",
        }
    }
}

/// The audience a client channel token must carry to connect to the hub.
#[must_use]
pub fn connect_path(hub: &str) -> String {
    format!("/hubs/{hub}/connect")
}
