//! Connection registry: live connections and their group/user indexes.
//!
//! The registry is the only shared mutable state in the server. It is
//! sharded three ways (connections, groups, users) so membership lookups
//! during dispatch do not serialize against connection churn. Cross-map
//! operations never hold a guard on one map while touching another; handles
//! are cloned out first. Snapshot reads (`members_of`, `by_user`) filter
//! against the live connection map, so a reader can never observe an id
//! whose connection has already been unregistered.

use dashmap::DashMap;
use hrp_common::ConnectionId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::outbound::{CloseReason, OutboundQueue};

/// Errors from registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection id is not (or no longer) registered.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    /// The registry is at its configured capacity.
    #[error("connection capacity exceeded ({0})")]
    CapacityExceeded(usize),
}

/// Handle held in the registry — everything dispatch needs to reach a
/// connection.
#[derive(Debug)]
pub struct ConnHandle {
    /// Process-unique connection id.
    pub id: ConnectionId,
    /// User identity from the connection token's subject claim, if any.
    pub user: Option<String>,
    /// Outbound frame queue drained by the connection's writer.
    pub queue: Arc<OutboundQueue>,
    /// Instant the connection was registered.
    pub registered_at: Instant,
    groups: Mutex<HashSet<String>>,
}

impl ConnHandle {
    fn new(id: ConnectionId, user: Option<String>, queue: Arc<OutboundQueue>) -> Self {
        Self {
            id,
            user,
            queue,
            registered_at: Instant::now(),
            groups: Mutex::new(HashSet::new()),
        }
    }

    /// Snapshot of the groups this connection has joined.
    #[must_use]
    pub fn joined_groups(&self) -> Vec<String> {
        self.groups.lock().iter().cloned().collect()
    }
}

/// Concurrent registry of live connections with group and user indexes.
#[derive(Debug)]
pub struct Registry {
    connections: DashMap<ConnectionId, Arc<ConnHandle>>,
    groups: DashMap<String, HashSet<ConnectionId>>,
    users: DashMap<String, HashSet<ConnectionId>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Registry {
    /// Creates an empty registry admitting at most `capacity` connections.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            groups: DashMap::new(),
            users: DashMap::new(),
            next_id: AtomicU64::new(0),
            capacity,
        }
    }

    /// Registers a connection, allocating a fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityExceeded`] when at capacity.
    pub fn register(
        &self,
        user: Option<String>,
        queue: Arc<OutboundQueue>,
    ) -> Result<Arc<ConnHandle>, RegistryError> {
        if self.connections.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded(self.capacity));
        }
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = Arc::new(ConnHandle::new(id, user, queue));
        let _ = self.connections.insert(id, Arc::clone(&handle));
        if let Some(user) = &handle.user {
            self.users
                .entry(user.clone())
                .or_default()
                .insert(id);
            // An unregister racing this insert may already have pruned the
            // user index; undo the insert so the entry cannot leak.
            if !self.connections.contains_key(&id) {
                remove_member(&self.users, user, id);
            }
        }
        Ok(handle)
    }

    /// Unregisters a connection and prunes it from every index.
    ///
    /// Idempotent: unknown ids are a no-op. Closes the connection's outbound
    /// queue so any in-flight dispatch observes a closed transport.
    pub fn unregister(&self, id: ConnectionId) {
        let Some((_, handle)) = self.connections.remove(&id) else {
            return;
        };
        handle.queue.close(CloseReason::Closed);
        let joined: Vec<String> = {
            let mut groups = handle.groups.lock();
            groups.drain().collect()
        };
        for group in &joined {
            remove_member(&self.groups, group, id);
        }
        if let Some(user) = &handle.user {
            remove_member(&self.users, user, id);
        }
    }

    /// Adds a connection to a group, creating the group on first join.
    ///
    /// Idempotent for existing members.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownConnection`] if the id is not
    /// registered.
    pub fn join_group(&self, id: ConnectionId, group: &str) -> Result<(), RegistryError> {
        let handle = self.handle(id).ok_or(RegistryError::UnknownConnection(id))?;
        {
            let mut groups = handle.groups.lock();
            let _ = groups.insert(group.to_string());
        }
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(id);
        // An unregister racing this join may have drained the handle's group
        // set before our index insert landed; undo it so the group entry is
        // still garbage-collected.
        if !self.connections.contains_key(&id) {
            remove_member(&self.groups, group, id);
            return Err(RegistryError::UnknownConnection(id));
        }
        Ok(())
    }

    /// Removes a connection from a group.
    ///
    /// Idempotent: leaving a group the connection is not a member of is a
    /// no-op. The group is removed once its membership becomes empty.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownConnection`] if the id is not
    /// registered.
    pub fn leave_group(&self, id: ConnectionId, group: &str) -> Result<(), RegistryError> {
        let handle = self.handle(id).ok_or(RegistryError::UnknownConnection(id))?;
        {
            let mut groups = handle.groups.lock();
            let _ = groups.remove(group);
        }
        remove_member(&self.groups, group, id);
        Ok(())
    }

    /// Snapshot of a group's live members. Unknown groups yield an empty set.
    #[must_use]
    pub fn members_of(&self, group: &str) -> HashSet<ConnectionId> {
        let ids: Vec<ConnectionId> = match self.groups.get(group) {
            Some(members) => members.iter().copied().collect(),
            None => return HashSet::new(),
        };
        ids.into_iter()
            .filter(|id| self.connections.contains_key(id))
            .collect()
    }

    /// Snapshot of a user's live connections.
    #[must_use]
    pub fn by_user(&self, user: &str) -> HashSet<ConnectionId> {
        let ids: Vec<ConnectionId> = match self.users.get(user) {
            Some(conns) => conns.iter().copied().collect(),
            None => return HashSet::new(),
        };
        ids.into_iter()
            .filter(|id| self.connections.contains_key(id))
            .collect()
    }

    /// Snapshot of every registered connection id.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Looks up a connection handle by id.
    #[must_use]
    pub fn handle(&self, id: ConnectionId) -> Option<Arc<ConnHandle>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Names of all currently existing groups.
    #[must_use]
    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Removes `id` from the named index entry and garbage-collects the entry
/// once empty.
fn remove_member(map: &DashMap<String, HashSet<ConnectionId>>, key: &str, id: ConnectionId) {
    if let Some(mut members) = map.get_mut(key) {
        let _ = members.remove(&id);
    }
    let _ = map.remove_if(key, |_, members| members.is_empty());
}
