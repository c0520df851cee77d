//! Connection Registry
//!
//! Maps connection ids to live [`Connection`] handles, grouped by a scope key:
//! the listening endpoint on the server, `()` on the client. Membership is the
//! single source of truth for whether an id is still valid for Send/Close.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::handle::Connection;
use super::types::ConnectionId;

/// Thread-safe, scope-keyed map of live connections
#[derive(Debug)]
pub struct ConnectionRegistry<K> {
    scopes: RwLock<HashMap<K, HashMap<ConnectionId, Arc<Connection>>>>,
    next_id: AtomicU64,
}

impl<K> ConnectionRegistry<K>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Hand out a fresh id; never repeats for this registry
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Add a connection under `scope`
    ///
    /// Returns `false` and leaves the registry untouched if the id is already
    /// present in that scope.
    pub fn insert(&self, scope: K, connection: Arc<Connection>) -> bool {
        let mut scopes = self.scopes.write();
        let entries = scopes.entry(scope).or_default();
        if entries.contains_key(&connection.id()) {
            return false;
        }
        entries.insert(connection.id(), connection);
        true
    }

    /// Allocate an id and insert the connection built for it in one step
    ///
    /// The write lock is held across allocation and insertion, so ids appear
    /// in the registry in the order they were issued.
    pub fn register<F, T>(&self, scope: K, build: F) -> (ConnectionId, T)
    where
        F: FnOnce(ConnectionId) -> (Arc<Connection>, T),
    {
        let mut scopes = self.scopes.write();
        let id = self.allocate_id();
        let (connection, extra) = build(id);
        debug_assert_eq!(connection.id(), id, "connection built for a different id");
        scopes.entry(scope).or_default().insert(id, connection);
        (id, extra)
    }

    pub fn lookup(&self, scope: K, id: ConnectionId) -> Option<Arc<Connection>> {
        self.scopes
            .read()
            .get(&scope)
            .and_then(|entries| entries.get(&id))
            .cloned()
    }

    /// Remove an entry; a missing entry is not an error
    pub fn remove(&self, scope: K, id: ConnectionId) -> Option<Arc<Connection>> {
        self.scopes
            .write()
            .get_mut(&scope)
            .and_then(|entries| entries.remove(&id))
    }

    /// Drop a whole scope, returning whatever was still registered in it
    pub fn remove_scope(&self, scope: K) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self
            .scopes
            .write()
            .remove(&scope)
            .map(|entries| entries.into_values().collect())
            .unwrap_or_default();
        connections.sort_by_key(|c| c.id());
        connections
    }

    /// Point-in-time copy of every entry, ordered by id
    pub fn snapshot(&self) -> Vec<(K, Arc<Connection>)> {
        let mut entries: Vec<_> = self
            .scopes
            .read()
            .iter()
            .flat_map(|(scope, entries)| {
                entries.values().map(move |c| (*scope, Arc::clone(c)))
            })
            .collect();
        entries.sort_by_key(|(_, c)| c.id());
        entries
    }

    /// Point-in-time copy of one scope, ordered by id
    pub fn snapshot_scope(&self, scope: K) -> Vec<Arc<Connection>> {
        let mut entries: Vec<_> = self
            .scopes
            .read()
            .get(&scope)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by_key(|c| c.id());
        entries
    }

    pub fn len(&self) -> usize {
        self.scopes.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ids issued so far
    pub fn total_allocated(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst).saturating_sub(1)
    }
}

impl<K> Default for ConnectionRegistry<K>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
