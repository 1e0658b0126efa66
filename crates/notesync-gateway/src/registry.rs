//! Connection registry.
//!
//! Tracks which connections are open, which note each one is viewing, which
//! channels and users they belong to, and which are watchers. All maps live
//! behind one lock, so a connection is never visible in one index and missing
//! from another.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::connection::ConnectionHandle;

type Subscribers = HashMap<String, Vec<Arc<ConnectionHandle>>>;

#[derive(Default)]
struct RegistryState {
    connections: HashMap<String, Arc<ConnectionHandle>>,
    /// note id -> viewers
    documents: Subscribers,
    /// connection id -> the note it is viewing
    viewing: HashMap<String, String>,
    channels: Subscribers,
    users: Subscribers,
    watchers: HashMap<String, Arc<ConnectionHandle>>,
}

fn attach(map: &mut Subscribers, key: &str, conn: &Arc<ConnectionHandle>) {
    let subscribers = map.entry(key.to_string()).or_default();
    if !subscribers.iter().any(|c| c.id == conn.id) {
        subscribers.push(Arc::clone(conn));
    }
}

fn detach(map: &mut Subscribers, key: &str, connection_id: &str) -> bool {
    let Some(subscribers) = map.get_mut(key) else {
        return false;
    };
    let before = subscribers.len();
    subscribers.retain(|c| c.id != connection_id);
    let removed = subscribers.len() != before;
    if subscribers.is_empty() {
        map.remove(key);
    }
    removed
}

/// What a connection left behind when it was removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    /// Note the connection was viewing
    pub document: Option<String>,
    pub user: Option<String>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ConnectionRegistry")
            .field("connections", &state.connections.len())
            .field("documents", &state.documents.len())
            .field("watchers", &state.watchers.len())
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<ConnectionHandle>) {
        self.state.write().connections.insert(conn.id.clone(), conn);
    }

    /// Remove a connection from every index.
    ///
    /// The connection is marked closed first, so fanout that already took a
    /// snapshot drops its frames. Returns `None` if it was already removed.
    pub fn remove(&self, conn: &ConnectionHandle) -> Option<Removal> {
        conn.mark_closed();

        let mut state = self.state.write();
        let known = state.connections.remove(&conn.id).is_some()
            | state.watchers.remove(&conn.id).is_some();
        if !known {
            return None;
        }

        let document = state.viewing.remove(&conn.id);
        if let Some(note_id) = &document {
            detach(&mut state.documents, note_id, &conn.id);
        }
        state
            .channels
            .retain(|_, subscribers| {
                subscribers.retain(|c| c.id != conn.id);
                !subscribers.is_empty()
            });
        let user = conn.user().map(str::to_string);
        if let Some(user) = &user {
            detach(&mut state.users, user, &conn.id);
        }

        debug!(connection_id = %conn.id, ?document, "connection removed");
        Some(Removal { document, user })
    }

    /// Make `note_id` the note this connection views.
    ///
    /// A connection views at most one note; the previous one, if different,
    /// is returned after the connection left it.
    pub fn subscribe_document(
        &self,
        conn: &Arc<ConnectionHandle>,
        note_id: &str,
    ) -> Option<String> {
        let mut state = self.state.write();
        if !state.connections.contains_key(&conn.id) {
            return None;
        }
        let previous = state.viewing.insert(conn.id.clone(), note_id.to_string());
        let previous = previous.filter(|p| p != note_id);
        if let Some(previous) = &previous {
            detach(&mut state.documents, previous, &conn.id);
        }
        attach(&mut state.documents, note_id, conn);
        previous
    }

    pub fn unsubscribe_document(&self, connection_id: &str, note_id: &str) -> bool {
        let mut state = self.state.write();
        if state.viewing.get(connection_id).map(String::as_str) == Some(note_id) {
            state.viewing.remove(connection_id);
        }
        detach(&mut state.documents, note_id, connection_id)
    }

    /// Stop viewing any note; returns the note left
    pub fn leave_documents(&self, connection_id: &str) -> Option<String> {
        let mut state = self.state.write();
        let note_id = state.viewing.remove(connection_id)?;
        detach(&mut state.documents, &note_id, connection_id);
        Some(note_id)
    }

    /// Drop every viewer of a deleted note
    pub fn remove_document(&self, note_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let mut state = self.state.write();
        let viewers = state.documents.remove(note_id).unwrap_or_default();
        for conn in &viewers {
            if state.viewing.get(&conn.id).map(String::as_str) == Some(note_id) {
                state.viewing.remove(&conn.id);
            }
        }
        viewers
    }

    pub fn subscribe_channel(&self, conn: &Arc<ConnectionHandle>, channel: &str) {
        let mut state = self.state.write();
        if state.connections.contains_key(&conn.id) {
            attach(&mut state.channels, channel, conn);
        }
    }

    pub fn unsubscribe_channel(&self, connection_id: &str, channel: &str) -> bool {
        detach(&mut self.state.write().channels, channel, connection_id)
    }

    /// Index the connection under its principal.
    ///
    /// Only the first principal is recorded; returns `false` if the
    /// connection already has one or is no longer registered.
    pub fn bind_user(&self, conn: &Arc<ConnectionHandle>, user: &str) -> bool {
        let mut state = self.state.write();
        if !state.connections.contains_key(&conn.id) || !conn.bind_user(user) {
            return false;
        }
        attach(&mut state.users, user, conn);
        true
    }

    /// Turn an ordinary connection into a watcher.
    ///
    /// Watchers leave every other index and only receive forwarded note
    /// traffic from then on.
    pub fn switch_to_watcher(&self, conn: &Arc<ConnectionHandle>) -> bool {
        let mut state = self.state.write();
        if state.connections.remove(&conn.id).is_none() {
            return false;
        }
        if let Some(note_id) = state.viewing.remove(&conn.id) {
            detach(&mut state.documents, &note_id, &conn.id);
        }
        state.channels.retain(|_, subscribers| {
            subscribers.retain(|c| c.id != conn.id);
            !subscribers.is_empty()
        });
        if let Some(user) = conn.user() {
            detach(&mut state.users, user, &conn.id);
        }
        state.watchers.insert(conn.id.clone(), Arc::clone(conn));
        true
    }

    pub fn associated_document(&self, connection_id: &str) -> Option<String> {
        self.state.read().viewing.get(connection_id).cloned()
    }

    /// Principals with at least one open connection
    pub fn connected_users(&self) -> BTreeSet<String> {
        self.state.read().users.keys().cloned().collect()
    }

    pub fn document_connections(&self, note_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.state
            .read()
            .documents
            .get(note_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn user_connections(&self, user: &str) -> Option<Vec<Arc<ConnectionHandle>>> {
        self.state.read().users.get(user).cloned()
    }

    pub fn channel_connections(&self, channel: &str) -> Vec<Arc<ConnectionHandle>> {
        self.state
            .read()
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Every open connection except watchers
    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.state.read().connections.values().cloned().collect()
    }

    pub fn watchers(&self) -> Vec<Arc<ConnectionHandle>> {
        self.state.read().watchers.values().cloned().collect()
    }

    /// Open connections, watchers included
    pub fn count(&self) -> usize {
        let state = self.state.read();
        state.connections.len() + state.watchers.len()
    }

    pub fn watcher_count(&self) -> usize {
        self.state.read().watchers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_connection;

    fn ids(conns: &[Arc<ConnectionHandle>]) -> Vec<&str> {
        let mut ids: Vec<&str> = conns.iter().map(|c| c.id.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_connection_views_one_document() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_connection("c1");
        registry.add(conn.clone());

        assert_eq!(registry.subscribe_document(&conn, "A"), None);
        assert_eq!(registry.subscribe_document(&conn, "A"), None);
        assert_eq!(registry.subscribe_document(&conn, "B"), Some("A".to_string()));

        assert!(registry.document_connections("A").is_empty());
        assert_eq!(ids(&registry.document_connections("B")), vec!["c1"]);
        assert_eq!(registry.associated_document("c1").as_deref(), Some("B"));
    }

    #[test]
    fn test_remove_purges_every_index() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_connection("c1");
        registry.add(conn.clone());
        registry.bind_user(&conn, "alice");
        registry.subscribe_document(&conn, "A");
        registry.subscribe_channel(&conn, "JOB_MANAGER_PAGE");

        let removal = registry.remove(&conn).unwrap();
        assert_eq!(removal.document.as_deref(), Some("A"));
        assert_eq!(removal.user.as_deref(), Some("alice"));
        assert!(conn.is_closed());
        assert!(registry.document_connections("A").is_empty());
        assert!(registry.channel_connections("JOB_MANAGER_PAGE").is_empty());
        assert!(registry.user_connections("alice").is_none());
        assert!(registry.connected_users().is_empty());
        assert_eq!(registry.count(), 0);

        assert_eq!(registry.remove(&conn), None);
    }

    #[test]
    fn test_user_keeps_remaining_connections() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = test_connection("c1");
        let (second, _rx2) = test_connection("c2");
        registry.add(first.clone());
        registry.add(second.clone());
        assert!(registry.bind_user(&first, "alice"));
        assert!(registry.bind_user(&second, "alice"));
        assert!(!registry.bind_user(&second, "bob"));

        registry.remove(&first);
        let remaining = registry.user_connections("alice").unwrap();
        assert_eq!(ids(&remaining), vec!["c2"]);
    }

    #[test]
    fn test_closed_connection_is_not_resubscribed() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_connection("c1");
        registry.add(conn.clone());
        registry.remove(&conn);

        registry.subscribe_document(&conn, "A");
        registry.subscribe_channel(&conn, "JOB_MANAGER_PAGE");
        assert!(!registry.bind_user(&conn, "alice"));
        assert!(registry.document_connections("A").is_empty());
        assert!(registry.channel_connections("JOB_MANAGER_PAGE").is_empty());
    }

    #[test]
    fn test_remove_document_drops_viewers() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = test_connection("c1");
        let (second, _rx2) = test_connection("c2");
        registry.add(first.clone());
        registry.add(second.clone());
        registry.subscribe_document(&first, "A");
        registry.subscribe_document(&second, "A");

        let dropped = registry.remove_document("A");
        assert_eq!(ids(&dropped), vec!["c1", "c2"]);
        assert_eq!(registry.associated_document("c1"), None);
        assert_eq!(registry.leave_documents("c2"), None);
    }

    #[test]
    fn test_switch_to_watcher() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_connection("w1");
        registry.add(conn.clone());
        registry.bind_user(&conn, "monitor");
        registry.subscribe_document(&conn, "A");

        assert!(registry.switch_to_watcher(&conn));
        assert!(!registry.switch_to_watcher(&conn));
        assert!(registry.all_connections().is_empty());
        assert!(registry.document_connections("A").is_empty());
        assert!(registry.user_connections("monitor").is_none());
        assert_eq!(registry.watcher_count(), 1);
        assert_eq!(registry.count(), 1);

        assert!(registry.remove(&conn).is_some());
        assert_eq!(registry.watcher_count(), 0);
    }
}
