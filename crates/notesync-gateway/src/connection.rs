//! Client connection handles

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open, no message has passed the session gate yet
    Unauthenticated,
    Authenticated,
    /// Closed; no further frame is delivered
    Closed,
}

/// Handle to a WebSocket connection for sending frames.
///
/// Frames go through an unbounded channel drained by the connection's writer
/// task, so sending never blocks and concurrent sends never interleave.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Connection ID
    pub id: String,
    /// Client address
    pub addr: Option<SocketAddr>,
    /// Handshake headers, names lowercased
    headers: HashMap<String, String>,
    sender: mpsc::UnboundedSender<Arc<String>>,
    /// Principal of the first authenticated message; never changes afterwards
    user: OnceLock<String>,
    state: Mutex<ConnectionState>,
}

impl ConnectionHandle {
    pub fn new(
        id: impl Into<String>,
        addr: Option<SocketAddr>,
        headers: HashMap<String, String>,
        sender: mpsc::UnboundedSender<Arc<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            addr,
            headers,
            sender,
            user: OnceLock::new(),
            state: Mutex::new(ConnectionState::Unauthenticated),
        }
    }

    /// Queue a frame for this connection
    pub fn send(&self, frame: Arc<String>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.sender.send(frame).map_err(|_| ConnectionError::Closed)
    }

    pub fn user(&self) -> Option<&str> {
        self.user.get().map(String::as_str)
    }

    /// Bind the principal; returns `false` when a principal is already bound
    pub(crate) fn bind_user(&self, user: &str) -> bool {
        self.user.set(user.to_string()).is_ok()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn mark_authenticated(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Unauthenticated {
            *state = ConnectionState::Authenticated;
        }
    }

    /// Returns `true` if this call closed the connection
    pub fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        let was_open = *state != ConnectionState::Closed;
        *state = ConnectionState::Closed;
        was_open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Handshake header by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Connection-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,
}

#[cfg(test)]
pub(crate) fn test_connection(
    id: &str,
) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<Arc<String>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ConnectionHandle::new(id, None, HashMap::new(), tx)),
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_after_close_fails() {
        let (conn, mut rx) = test_connection("c1");
        conn.send(Arc::new("a".to_string())).unwrap();
        assert_eq!(rx.try_recv().unwrap().as_str(), "a");

        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
        assert!(matches!(
            conn.send(Arc::new("b".to_string())),
            Err(ConnectionError::Closed)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_user_binds_once() {
        let (conn, _rx) = test_connection("c1");
        assert_eq!(conn.user(), None);
        assert!(conn.bind_user("alice"));
        assert!(!conn.bind_user("bob"));
        assert_eq!(conn.user(), Some("alice"));
    }

    #[test]
    fn test_state_transitions() {
        let (conn, _rx) = test_connection("c1");
        assert_eq!(conn.state(), ConnectionState::Unauthenticated);
        conn.mark_authenticated();
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        conn.mark_closed();
        conn.mark_authenticated();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut headers = HashMap::new();
        headers.insert("x-watcher-key".to_string(), "secret".to_string());
        let conn = ConnectionHandle::new("c1", None, headers, tx);
        assert_eq!(conn.header("X-Watcher-Key"), Some("secret"));
        assert_eq!(conn.header("origin"), None);
    }
}
