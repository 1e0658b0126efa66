//! Session gate: origin checks and per-message ticket authentication

use std::sync::Arc;

use dashmap::DashMap;
use notesync_config::GatewayConfig;
use notesync_core::context::ANONYMOUS;
use tokio_tungstenite::tungstenite::http::Uri;
use uuid::Uuid;

use crate::connection::ConnectionHandle;

/// Header a client presents to become a watcher
pub const WATCHER_KEY_HEADER: &str = "x-watcher-key";

/// Credentials issued to one principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketEntry {
    pub principal: String,
    pub roles: Vec<String>,
    pub ticket: String,
}

/// Tickets issued by the host application, keyed by principal
#[derive(Debug, Default)]
pub struct TicketStore {
    entries: DashMap<String, TicketEntry>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue (or return the live) ticket for a principal.
    ///
    /// The anonymous principal always gets the ticket `anonymous`.
    pub fn issue(&self, principal: &str, roles: Vec<String>) -> String {
        let mut entry = self
            .entries
            .entry(principal.to_string())
            .or_insert_with(|| TicketEntry {
                principal: principal.to_string(),
                roles: Vec::new(),
                ticket: if principal == ANONYMOUS {
                    ANONYMOUS.to_string()
                } else {
                    Uuid::new_v4().to_string()
                },
            });
        entry.roles = roles;
        entry.ticket.clone()
    }

    pub fn get(&self, principal: &str) -> Option<TicketEntry> {
        self.entries.get(principal).map(|e| e.value().clone())
    }

    /// Drop a principal's ticket; its next message gets a logout notice
    pub fn invalidate(&self, principal: &str) -> bool {
        self.entries.remove(principal).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of authenticating one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Accepted(TicketEntry),
    /// `anonymous` while anonymous access is disabled
    AnonymousDisallowed,
    /// No ticket was ever issued to the principal
    UnknownPrincipal,
    /// The message carries a ticket other than the one on record
    StaleTicket,
}

#[derive(Debug)]
pub struct SessionGate {
    tickets: Arc<TicketStore>,
    allowed_origins: Vec<String>,
    anonymous_allowed: bool,
    watcher_key: Option<String>,
}

impl SessionGate {
    pub fn new(config: &GatewayConfig, tickets: Arc<TicketStore>) -> Self {
        Self {
            tickets,
            allowed_origins: config.allowed_origins.clone(),
            anonymous_allowed: config.anonymous_allowed,
            watcher_key: config.watcher_key.clone(),
        }
    }

    pub fn tickets(&self) -> &Arc<TicketStore> {
        &self.tickets
    }

    /// Decide whether a handshake from `origin` may proceed.
    ///
    /// `*` admits everything, including clients that send no origin. Otherwise
    /// the origin must be listed verbatim or point at the local host.
    pub fn check_origin(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return true;
        }
        let Some(origin) = origin.filter(|o| !o.is_empty()) else {
            return false;
        };
        if self.allowed_origins.iter().any(|o| o == origin) {
            return true;
        }
        match origin.parse::<Uri>() {
            Ok(uri) => matches!(
                uri.host().map(str::to_ascii_lowercase).as_deref(),
                Some("localhost") | Some("127.0.0.1")
            ),
            Err(_) => false,
        }
    }

    pub fn authenticate(&self, principal: Option<&str>, ticket: Option<&str>) -> AuthResult {
        let principal = principal.unwrap_or_default();
        if principal == ANONYMOUS && !self.anonymous_allowed {
            return AuthResult::AnonymousDisallowed;
        }
        let Some(entry) = self.tickets.get(principal) else {
            return AuthResult::UnknownPrincipal;
        };
        if entry.ticket.is_empty() {
            return AuthResult::UnknownPrincipal;
        }
        if ticket != Some(entry.ticket.as_str()) {
            return AuthResult::StaleTicket;
        }
        AuthResult::Accepted(entry)
    }

    /// Whether the connection presented the configured watcher key
    pub fn may_watch(&self, conn: &ConnectionHandle) -> bool {
        match (&self.watcher_key, conn.header(WATCHER_KEY_HEADER)) {
            (Some(expected), Some(presented)) => !expected.is_empty() && expected == presented,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn gate(configure: impl FnOnce(&mut GatewayConfig)) -> SessionGate {
        let mut config = GatewayConfig::default();
        configure(&mut config);
        SessionGate::new(&config, Arc::new(TicketStore::new()))
    }

    #[test]
    fn test_ticket_reuse() {
        let store = TicketStore::new();
        let first = store.issue("alice", vec!["admin".into()]);
        let second = store.issue("alice", vec![]);
        assert_eq!(first, second);
        assert!(store.get("alice").unwrap().roles.is_empty());
        assert_eq!(store.issue(ANONYMOUS, vec![]), "anonymous");
        assert!(store.invalidate("alice"));
        assert_ne!(store.issue("alice", vec![]), first);
    }

    #[test]
    fn test_authenticate_outcomes() {
        let gate = gate(|_| {});
        let ticket = gate.tickets().issue("alice", vec!["dev".into()]);

        match gate.authenticate(Some("alice"), Some(&ticket)) {
            AuthResult::Accepted(entry) => assert_eq!(entry.roles, vec!["dev".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            gate.authenticate(Some("alice"), Some("old")),
            AuthResult::StaleTicket
        );
        assert_eq!(gate.authenticate(Some("alice"), None), AuthResult::StaleTicket);
        assert_eq!(
            gate.authenticate(Some("bob"), Some(&ticket)),
            AuthResult::UnknownPrincipal
        );
        assert_eq!(gate.authenticate(None, None), AuthResult::UnknownPrincipal);
    }

    #[test]
    fn test_anonymous_checked_before_ticket() {
        let gate = gate(|c| c.anonymous_allowed = false);
        gate.tickets().issue(ANONYMOUS, vec![]);
        assert_eq!(
            gate.authenticate(Some(ANONYMOUS), Some(ANONYMOUS)),
            AuthResult::AnonymousDisallowed
        );

        let open = self::gate(|_| {});
        open.tickets().issue(ANONYMOUS, vec![]);
        assert!(matches!(
            open.authenticate(Some(ANONYMOUS), Some(ANONYMOUS)),
            AuthResult::Accepted(_)
        ));
    }

    #[test]
    fn test_check_origin() {
        let any = gate(|_| {});
        assert!(any.check_origin(None));
        assert!(any.check_origin(Some("http://evil.example")));

        let strict = gate(|c| c.allowed_origins = vec!["https://notes.example.com".into()]);
        assert!(strict.check_origin(Some("https://notes.example.com")));
        assert!(strict.check_origin(Some("http://localhost:8080")));
        assert!(strict.check_origin(Some("http://127.0.0.1")));
        assert!(!strict.check_origin(Some("https://evil.example")));
        assert!(!strict.check_origin(Some("::not a uri::")));
        assert!(!strict.check_origin(None));
    }

    #[test]
    fn test_watcher_key() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut headers = HashMap::new();
        headers.insert(WATCHER_KEY_HEADER.to_string(), "s3cret".to_string());
        let conn = ConnectionHandle::new("w1", None, headers, tx);

        assert!(!gate(|_| {}).may_watch(&conn));
        assert!(gate(|c| c.watcher_key = Some("s3cret".into())).may_watch(&conn));
        assert!(!gate(|c| c.watcher_key = Some("other".into())).may_watch(&conn));
    }
}
