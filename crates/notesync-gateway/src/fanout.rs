//! Message fan-out to connected clients.
//!
//! Every delivery serializes the message once, takes a snapshot of the
//! recipients from the registry, then sends outside the registry lock. A
//! closed or failing recipient is skipped and never aborts the rest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use notesync_core::{Note, Paragraph};
use notesync_observability::GatewayMetrics;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::protocol::{Op, OutboundMessage, WatcherMessage};
use crate::registry::ConnectionRegistry;

pub struct Fanout {
    registry: Arc<ConnectionRegistry>,
    collaborative_mode: bool,
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("collaborative_mode", &self.collaborative_mode)
            .finish_non_exhaustive()
    }
}

fn encode(message: &OutboundMessage) -> Option<Arc<String>> {
    match message.encode() {
        Ok(frame) => Some(Arc::new(frame)),
        Err(e) => {
            warn!(op = %message.op, error = %e, "failed to serialize message");
            None
        }
    }
}

fn deliver(conn: &ConnectionHandle, frame: &Arc<String>) {
    if let Err(e) = conn.send(Arc::clone(frame)) {
        debug!(connection_id = %conn.id, error = %e, "dropped frame");
        GatewayMetrics::send_failed();
    }
}

impl Fanout {
    pub fn new(registry: Arc<ConnectionRegistry>, collaborative_mode: bool) -> Self {
        Self {
            registry,
            collaborative_mode,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn collaborative_mode(&self) -> bool {
        self.collaborative_mode
    }

    /// Send to a single connection
    pub fn unicast(&self, message: &OutboundMessage, conn: &ConnectionHandle) {
        if let Some(frame) = encode(message) {
            deliver(conn, &frame);
        }
    }

    /// Send to every connection of `user`
    pub fn multicast_to_user(&self, user: &str, message: &OutboundMessage) {
        let Some(conns) = self.registry.user_connections(user) else {
            warn!(user, op = %message.op, "multicasting to user that is not connected");
            return;
        };
        if let Some(frame) = encode(message) {
            for conn in &conns {
                deliver(conn, &frame);
            }
        }
    }

    /// Send to every viewer of a note, and forward to watchers
    pub fn broadcast(&self, note_id: &str, message: &OutboundMessage) {
        let Some(frame) = encode(message) else {
            return;
        };
        let conns = self.registry.document_connections(note_id);
        debug!(note_id, op = %message.op, recipients = conns.len(), "broadcast");
        for conn in &conns {
            deliver(conn, &frame);
        }
        self.forward_to_watchers(note_id, "", &frame);
    }

    /// Like [`Fanout::broadcast`], skipping the connection that caused it
    pub fn broadcast_except(
        &self,
        note_id: &str,
        message: &OutboundMessage,
        exclude: &ConnectionHandle,
    ) {
        let Some(frame) = encode(message) else {
            return;
        };
        let conns = self.registry.document_connections(note_id);
        debug!(note_id, op = %message.op, exclude = %exclude.id, "broadcast except");
        for conn in conns.iter().filter(|c| c.id != exclude.id) {
            deliver(conn, &frame);
        }
        self.forward_to_watchers(note_id, exclude.user().unwrap_or_default(), &frame);
    }

    pub fn broadcast_channel(&self, channel: &str, message: &OutboundMessage) {
        let Some(frame) = encode(message) else {
            return;
        };
        for conn in &self.registry.channel_connections(channel) {
            deliver(conn, &frame);
        }
    }

    /// Send to every open connection except watchers
    pub fn broadcast_all(&self, message: &OutboundMessage) {
        let Some(frame) = encode(message) else {
            return;
        };
        for conn in &self.registry.all_connections() {
            deliver(conn, &frame);
        }
    }

    fn forward_to_watchers(&self, note_id: &str, subject: &str, frame: &str) {
        let watchers = self.registry.watchers();
        if watchers.is_empty() {
            return;
        }
        let envelope = WatcherMessage {
            note_id: note_id.to_string(),
            subject: subject.to_string(),
            message: frame.to_string(),
        };
        let frame = match serde_json::to_string(&envelope) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!(note_id, error = %e, "failed to serialize watcher message");
                return;
            }
        };
        for watcher in &watchers {
            deliver(watcher, &frame);
        }
    }

    pub fn broadcast_note(&self, note: &Note) {
        self.broadcast(&note.id, &OutboundMessage::new(Op::Note).put("note", note));
    }

    pub fn broadcast_note_forms(&self, note: &Note) {
        self.broadcast(
            &note.id,
            &OutboundMessage::new(Op::SaveNoteForms).put("formsData", note.forms_data()),
        );
    }

    /// Announce a changed paragraph.
    ///
    /// Forms go out first. A personalized note sends each user their own
    /// copy; otherwise every viewer gets the shared paragraph.
    pub fn broadcast_paragraph(&self, note: &Note, paragraph: &Paragraph, msg_id: Option<&str>) {
        self.broadcast_note_forms(note);

        if note.personalized_mode {
            self.broadcast_paragraphs(&paragraph.user_paragraphs, msg_id);
        } else {
            self.broadcast(
                &note.id,
                &OutboundMessage::new(Op::Paragraph)
                    .put("paragraph", paragraph)
                    .with_msg_id(msg_id),
            );
        }
    }

    /// Send every user their private copy of a paragraph
    pub fn broadcast_paragraphs(
        &self,
        user_paragraphs: &BTreeMap<String, Paragraph>,
        msg_id: Option<&str>,
    ) {
        for (user, copy) in user_paragraphs {
            self.multicast_to_user(
                user,
                &OutboundMessage::new(Op::Paragraph)
                    .put("paragraph", copy)
                    .with_msg_id(msg_id),
            );
        }
    }

    /// Send `user` their copy, only on connections viewing the note
    pub fn unicast_paragraph(
        &self,
        note: &Note,
        paragraph: &Paragraph,
        user: &str,
        msg_id: Option<&str>,
    ) {
        if !note.personalized_mode {
            return;
        }
        let Some(conns) = self.registry.user_connections(user) else {
            warn!(user, "user is not connected");
            return;
        };
        let viewers: BTreeSet<String> = self
            .registry
            .document_connections(&note.id)
            .iter()
            .map(|c| c.id.clone())
            .collect();
        let message = OutboundMessage::new(Op::Paragraph)
            .put("paragraph", paragraph)
            .with_msg_id(msg_id);
        let Some(frame) = encode(&message) else {
            return;
        };
        for conn in conns.iter().filter(|c| viewers.contains(&c.id)) {
            deliver(conn, &frame);
        }
    }

    pub fn broadcast_new_paragraph(&self, note: &Note, paragraph: &Paragraph) {
        let index = note.paragraph_index(&paragraph.id);
        self.broadcast(
            &note.id,
            &OutboundMessage::new(Op::ParagraphAdded)
                .put("paragraph", paragraph)
                .put("index", index),
        );
    }

    /// Tell the viewers of a note whether they are collaborating
    pub fn collaborative_status(&self, note_id: &str) {
        if !self.collaborative_mode {
            return;
        }
        let viewers = self.registry.document_connections(note_id);
        let collaborating = viewers.len() > 1;
        let mut message =
            OutboundMessage::new(Op::CollaborativeModeStatus).put("status", collaborating);
        if collaborating {
            let users: BTreeSet<&str> = viewers.iter().filter_map(|c| c.user()).collect();
            message = message.put("users", users);
        }
        self.broadcast(note_id, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_connection;
    use serde_json::Value;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (Arc<ConnectionRegistry>, Fanout) {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Fanout::new(Arc::clone(&registry), true);
        (registry, fanout)
    }

    fn join(
        registry: &ConnectionRegistry,
        id: &str,
        user: &str,
        note_id: Option<&str>,
    ) -> (Arc<ConnectionHandle>, UnboundedReceiver<Arc<String>>) {
        let (conn, rx) = test_connection(id);
        registry.add(conn.clone());
        registry.bind_user(&conn, user);
        if let Some(note_id) = note_id {
            registry.subscribe_document(&conn, note_id);
        }
        (conn, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Arc<String>>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[test]
    fn test_broadcast_reaches_viewers_only() {
        let (registry, fanout) = setup();
        let (_a, mut rx_a) = join(&registry, "c1", "alice", Some("N1"));
        let (_b, mut rx_b) = join(&registry, "c2", "bob", Some("N1"));
        let (_c, mut rx_c) = join(&registry, "c3", "carol", Some("N2"));

        fanout.broadcast("N1", &OutboundMessage::new(Op::ParagraphRemoved).put("id", "p1"));

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b)[0]["op"], "PARAGRAPH_REMOVED");
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn test_broadcast_except_and_watchers() {
        let (registry, fanout) = setup();
        let (a, mut rx_a) = join(&registry, "c1", "alice", Some("N1"));
        let (_b, mut rx_b) = join(&registry, "c2", "bob", Some("N1"));
        let (w, mut rx_w) = join(&registry, "w1", "monitor", None);
        registry.switch_to_watcher(&w);

        fanout.broadcast_except("N1", &OutboundMessage::new(Op::PatchParagraph), &a);

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
        let forwarded = drain(&mut rx_w);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0]["noteId"], "N1");
        assert_eq!(forwarded[0]["subject"], "alice");
        let inner: Value =
            serde_json::from_str(forwarded[0]["message"].as_str().unwrap()).unwrap();
        assert_eq!(inner["op"], "PATCH_PARAGRAPH");
    }

    #[test]
    fn test_closed_recipient_does_not_abort_fanout() {
        let (registry, fanout) = setup();
        let (a, _rx_a) = join(&registry, "c1", "alice", Some("N1"));
        let (_b, mut rx_b) = join(&registry, "c2", "bob", Some("N1"));
        a.mark_closed();

        fanout.broadcast("N1", &OutboundMessage::new(Op::Note));
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn test_personalized_paragraph_goes_to_each_owner() {
        let (registry, fanout) = setup();
        let (_a, mut rx_a) = join(&registry, "c1", "alice", Some("N1"));
        let (_b, mut rx_b) = join(&registry, "c2", "bob", Some("N1"));

        let mut note = Note::new("shared");
        note.id = "N1".to_string();
        note.personalized_mode = true;
        let mut paragraph = Paragraph::new("p1").with_text("shared text");
        paragraph.user_paragraph_mut("alice").text = Some("alice text".to_string());
        paragraph.user_paragraph_mut("bob").text = Some("bob text".to_string());

        fanout.broadcast_paragraph(&note, &paragraph, Some("m1"));

        let alice = drain(&mut rx_a);
        assert_eq!(alice[0]["op"], "SAVE_NOTE_FORMS");
        assert_eq!(alice[1]["data"]["paragraph"]["text"], "alice text");
        assert_eq!(alice[1]["msgId"], "m1");
        let bob = drain(&mut rx_b);
        assert_eq!(bob[1]["data"]["paragraph"]["text"], "bob text");
    }

    #[test]
    fn test_unicast_paragraph_only_on_viewing_connections() {
        let (registry, fanout) = setup();
        let (_a1, mut rx_a1) = join(&registry, "c1", "alice", Some("N1"));
        let (_a2, mut rx_a2) = join(&registry, "c2", "alice", Some("N2"));

        let mut note = Note::new("n");
        note.id = "N1".to_string();
        note.personalized_mode = true;
        fanout.unicast_paragraph(&note, &Paragraph::new("p1"), "alice", None);

        assert_eq!(drain(&mut rx_a1).len(), 1);
        assert!(drain(&mut rx_a2).is_empty());
    }

    #[test]
    fn test_collaborative_status() {
        let (registry, fanout) = setup();
        let (_a, mut rx_a) = join(&registry, "c1", "alice", Some("N1"));
        fanout.collaborative_status("N1");
        let frames = drain(&mut rx_a);
        assert_eq!(frames[0]["data"]["status"], false);
        assert!(frames[0]["data"].get("users").is_none());

        let (_b, mut rx_b) = join(&registry, "c2", "bob", Some("N1"));
        fanout.collaborative_status("N1");
        let frames = drain(&mut rx_b);
        assert_eq!(frames[0]["data"]["status"], true);
        assert_eq!(frames[0]["data"]["users"], serde_json::json!(["alice", "bob"]));

        let quiet = Fanout::new(Arc::clone(&registry), false);
        quiet.collaborative_status("N1");
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[test]
    fn test_multicast_and_channel() {
        let (registry, fanout) = setup();
        let (a, mut rx_a) = join(&registry, "c1", "alice", None);
        let (_b, mut rx_b) = join(&registry, "c2", "bob", None);
        registry.subscribe_channel(&a, "JOB_MANAGER_PAGE");

        fanout.multicast_to_user("alice", &OutboundMessage::new(Op::NotesInfo));
        fanout.multicast_to_user("nobody", &OutboundMessage::new(Op::NotesInfo));
        fanout.broadcast_channel("JOB_MANAGER_PAGE", &OutboundMessage::new(Op::ListUpdateNoteJobs));
        fanout.broadcast_all(&OutboundMessage::new(Op::Notice).put("notice", "hi"));

        assert_eq!(drain(&mut rx_a).len(), 3);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }
}
