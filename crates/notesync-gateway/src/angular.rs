//! Angular object synchronization.
//!
//! Angular objects are named values shared between the browser and an
//! interpreter group. Client edits go to the group's registry and out to the
//! other viewers; changes raised by the interpreter side come back through
//! [`AngularBridge::on_remote_update`] and [`AngularBridge::on_remote_remove`].

use std::sync::Arc;

use notesync_core::{AngularObject, Note, NotebookExt, ServiceContext};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::connection::ConnectionHandle;
use crate::error::DispatchError;
use crate::fanout::Fanout;
use crate::protocol::{Op, OutboundMessage};
use crate::services::Services;

fn object_message(op: Op, object: &AngularObject, group_id: &str, note_id: Option<&str>) -> OutboundMessage {
    OutboundMessage::new(op)
        .put("angularObject", object)
        .put("interpreterGroupId", group_id)
        .put("noteId", note_id)
        .put("paragraphId", &object.paragraph_id)
}

pub struct AngularBridge {
    fanout: Arc<Fanout>,
    services: Services,
}

impl std::fmt::Debug for AngularBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AngularBridge").finish_non_exhaustive()
    }
}

impl AngularBridge {
    pub fn new(fanout: Arc<Fanout>, services: Services) -> Self {
        Self { fanout, services }
    }

    /// A client changed an object's value
    #[allow(clippy::too_many_arguments)]
    pub async fn client_update(
        &self,
        conn: &ConnectionHandle,
        ctx: &ServiceContext,
        note_id: &str,
        paragraph_id: Option<&str>,
        group_id: &str,
        name: &str,
        value: Value,
    ) -> Result<(), DispatchError> {
        let object = self
            .services
            .notebook_service
            .update_angular_object(note_id, paragraph_id, group_id, name, value, ctx)
            .await?;

        self.fanout.broadcast_except(
            note_id,
            &object_message(Op::AngularObjectUpdate, &object, group_id, Some(note_id)),
            conn,
        );
        self.persist(note_id, group_id, object);
        Ok(())
    }

    /// Bind a value to a paragraph from the client side
    pub async fn bind(
        &self,
        conn: &ConnectionHandle,
        note_id: &str,
        paragraph_id: &str,
        name: &str,
        value: Value,
    ) -> Result<(), DispatchError> {
        let Some(group_id) = self.resolve_group(note_id, paragraph_id) else {
            return Ok(());
        };
        let Some(registry) = self.services.interpreters.angular_registry(&group_id) else {
            error!(group_id = %group_id, "no angular object registry for interpreter group");
            return Ok(());
        };

        let object = registry
            .add_and_notify_remote(name, value, note_id, Some(paragraph_id))
            .await?;

        self.fanout.broadcast_except(
            note_id,
            &object_message(Op::AngularObjectUpdate, &object, &group_id, Some(note_id)),
            conn,
        );
        self.persist(note_id, &group_id, object);
        Ok(())
    }

    /// Remove a paragraph-scoped value from the client side
    pub async fn unbind(
        &self,
        conn: &ConnectionHandle,
        note_id: &str,
        paragraph_id: &str,
        name: &str,
    ) -> Result<(), DispatchError> {
        let Some(group_id) = self.resolve_group(note_id, paragraph_id) else {
            return Ok(());
        };
        let Some(registry) = self.services.interpreters.angular_registry(&group_id) else {
            error!(group_id = %group_id, "no angular object registry for interpreter group");
            return Ok(());
        };

        let removed = registry
            .remove_and_notify_remote(name, note_id, Some(paragraph_id))
            .await?;

        if let Some(object) = &removed {
            self.fanout.broadcast_except(
                note_id,
                &object_message(Op::AngularObjectRemove, object, &group_id, Some(note_id)),
                conn,
            );
        }
        self.services.notebook.process_note(note_id, |note| {
            if let Some(note) = note {
                note.delete_angular_object(&group_id, Some(note_id), Some(paragraph_id), name);
            }
        });
        Ok(())
    }

    /// Push a note's persisted paragraph-scoped objects to their registries.
    ///
    /// Paragraphs whose interpreter group cannot be resolved are skipped.
    pub async fn push_note_objects(&self, note: &Note) {
        for paragraph in &note.paragraphs {
            let group_id = match self
                .services
                .interpreters
                .interpreter_group_for_paragraph(note, &paragraph.id)
            {
                Ok(group_id) => group_id,
                Err(e) => {
                    debug!(note_id = %note.id, paragraph_id = %paragraph.id, error = %e, "skipping paragraph");
                    continue;
                }
            };
            let Some(registry) = self.services.interpreters.angular_registry(&group_id) else {
                continue;
            };
            for object in note.angular_objects_for(&group_id) {
                if !object.matches_scope(Some(&note.id), Some(&paragraph.id)) {
                    continue;
                }
                if let Err(e) = registry
                    .add_and_notify_remote(&object.name, object.value.clone(), &note.id, Some(&paragraph.id))
                    .await
                {
                    warn!(note_id = %note.id, name = %object.name, error = %e, "failed to restore angular object");
                }
            }
        }
    }

    /// Send one connection every object visible to a note
    pub fn send_all(&self, note: &Note, user: &str, conn: &ConnectionHandle) {
        for setting in self.services.notebook.bound_interpreter_settings(&note.id) {
            let Some(group_id) = self
                .services
                .interpreters
                .interpreter_group(&setting.id, user, &note.id)
            else {
                continue;
            };
            let Some(registry) = self.services.interpreters.angular_registry(&group_id) else {
                continue;
            };
            for object in registry.all_with_global(&note.id) {
                self.fanout.unicast(
                    &object_message(
                        Op::AngularObjectUpdate,
                        &object,
                        &group_id,
                        object.note_id.as_deref(),
                    ),
                    conn,
                );
            }
        }
    }

    /// An interpreter added or changed an object
    pub fn on_remote_update(&self, group_id: &str, object: &AngularObject) {
        for note_id in self.affected_notes(group_id, object) {
            self.fanout.broadcast(
                &note_id,
                &object_message(Op::AngularObjectUpdate, object, group_id, Some(&note_id)),
            );
        }
    }

    /// An interpreter removed an object
    pub fn on_remote_remove(&self, group_id: &str, object: &AngularObject) {
        let known_group = self
            .services
            .interpreters
            .setting_ids()
            .iter()
            .any(|id| group_id.contains(id.as_str()));
        if !known_group {
            return;
        }
        for note_id in self.affected_notes(group_id, object) {
            self.fanout.broadcast(
                &note_id,
                &OutboundMessage::new(Op::AngularObjectRemove)
                    .put("name", &object.name)
                    .put("noteId", &note_id)
                    .put("paragraphId", &object.paragraph_id),
            );
        }
    }

    /// Notes that see `object`: its own note, or every note served by the group
    fn affected_notes(&self, group_id: &str, object: &AngularObject) -> Vec<String> {
        match object.note_id.as_deref() {
            Some(note_id) => {
                if self.services.notebook.bound_interpreter_settings(note_id).is_empty() {
                    Vec::new()
                } else {
                    vec![note_id.to_string()]
                }
            }
            None => self
                .services
                .notebook
                .notes_info()
                .into_iter()
                .filter(|info| self.served_by(&info.id, group_id))
                .map(|info| info.id)
                .collect(),
        }
    }

    fn served_by(&self, note_id: &str, group_id: &str) -> bool {
        self.services
            .notebook
            .bound_interpreter_settings(note_id)
            .iter()
            .any(|setting| group_id.contains(setting.id.as_str()))
    }

    fn resolve_group(&self, note_id: &str, paragraph_id: &str) -> Option<String> {
        let interpreters = &self.services.interpreters;
        let resolved = self.services.notebook.process_note(note_id, |note| {
            note.map(|note| interpreters.interpreter_group_for_paragraph(note, paragraph_id))
        });
        match resolved {
            Some(Ok(group_id)) => Some(group_id),
            Some(Err(e)) => {
                error!(note_id, paragraph_id, error = %e, "cannot resolve interpreter group");
                None
            }
            None => {
                error!(note_id, "no such note");
                None
            }
        }
    }

    fn persist(&self, note_id: &str, group_id: &str, object: AngularObject) {
        self.services.notebook.process_note(note_id, |note| {
            if let Some(note) = note {
                note.add_or_update_angular_object(group_id, object);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_connection;
    use crate::registry::ConnectionRegistry;
    use notesync_core::testing::MemoryBackend;
    use notesync_core::{AuthenticationInfo, InterpreterSetting, Paragraph};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        registry: Arc<ConnectionRegistry>,
        bridge: AngularBridge,
        note_id: String,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let mut note = Note::new("angular");
        note.paragraphs.push(Paragraph::new("p1"));
        let note_id = note.id.clone();
        backend.insert_note(note);
        backend.bind_setting(&note_id, InterpreterSetting::new("spark", "spark"), "spark-shared");
        backend.assign_group("p1", "spark-shared");

        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Arc::new(Fanout::new(Arc::clone(&registry), false));
        let bridge = AngularBridge::new(fanout, Services::from_backend(backend.clone()));
        Fixture {
            backend,
            registry,
            bridge,
            note_id,
        }
    }

    fn viewer(
        fx: &Fixture,
        id: &str,
        user: &str,
    ) -> (Arc<ConnectionHandle>, UnboundedReceiver<Arc<String>>) {
        let (conn, rx) = test_connection(id);
        fx.registry.add(conn.clone());
        fx.registry.bind_user(&conn, user);
        fx.registry.subscribe_document(&conn, &fx.note_id);
        (conn, rx)
    }

    fn frames(rx: &mut UnboundedReceiver<Arc<String>>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_bind_reaches_registry_and_other_viewers() {
        let fx = fixture();
        let (a, mut rx_a) = viewer(&fx, "c1", "alice");
        let (_b, mut rx_b) = viewer(&fx, "c2", "bob");

        fx.bridge
            .bind(&a, &fx.note_id, "p1", "x", json!(5))
            .await
            .unwrap();

        let registry = fx.backend.registry("spark-shared");
        let stored = registry.get("x", Some(&fx.note_id), Some("p1")).unwrap();
        assert_eq!(stored.value, json!(5));
        assert_eq!(registry.notifications(), vec!["add:x".to_string()]);

        assert!(frames(&mut rx_a).is_empty());
        let update = frames(&mut rx_b);
        assert_eq!(update[0]["op"], "ANGULAR_OBJECT_UPDATE");
        assert_eq!(update[0]["data"]["angularObject"]["object"], 5);
        assert_eq!(update[0]["data"]["interpreterGroupId"], "spark-shared");

        let note = fx.backend.snapshot(&fx.note_id).unwrap();
        assert_eq!(note.angular_objects_for("spark-shared").len(), 1);
    }

    #[tokio::test]
    async fn test_unbind_removes_persisted_object() {
        let fx = fixture();
        let (a, _rx_a) = viewer(&fx, "c1", "alice");
        let (_b, mut rx_b) = viewer(&fx, "c2", "bob");
        fx.bridge.bind(&a, &fx.note_id, "p1", "x", json!(1)).await.unwrap();
        frames(&mut rx_b);

        fx.bridge.unbind(&a, &fx.note_id, "p1", "x").await.unwrap();

        let removed = frames(&mut rx_b);
        assert_eq!(removed[0]["op"], "ANGULAR_OBJECT_REMOVE");
        let note = fx.backend.snapshot(&fx.note_id).unwrap();
        assert!(note.angular_objects_for("spark-shared").is_empty());
        assert!(fx.backend.registry("spark-shared").get("x", Some(&fx.note_id), Some("p1")).is_none());
    }

    #[tokio::test]
    async fn test_bind_to_unknown_paragraph_is_dropped() {
        let fx = fixture();
        let (a, _rx_a) = viewer(&fx, "c1", "alice");
        fx.bridge.bind(&a, &fx.note_id, "nope", "x", json!(1)).await.unwrap();
        assert!(fx.backend.registry("spark-shared").notifications().is_empty());
    }

    #[tokio::test]
    async fn test_client_update_goes_through_service() {
        let fx = fixture();
        let (a, _rx_a) = viewer(&fx, "c1", "alice");
        let (_b, mut rx_b) = viewer(&fx, "c2", "bob");
        let ctx = ServiceContext::new(AuthenticationInfo::new("alice", vec![], "t"));

        fx.bridge
            .client_update(&a, &ctx, &fx.note_id, Some("p1"), "spark-shared", "y", json!("v"))
            .await
            .unwrap();

        assert!(fx.backend.was_called("update_angular_object"));
        assert_eq!(frames(&mut rx_b)[0]["data"]["angularObject"]["name"], "y");
    }

    #[tokio::test]
    async fn test_push_note_objects_restores_registry() {
        let fx = fixture();
        let mut note = fx.backend.snapshot(&fx.note_id).unwrap();
        note.add_or_update_angular_object(
            "spark-shared",
            AngularObject::scoped("saved", json!(true), &fx.note_id, Some("p1".to_string())),
        );
        note.paragraphs.push(Paragraph::new("unassigned"));

        fx.bridge.push_note_objects(&note).await;

        let registry = fx.backend.registry("spark-shared");
        assert_eq!(registry.notifications(), vec!["add:saved".to_string()]);
    }

    #[tokio::test]
    async fn test_send_all_includes_global_objects() {
        let fx = fixture();
        let (a, mut rx_a) = viewer(&fx, "c1", "alice");
        let registry = fx.backend.registry("spark-shared");
        registry.insert(AngularObject::global("g", json!(1)));
        registry.insert(AngularObject::scoped("s", json!(2), &fx.note_id, None));
        registry.insert(AngularObject::scoped("other", json!(3), "ELSEWHERE", None));

        let note = fx.backend.snapshot(&fx.note_id).unwrap();
        fx.bridge.send_all(&note, "alice", &a);

        let sent = frames(&mut rx_a);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|f| f["op"] == "ANGULAR_OBJECT_UPDATE"));
    }

    #[tokio::test]
    async fn test_remote_events_reach_note_viewers() {
        let fx = fixture();
        let (_a, mut rx_a) = viewer(&fx, "c1", "alice");

        let scoped = AngularObject::scoped("s", json!(1), &fx.note_id, None);
        fx.bridge.on_remote_update("spark-shared", &scoped);
        let global = AngularObject::global("g", json!(2));
        fx.bridge.on_remote_update("spark-shared", &global);
        fx.bridge.on_remote_remove("spark-shared", &global);
        fx.bridge.on_remote_remove("unrelated", &global);

        let sent = frames(&mut rx_a);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1]["data"]["noteId"], fx.note_id.as_str());
        assert_eq!(sent[2]["op"], "ANGULAR_OBJECT_REMOVE");
        assert_eq!(sent[2]["data"]["name"], "g");
    }
}
