//! Note and folder handlers

use std::sync::Arc;

use notesync_core::{NoteFormat, NotebookExt, ServiceContext, ServiceError};
use serde_json::Value;
use tracing::{info, warn};

use super::{Dispatcher, HandlerResult};
use crate::connection::ConnectionHandle;
use crate::error::DispatchError;
use crate::protocol::{InboundMessage, Op, OutboundMessage};

fn folder_path(id: &str) -> String {
    format!("/{}", id.trim_start_matches('/'))
}

impl Dispatcher {
    pub(super) async fn list_notes(&self, conn: &ConnectionHandle, ctx: &ServiceContext) -> HandlerResult {
        let notes = self
            .services
            .notebook_service
            .list_notes_info(false, ctx)
            .await?;
        self.fanout
            .unicast(&OutboundMessage::new(Op::NotesInfo).put("notes", notes), conn);
        Ok(())
    }

    pub(super) async fn reload_notes_from_repo(
        &self,
        conn: &ConnectionHandle,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        self.services
            .notebook_service
            .list_notes_info(true, ctx)
            .await?;
        info!(connection_id = %conn.id, "notes reloaded from repository");
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn get_home_note(
        &self,
        conn: &Arc<ConnectionHandle>,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        match self.services.notebook_service.get_home_note(ctx).await? {
            Some(note) => {
                self.open_note(conn, &note.id);
                self.fanout
                    .unicast(&OutboundMessage::new(Op::Note).put("note", &note), conn);
                self.angular.send_all(&note, ctx.user(), conn);
            }
            None => {
                self.leave_notes(conn);
                self.fanout
                    .unicast(&OutboundMessage::new(Op::Note).put("note", Value::Null), conn);
            }
        }
        Ok(())
    }

    pub(super) async fn get_note(
        &self,
        conn: &Arc<ConnectionHandle>,
        message: &InboundMessage,
        ctx: &ServiceContext,
        reload: bool,
    ) -> HandlerResult {
        let Some(note_id) = message.get_string("id") else {
            return Ok(());
        };
        let note = self
            .services
            .notebook_service
            .get_note(&note_id, reload, ctx)
            .await?;

        self.open_note(conn, &note.id);
        self.fanout
            .unicast(&OutboundMessage::new(Op::Note).put("note", &note), conn);
        self.angular.push_note_objects(&note).await;
        self.angular.send_all(&note, ctx.user(), conn);
        Ok(())
    }

    pub(super) async fn create_note(
        &self,
        conn: &Arc<ConnectionHandle>,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let name = message.get_string("name");
        let group = message.get_string("defaultInterpreterGroup");
        let result = self
            .services
            .notebook_service
            .create_note(name.as_deref(), group.as_deref(), ctx)
            .await;
        match result {
            Ok(note) => {
                self.open_note(conn, &note.id);
                self.fanout
                    .unicast(&OutboundMessage::new(Op::NewNote).put("note", &note), conn);
                self.broadcast_note_list_update();
                Ok(())
            }
            Err(ServiceError::Forbidden { message }) => Err(DispatchError::Forbidden { message }),
            Err(e) => Err(DispatchError::invalid(format!(
                "Failed to create note.\n{}",
                e.client_message()
            ))),
        }
    }

    pub(super) async fn delete_note(&self, message: &InboundMessage, ctx: &ServiceContext) -> HandlerResult {
        let Some(note_id) = message.get_string("id") else {
            return Ok(());
        };
        self.services
            .notebook_service
            .remove_note(&note_id, ctx)
            .await?;
        self.registry.remove_document(&note_id);
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn remove_folder(&self, message: &InboundMessage, ctx: &ServiceContext) -> HandlerResult {
        let Some(id) = message.get_string("id") else {
            return Ok(());
        };
        let removed = self
            .services
            .notebook_service
            .remove_folder(&folder_path(&id), ctx)
            .await?;
        for info in &removed {
            self.registry.remove_document(&info.id);
        }
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn move_note_to_trash(
        &self,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let Some(note_id) = message.get_string("id") else {
            return Ok(());
        };
        let note = self
            .services
            .notebook_service
            .move_note_to_trash(&note_id, ctx)
            .await?;
        self.fanout.broadcast_note(&note);
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn move_folder_to_trash(
        &self,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let Some(id) = message.get_string("id") else {
            return Ok(());
        };
        self.services
            .notebook_service
            .move_folder_to_trash(&folder_path(&id), ctx)
            .await?;
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn empty_trash(&self, ctx: &ServiceContext) -> HandlerResult {
        self.services.notebook_service.empty_trash(ctx).await?;
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn restore_folder(&self, message: &InboundMessage, ctx: &ServiceContext) -> HandlerResult {
        let Some(id) = message.get_string("id") else {
            return Ok(());
        };
        self.services
            .notebook_service
            .restore_folder(&folder_path(&id), ctx)
            .await?;
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn restore_note(&self, message: &InboundMessage, ctx: &ServiceContext) -> HandlerResult {
        let Some(note_id) = message.get_string("id") else {
            return Ok(());
        };
        let note = self
            .services
            .notebook_service
            .restore_note(&note_id, ctx)
            .await?;
        self.fanout.broadcast_note(&note);
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn restore_all(&self, ctx: &ServiceContext) -> HandlerResult {
        self.services.notebook_service.restore_all(ctx).await?;
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn clone_note(
        &self,
        conn: &Arc<ConnectionHandle>,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let source = self.target_note(conn, message)?;
        let name = message.get_string("name");
        let note = self
            .services
            .notebook_service
            .clone_note(&source, name.as_deref(), ctx)
            .await?;
        self.open_note(conn, &note.id);
        self.fanout
            .unicast(&OutboundMessage::new(Op::NewNote).put("note", &note), conn);
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn import_note(&self, message: &InboundMessage, ctx: &ServiceContext) -> HandlerResult {
        let Some(payload) = message.get_object("note") else {
            return Err(DispatchError::invalid("note is required"));
        };
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let format = if payload.contains_key("cells") {
            NoteFormat::Jupyter
        } else {
            NoteFormat::Zeppelin
        };
        let note = self
            .services
            .notebook_service
            .import_note(name.as_deref(), &Value::Object(payload.clone()), format, ctx)
            .await?;
        self.fanout.broadcast_note(&note);
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) fn convert_note_nbformat(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
    ) -> HandlerResult {
        let note_id = Self::required(message, "noteId")?;
        let note_name = message.get_string("noteName");
        let nbformat = self.services.notebook.process_note(&note_id, |note| match note {
            Some(note) => self.services.notebook.convert_to_nbformat(note),
            None => Err(ServiceError::not_found(format!("No such note: {}", note_id))),
        })?;
        self.fanout.unicast(
            &OutboundMessage::new(Op::ConvertedNoteNbformat)
                .put("nbformat", nbformat)
                .put("noteName", note_name),
            conn,
        );
        Ok(())
    }

    pub(super) async fn update_note(&self, message: &InboundMessage, ctx: &ServiceContext) -> HandlerResult {
        let Some(note_id) = message.get_string("id") else {
            return Ok(());
        };
        let Some(config) = message.get_object("config") else {
            return Ok(());
        };
        let name = message.get_string("name");
        let note = self
            .services
            .notebook_service
            .update_note(&note_id, name.as_deref(), config, ctx)
            .await?;
        self.fanout.broadcast(
            &note.id,
            &OutboundMessage::new(Op::NoteUpdated)
                .put("name", &note.name)
                .put("config", &note.config)
                .put("info", &note.info),
        );
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn rename_note(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let Some(note_id) = message.get_string("id") else {
            return Ok(());
        };
        let new_name = Self::required(message, "name")?;
        let relative = message.get_bool("relative").unwrap_or(false);

        let result = self
            .services
            .notebook_service
            .rename_note(&note_id, &new_name, relative, ctx)
            .await;
        match result {
            Ok(note) => {
                self.fanout.broadcast_note(&note);
                self.broadcast_note_list_update();
            }
            Err(e) => {
                warn!(connection_id = %conn.id, note_id = %note_id, error = %e, "rename failed");
                self.report(conn, &DispatchError::from(e));
                // restore the old name on every viewer
                self.services.notebook.process_note(&note_id, |note| {
                    if let Some(note) = note {
                        self.fanout.broadcast_note(note);
                    }
                });
            }
        }
        Ok(())
    }

    pub(super) async fn rename_folder(&self, message: &InboundMessage, ctx: &ServiceContext) -> HandlerResult {
        let Some(old_path) = message.get_string("id") else {
            return Ok(());
        };
        let new_path = Self::required(message, "name")?;
        self.services
            .notebook_service
            .rename_folder(&old_path, &new_path, ctx)
            .await?;
        self.broadcast_note_list_update();
        Ok(())
    }

    pub(super) async fn update_personalized_mode(
        &self,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let Some(note_id) = message.get_string("id") else {
            return Ok(());
        };
        let personalized = message.get_bool("personalized").unwrap_or(false);
        let note = self
            .services
            .notebook_service
            .update_personalized_mode(&note_id, personalized, ctx)
            .await?;
        self.fanout.broadcast_note(&note);
        Ok(())
    }

    pub(super) async fn save_note_forms(&self, message: &InboundMessage, ctx: &ServiceContext) -> HandlerResult {
        let note_id = Self::required(message, "noteId")?;
        let params = message.get_object("noteParams").cloned().unwrap_or_default();
        let note = self
            .services
            .notebook_service
            .save_note_forms(&note_id, &params, ctx)
            .await?;
        self.fanout.broadcast_note_forms(&note);
        Ok(())
    }

    pub(super) async fn remove_note_forms(&self, message: &InboundMessage, ctx: &ServiceContext) -> HandlerResult {
        let note_id = Self::required(message, "noteId")?;
        let form_name = Self::required(message, "formName")?;
        let note = self
            .services
            .notebook_service
            .remove_note_forms(&note_id, &form_name, ctx)
            .await?;
        self.fanout.broadcast_note_forms(&note);
        Ok(())
    }
}
