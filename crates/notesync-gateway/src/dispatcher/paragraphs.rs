//! Paragraph handlers, including runs and angular object edits

use std::sync::Arc;

use notesync_core::{Note, NotebookExt, Paragraph, ParagraphUpdate, ServiceContext};
use notesync_observability::logging::note_span;
use serde_json::Value;
use tracing::{error, warn, Instrument};

use super::{Dispatcher, HandlerResult};
use crate::connection::ConnectionHandle;
use crate::error::DispatchError;
use crate::protocol::{InboundMessage, Op, OutboundMessage};

/// Title, text, params and config as sent by the editor
fn paragraph_update(message: &InboundMessage) -> ParagraphUpdate {
    ParagraphUpdate {
        title: message.get_string("title"),
        text: message.get_string("paragraph"),
        params: message.get_object("params").cloned().unwrap_or_default(),
        config: message.get_object("config").cloned().unwrap_or_default(),
    }
}

impl Dispatcher {
    pub(super) async fn commit_paragraph(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let paragraph_id = Self::required(message, "id")?;
        let note_id = self.target_note(conn, message)?;
        let paragraph = self
            .services
            .notebook_service
            .update_paragraph(&note_id, &paragraph_id, &paragraph_update(message), ctx)
            .await?;
        self.rebroadcast_paragraph(&note_id, &paragraph, message.msg_id.as_deref());
        Ok(())
    }

    pub(super) async fn patch_paragraph(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        if !self.config.collaborative_mode {
            return Ok(());
        }
        let paragraph_id = Self::required(message, "id")?;
        let note_id = self.target_note(conn, message)?;
        let patch = Self::required(message, "patch")?;
        let accepted = self
            .services
            .notebook_service
            .patch_paragraph(&note_id, &paragraph_id, &patch, ctx)
            .await?;
        self.fanout.broadcast_except(
            &note_id,
            &OutboundMessage::new(Op::PatchParagraph)
                .put("patch", accepted)
                .put("paragraphId", &paragraph_id),
            conn,
        );
        Ok(())
    }

    /// Validate now, run on the pool
    pub(super) fn run_paragraph(
        &self,
        conn: &Arc<ConnectionHandle>,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let paragraph_id = Self::required(message, "id")?;
        let note_id = self.target_note(conn, message)?;
        let update = paragraph_update(message);
        let msg_id = message.msg_id.clone();

        let span = note_span(&note_id);
        let this = self.clone();
        let conn = Arc::clone(conn);
        let ctx = ctx.clone();
        self.pool.submit(
            "run_paragraph",
            async move {
                let result = this
                    .finish_run(&note_id, &paragraph_id, &update, msg_id.as_deref(), &ctx)
                    .await;
                if let Err(err) = result {
                    error!(connection_id = %conn.id, paragraph_id = %paragraph_id, error = %err, "failed to run paragraph");
                    this.report(&conn, &err);
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn finish_run(
        &self,
        note_id: &str,
        paragraph_id: &str,
        update: &ParagraphUpdate,
        msg_id: Option<&str>,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let paragraph = self
            .services
            .notebook_service
            .run_paragraph(note_id, paragraph_id, update, ctx)
            .await?;
        let user = ctx.user();

        self.services
            .notebook
            .process_note(note_id, |note| -> HandlerResult {
                let Some(note) = note else {
                    return Ok(());
                };
                if note.personalized_mode {
                    if let Some(copy) = note.clear_personalized_paragraph_output(paragraph_id, user) {
                        self.fanout.unicast_paragraph(note, &copy, user, msg_id);
                    }
                }
                // running the last paragraph opens a fresh one below it
                if note.is_last_paragraph(paragraph_id) && paragraph.has_text() {
                    let added = note.add_new_paragraph(Some(user));
                    self.services.notebook.save_note(note, &ctx.auth)?;
                    self.fanout.broadcast_new_paragraph(note, &added);
                }
                Ok(())
            })
    }

    pub(super) fn run_all_paragraphs(
        &self,
        conn: &Arc<ConnectionHandle>,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        let paragraphs = message.get_array("paragraphs").unwrap_or_default();

        let span = note_span(&note_id);
        let this = self.clone();
        let conn = Arc::clone(conn);
        let ctx = ctx.clone();
        self.pool.submit(
            "run_all_paragraphs",
            async move {
                match this
                    .services
                    .notebook_service
                    .run_all_paragraphs(&note_id, &paragraphs, &ctx)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => this.resync_paragraphs(&note_id),
                    Err(e) => {
                        let err = DispatchError::from(e);
                        error!(connection_id = %conn.id, error = %err, "failed to run all paragraphs");
                        this.report(&conn, &err);
                    }
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Put every client back in step after a refused run
    fn resync_paragraphs(&self, note_id: &str) {
        self.services.notebook.process_note(note_id, |note| {
            if let Some(note) = note {
                let note: &Note = note;
                for paragraph in &note.paragraphs {
                    self.fanout.broadcast_paragraph(note, paragraph, None);
                }
            }
        });
    }

    pub(super) async fn paragraph_executed_by_spell(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let paragraph_id = Self::required(message, "id")?;
        let note_id = self.target_note(conn, message)?;
        let paragraph = self
            .services
            .notebook_service
            .spell(&note_id, &paragraph_id, &message.data, ctx)
            .await?;
        self.fanout.broadcast_except(
            &note_id,
            &OutboundMessage::new(Op::RunParagraphUsingSpell).put("paragraph", &paragraph),
            conn,
        );
        Ok(())
    }

    pub(super) async fn cancel_paragraph(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let paragraph_id = Self::required(message, "id")?;
        let note_id = self.target_note(conn, message)?;
        self.services
            .notebook_service
            .cancel_paragraph(&note_id, &paragraph_id, ctx)
            .await?;
        Ok(())
    }

    pub(super) async fn move_paragraph(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let paragraph_id = Self::required(message, "id")?;
        let index = message
            .get_index("index")
            .ok_or_else(|| DispatchError::invalid("index is required"))?;
        let note_id = self.target_note(conn, message)?;
        self.services
            .notebook_service
            .move_paragraph(&note_id, &paragraph_id, index, ctx)
            .await?;
        self.fanout.broadcast(
            &note_id,
            &OutboundMessage::new(Op::ParagraphMoved)
                .put("id", &paragraph_id)
                .put("index", index),
        );
        Ok(())
    }

    pub(super) async fn insert_paragraph(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> Result<Paragraph, DispatchError> {
        let index = message
            .get_index("index")
            .ok_or_else(|| DispatchError::invalid("index is required"))?;
        let note_id = self.target_note(conn, message)?;
        let config = message.get_object("config").cloned().unwrap_or_default();
        let paragraph = self
            .services
            .notebook_service
            .insert_paragraph(&note_id, index, &config, ctx)
            .await?;
        self.services.notebook.process_note(&note_id, |note| {
            if let Some(note) = note {
                self.fanout.broadcast_new_paragraph(note, &paragraph);
            }
        });
        Ok(paragraph)
    }

    pub(super) async fn copy_paragraph(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let inserted = self.insert_paragraph(conn, message, ctx).await?;
        let note_id = self.target_note(conn, message)?;
        let paragraph = self
            .services
            .notebook_service
            .update_paragraph(&note_id, &inserted.id, &paragraph_update(message), ctx)
            .await?;
        self.rebroadcast_paragraph(&note_id, &paragraph, message.msg_id.as_deref());
        Ok(())
    }

    pub(super) async fn remove_paragraph(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let paragraph_id = Self::required(message, "id")?;
        let note_id = self.target_note(conn, message)?;
        let removed = self
            .services
            .notebook_service
            .remove_paragraph(&note_id, &paragraph_id, ctx)
            .await?;
        self.fanout.broadcast(
            &note_id,
            &OutboundMessage::new(Op::ParagraphRemoved).put("id", &removed.id),
        );
        Ok(())
    }

    pub(super) async fn clear_paragraph_output(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let paragraph_id = Self::required(message, "id")?;
        let note_id = self.target_note(conn, message)?;
        let paragraph = self
            .services
            .notebook_service
            .clear_paragraph_output(&note_id, &paragraph_id, ctx)
            .await?;
        let user = ctx.user();
        let msg_id = message.msg_id.as_deref();

        self.services.notebook.process_note(&note_id, |note| {
            let Some(note) = note else {
                return;
            };
            let note: &Note = note;
            let current = note.paragraph(&paragraph.id).unwrap_or(&paragraph);
            if note.personalized_mode {
                let copy = current.user_paragraph(user).unwrap_or(current);
                self.fanout.unicast_paragraph(note, copy, user, msg_id);
            } else {
                self.fanout.broadcast_paragraph(note, current, msg_id);
            }
        });
        Ok(())
    }

    pub(super) async fn clear_all_paragraph_output(
        &self,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let note_id = Self::required(message, "id")?;
        let note = self
            .services
            .notebook_service
            .clear_all_paragraph_output(&note_id, ctx)
            .await?;
        self.fanout.broadcast_note(&note);
        Ok(())
    }

    /// Completion failures still answer with an empty list
    pub(super) async fn completion(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let paragraph_id = Self::required(message, "id")?;
        let note_id = self.target_note(conn, message)?;
        let buffer = message.get_string("buf").unwrap_or_default();
        let cursor = message.get_index("cursor").unwrap_or(0);

        let completions = match self
            .services
            .notebook_service
            .completion(&note_id, &paragraph_id, &buffer, cursor, ctx)
            .await
        {
            Ok(completions) => completions,
            Err(e) => {
                let err = DispatchError::from(e);
                warn!(connection_id = %conn.id, paragraph_id = %paragraph_id, error = %err, "completion failed");
                self.report(conn, &err);
                Vec::new()
            }
        };
        self.fanout.unicast(
            &OutboundMessage::new(Op::CompletionList)
                .put("id", &paragraph_id)
                .put("completions", completions),
            conn,
        );
        Ok(())
    }

    pub(super) async fn angular_object_updated(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        let paragraph_id = message.get_string("paragraphId");
        let group_id = Self::required(message, "interpreterGroupId")?;
        let name = Self::required(message, "name")?;
        let value = message.get("value").cloned().unwrap_or(Value::Null);
        self.angular
            .client_update(
                conn,
                ctx,
                &note_id,
                paragraph_id.as_deref(),
                &group_id,
                &name,
                value,
            )
            .await
    }

    pub(super) async fn angular_object_client_bind(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        let name = Self::required(message, "name")?;
        let value = message.get("value").cloned().unwrap_or(Value::Null);
        let paragraph_id = message.get_string("paragraphId").ok_or_else(|| {
            DispatchError::invalid("target paragraph not specified for angular value bind")
        })?;
        self.angular
            .bind(conn, &note_id, &paragraph_id, &name, value)
            .await
    }

    pub(super) async fn angular_object_client_unbind(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        let name = Self::required(message, "name")?;
        let paragraph_id = message.get_string("paragraphId").ok_or_else(|| {
            DispatchError::invalid("target paragraph not specified for angular value unbind")
        })?;
        self.angular.unbind(conn, &note_id, &paragraph_id, &name).await
    }

    /// Broadcast the stored version of a paragraph, falling back to `paragraph`
    fn rebroadcast_paragraph(&self, note_id: &str, paragraph: &Paragraph, msg_id: Option<&str>) {
        self.services.notebook.process_note(note_id, |note| {
            if let Some(note) = note {
                let note: &Note = note;
                let current = note.paragraph(&paragraph.id).unwrap_or(paragraph);
                self.fanout.broadcast_paragraph(note, current, msg_id);
            }
        });
    }
}
