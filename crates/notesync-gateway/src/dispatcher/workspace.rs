//! Configuration, job manager, interpreter and watcher handlers

use std::sync::Arc;

use chrono::Utc;
use notesync_core::{InterpreterBinding, NotebookExt, ServiceContext, ServiceError};
use tracing::{error, info, warn};

use super::{Dispatcher, HandlerResult, JOB_MANAGER_PAGE};
use crate::connection::ConnectionHandle;
use crate::protocol::{InboundMessage, Op, OutboundMessage};

impl Dispatcher {
    pub(super) async fn list_configurations(
        &self,
        conn: &ConnectionHandle,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let mut properties = self.services.configuration.all_properties(ctx).await?;
        properties.insert(
            "isRevisionSupported".to_string(),
            self.services.notebook.is_revision_supported().to_string(),
        );
        self.fanout.unicast(
            &OutboundMessage::new(Op::ConfigurationsInfo).put("configurations", properties),
            conn,
        );
        Ok(())
    }

    /// Subscribe to job updates and send the current snapshot
    pub(super) async fn list_note_jobs(
        &self,
        conn: &Arc<ConnectionHandle>,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        self.registry.subscribe_channel(conn, JOB_MANAGER_PAGE);
        match self.services.jobs.note_job_info_since(0, ctx).await {
            Ok(jobs) => {
                let note_jobs = serde_json::json!({
                    "lastResponseUnixTime": Utc::now().timestamp_millis(),
                    "jobs": jobs,
                });
                self.fanout.unicast(
                    &OutboundMessage::new(Op::ListNoteJobs).put("noteJobs", note_jobs),
                    conn,
                );
            }
            Err(e) => warn!(connection_id = %conn.id, error = %e, "failed to list note jobs"),
        }
        Ok(())
    }

    pub(super) fn unsubscribe_note_jobs(&self, conn: &ConnectionHandle) -> HandlerResult {
        self.registry.unsubscribe_channel(&conn.id, JOB_MANAGER_PAGE);
        Ok(())
    }

    /// Bound settings first, then the remaining ones unselected
    fn interpreter_bindings(&self, note_id: &str) -> Vec<InterpreterBinding> {
        let bound = self.services.notebook.bound_interpreter_settings(note_id);
        let mut bindings: Vec<InterpreterBinding> = bound.iter().map(InterpreterBinding::from).collect();
        for setting in self.services.interpreters.settings() {
            if bound.iter().any(|b| b.id == setting.id) {
                continue;
            }
            let mut binding = InterpreterBinding::from(&setting);
            binding.selected = false;
            bindings.push(binding);
        }
        bindings
    }

    pub(super) fn get_interpreter_bindings(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        self.fanout.unicast(
            &OutboundMessage::new(Op::InterpreterBindings)
                .put("interpreterBindings", self.interpreter_bindings(&note_id)),
            conn,
        );
        Ok(())
    }

    pub(super) fn save_interpreter_bindings(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        if !self
            .services
            .authorization
            .is_writer(&note_id, &ctx.user_and_roles)
        {
            let writers = self.services.authorization.writers(&note_id);
            self.permission_error(conn, "update", ctx.user(), &ctx.user_and_roles, &writers);
            return Ok(());
        }

        let selected = message.get_strings("selectedSettingIds");
        let default_group = selected
            .first()
            .and_then(|id| self.services.interpreters.setting(id))
            .map(|setting| setting.name);

        self.services
            .notebook
            .process_note(&note_id, |note| match note {
                Some(note) => {
                    if default_group.is_some() {
                        note.default_interpreter_group = default_group;
                    }
                    self.services.notebook.save_note(note, &ctx.auth)
                }
                None => Err(ServiceError::not_found(format!("No such note: {}", note_id))),
            })?;
        info!(note_id = %note_id, settings = ?selected, "interpreter bindings saved");

        self.fanout.unicast(
            &OutboundMessage::new(Op::InterpreterBindings)
                .put("interpreterBindings", self.interpreter_bindings(&note_id)),
            conn,
        );
        Ok(())
    }

    pub(super) async fn editor_setting(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        let paragraph_id = Self::required(message, "paragraphId")?;
        let text = message.get_string("paragraphText").unwrap_or_default();
        match self
            .services
            .notebook_service
            .editor_setting(&note_id, &paragraph_id, &text, ctx)
            .await
        {
            Ok(editor) => self.fanout.unicast(
                &OutboundMessage::new(Op::EditorSetting)
                    .put("paragraphId", &paragraph_id)
                    .put("editor", editor),
                conn,
            ),
            Err(e) => warn!(connection_id = %conn.id, paragraph_id = %paragraph_id, error = %e, "failed to get editor setting"),
        }
        Ok(())
    }

    pub(super) fn get_interpreter_settings(
        &self,
        conn: &ConnectionHandle,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let settings: Vec<_> = self
            .services
            .interpreters
            .settings()
            .into_iter()
            .filter(|setting| setting.is_user_authorized(&ctx.user_and_roles))
            .collect();
        self.fanout.unicast(
            &OutboundMessage::new(Op::InterpreterSettings).put("interpreterSettings", settings),
            conn,
        );
        Ok(())
    }

    pub(super) fn switch_to_watcher(&self, conn: &Arc<ConnectionHandle>) -> HandlerResult {
        if !self.gate.may_watch(conn) {
            error!(connection_id = %conn.id, "watcher key mismatch, refusing watcher mode");
            return Ok(());
        }
        if self.registry.switch_to_watcher(conn) {
            info!(connection_id = %conn.id, "connection switched to watcher");
        }
        Ok(())
    }
}
