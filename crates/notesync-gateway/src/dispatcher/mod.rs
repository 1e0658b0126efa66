//! Message dispatcher.
//!
//! Every inbound frame goes through the same pipeline: decode, authenticate
//! against the ticket store, bind the connection to its principal, refuse
//! edits to a note that is running, then route to the handler for its op.
//! Handlers report failures by returning [`DispatchError`]; the dispatcher
//! turns each into exactly one reply to the sender.

mod notes;
mod paragraphs;
mod revisions;
mod workspace;

use std::collections::HashSet;
use std::sync::Arc;

use notesync_config::GatewayConfig;
use notesync_core::{AuthenticationInfo, NotebookExt, ServiceContext};
use notesync_observability::GatewayMetrics;
use tracing::{debug, error, info, warn};

use crate::angular::AngularBridge;
use crate::connection::ConnectionHandle;
use crate::error::DispatchError;
use crate::fanout::Fanout;
use crate::pool::TaskPool;
use crate::protocol::{InboundMessage, Op, OutboundMessage};
use crate::registry::ConnectionRegistry;
use crate::services::Services;
use crate::session::{AuthResult, SessionGate};

/// Channel of clients watching the job manager page
pub const JOB_MANAGER_PAGE: &str = "JOB_MANAGER_PAGE";

const STALE_TICKET_INFO: &str =
    "Your ticket is invalid possibly due to server restart. Please login again.";

type HandlerResult = Result<(), DispatchError>;

#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<GatewayConfig>,
    gate: Arc<SessionGate>,
    registry: Arc<ConnectionRegistry>,
    fanout: Arc<Fanout>,
    angular: Arc<AngularBridge>,
    services: Services,
    pool: TaskPool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        config: Arc<GatewayConfig>,
        gate: Arc<SessionGate>,
        registry: Arc<ConnectionRegistry>,
        fanout: Arc<Fanout>,
        angular: Arc<AngularBridge>,
        services: Services,
        pool: TaskPool,
    ) -> Self {
        Self {
            config,
            gate,
            registry,
            fanout,
            angular,
            services,
            pool,
        }
    }

    pub fn on_open(&self, conn: &Arc<ConnectionHandle>) {
        self.registry.add(Arc::clone(conn));
        GatewayMetrics::connection_opened();
        info!(connection_id = %conn.id, peer = ?conn.addr, "connection opened");
    }

    pub fn on_close(&self, conn: &ConnectionHandle) {
        let Some(removal) = self.registry.remove(conn) else {
            return;
        };
        GatewayMetrics::connection_closed();
        info!(connection_id = %conn.id, user = ?removal.user, "connection closed");
        if let Some(note_id) = removal.document {
            self.fanout.collaborative_status(&note_id);
        }
    }

    /// Handle one text frame; frames of a connection are handled in order
    pub async fn on_message(&self, conn: &Arc<ConnectionHandle>, frame: &str) {
        if conn.is_closed() {
            return;
        }
        let message = match InboundMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                let err = DispatchError::from(e);
                error!(connection_id = %conn.id, error = %err, "failed to decode message");
                self.report(conn, &err);
                return;
            }
        };
        let op = message.op;
        if let Err(err) = self.process(conn, message).await {
            error!(
                connection_id = %conn.id,
                op = op.map_or("UNKNOWN", |op| op.as_str()),
                error = %err,
                "failed to handle message"
            );
            self.report(conn, &err);
        }
    }

    /// Send the sender the notice for a failure
    pub(crate) fn report(&self, conn: &ConnectionHandle, err: &DispatchError) {
        self.fanout.unicast(&err.to_reply(), conn);
    }

    async fn process(&self, conn: &Arc<ConnectionHandle>, message: InboundMessage) -> HandlerResult {
        if message.op != Some(Op::Ping) {
            debug!(
                connection_id = %conn.id,
                op = message.op.map_or("UNKNOWN", |op| op.as_str()),
                principal = ?message.principal,
                "RECEIVE"
            );
        }

        let entry = match self
            .gate
            .authenticate(message.principal.as_deref(), message.ticket.as_deref())
        {
            AuthResult::Accepted(entry) => entry,
            AuthResult::AnonymousDisallowed => {
                warn!(connection_id = %conn.id, "Anonymous access not allowed");
                GatewayMetrics::rejected("anonymous");
                return Ok(());
            }
            AuthResult::UnknownPrincipal => {
                debug!(connection_id = %conn.id, principal = ?message.principal, "no ticket on record");
                GatewayMetrics::rejected("unknown_principal");
                return Ok(());
            }
            AuthResult::StaleTicket => {
                debug!(connection_id = %conn.id, principal = ?message.principal, "invalid ticket");
                GatewayMetrics::rejected("stale_ticket");
                if message.op != Some(Op::Ping) {
                    self.fanout.unicast(
                        &OutboundMessage::new(Op::SessionLogout).put("info", STALE_TICKET_INFO),
                        conn,
                    );
                }
                return Ok(());
            }
        };

        self.registry.bind_user(conn, &entry.principal);
        conn.mark_authenticated();

        let Some(op) = message.op else {
            debug!(connection_id = %conn.id, "ignoring unknown op");
            return Ok(());
        };
        GatewayMetrics::message_received(op.as_str());

        if op.is_disabled_while_running() {
            self.ensure_not_running(conn, op, &message)?;
        }

        let ctx = ServiceContext::new(AuthenticationInfo::new(
            entry.principal,
            entry.roles,
            entry.ticket,
        ));
        self.dispatch(conn, op, &message, &ctx).await
    }

    /// Refuse `op` while its target note runs its paragraphs in sequence
    fn ensure_not_running(
        &self,
        conn: &ConnectionHandle,
        op: Op,
        message: &InboundMessage,
    ) -> HandlerResult {
        let target = message
            .get_string("noteId")
            .or_else(|| {
                if op.targets_note_by_id() {
                    message.get_string("id")
                } else {
                    None
                }
            })
            .or_else(|| self.registry.associated_document(&conn.id));
        let Some(note_id) = target else {
            return Ok(());
        };
        let running = self
            .services
            .notebook
            .process_note(&note_id, |note| note.map_or(false, |note| note.running));
        if running {
            Err(DispatchError::OperationConflict { op })
        } else {
            Ok(())
        }
    }

    async fn dispatch(
        &self,
        conn: &Arc<ConnectionHandle>,
        op: Op,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        match op {
            Op::ListNotes => self.list_notes(conn, ctx).await,
            Op::ReloadNotesFromRepo => self.reload_notes_from_repo(conn, ctx).await,
            Op::GetHomeNote => self.get_home_note(conn, ctx).await,
            Op::GetNote => self.get_note(conn, message, ctx, false).await,
            Op::ReloadNote => self.get_note(conn, message, ctx, true).await,
            Op::NewNote => self.create_note(conn, message, ctx).await,
            Op::DelNote => self.delete_note(message, ctx).await,
            Op::RemoveFolder => self.remove_folder(message, ctx).await,
            Op::MoveNoteToTrash => self.move_note_to_trash(message, ctx).await,
            Op::MoveFolderToTrash => self.move_folder_to_trash(message, ctx).await,
            Op::EmptyTrash => self.empty_trash(ctx).await,
            Op::RestoreFolder => self.restore_folder(message, ctx).await,
            Op::RestoreNote => self.restore_note(message, ctx).await,
            Op::RestoreAll => self.restore_all(ctx).await,
            Op::CloneNote => self.clone_note(conn, message, ctx).await,
            Op::ImportNote => self.import_note(message, ctx).await,
            Op::ConvertNoteNbformat => self.convert_note_nbformat(conn, message),
            Op::NoteUpdate => self.update_note(message, ctx).await,
            Op::NoteRename => self.rename_note(conn, message, ctx).await,
            Op::FolderRename => self.rename_folder(message, ctx).await,
            Op::UpdatePersonalizedMode => self.update_personalized_mode(message, ctx).await,
            Op::CommitParagraph => self.commit_paragraph(conn, message, ctx).await,
            Op::PatchParagraph => self.patch_paragraph(conn, message, ctx).await,
            Op::RunParagraph => self.run_paragraph(conn, message, ctx),
            Op::RunAllParagraphs => self.run_all_paragraphs(conn, message, ctx),
            Op::ParagraphExecutedBySpell => self.paragraph_executed_by_spell(conn, message, ctx).await,
            Op::CancelParagraph => self.cancel_paragraph(conn, message, ctx).await,
            Op::MoveParagraph => self.move_paragraph(conn, message, ctx).await,
            Op::InsertParagraph => self.insert_paragraph(conn, message, ctx).await.map(|_| ()),
            Op::CopyParagraph => self.copy_paragraph(conn, message, ctx).await,
            Op::ParagraphRemove => self.remove_paragraph(conn, message, ctx).await,
            Op::ParagraphClearOutput => self.clear_paragraph_output(conn, message, ctx).await,
            Op::ParagraphClearAllOutput => self.clear_all_paragraph_output(message, ctx).await,
            Op::Completion => self.completion(conn, message, ctx).await,
            Op::AngularObjectUpdated => self.angular_object_updated(conn, message, ctx).await,
            Op::AngularObjectClientBind => self.angular_object_client_bind(conn, message).await,
            Op::AngularObjectClientUnbind => self.angular_object_client_unbind(conn, message).await,
            Op::ListConfigurations => self.list_configurations(conn, ctx).await,
            Op::CheckpointNote => self.checkpoint_note(conn, message, ctx).await,
            Op::ListRevisionHistory => self.list_revision_history(conn, message, ctx).await,
            Op::SetNoteRevision => self.set_note_revision(conn, message, ctx).await,
            Op::NoteRevision => self.note_revision(conn, message, ctx).await,
            Op::NoteRevisionForCompare => self.note_revision_for_compare(conn, message, ctx).await,
            Op::ListNoteJobs => self.list_note_jobs(conn, ctx).await,
            Op::UnsubscribeUpdateNoteJobs => self.unsubscribe_note_jobs(conn),
            Op::GetInterpreterBindings => self.get_interpreter_bindings(conn, message),
            Op::SaveInterpreterBindings => self.save_interpreter_bindings(conn, message, ctx),
            Op::EditorSetting => self.editor_setting(conn, message, ctx).await,
            Op::GetInterpreterSettings => self.get_interpreter_settings(conn, ctx),
            Op::Watcher => self.switch_to_watcher(conn),
            Op::SaveNoteForms => self.save_note_forms(message, ctx).await,
            Op::RemoveNoteForms => self.remove_note_forms(message, ctx).await,
            Op::Ping => Ok(()),
            Op::Note
            | Op::NotesInfo
            | Op::Paragraph
            | Op::ParagraphAdded
            | Op::ParagraphRemoved
            | Op::ParagraphMoved
            | Op::ParagraphAppendOutput
            | Op::ParagraphUpdateOutput
            | Op::Progress
            | Op::CompletionList
            | Op::NoteUpdated
            | Op::RunParagraphUsingSpell
            | Op::AngularObjectUpdate
            | Op::AngularObjectRemove
            | Op::ConfigurationsInfo
            | Op::InterpreterBindings
            | Op::InterpreterSettings
            | Op::ErrorInfo
            | Op::AuthInfo
            | Op::SessionLogout
            | Op::Notice
            | Op::ConvertedNoteNbformat
            | Op::ListUpdateNoteJobs
            | Op::NoteRunningStatus
            | Op::ParasInfo
            | Op::AppAppendOutput
            | Op::AppUpdateOutput
            | Op::AppLoad
            | Op::AppStatusChange
            | Op::CollaborativeModeStatus => {
                debug!(connection_id = %conn.id, %op, "ignoring server-only op");
                Ok(())
            }
        }
    }

    /// Explicit `noteId`, else the note the connection is viewing
    fn target_note(&self, conn: &ConnectionHandle, message: &InboundMessage) -> Result<String, DispatchError> {
        message
            .get_string("noteId")
            .or_else(|| self.registry.associated_document(&conn.id))
            .ok_or_else(|| DispatchError::invalid("noteId is required"))
    }

    fn required(message: &InboundMessage, key: &str) -> Result<String, DispatchError> {
        message
            .get_string(key)
            .ok_or_else(|| DispatchError::invalid(format!("{} is required", key)))
    }

    /// Start viewing a note and tell both the old and new viewers
    fn open_note(&self, conn: &Arc<ConnectionHandle>, note_id: &str) {
        if let Some(previous) = self.registry.subscribe_document(conn, note_id) {
            self.fanout.collaborative_status(&previous);
        }
        self.fanout.collaborative_status(note_id);
    }

    fn leave_notes(&self, conn: &ConnectionHandle) {
        if let Some(previous) = self.registry.leave_documents(&conn.id) {
            self.fanout.collaborative_status(&previous);
        }
    }

    /// Send every connected user the notes they may read
    pub(crate) fn broadcast_note_list_update(&self) {
        let notes = self.services.notebook.notes_info();
        for user in self.registry.connected_users() {
            let mut user_and_roles = self.services.authorization.roles(&user);
            user_and_roles.insert(user.clone());
            let readable: Vec<_> = notes
                .iter()
                .filter(|info| {
                    self.services
                        .authorization
                        .is_reader(&info.id, &user_and_roles)
                })
                .collect();
            self.fanout.multicast_to_user(
                &user,
                &OutboundMessage::new(Op::NotesInfo).put("notes", readable),
            );
        }
    }

    fn permission_error(
        &self,
        conn: &ConnectionHandle,
        operation: &str,
        user: &str,
        user_and_roles: &HashSet<String>,
        allowed: &HashSet<String>,
    ) {
        info!(user, operation, "insufficient privileges");
        self.fanout.unicast(
            &OutboundMessage::auth_info(format!(
                "Insufficient privileges to {} note.\n\nAllowed users or roles: {:?}\n\nBut the user {} belongs to: {:?}",
                operation, allowed, user, user_and_roles
            )),
            conn,
        );
    }
}
