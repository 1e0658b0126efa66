//! Note revision handlers

use notesync_core::ServiceContext;

use super::{Dispatcher, HandlerResult};
use crate::connection::ConnectionHandle;
use crate::error::DispatchError;
use crate::protocol::{InboundMessage, Op, OutboundMessage};

const CHECKPOINT_FAILED: &str = "Couldn't checkpoint note revision: possibly no changes found or storage doesn't support versioning. Please check the logs for more details.";

impl Dispatcher {
    pub(super) async fn checkpoint_note(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        let commit_message = message.get_string("commitMessage").unwrap_or_default();
        let revision = self
            .services
            .notebook_service
            .checkpoint_note(&note_id, &commit_message, ctx)
            .await?;
        if revision.is_empty() {
            return Err(DispatchError::invalid(CHECKPOINT_FAILED));
        }

        let history = self
            .services
            .notebook_service
            .list_revision_history(&note_id, ctx)
            .await?;
        self.fanout.unicast(
            &OutboundMessage::new(Op::ListRevisionHistory).put("revisionList", history),
            conn,
        );
        Ok(())
    }

    pub(super) async fn list_revision_history(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        let history = self
            .services
            .notebook_service
            .list_revision_history(&note_id, ctx)
            .await?;
        self.fanout.unicast(
            &OutboundMessage::new(Op::ListRevisionHistory).put("revisionList", history),
            conn,
        );
        Ok(())
    }

    pub(super) async fn set_note_revision(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        let revision_id = Self::required(message, "revisionId")?;
        let note = self
            .services
            .notebook_service
            .set_note_revision(&note_id, &revision_id, ctx)
            .await?;
        self.fanout.unicast(
            &OutboundMessage::new(Op::SetNoteRevision).put("status", true),
            conn,
        );
        self.fanout.broadcast_note(&note);
        Ok(())
    }

    pub(super) async fn note_revision(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        let revision_id = Self::required(message, "revisionId")?;
        let note = self
            .services
            .notebook_service
            .note_by_revision(&note_id, &revision_id, ctx)
            .await?;
        self.fanout.unicast(
            &OutboundMessage::new(Op::NoteRevision)
                .put("noteId", &note_id)
                .put("revisionId", &revision_id)
                .put("note", &note),
            conn,
        );
        Ok(())
    }

    /// Same as [`Self::note_revision`], tagged with the diff pane it is for
    pub(super) async fn note_revision_for_compare(
        &self,
        conn: &ConnectionHandle,
        message: &InboundMessage,
        ctx: &ServiceContext,
    ) -> HandlerResult {
        let note_id = self.target_note(conn, message)?;
        let revision_id = Self::required(message, "revisionId")?;
        let position = message.get_string("position");
        let note = self
            .services
            .notebook_service
            .note_by_revision_for_compare(&note_id, &revision_id, ctx)
            .await?;
        self.fanout.unicast(
            &OutboundMessage::new(Op::NoteRevisionForCompare)
                .put("noteId", &note_id)
                .put("revisionId", &revision_id)
                .put("position", position)
                .put("note", &note),
            conn,
        );
        Ok(())
    }
}
