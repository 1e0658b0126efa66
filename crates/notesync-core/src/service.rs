//! Collaborator contracts.
//!
//! Storage, execution, authorization and job bookkeeping live outside the
//! gateway. Every asynchronous call reports its outcome exactly once through
//! the returned [`ServiceResult`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::context::{AuthenticationInfo, ServiceContext};
use crate::error::ServiceResult;
use crate::types::{
    AngularObject, InterpreterCompletion, InterpreterSetting, Note, NoteFormat, NoteInfo,
    NoteJobInfo, Paragraph, Revision,
};

/// Shared, lockable handle to a loaded note
pub type NoteHandle = Arc<Mutex<Note>>;

/// Client-supplied paragraph fields for commit and run requests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParagraphUpdate {
    pub title: Option<String>,
    pub text: Option<String>,
    pub params: Map<String, Value>,
    pub config: Map<String, Value>,
}

/// Direct access to loaded notes
pub trait Notebook: Send + Sync {
    fn note(&self, note_id: &str) -> Option<NoteHandle>;

    fn notes_info(&self) -> Vec<NoteInfo>;

    fn save_note(&self, note: &Note, subject: &AuthenticationInfo) -> ServiceResult<()>;

    fn is_revision_supported(&self) -> bool;

    /// Render a note in the Jupyter notebook format
    fn convert_to_nbformat(&self, note: &Note) -> ServiceResult<String>;

    /// Interpreter settings bound to the note
    fn bound_interpreter_settings(&self, note_id: &str) -> Vec<InterpreterSetting>;
}

/// Scoped access to a single note.
///
/// The note lock is held only for the duration of the closure and is released
/// on every exit path.
pub trait NotebookExt: Notebook {
    fn process_note<R>(&self, note_id: &str, f: impl FnOnce(Option<&mut Note>) -> R) -> R {
        match self.note(note_id) {
            Some(handle) => {
                let mut note = handle.lock();
                f(Some(&mut *note))
            }
            None => f(None),
        }
    }
}

impl<T: Notebook + ?Sized> NotebookExt for T {}

/// Note and paragraph operations requested by clients
#[async_trait]
pub trait NotebookService: Send + Sync {
    async fn list_notes_info(&self, reload: bool, ctx: &ServiceContext)
        -> ServiceResult<Vec<NoteInfo>>;

    async fn get_home_note(&self, ctx: &ServiceContext) -> ServiceResult<Option<Note>>;

    async fn get_note(&self, note_id: &str, reload: bool, ctx: &ServiceContext)
        -> ServiceResult<Note>;

    async fn create_note(
        &self,
        name: Option<&str>,
        default_interpreter_group: Option<&str>,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;

    async fn remove_note(&self, note_id: &str, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Remove every note under `folder_path`, returning the removed notes
    async fn remove_folder(&self, folder_path: &str, ctx: &ServiceContext)
        -> ServiceResult<Vec<NoteInfo>>;

    async fn move_note_to_trash(&self, note_id: &str, ctx: &ServiceContext)
        -> ServiceResult<Note>;

    async fn move_folder_to_trash(&self, folder_path: &str, ctx: &ServiceContext)
        -> ServiceResult<()>;

    async fn restore_note(&self, note_id: &str, ctx: &ServiceContext) -> ServiceResult<Note>;

    async fn restore_folder(&self, folder_path: &str, ctx: &ServiceContext) -> ServiceResult<()>;

    async fn restore_all(&self, ctx: &ServiceContext) -> ServiceResult<()>;

    async fn empty_trash(&self, ctx: &ServiceContext) -> ServiceResult<()>;

    async fn clone_note(
        &self,
        note_id: &str,
        new_name: Option<&str>,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;

    async fn import_note(
        &self,
        name: Option<&str>,
        payload: &Value,
        format: NoteFormat,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;

    async fn update_note(
        &self,
        note_id: &str,
        name: Option<&str>,
        config: &Map<String, Value>,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;

    async fn rename_note(
        &self,
        note_id: &str,
        new_name: &str,
        relative: bool,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;

    async fn rename_folder(
        &self,
        folder_path: &str,
        new_path: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<Vec<NoteInfo>>;

    async fn update_personalized_mode(
        &self,
        note_id: &str,
        personalized: bool,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;

    async fn clear_all_paragraph_output(&self, note_id: &str, ctx: &ServiceContext)
        -> ServiceResult<Note>;

    async fn update_paragraph(
        &self,
        note_id: &str,
        paragraph_id: &str,
        update: &ParagraphUpdate,
        ctx: &ServiceContext,
    ) -> ServiceResult<Paragraph>;

    /// Apply a text patch, returning the patch as accepted
    async fn patch_paragraph(
        &self,
        note_id: &str,
        paragraph_id: &str,
        patch: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<String>;

    async fn remove_paragraph(
        &self,
        note_id: &str,
        paragraph_id: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<Paragraph>;

    async fn clear_paragraph_output(
        &self,
        note_id: &str,
        paragraph_id: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<Paragraph>;

    async fn move_paragraph(
        &self,
        note_id: &str,
        paragraph_id: &str,
        index: usize,
        ctx: &ServiceContext,
    ) -> ServiceResult<()>;

    async fn insert_paragraph(
        &self,
        note_id: &str,
        index: usize,
        config: &Map<String, Value>,
        ctx: &ServiceContext,
    ) -> ServiceResult<Paragraph>;

    async fn cancel_paragraph(
        &self,
        note_id: &str,
        paragraph_id: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<()>;

    async fn run_paragraph(
        &self,
        note_id: &str,
        paragraph_id: &str,
        update: &ParagraphUpdate,
        ctx: &ServiceContext,
    ) -> ServiceResult<Paragraph>;

    /// Returns `false` when the run was refused and clients need a resync
    async fn run_all_paragraphs(
        &self,
        note_id: &str,
        paragraphs: &[Value],
        ctx: &ServiceContext,
    ) -> ServiceResult<bool>;

    /// Record a paragraph that the client executed through a spell
    async fn spell(
        &self,
        note_id: &str,
        paragraph_id: &str,
        payload: &Map<String, Value>,
        ctx: &ServiceContext,
    ) -> ServiceResult<Paragraph>;

    /// Run a paragraph on behalf of an execution backend
    async fn execute_paragraph(
        &self,
        note_id: &str,
        paragraph_id: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<()>;

    async fn completion(
        &self,
        note_id: &str,
        paragraph_id: &str,
        buffer: &str,
        cursor: usize,
        ctx: &ServiceContext,
    ) -> ServiceResult<Vec<InterpreterCompletion>>;

    async fn update_angular_object(
        &self,
        note_id: &str,
        paragraph_id: Option<&str>,
        group_id: &str,
        name: &str,
        value: Value,
        ctx: &ServiceContext,
    ) -> ServiceResult<AngularObject>;

    async fn editor_setting(
        &self,
        note_id: &str,
        paragraph_id: &str,
        paragraph_text: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<Map<String, Value>>;

    async fn save_note_forms(
        &self,
        note_id: &str,
        params: &Map<String, Value>,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;

    async fn remove_note_forms(
        &self,
        note_id: &str,
        form_name: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;

    async fn checkpoint_note(
        &self,
        note_id: &str,
        commit_message: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<Revision>;

    async fn list_revision_history(&self, note_id: &str, ctx: &ServiceContext)
        -> ServiceResult<Vec<Revision>>;

    async fn set_note_revision(
        &self,
        note_id: &str,
        revision_id: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;

    async fn note_by_revision(
        &self,
        note_id: &str,
        revision_id: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;

    async fn note_by_revision_for_compare(
        &self,
        note_id: &str,
        revision_id: &str,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note>;
}

/// Note permission lookups
pub trait AuthorizationService: Send + Sync {
    fn is_reader(&self, note_id: &str, user_and_roles: &HashSet<String>) -> bool;

    fn is_writer(&self, note_id: &str, user_and_roles: &HashSet<String>) -> bool;

    fn owners(&self, note_id: &str) -> HashSet<String>;

    fn readers(&self, note_id: &str) -> HashSet<String>;

    fn writers(&self, note_id: &str) -> HashSet<String>;

    fn roles(&self, user: &str) -> HashSet<String>;
}

/// Resolution of paragraphs and settings to interpreter groups
pub trait InterpreterRegistry: Send + Sync {
    /// Group id that executes `paragraph_id` of `note`
    fn interpreter_group_for_paragraph(&self, note: &Note, paragraph_id: &str)
        -> ServiceResult<String>;

    /// Group id of a setting for one user and note, if the group is running
    fn interpreter_group(&self, setting_id: &str, user: &str, note_id: &str) -> Option<String>;

    fn angular_registry(&self, group_id: &str) -> Option<Arc<dyn AngularObjectRegistry>>;

    fn settings(&self) -> Vec<InterpreterSetting>;

    fn setting(&self, setting_id: &str) -> Option<InterpreterSetting> {
        self.settings().into_iter().find(|s| s.id == setting_id)
    }

    fn setting_ids(&self) -> Vec<String> {
        self.settings().into_iter().map(|s| s.id).collect()
    }
}

/// Angular object registry of one interpreter group
#[async_trait]
pub trait AngularObjectRegistry: Send + Sync {
    /// Add (or overwrite) an object and push it to the remote process
    async fn add_and_notify_remote(
        &self,
        name: &str,
        value: Value,
        note_id: &str,
        paragraph_id: Option<&str>,
    ) -> ServiceResult<AngularObject>;

    /// Remove an object and tell the remote process
    async fn remove_and_notify_remote(
        &self,
        name: &str,
        note_id: &str,
        paragraph_id: Option<&str>,
    ) -> ServiceResult<Option<AngularObject>>;

    /// Objects of the note plus the group's global objects
    fn all_with_global(&self, note_id: &str) -> Vec<AngularObject>;
}

#[async_trait]
pub trait JobManagerService: Send + Sync {
    async fn note_job_info(&self, note_id: &str, ctx: &ServiceContext)
        -> ServiceResult<Vec<NoteJobInfo>>;

    /// Job info of every note updated after `last_update_unix_ms`
    async fn note_job_info_since(&self, last_update_unix_ms: i64, ctx: &ServiceContext)
        -> ServiceResult<Vec<NoteJobInfo>>;

    async fn remove_note_job_info(&self, note_id: &str, ctx: &ServiceContext)
        -> ServiceResult<Vec<NoteJobInfo>>;
}

#[async_trait]
pub trait ConfigurationService: Send + Sync {
    async fn all_properties(&self, ctx: &ServiceContext)
        -> ServiceResult<BTreeMap<String, String>>;
}
