//! In-memory collaborators for tests.
//!
//! [`MemoryBackend`] implements every collaborator trait over plain maps so
//! the gateway can be exercised without storage or interpreters. Calls are
//! recorded by name, and a failure can be injected for the next call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::context::{AuthenticationInfo, ServiceContext};
use crate::error::{ServiceError, ServiceResult};
use crate::service::{
    AngularObjectRegistry, AuthorizationService, ConfigurationService, InterpreterRegistry,
    JobManagerService, NoteHandle, Notebook, NotebookService, ParagraphUpdate,
};
use crate::types::{
    AngularObject, InterpreterCompletion, InterpreterSetting, Note, NoteFormat, NoteInfo,
    NoteJobInfo, Paragraph, ParagraphStatus, Revision,
};

const TRASH: &str = "/~Trash";

/// Owners, readers and writers of one note. Empty sets grant everyone.
#[derive(Debug, Clone, Default)]
pub struct NotePermissions {
    pub owners: HashSet<String>,
    pub readers: HashSet<String>,
    pub writers: HashSet<String>,
}

impl NotePermissions {
    pub fn readers(readers: &[&str]) -> Self {
        Self {
            readers: readers.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }
}

/// Angular object registry of one in-memory interpreter group
#[derive(Debug, Default)]
pub struct MemoryAngularRegistry {
    objects: Mutex<Vec<AngularObject>>,
    notifications: Mutex<Vec<String>>,
}

impl MemoryAngularRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: AngularObject) {
        let mut objects = self.objects.lock();
        objects.retain(|o| !o.same_identity(&object));
        objects.push(object);
    }

    pub fn get(&self, name: &str, note_id: Option<&str>, paragraph_id: Option<&str>) -> Option<AngularObject> {
        self.objects
            .lock()
            .iter()
            .find(|o| o.name == name && o.matches_scope(note_id, paragraph_id))
            .cloned()
    }

    /// Remote notifications sent so far, e.g. `add:x` or `remove:x`
    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().clone()
    }
}

#[async_trait]
impl AngularObjectRegistry for MemoryAngularRegistry {
    async fn add_and_notify_remote(
        &self,
        name: &str,
        value: Value,
        note_id: &str,
        paragraph_id: Option<&str>,
    ) -> ServiceResult<AngularObject> {
        let object = AngularObject::scoped(name, value, note_id, paragraph_id.map(str::to_string));
        self.insert(object.clone());
        self.notifications.lock().push(format!("add:{}", name));
        Ok(object)
    }

    async fn remove_and_notify_remote(
        &self,
        name: &str,
        note_id: &str,
        paragraph_id: Option<&str>,
    ) -> ServiceResult<Option<AngularObject>> {
        let mut objects = self.objects.lock();
        let index = objects
            .iter()
            .position(|o| o.name == name && o.matches_scope(Some(note_id), paragraph_id));
        let removed = index.map(|i| objects.remove(i));
        self.notifications.lock().push(format!("remove:{}", name));
        Ok(removed)
    }

    fn all_with_global(&self, note_id: &str) -> Vec<AngularObject> {
        self.objects
            .lock()
            .iter()
            .filter(|o| o.is_global() || o.note_id.as_deref() == Some(note_id))
            .cloned()
            .collect()
    }
}

/// All collaborators backed by in-memory maps
#[derive(Default)]
pub struct MemoryBackend {
    notes: RwLock<BTreeMap<String, NoteHandle>>,
    home_note: RwLock<Option<String>>,
    permissions: RwLock<HashMap<String, NotePermissions>>,
    new_note_permissions: RwLock<Option<NotePermissions>>,
    roles: RwLock<HashMap<String, HashSet<String>>>,
    settings: RwLock<Vec<InterpreterSetting>>,
    bindings: RwLock<HashMap<String, Vec<String>>>,
    setting_groups: RwLock<HashMap<String, String>>,
    paragraph_groups: RwLock<HashMap<String, String>>,
    registries: RwLock<HashMap<String, Arc<MemoryAngularRegistry>>>,
    revisions: RwLock<HashMap<String, Vec<Revision>>>,
    properties: RwLock<BTreeMap<String, String>>,
    calls: Mutex<Vec<String>>,
    runs: Mutex<Vec<(String, String)>>,
    failure: Mutex<Option<ServiceError>>,
    saves: AtomicUsize,
    revision_supported: AtomicBool,
    refuse_run_all: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_note(&self, note: Note) -> NoteHandle {
        let handle = Arc::new(Mutex::new(note));
        let id = handle.lock().id.clone();
        self.notes.write().insert(id, handle.clone());
        handle
    }

    pub fn snapshot(&self, note_id: &str) -> Option<Note> {
        self.notes.read().get(note_id).map(|h| h.lock().clone())
    }

    pub fn set_home_note(&self, note_id: Option<&str>) {
        *self.home_note.write() = note_id.map(str::to_string);
    }

    pub fn set_permissions(&self, note_id: &str, permissions: NotePermissions) {
        self.permissions.write().insert(note_id.to_string(), permissions);
    }

    /// Permissions given to notes created from now on; the creator is added as owner
    pub fn set_new_note_permissions(&self, permissions: NotePermissions) {
        *self.new_note_permissions.write() = Some(permissions);
    }

    pub fn set_roles(&self, user: &str, roles: &[&str]) {
        self.roles
            .write()
            .insert(user.to_string(), roles.iter().map(|r| r.to_string()).collect());
    }

    pub fn set_running(&self, note_id: &str, running: bool) {
        if let Some(handle) = self.notes.read().get(note_id) {
            handle.lock().running = running;
        }
    }

    /// Bind a setting to a note; the setting runs in `group_id`
    pub fn bind_setting(&self, note_id: &str, setting: InterpreterSetting, group_id: &str) {
        {
            let mut settings = self.settings.write();
            if !settings.iter().any(|s| s.id == setting.id) {
                settings.push(setting.clone());
            }
        }
        self.bindings
            .write()
            .entry(note_id.to_string())
            .or_default()
            .push(setting.id.clone());
        self.setting_groups
            .write()
            .insert(setting.id, group_id.to_string());
        self.registry(group_id);
    }

    /// Execute `paragraph_id` in `group_id`
    pub fn assign_group(&self, paragraph_id: &str, group_id: &str) {
        self.paragraph_groups
            .write()
            .insert(paragraph_id.to_string(), group_id.to_string());
        self.registry(group_id);
    }

    pub fn registry(&self, group_id: &str) -> Arc<MemoryAngularRegistry> {
        self.registries
            .write()
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(MemoryAngularRegistry::new()))
            .clone()
    }

    pub fn set_property(&self, key: &str, value: &str) {
        self.properties.write().insert(key.to_string(), value.to_string());
    }

    pub fn set_revision_supported(&self, supported: bool) {
        self.revision_supported.store(supported, Ordering::SeqCst);
    }

    pub fn refuse_run_all(&self, refuse: bool) {
        self.refuse_run_all.store(refuse, Ordering::SeqCst);
    }

    /// Fail the next collaborator call with `error`
    pub fn fail_next(&self, error: ServiceError) {
        *self.failure.lock() = Some(error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn was_called(&self, call: &str) -> bool {
        self.calls.lock().iter().any(|c| c == call)
    }

    /// `(note_id, paragraph_id)` of every run request
    pub fn runs(&self) -> Vec<(String, String)> {
        self.runs.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn enter(&self, call: &str) -> ServiceResult<()> {
        self.calls.lock().push(call.to_string());
        match self.failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn handle(&self, note_id: &str) -> ServiceResult<NoteHandle> {
        self.notes
            .read()
            .get(note_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("No such note: {}", note_id)))
    }

    fn check_reader(&self, note_id: &str, ctx: &ServiceContext) -> ServiceResult<()> {
        if self.is_reader(note_id, &ctx.user_and_roles) {
            return Ok(());
        }
        let allowed = self.readers(note_id);
        Err(ServiceError::forbidden(format!(
            "Insufficient privileges to read note.\n\nAllowed users or roles: {:?}\n\nBut the user {} belongs to: {:?}",
            allowed,
            ctx.user(),
            ctx.user_and_roles
        )))
    }

    fn with_note<R>(&self, note_id: &str, f: impl FnOnce(&mut Note) -> ServiceResult<R>) -> ServiceResult<R> {
        let handle = self.handle(note_id)?;
        let mut note = handle.lock();
        f(&mut note)
    }

    fn with_paragraph<R>(
        &self,
        note_id: &str,
        paragraph_id: &str,
        f: impl FnOnce(&mut Paragraph, bool) -> R,
    ) -> ServiceResult<R> {
        self.with_note(note_id, |note| {
            let personalized = note.personalized_mode;
            note.paragraph_mut(paragraph_id)
                .map(|p| f(p, personalized))
                .ok_or_else(|| ServiceError::not_found(format!("No such paragraph: {}", paragraph_id)))
        })
    }

    fn notes_under(&self, folder_path: &str) -> Vec<NoteHandle> {
        let prefix = format!("{}/", folder_path.trim_end_matches('/'));
        self.notes
            .read()
            .values()
            .filter(|h| h.lock().path.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn readable_infos(&self, ctx: &ServiceContext) -> Vec<NoteInfo> {
        self.notes_info()
            .into_iter()
            .filter(|info| self.is_reader(&info.id, &ctx.user_and_roles))
            .collect()
    }

    fn require_revision(&self, note_id: &str, revision_id: &str) -> ServiceResult<()> {
        let known = self
            .revisions
            .read()
            .get(note_id)
            .map_or(false, |revs| revs.iter().any(|r| r.id == revision_id));
        if known {
            Ok(())
        } else {
            Err(ServiceError::not_found(format!("No such revision: {}", revision_id)))
        }
    }
}

fn apply_update(paragraph: &mut Paragraph, update: &ParagraphUpdate) {
    if update.title.is_some() {
        paragraph.title = update.title.clone();
    }
    if update.text.is_some() {
        paragraph.text = update.text.clone();
    }
    paragraph.params = update.params.clone();
    paragraph.config = update.config.clone();
}

fn name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn allowed(set: &HashSet<String>, user_and_roles: &HashSet<String>) -> bool {
    !set.is_disjoint(user_and_roles)
}

impl Notebook for MemoryBackend {
    fn note(&self, note_id: &str) -> Option<NoteHandle> {
        self.notes.read().get(note_id).cloned()
    }

    fn notes_info(&self) -> Vec<NoteInfo> {
        self.notes.read().values().map(|h| h.lock().info()).collect()
    }

    fn save_note(&self, _note: &Note, _subject: &AuthenticationInfo) -> ServiceResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_revision_supported(&self) -> bool {
        self.revision_supported.load(Ordering::SeqCst)
    }

    fn convert_to_nbformat(&self, note: &Note) -> ServiceResult<String> {
        let cells = note
            .paragraphs
            .iter()
            .map(|p| json!({ "cell_type": "code", "source": p.text.clone().unwrap_or_default() }))
            .collect::<Vec<_>>();
        serde_json::to_string(&json!({ "nbformat": 4, "cells": cells }))
            .map_err(|e| ServiceError::failed(e.to_string()))
    }

    fn bound_interpreter_settings(&self, note_id: &str) -> Vec<InterpreterSetting> {
        let bindings = self.bindings.read();
        let settings = self.settings.read();
        bindings
            .get(note_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| settings.iter().find(|s| &s.id == id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotebookService for MemoryBackend {
    async fn list_notes_info(&self, _reload: bool, ctx: &ServiceContext) -> ServiceResult<Vec<NoteInfo>> {
        self.enter("list_notes_info")?;
        Ok(self.readable_infos(ctx))
    }

    async fn get_home_note(&self, _ctx: &ServiceContext) -> ServiceResult<Option<Note>> {
        self.enter("get_home_note")?;
        let home = self.home_note.read().clone();
        Ok(home.and_then(|id| self.snapshot(&id)))
    }

    async fn get_note(&self, note_id: &str, _reload: bool, ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("get_note")?;
        self.check_reader(note_id, ctx)?;
        self.with_note(note_id, |note| Ok(note.clone()))
    }

    async fn create_note(
        &self,
        name: Option<&str>,
        default_interpreter_group: Option<&str>,
        ctx: &ServiceContext,
    ) -> ServiceResult<Note> {
        self.enter("create_note")?;
        let mut note = Note::new(name.unwrap_or("Untitled Note"));
        note.default_interpreter_group = default_interpreter_group.map(str::to_string);
        note.paragraphs.push(Paragraph::new(Paragraph::generate_id()));
        if let Some(mut permissions) = self.new_note_permissions.read().clone() {
            permissions.owners.insert(ctx.user().to_string());
            self.set_permissions(&note.id, permissions);
        }
        self.insert_note(note.clone());
        Ok(note)
    }

    async fn remove_note(&self, note_id: &str, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.enter("remove_note")?;
        self.notes
            .write()
            .remove(note_id)
            .map(|_| ())
            .ok_or_else(|| ServiceError::not_found(format!("No such note: {}", note_id)))
    }

    async fn remove_folder(&self, folder_path: &str, _ctx: &ServiceContext) -> ServiceResult<Vec<NoteInfo>> {
        self.enter("remove_folder")?;
        let removed = self
            .notes_under(folder_path)
            .iter()
            .map(|h| h.lock().info())
            .collect::<Vec<_>>();
        let mut notes = self.notes.write();
        for info in &removed {
            notes.remove(&info.id);
        }
        Ok(removed)
    }

    async fn move_note_to_trash(&self, note_id: &str, _ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("move_note_to_trash")?;
        self.with_note(note_id, |note| {
            if !note.is_trash() {
                note.path = format!("{}{}", TRASH, note.path);
            }
            Ok(note.clone())
        })
    }

    async fn move_folder_to_trash(&self, folder_path: &str, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.enter("move_folder_to_trash")?;
        for handle in self.notes_under(folder_path) {
            let mut note = handle.lock();
            note.path = format!("{}{}", TRASH, note.path);
        }
        Ok(())
    }

    async fn restore_note(&self, note_id: &str, _ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("restore_note")?;
        self.with_note(note_id, |note| {
            if let Some(path) = note.path.strip_prefix(TRASH) {
                note.path = path.to_string();
            }
            Ok(note.clone())
        })
    }

    async fn restore_folder(&self, folder_path: &str, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.enter("restore_folder")?;
        for handle in self.notes_under(folder_path) {
            let mut note = handle.lock();
            if let Some(path) = note.path.strip_prefix(TRASH) {
                note.path = path.to_string();
            }
        }
        Ok(())
    }

    async fn restore_all(&self, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.enter("restore_all")?;
        for handle in self.notes.read().values() {
            let mut note = handle.lock();
            if let Some(path) = note.path.strip_prefix(TRASH) {
                note.path = path.to_string();
            }
        }
        Ok(())
    }

    async fn empty_trash(&self, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.enter("empty_trash")?;
        self.notes.write().retain(|_, h| !h.lock().is_trash());
        Ok(())
    }

    async fn clone_note(&self, note_id: &str, new_name: Option<&str>, _ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("clone_note")?;
        let source = self.with_note(note_id, |note| Ok(note.clone()))?;
        let name = new_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} Clone", source.name));
        let mut clone = Note::new(name);
        clone.paragraphs = source.paragraphs;
        clone.config = source.config;
        clone.default_interpreter_group = source.default_interpreter_group;
        self.insert_note(clone.clone());
        Ok(clone)
    }

    async fn import_note(
        &self,
        name: Option<&str>,
        payload: &Value,
        format: NoteFormat,
        _ctx: &ServiceContext,
    ) -> ServiceResult<Note> {
        self.enter("import_note")?;
        let name = name
            .map(str::to_string)
            .or_else(|| payload.get("name").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "Imported Note".to_string());
        let mut note = Note::new(name);
        match format {
            NoteFormat::Zeppelin => {
                let imported: Note = serde_json::from_value(payload.clone())
                    .map_err(|e| ServiceError::failed_with_cause("Fail to import note", e.to_string()))?;
                note.paragraphs = imported.paragraphs;
                note.config = imported.config;
            }
            NoteFormat::Jupyter => {
                let cells = payload.get("cells").and_then(Value::as_array).cloned().unwrap_or_default();
                note.paragraphs = cells
                    .iter()
                    .map(|cell| {
                        let source = match cell.get("source") {
                            Some(Value::Array(lines)) => lines.iter().filter_map(Value::as_str).collect::<String>(),
                            Some(Value::String(text)) => text.clone(),
                            _ => String::new(),
                        };
                        Paragraph::new(Paragraph::generate_id()).with_text(source)
                    })
                    .collect();
            }
        }
        self.insert_note(note.clone());
        Ok(note)
    }

    async fn update_note(
        &self,
        note_id: &str,
        name: Option<&str>,
        config: &Map<String, Value>,
        _ctx: &ServiceContext,
    ) -> ServiceResult<Note> {
        self.enter("update_note")?;
        self.with_note(note_id, |note| {
            if let Some(name) = name {
                note.name = name.to_string();
            }
            note.config = config.clone();
            Ok(note.clone())
        })
    }

    async fn rename_note(
        &self,
        note_id: &str,
        new_name: &str,
        relative: bool,
        _ctx: &ServiceContext,
    ) -> ServiceResult<Note> {
        self.enter("rename_note")?;
        if new_name.trim().is_empty() {
            return Err(ServiceError::invalid_argument("Note name can not be empty"));
        }
        self.with_note(note_id, |note| {
            note.path = if relative {
                let parent = note.path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
                format!("{}/{}", parent, new_name)
            } else {
                format!("/{}", new_name.trim_start_matches('/'))
            };
            note.name = name_of(&note.path);
            Ok(note.clone())
        })
    }

    async fn rename_folder(&self, folder_path: &str, new_path: &str, _ctx: &ServiceContext) -> ServiceResult<Vec<NoteInfo>> {
        self.enter("rename_folder")?;
        let old = folder_path.trim_end_matches('/');
        let new = new_path.trim_end_matches('/');
        let mut renamed = Vec::new();
        for handle in self.notes_under(old) {
            let mut note = handle.lock();
            note.path = format!("{}{}", new, &note.path[old.len()..]);
            renamed.push(note.info());
        }
        Ok(renamed)
    }

    async fn update_personalized_mode(&self, note_id: &str, personalized: bool, _ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("update_personalized_mode")?;
        self.with_note(note_id, |note| {
            note.personalized_mode = personalized;
            Ok(note.clone())
        })
    }

    async fn clear_all_paragraph_output(&self, note_id: &str, _ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("clear_all_paragraph_output")?;
        self.with_note(note_id, |note| {
            note.clear_all_paragraph_output();
            Ok(note.clone())
        })
    }

    async fn update_paragraph(
        &self,
        note_id: &str,
        paragraph_id: &str,
        update: &ParagraphUpdate,
        ctx: &ServiceContext,
    ) -> ServiceResult<Paragraph> {
        self.enter("update_paragraph")?;
        self.with_paragraph(note_id, paragraph_id, |paragraph, personalized| {
            apply_update(paragraph, update);
            if personalized {
                apply_update(paragraph.user_paragraph_mut(ctx.user()), update);
            }
            paragraph.clone()
        })
    }

    async fn patch_paragraph(&self, note_id: &str, paragraph_id: &str, patch: &str, _ctx: &ServiceContext) -> ServiceResult<String> {
        self.enter("patch_paragraph")?;
        self.with_paragraph(note_id, paragraph_id, |_, _| patch.to_string())
    }

    async fn remove_paragraph(&self, note_id: &str, paragraph_id: &str, _ctx: &ServiceContext) -> ServiceResult<Paragraph> {
        self.enter("remove_paragraph")?;
        self.with_note(note_id, |note| {
            note.remove_paragraph(paragraph_id)
                .ok_or_else(|| ServiceError::not_found(format!("No such paragraph: {}", paragraph_id)))
        })
    }

    async fn clear_paragraph_output(&self, note_id: &str, paragraph_id: &str, ctx: &ServiceContext) -> ServiceResult<Paragraph> {
        self.enter("clear_paragraph_output")?;
        self.with_paragraph(note_id, paragraph_id, |paragraph, personalized| {
            if personalized {
                paragraph.clear_user_output(ctx.user());
            } else {
                paragraph.clear_output();
            }
            paragraph.clone()
        })
    }

    async fn move_paragraph(&self, note_id: &str, paragraph_id: &str, index: usize, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.enter("move_paragraph")?;
        self.with_note(note_id, |note| {
            if note.move_paragraph(paragraph_id, index) {
                Ok(())
            } else {
                Err(ServiceError::invalid_argument(format!(
                    "newIndex {} is out of bounds",
                    index
                )))
            }
        })
    }

    async fn insert_paragraph(
        &self,
        note_id: &str,
        index: usize,
        config: &Map<String, Value>,
        ctx: &ServiceContext,
    ) -> ServiceResult<Paragraph> {
        self.enter("insert_paragraph")?;
        self.with_note(note_id, |note| {
            let inserted = note.insert_new_paragraph(index, Some(ctx.user()));
            let paragraph = note
                .paragraph_mut(&inserted.id)
                .ok_or_else(|| ServiceError::failed("inserted paragraph vanished"))?;
            paragraph.config = config.clone();
            Ok(paragraph.clone())
        })
    }

    async fn cancel_paragraph(&self, note_id: &str, paragraph_id: &str, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.enter("cancel_paragraph")?;
        self.with_paragraph(note_id, paragraph_id, |paragraph, _| {
            paragraph.status = ParagraphStatus::Aborted;
        })
    }

    async fn run_paragraph(
        &self,
        note_id: &str,
        paragraph_id: &str,
        update: &ParagraphUpdate,
        ctx: &ServiceContext,
    ) -> ServiceResult<Paragraph> {
        self.enter("run_paragraph")?;
        let paragraph = self.with_paragraph(note_id, paragraph_id, |paragraph, personalized| {
            apply_update(paragraph, update);
            paragraph.status = ParagraphStatus::Pending;
            if personalized {
                let copy = paragraph.user_paragraph_mut(ctx.user());
                apply_update(copy, update);
                copy.status = ParagraphStatus::Pending;
            }
            paragraph.clone()
        })?;
        self.runs.lock().push((note_id.to_string(), paragraph_id.to_string()));
        Ok(paragraph)
    }

    async fn run_all_paragraphs(&self, note_id: &str, paragraphs: &[Value], _ctx: &ServiceContext) -> ServiceResult<bool> {
        self.enter("run_all_paragraphs")?;
        self.handle(note_id)?;
        if self.refuse_run_all.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut runs = self.runs.lock();
        for paragraph in paragraphs {
            if let Some(id) = paragraph.get("id").and_then(Value::as_str) {
                runs.push((note_id.to_string(), id.to_string()));
            }
        }
        Ok(true)
    }

    async fn spell(
        &self,
        note_id: &str,
        paragraph_id: &str,
        payload: &Map<String, Value>,
        _ctx: &ServiceContext,
    ) -> ServiceResult<Paragraph> {
        self.enter("spell")?;
        self.with_paragraph(note_id, paragraph_id, |paragraph, _| {
            if let Some(text) = payload.get("paragraph").and_then(Value::as_str) {
                paragraph.text = Some(text.to_string());
            }
            paragraph.status = ParagraphStatus::Finished;
            paragraph.clone()
        })
    }

    async fn execute_paragraph(&self, note_id: &str, paragraph_id: &str, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.enter("execute_paragraph")?;
        self.with_paragraph(note_id, paragraph_id, |_, _| ())?;
        self.runs.lock().push((note_id.to_string(), paragraph_id.to_string()));
        Ok(())
    }

    async fn completion(
        &self,
        _note_id: &str,
        _paragraph_id: &str,
        buffer: &str,
        cursor: usize,
        _ctx: &ServiceContext,
    ) -> ServiceResult<Vec<InterpreterCompletion>> {
        self.enter("completion")?;
        let head = buffer.get(..cursor.min(buffer.len())).unwrap_or(buffer);
        let word = head.rsplit(|c: char| !c.is_alphanumeric()).next().unwrap_or("");
        Ok(["print", "println", "printf"]
            .iter()
            .filter(|candidate| !word.is_empty() && candidate.starts_with(word))
            .map(|candidate| InterpreterCompletion::new(*candidate, *candidate))
            .collect())
    }

    async fn update_angular_object(
        &self,
        note_id: &str,
        paragraph_id: Option<&str>,
        group_id: &str,
        name: &str,
        value: Value,
        _ctx: &ServiceContext,
    ) -> ServiceResult<AngularObject> {
        self.enter("update_angular_object")?;
        let registry = self
            .registries
            .read()
            .get(group_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("No interpreter group: {}", group_id)))?;
        let object = AngularObject::scoped(name, value, note_id, paragraph_id.map(str::to_string));
        registry.insert(object.clone());
        Ok(object)
    }

    async fn editor_setting(
        &self,
        _note_id: &str,
        _paragraph_id: &str,
        paragraph_text: &str,
        _ctx: &ServiceContext,
    ) -> ServiceResult<Map<String, Value>> {
        self.enter("editor_setting")?;
        let language = paragraph_text
            .trim_start()
            .strip_prefix('%')
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap_or("text");
        let mut editor = Map::new();
        editor.insert("language".into(), json!(language));
        editor.insert("editOnDblClick".into(), json!(false));
        Ok(editor)
    }

    async fn save_note_forms(&self, note_id: &str, params: &Map<String, Value>, _ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("save_note_forms")?;
        self.with_note(note_id, |note| {
            note.note_params = params.clone();
            Ok(note.clone())
        })
    }

    async fn remove_note_forms(&self, note_id: &str, form_name: &str, _ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("remove_note_forms")?;
        self.with_note(note_id, |note| {
            note.note_forms.remove(form_name);
            note.note_params.remove(form_name);
            Ok(note.clone())
        })
    }

    async fn checkpoint_note(&self, note_id: &str, commit_message: &str, _ctx: &ServiceContext) -> ServiceResult<Revision> {
        self.enter("checkpoint_note")?;
        self.handle(note_id)?;
        if !self.is_revision_supported() {
            return Ok(Revision::empty());
        }
        let revision = Revision {
            id: Uuid::new_v4().simple().to_string(),
            message: commit_message.to_string(),
            time: Utc::now().timestamp(),
        };
        self.revisions
            .write()
            .entry(note_id.to_string())
            .or_default()
            .push(revision.clone());
        Ok(revision)
    }

    async fn list_revision_history(&self, note_id: &str, _ctx: &ServiceContext) -> ServiceResult<Vec<Revision>> {
        self.enter("list_revision_history")?;
        Ok(self.revisions.read().get(note_id).cloned().unwrap_or_default())
    }

    async fn set_note_revision(&self, note_id: &str, revision_id: &str, _ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("set_note_revision")?;
        self.require_revision(note_id, revision_id)?;
        self.with_note(note_id, |note| Ok(note.clone()))
    }

    async fn note_by_revision(&self, note_id: &str, revision_id: &str, _ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("note_by_revision")?;
        self.require_revision(note_id, revision_id)?;
        self.with_note(note_id, |note| Ok(note.clone()))
    }

    async fn note_by_revision_for_compare(&self, note_id: &str, revision_id: &str, _ctx: &ServiceContext) -> ServiceResult<Note> {
        self.enter("note_by_revision_for_compare")?;
        self.require_revision(note_id, revision_id)?;
        self.with_note(note_id, |note| Ok(note.clone()))
    }
}

impl AuthorizationService for MemoryBackend {
    fn is_reader(&self, note_id: &str, user_and_roles: &HashSet<String>) -> bool {
        let permissions = self.permissions.read();
        let Some(p) = permissions.get(note_id) else {
            return true;
        };
        p.readers.is_empty()
            || allowed(&p.readers, user_and_roles)
            || allowed(&p.writers, user_and_roles)
            || allowed(&p.owners, user_and_roles)
    }

    fn is_writer(&self, note_id: &str, user_and_roles: &HashSet<String>) -> bool {
        let permissions = self.permissions.read();
        let Some(p) = permissions.get(note_id) else {
            return true;
        };
        p.writers.is_empty()
            || allowed(&p.writers, user_and_roles)
            || allowed(&p.owners, user_and_roles)
    }

    fn owners(&self, note_id: &str) -> HashSet<String> {
        self.permissions
            .read()
            .get(note_id)
            .map(|p| p.owners.clone())
            .unwrap_or_default()
    }

    fn readers(&self, note_id: &str) -> HashSet<String> {
        self.permissions
            .read()
            .get(note_id)
            .map(|p| p.readers.clone())
            .unwrap_or_default()
    }

    fn writers(&self, note_id: &str) -> HashSet<String> {
        self.permissions
            .read()
            .get(note_id)
            .map(|p| p.writers.clone())
            .unwrap_or_default()
    }

    fn roles(&self, user: &str) -> HashSet<String> {
        self.roles.read().get(user).cloned().unwrap_or_default()
    }
}

impl InterpreterRegistry for MemoryBackend {
    fn interpreter_group_for_paragraph(&self, note: &Note, paragraph_id: &str) -> ServiceResult<String> {
        let unknown = || ServiceError::not_found(format!("Unknown paragraph with id : {}", paragraph_id));
        if note.paragraph(paragraph_id).is_none() {
            return Err(unknown());
        }
        self.paragraph_groups
            .read()
            .get(paragraph_id)
            .cloned()
            .ok_or_else(unknown)
    }

    fn interpreter_group(&self, setting_id: &str, _user: &str, _note_id: &str) -> Option<String> {
        self.setting_groups.read().get(setting_id).cloned()
    }

    fn angular_registry(&self, group_id: &str) -> Option<Arc<dyn AngularObjectRegistry>> {
        self.registries
            .read()
            .get(group_id)
            .map(|r| r.clone() as Arc<dyn AngularObjectRegistry>)
    }

    fn settings(&self) -> Vec<InterpreterSetting> {
        self.settings.read().clone()
    }
}

#[async_trait]
impl JobManagerService for MemoryBackend {
    async fn note_job_info(&self, note_id: &str, _ctx: &ServiceContext) -> ServiceResult<Vec<NoteJobInfo>> {
        self.enter("note_job_info")?;
        let now = Utc::now().timestamp_millis();
        self.with_note(note_id, |note| Ok(vec![NoteJobInfo::from_note(note, now)]))
    }

    async fn note_job_info_since(&self, _last_update_unix_ms: i64, _ctx: &ServiceContext) -> ServiceResult<Vec<NoteJobInfo>> {
        self.enter("note_job_info_since")?;
        let now = Utc::now().timestamp_millis();
        Ok(self
            .notes
            .read()
            .values()
            .map(|h| NoteJobInfo::from_note(&h.lock(), now))
            .collect())
    }

    async fn remove_note_job_info(&self, note_id: &str, _ctx: &ServiceContext) -> ServiceResult<Vec<NoteJobInfo>> {
        self.enter("remove_note_job_info")?;
        Ok(vec![NoteJobInfo::removed(note_id, Utc::now().timestamp_millis())])
    }
}

#[async_trait]
impl ConfigurationService for MemoryBackend {
    async fn all_properties(&self, _ctx: &ServiceContext) -> ServiceResult<BTreeMap<String, String>> {
        self.enter("all_properties")?;
        Ok(self.properties.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::NotebookExt;
    use tokio_test::{assert_err, assert_ok};

    fn ctx(user: &str) -> ServiceContext {
        ServiceContext::new(AuthenticationInfo::new(user, Vec::new(), "t"))
    }

    #[tokio::test]
    async fn injected_failure_is_reported_once() {
        let backend = MemoryBackend::new();
        backend.fail_next(ServiceError::failed("boom"));
        assert_err!(backend.list_notes_info(false, &ctx("alice")).await);
        assert_ok!(backend.list_notes_info(false, &ctx("alice")).await);
        assert_eq!(backend.calls(), vec!["list_notes_info", "list_notes_info"]);
    }

    #[tokio::test]
    async fn reader_permissions_filter_note_list() {
        let backend = MemoryBackend::new();
        let open = backend.insert_note(Note::new("open")).lock().id.clone();
        let secret = backend.insert_note(Note::new("secret")).lock().id.clone();
        backend.set_permissions(&secret, NotePermissions::readers(&["bob"]));

        let alice = backend.list_notes_info(false, &ctx("alice")).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].id, open);

        let err = backend.get_note(&secret, false, &ctx("alice")).await.unwrap_err();
        assert!(err.is_forbidden());
    }

    #[tokio::test]
    async fn trash_and_restore_round_trip_path() {
        let backend = MemoryBackend::new();
        let id = backend.insert_note(Note::new("a/b")).lock().id.clone();
        let trashed = backend.move_note_to_trash(&id, &ctx("alice")).await.unwrap();
        assert_eq!(trashed.path, "/~Trash/a/b");
        let restored = backend.restore_note(&id, &ctx("alice")).await.unwrap();
        assert_eq!(restored.path, "/a/b");
    }

    #[test]
    fn process_note_scopes_lock() {
        let backend = MemoryBackend::new();
        let id = backend.insert_note(Note::new("n")).lock().id.clone();
        let renamed = backend.process_note(&id, |note| {
            let note = note.unwrap();
            note.name = "renamed".into();
            note.name.clone()
        });
        assert_eq!(renamed, "renamed");
        assert!(backend.process_note("missing", |note| note.is_none()));
        assert_eq!(backend.snapshot(&id).unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn completion_filters_by_prefix() {
        let backend = MemoryBackend::new();
        let items = backend
            .completion("n", "p", "x = prin", 8, &ctx("alice"))
            .await
            .unwrap();
        assert_eq!(items.len(), 3);
        let none = backend.completion("n", "p", "", 0, &ctx("alice")).await.unwrap();
        assert!(none.is_empty());
    }
}
