use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::angular::AngularObject;

/// Upper bound on streamed output blocks per paragraph
pub const MAX_OUTPUT_BLOCKS: usize = 1024;

/// Paragraph execution status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParagraphStatus {
    #[default]
    Ready,
    Pending,
    Running,
    Finished,
    Error,
    Aborted,
}

impl ParagraphStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Aborted)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ParagraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ready => "READY",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// One output block of a paragraph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
}

impl ResultMessage {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            kind: "TEXT".to_string(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParagraphResult {
    pub code: String,
    pub msg: Vec<ResultMessage>,
}

/// Import/export format of a note payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteFormat {
    Zeppelin,
    Jupyter,
}

/// A paragraph of a note.
///
/// In personalized mode every user works on a private copy kept in
/// `user_paragraphs`; the copies never leave the process as part of the note.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paragraph {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub status: ParagraphStatus,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ParagraphResult>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub runtime_infos: Map<String, Value>,
    #[serde(skip)]
    pub output_buffer: Vec<ResultMessage>,
    #[serde(skip)]
    pub user_paragraphs: BTreeMap<String, Paragraph>,
}

impl Paragraph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Generate a fresh paragraph id, e.g. `paragraph_1718000000000_3f2a9c1e`
    pub fn generate_id() -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("paragraph_{}_{}", Utc::now().timestamp_millis(), &suffix[..8])
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn has_text(&self) -> bool {
        self.text.as_deref().map_or(false, |t| !t.trim().is_empty())
    }

    pub fn user_paragraph(&self, user: &str) -> Option<&Paragraph> {
        self.user_paragraphs.get(user)
    }

    /// Private copy for `user`, created from the shared paragraph on first use
    pub fn user_paragraph_mut(&mut self, user: &str) -> &mut Paragraph {
        if !self.user_paragraphs.contains_key(user) {
            let copy = self.copy_for(user);
            self.user_paragraphs.insert(user.to_string(), copy);
        }
        self.user_paragraphs.entry(user.to_string()).or_default()
    }

    fn copy_for(&self, user: &str) -> Paragraph {
        Paragraph {
            id: self.id.clone(),
            title: self.title.clone(),
            text: self.text.clone(),
            user: Some(user.to_string()),
            status: self.status,
            config: self.config.clone(),
            params: self.params.clone(),
            results: self.results.clone(),
            runtime_infos: self.runtime_infos.clone(),
            output_buffer: self.output_buffer.clone(),
            user_paragraphs: BTreeMap::new(),
        }
    }

    pub fn clear_output(&mut self) {
        self.results = None;
        self.output_buffer.clear();
    }

    /// Clear the output of `user`'s copy and return that copy
    pub fn clear_user_output(&mut self, user: &str) -> Paragraph {
        let copy = self.user_paragraph_mut(user);
        copy.clear_output();
        copy.clone()
    }

    pub fn set_status_to_user_paragraphs(&mut self) {
        let status = self.status;
        for copy in self.user_paragraphs.values_mut() {
            copy.status = status;
        }
    }

    /// Replace output block `index`, padding with empty text blocks.
    ///
    /// Returns `false` and leaves the buffer alone when `index` is at or past
    /// [`MAX_OUTPUT_BLOCKS`].
    pub fn update_output_buffer(&mut self, index: usize, kind: &str, data: &str) -> bool {
        if index >= MAX_OUTPUT_BLOCKS {
            return false;
        }
        if self.output_buffer.len() <= index {
            self.output_buffer.resize(index + 1, ResultMessage::text(""));
        }
        self.output_buffer[index] = ResultMessage {
            kind: kind.to_string(),
            data: data.to_string(),
        };
        true
    }

    /// Persist the streamed output buffer into the paragraph results
    pub fn checkpoint_output(&mut self) {
        if self.output_buffer.is_empty() {
            return;
        }
        let code = self
            .results
            .as_ref()
            .map(|r| r.code.clone())
            .unwrap_or_else(|| "SUCCESS".to_string());
        self.results = Some(ParagraphResult {
            code,
            msg: self.output_buffer.clone(),
        });
    }

    pub fn update_runtime_infos(
        &mut self,
        label: &str,
        tooltip: &str,
        infos: &Map<String, Value>,
        group: &str,
        setting_id: &str,
    ) {
        for (key, value) in infos {
            let entry = self.runtime_infos.entry(key.clone()).or_insert_with(|| {
                json!({
                    "propertyName": key,
                    "label": label,
                    "tooltip": tooltip,
                    "group": group,
                    "intpSettingId": setting_id,
                    "values": [],
                })
            });
            if let Some(values) = entry.get_mut("values").and_then(Value::as_array_mut) {
                values.push(value.clone());
            }
        }
    }
}

/// Summary used in note lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteInfo {
    pub id: String,
    pub path: String,
}

impl NoteInfo {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// A notebook document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_interpreter_group: Option<String>,
    #[serde(default)]
    pub paragraphs: Vec<Paragraph>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub info: Map<String, Value>,
    #[serde(default)]
    pub personalized_mode: bool,
    /// Set while the note runs its paragraphs sequentially
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub note_forms: Map<String, Value>,
    #[serde(default)]
    pub note_params: Map<String, Value>,
    /// Persisted angular objects, keyed by interpreter group id
    #[serde(default)]
    pub angular_objects: BTreeMap<String, Vec<AngularObject>>,
}

impl Note {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = Uuid::new_v4().simple().to_string()[..9].to_uppercase();
        Self {
            id,
            path: format!("/{}", name.trim_start_matches('/')),
            name,
            ..Default::default()
        }
    }

    pub fn info(&self) -> NoteInfo {
        NoteInfo::new(self.id.clone(), self.path.clone())
    }

    pub fn is_trash(&self) -> bool {
        self.path.starts_with("/~Trash")
    }

    pub fn paragraph(&self, id: &str) -> Option<&Paragraph> {
        self.paragraphs.iter().find(|p| p.id == id)
    }

    pub fn paragraph_mut(&mut self, id: &str) -> Option<&mut Paragraph> {
        self.paragraphs.iter_mut().find(|p| p.id == id)
    }

    pub fn paragraph_index(&self, id: &str) -> Option<usize> {
        self.paragraphs.iter().position(|p| p.id == id)
    }

    pub fn is_last_paragraph(&self, id: &str) -> bool {
        self.paragraphs.last().map_or(false, |p| p.id == id)
    }

    /// Append an empty paragraph and return a copy of it
    pub fn add_new_paragraph(&mut self, user: Option<&str>) -> Paragraph {
        let index = self.paragraphs.len();
        self.insert_new_paragraph(index, user)
    }

    /// Insert an empty paragraph at `index` (clamped) and return a copy of it
    pub fn insert_new_paragraph(&mut self, index: usize, user: Option<&str>) -> Paragraph {
        let mut paragraph = Paragraph::new(Paragraph::generate_id());
        paragraph.user = user.map(str::to_string);
        let index = index.min(self.paragraphs.len());
        self.paragraphs.insert(index, paragraph.clone());
        paragraph
    }

    pub fn remove_paragraph(&mut self, id: &str) -> Option<Paragraph> {
        let index = self.paragraph_index(id)?;
        Some(self.paragraphs.remove(index))
    }

    pub fn move_paragraph(&mut self, id: &str, index: usize) -> bool {
        let Some(from) = self.paragraph_index(id) else {
            return false;
        };
        if index >= self.paragraphs.len() {
            return false;
        }
        let paragraph = self.paragraphs.remove(from);
        self.paragraphs.insert(index, paragraph);
        true
    }

    pub fn clear_all_paragraph_output(&mut self) {
        for paragraph in &mut self.paragraphs {
            paragraph.clear_output();
        }
    }

    pub fn clear_personalized_paragraph_output(
        &mut self,
        paragraph_id: &str,
        user: &str,
    ) -> Option<Paragraph> {
        self.paragraph_mut(paragraph_id)
            .map(|p| p.clear_user_output(user))
    }

    /// `{forms, params}` payload of `SAVE_NOTE_FORMS`
    pub fn forms_data(&self) -> Value {
        json!({
            "forms": self.note_forms,
            "params": self.note_params,
        })
    }

    pub fn angular_objects_for(&self, group_id: &str) -> &[AngularObject] {
        self.angular_objects
            .get(group_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn add_or_update_angular_object(&mut self, group_id: &str, object: AngularObject) {
        let objects = self.angular_objects.entry(group_id.to_string()).or_default();
        match objects.iter_mut().find(|o| o.same_identity(&object)) {
            Some(existing) => *existing = object,
            None => objects.push(object),
        }
    }

    pub fn delete_angular_object(
        &mut self,
        group_id: &str,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
    ) -> bool {
        let Some(objects) = self.angular_objects.get_mut(group_id) else {
            return false;
        };
        let before = objects.len();
        objects.retain(|o| !(o.name == name && o.matches_scope(note_id, paragraph_id)));
        let removed = objects.len() != before;
        if objects.is_empty() {
            self.angular_objects.remove(group_id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note_with(ids: &[&str]) -> Note {
        let mut note = Note::new("Demo");
        note.paragraphs = ids.iter().map(|id| Paragraph::new(*id)).collect();
        note
    }

    #[test]
    fn last_paragraph_detection() {
        let note = note_with(&["p1", "p2"]);
        assert!(note.is_last_paragraph("p2"));
        assert!(!note.is_last_paragraph("p1"));
        assert!(!Note::new("empty").is_last_paragraph("p1"));
    }

    #[test]
    fn new_note_path_and_id() {
        let note = Note::new("folder/Demo");
        assert_eq!(note.path, "/folder/Demo");
        assert_eq!(note.id.len(), 9);
    }

    #[test]
    fn insert_clamps_index() {
        let mut note = note_with(&["p1"]);
        let added = note.insert_new_paragraph(10, Some("alice"));
        assert_eq!(note.paragraph_index(&added.id), Some(1));
        assert_eq!(added.user.as_deref(), Some("alice"));
    }

    #[test]
    fn move_paragraph_rejects_out_of_range() {
        let mut note = note_with(&["p1", "p2", "p3"]);
        assert!(note.move_paragraph("p3", 0));
        assert_eq!(note.paragraphs[0].id, "p3");
        assert!(!note.move_paragraph("p1", 3));
        assert!(!note.move_paragraph("missing", 0));
    }

    #[test]
    fn personalized_clear_only_touches_user_copy() {
        let mut note = note_with(&["p1"]);
        note.paragraphs[0].results = Some(ParagraphResult {
            code: "SUCCESS".into(),
            msg: vec![ResultMessage::text("42")],
        });

        let cleared = note.clear_personalized_paragraph_output("p1", "alice").unwrap();
        assert!(cleared.results.is_none());
        assert_eq!(cleared.user.as_deref(), Some("alice"));
        assert!(note.paragraphs[0].results.is_some());
        assert!(note.paragraphs[0].user_paragraph("alice").is_some());
    }

    #[test]
    fn user_copies_are_not_serialized() {
        let mut note = note_with(&["p1"]);
        note.paragraphs[0].user_paragraph_mut("alice");
        let value = serde_json::to_value(&note).unwrap();
        assert!(value["paragraphs"][0].get("userParagraphs").is_none());
    }

    #[test]
    fn angular_object_upsert_and_delete() {
        let mut note = note_with(&["p1"]);
        let id = note.id.clone();
        note.add_or_update_angular_object(
            "spark",
            AngularObject::scoped("x", json!(1), id.clone(), Some("p1".into())),
        );
        note.add_or_update_angular_object(
            "spark",
            AngularObject::scoped("x", json!(2), id.clone(), Some("p1".into())),
        );
        assert_eq!(note.angular_objects_for("spark").len(), 1);
        assert_eq!(note.angular_objects_for("spark")[0].value, json!(2));

        assert!(!note.delete_angular_object("spark", Some(&id), None, "x"));
        assert!(note.delete_angular_object("spark", Some(&id), Some("p1"), "x"));
        assert!(note.angular_objects_for("spark").is_empty());
    }

    #[test]
    fn output_buffer_checkpoint() {
        let mut paragraph = Paragraph::new("p1");
        assert!(paragraph.update_output_buffer(1, "HTML", "<b>hi</b>"));
        assert_eq!(paragraph.output_buffer.len(), 2);
        paragraph.checkpoint_output();
        let results = paragraph.results.unwrap();
        assert_eq!(results.code, "SUCCESS");
        assert_eq!(results.msg[1].kind, "HTML");
    }

    #[test]
    fn output_index_past_bound_is_ignored() {
        let mut paragraph = Paragraph::new("p1");
        assert!(!paragraph.update_output_buffer(MAX_OUTPUT_BLOCKS, "TEXT", "x"));
        assert!(!paragraph.update_output_buffer(usize::MAX, "TEXT", "x"));
        assert!(paragraph.output_buffer.is_empty());

        assert!(paragraph.update_output_buffer(MAX_OUTPUT_BLOCKS - 1, "TEXT", "last"));
        assert_eq!(paragraph.output_buffer.len(), MAX_OUTPUT_BLOCKS);
    }

    #[test]
    fn runtime_infos_accumulate_values() {
        let mut paragraph = Paragraph::new("p1");
        let mut infos = Map::new();
        infos.insert("jobUrl".into(), json!("http://a"));
        paragraph.update_runtime_infos("SPARK JOB", "View in UI", &infos, "spark", "spark_1");
        paragraph.update_runtime_infos("SPARK JOB", "View in UI", &infos, "spark", "spark_1");
        let values = paragraph.runtime_infos["jobUrl"]["values"].as_array().unwrap();
        assert_eq!(values.len(), 2);
    }
}
