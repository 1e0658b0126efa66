use serde::{Deserialize, Serialize};

use super::note::{Note, ParagraphStatus};

/// A stored revision of a note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,
    pub message: String,
    pub time: i64,
}

impl Revision {
    /// Storage without versioning reports checkpoints as an empty revision.
    pub fn empty() -> Self {
        Self {
            id: String::new(),
            message: String::new(),
            time: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParagraphJobInfo {
    pub id: String,
    pub name: String,
    pub status: ParagraphStatus,
}

/// Job-manager view of one note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteJobInfo {
    pub note_id: String,
    pub note_name: String,
    pub is_running_job: bool,
    pub is_removed: bool,
    pub unix_time_last_run: i64,
    pub paragraphs: Vec<ParagraphJobInfo>,
}

impl NoteJobInfo {
    pub fn from_note(note: &Note, unix_time_last_run: i64) -> Self {
        let paragraphs = note
            .paragraphs
            .iter()
            .map(|p| ParagraphJobInfo {
                id: p.id.clone(),
                name: p.title.clone().unwrap_or_else(|| p.id.clone()),
                status: p.status,
            })
            .collect::<Vec<_>>();
        Self {
            note_id: note.id.clone(),
            note_name: note.name.clone(),
            is_running_job: note.running || paragraphs.iter().any(|p| p.status.is_running()),
            is_removed: false,
            unix_time_last_run,
            paragraphs,
        }
    }

    pub fn removed(note_id: impl Into<String>, unix_time_last_run: i64) -> Self {
        Self {
            note_id: note_id.into(),
            note_name: String::new(),
            is_running_job: false,
            is_removed: true,
            unix_time_last_run,
            paragraphs: Vec::new(),
        }
    }
}

/// Paragraph summary returned to execution backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParagraphInfo {
    pub note_id: String,
    pub paragraph_id: String,
    pub paragraph_title: Option<String>,
    pub paragraph_text: Option<String>,
}
