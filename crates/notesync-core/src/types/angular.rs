use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reactive variable shared between clients and an execution backend.
///
/// An object without `note_id` is global to its interpreter group and is
/// visible from every note bound to that group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AngularObject {
    pub name: String,
    #[serde(rename = "object", default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paragraph_id: Option<String>,
}

impl AngularObject {
    /// Create an object scoped to a note, and optionally to one paragraph of it
    pub fn scoped(
        name: impl Into<String>,
        value: Value,
        note_id: impl Into<String>,
        paragraph_id: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            note_id: Some(note_id.into()),
            paragraph_id,
        }
    }

    /// Create a global object
    pub fn global(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            note_id: None,
            paragraph_id: None,
        }
    }

    pub fn is_global(&self) -> bool {
        self.note_id.is_none()
    }

    /// Two objects denote the same variable when name and scope match.
    pub fn same_identity(&self, other: &AngularObject) -> bool {
        self.name == other.name
            && self.note_id == other.note_id
            && self.paragraph_id == other.paragraph_id
    }

    pub fn matches_scope(&self, note_id: Option<&str>, paragraph_id: Option<&str>) -> bool {
        self.note_id.as_deref() == note_id && self.paragraph_id.as_deref() == paragraph_id
    }
}
