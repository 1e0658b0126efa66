//! Wire protocol.
//!
//! Every frame is a JSON object `{op, data, principal, ticket, roles, msgId}`.
//! The set of operations is closed; an unknown `op` decodes to `None` and is
//! ignored by the dispatcher.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

macro_rules! ops {
    ($($variant:ident => $wire:literal,)+) => {
        /// Message operation
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Op {
            $($variant,)+
        }

        impl Op {
            pub const ALL: &'static [Op] = &[$(Op::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Op::$variant => $wire,)+
                }
            }

            pub fn from_wire(name: &str) -> Option<Op> {
                match name {
                    $($wire => Some(Op::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

ops! {
    // inbound (some are also sent back as replies)
    GetNote => "GET_NOTE",
    ReloadNote => "RELOAD_NOTE",
    NewNote => "NEW_NOTE",
    DelNote => "DEL_NOTE",
    RemoveFolder => "REMOVE_FOLDER",
    MoveNoteToTrash => "MOVE_NOTE_TO_TRASH",
    MoveFolderToTrash => "MOVE_FOLDER_TO_TRASH",
    EmptyTrash => "EMPTY_TRASH",
    RestoreFolder => "RESTORE_FOLDER",
    RestoreNote => "RESTORE_NOTE",
    RestoreAll => "RESTORE_ALL",
    CloneNote => "CLONE_NOTE",
    ImportNote => "IMPORT_NOTE",
    ConvertNoteNbformat => "CONVERT_NOTE_NBFORMAT",
    NoteUpdate => "NOTE_UPDATE",
    NoteRename => "NOTE_RENAME",
    FolderRename => "FOLDER_RENAME",
    UpdatePersonalizedMode => "UPDATE_PERSONALIZED_MODE",
    RunParagraph => "RUN_PARAGRAPH",
    CommitParagraph => "COMMIT_PARAGRAPH",
    PatchParagraph => "PATCH_PARAGRAPH",
    RunAllParagraphs => "RUN_ALL_PARAGRAPHS",
    ParagraphExecutedBySpell => "PARAGRAPH_EXECUTED_BY_SPELL",
    CancelParagraph => "CANCEL_PARAGRAPH",
    MoveParagraph => "MOVE_PARAGRAPH",
    InsertParagraph => "INSERT_PARAGRAPH",
    CopyParagraph => "COPY_PARAGRAPH",
    ParagraphRemove => "PARAGRAPH_REMOVE",
    ParagraphClearOutput => "PARAGRAPH_CLEAR_OUTPUT",
    ParagraphClearAllOutput => "PARAGRAPH_CLEAR_ALL_OUTPUT",
    Completion => "COMPLETION",
    Ping => "PING",
    AngularObjectUpdated => "ANGULAR_OBJECT_UPDATED",
    AngularObjectClientBind => "ANGULAR_OBJECT_CLIENT_BIND",
    AngularObjectClientUnbind => "ANGULAR_OBJECT_CLIENT_UNBIND",
    ListConfigurations => "LIST_CONFIGURATIONS",
    CheckpointNote => "CHECKPOINT_NOTE",
    ListRevisionHistory => "LIST_REVISION_HISTORY",
    SetNoteRevision => "SET_NOTE_REVISION",
    NoteRevision => "NOTE_REVISION",
    NoteRevisionForCompare => "NOTE_REVISION_FOR_COMPARE",
    ListNotes => "LIST_NOTES",
    ReloadNotesFromRepo => "RELOAD_NOTES_FROM_REPO",
    GetHomeNote => "GET_HOME_NOTE",
    ListNoteJobs => "LIST_NOTE_JOBS",
    UnsubscribeUpdateNoteJobs => "UNSUBSCRIBE_UPDATE_NOTE_JOBS",
    GetInterpreterBindings => "GET_INTERPRETER_BINDINGS",
    SaveInterpreterBindings => "SAVE_INTERPRETER_BINDINGS",
    EditorSetting => "EDITOR_SETTING",
    GetInterpreterSettings => "GET_INTERPRETER_SETTINGS",
    Watcher => "WATCHER",
    SaveNoteForms => "SAVE_NOTE_FORMS",
    RemoveNoteForms => "REMOVE_NOTE_FORMS",

    // outbound only
    Note => "NOTE",
    NotesInfo => "NOTES_INFO",
    Paragraph => "PARAGRAPH",
    ParagraphAdded => "PARAGRAPH_ADDED",
    ParagraphRemoved => "PARAGRAPH_REMOVED",
    ParagraphMoved => "PARAGRAPH_MOVED",
    ParagraphAppendOutput => "PARAGRAPH_APPEND_OUTPUT",
    ParagraphUpdateOutput => "PARAGRAPH_UPDATE_OUTPUT",
    Progress => "PROGRESS",
    CompletionList => "COMPLETION_LIST",
    NoteUpdated => "NOTE_UPDATED",
    RunParagraphUsingSpell => "RUN_PARAGRAPH_USING_SPELL",
    AngularObjectUpdate => "ANGULAR_OBJECT_UPDATE",
    AngularObjectRemove => "ANGULAR_OBJECT_REMOVE",
    ConfigurationsInfo => "CONFIGURATIONS_INFO",
    InterpreterBindings => "INTERPRETER_BINDINGS",
    InterpreterSettings => "INTERPRETER_SETTINGS",
    ErrorInfo => "ERROR_INFO",
    AuthInfo => "AUTH_INFO",
    SessionLogout => "SESSION_LOGOUT",
    Notice => "NOTICE",
    ConvertedNoteNbformat => "CONVERTED_NOTE_NBFORMAT",
    ListUpdateNoteJobs => "LIST_UPDATE_NOTE_JOBS",
    NoteRunningStatus => "NOTE_RUNNING_STATUS",
    ParasInfo => "PARAS_INFO",
    AppAppendOutput => "APP_APPEND_OUTPUT",
    AppUpdateOutput => "APP_UPDATE_OUTPUT",
    AppLoad => "APP_LOAD",
    AppStatusChange => "APP_STATUS_CHANGE",
    CollaborativeModeStatus => "COLLABORATIVE_MODE_STATUS",
}

impl Op {
    /// Operations refused while the target note is running sequentially
    pub fn is_disabled_while_running(&self) -> bool {
        matches!(
            self,
            Op::CommitParagraph
                | Op::RunParagraph
                | Op::ParagraphExecutedBySpell
                | Op::RunAllParagraphs
                | Op::ParagraphClearOutput
                | Op::ParagraphClearAllOutput
                | Op::InsertParagraph
                | Op::MoveParagraph
                | Op::CopyParagraph
                | Op::ParagraphRemove
                | Op::MoveNoteToTrash
                | Op::DelNote
                | Op::PatchParagraph
                | Op::NoteUpdate
        )
    }

    /// Operations that name their note in `data.id` rather than `data.noteId`
    pub fn targets_note_by_id(&self) -> bool {
        matches!(
            self,
            Op::NoteUpdate | Op::DelNote | Op::MoveNoteToTrash | Op::ParagraphClearAllOutput
        )
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Op {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Op {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Op::from_wire(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown op: {}", name)))
    }
}

fn lenient_op<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Op>, D::Error> {
    let name = Option::<String>::deserialize(deserializer)?;
    Ok(name.as_deref().and_then(Op::from_wire))
}

fn lenient_data<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Map<String, Value>, D::Error> {
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Roles arrive either as an array or as a string holding a JSON array
fn lenient_roles<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let roles = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(text)) if !text.trim().is_empty() => {
            serde_json::from_str::<Vec<String>>(&text).unwrap_or_default()
        }
        _ => Vec::new(),
    };
    Ok(roles)
}

/// A frame received from a client
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default, deserialize_with = "lenient_op")]
    pub op: Option<Op>,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(default, deserialize_with = "lenient_roles")]
    pub roles: Vec<String>,
    #[serde(default, deserialize_with = "lenient_data")]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub msg_id: Option<String>,
}

impl InboundMessage {
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key).filter(|v| !v.is_null())
    }

    /// String field; numbers are rendered as text
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Numeric field; clients send indices both as numbers and as strings
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_index(&self, key: &str) -> Option<usize> {
        self.get_f64(key)
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n as usize)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
            _ => None,
        }
    }

    pub fn get_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.get(key).and_then(Value::as_object)
    }

    /// Array field, also accepted as a string holding a JSON array
    pub fn get_array(&self, key: &str) -> Option<Vec<Value>> {
        match self.get(key)? {
            Value::Array(items) => Some(items.clone()),
            Value::String(text) => serde_json::from_str(text).ok(),
            _ => None,
        }
    }

    pub fn get_strings(&self, key: &str) -> Vec<String> {
        self.get_array(key)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

/// A frame sent to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub op: Op,
    pub data: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            data: Map::new(),
            msg_id: None,
        }
    }

    pub fn put(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or_else(|e| {
            tracing::warn!(op = %self.op, key, error = %e, "failed to serialize field");
            Value::Null
        });
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn with_msg_id(mut self, msg_id: Option<&str>) -> Self {
        self.msg_id = msg_id.map(str::to_string);
        self
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn error_info(info: impl Into<String>) -> Self {
        Self::new(Op::ErrorInfo).put("info", info.into())
    }

    pub fn auth_info(info: impl Into<String>) -> Self {
        Self::new(Op::AuthInfo).put("info", info.into())
    }
}

/// Envelope forwarded to watcher connections
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherMessage {
    pub note_id: String,
    /// User whose action caused the message; empty when not attributable
    pub subject: String,
    /// The original frame as sent to the note's subscribers
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names_are_unique() {
        let mut names: Vec<&str> = Op::ALL.iter().map(Op::as_str).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
        for op in Op::ALL {
            assert_eq!(Op::from_wire(op.as_str()), Some(*op));
        }
    }

    #[test]
    fn test_decode_is_lenient() {
        let message = InboundMessage::decode(
            r#"{"op":"SOMETHING_NEW","principal":"alice","ticket":"t","roles":"[\"admin\"]","data":null}"#,
        )
        .unwrap();
        assert_eq!(message.op, None);
        assert_eq!(message.roles, vec!["admin".to_string()]);
        assert!(message.data.is_empty());

        let message = InboundMessage::decode(r#"{"op":"PING"}"#).unwrap();
        assert_eq!(message.op, Some(Op::Ping));
        assert!(message.principal.is_none());

        assert!(InboundMessage::decode("not json").is_err());
    }

    #[test]
    fn test_field_accessors() {
        let message = InboundMessage::decode(
            &json!({
                "op": "MOVE_PARAGRAPH",
                "data": {
                    "id": "p1",
                    "index": "2",
                    "cursor": 7.0,
                    "personalized": "true",
                    "paragraphs": "[{\"id\":\"p1\"}]",
                    "missing": null
                }
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(message.get_string("id").as_deref(), Some("p1"));
        assert_eq!(message.get_index("index"), Some(2));
        assert_eq!(message.get_index("cursor"), Some(7));
        assert_eq!(message.get_bool("personalized"), Some(true));
        assert_eq!(message.get_array("paragraphs").map(|a| a.len()), Some(1));
        assert!(message.get("missing").is_none());
    }

    #[test]
    fn test_outbound_encoding() {
        let frame = OutboundMessage::new(Op::ParagraphMoved)
            .put("id", "p1")
            .put("index", 3)
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["op"], "PARAGRAPH_MOVED");
        assert_eq!(value["data"]["index"], 3);
        assert!(value.get("msgId").is_none());

        let frame = OutboundMessage::error_info("boom")
            .with_msg_id(Some("m1"))
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["msgId"], "m1");
        assert_eq!(value["data"]["info"], "boom");
    }

    #[test]
    fn test_running_guard_ops() {
        assert!(Op::NoteUpdate.is_disabled_while_running());
        assert!(Op::NoteUpdate.targets_note_by_id());
        assert!(Op::RunParagraph.is_disabled_while_running());
        assert!(!Op::RunParagraph.targets_note_by_id());
        assert!(!Op::GetNote.is_disabled_while_running());
    }
}
