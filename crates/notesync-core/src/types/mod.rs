//! Domain types shared between the gateway and its collaborators.

pub mod angular;
pub mod interpreter;
pub mod job;
pub mod note;

pub use angular::AngularObject;
pub use interpreter::{InterpreterBinding, InterpreterCompletion, InterpreterSetting};
pub use job::{NoteJobInfo, ParagraphInfo, ParagraphJobInfo, Revision};
pub use note::{
    Note, NoteFormat, NoteInfo, Paragraph, ParagraphResult, ParagraphStatus, ResultMessage,
};
