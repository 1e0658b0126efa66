//! Shared domain types and collaborator contracts for the notebook sync gateway.
//!
//! The gateway never owns documents, interpreters or permissions. It talks to
//! them through the traits in [`service`], which a host application implements.

pub mod context;
pub mod error;
pub mod service;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::{AuthenticationInfo, ServiceContext};
pub use error::{ServiceError, ServiceResult};
pub use service::{
    AngularObjectRegistry, AuthorizationService, ConfigurationService, InterpreterRegistry,
    JobManagerService, NoteHandle, Notebook, NotebookExt, NotebookService, ParagraphUpdate,
};
pub use types::{
    AngularObject, InterpreterBinding, InterpreterCompletion, InterpreterSetting, Note, NoteFormat,
    NoteInfo, NoteJobInfo, Paragraph, ParagraphInfo, ParagraphJobInfo, ParagraphResult,
    ParagraphStatus, ResultMessage, Revision,
};
