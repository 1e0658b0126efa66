//! Collaborators the gateway depends on

use std::sync::Arc;

use notesync_core::{
    AuthorizationService, ConfigurationService, InterpreterRegistry, JobManagerService, Notebook,
    NotebookService,
};

/// Every collaborator, injected once at construction
#[derive(Clone)]
pub struct Services {
    pub notebook: Arc<dyn Notebook>,
    pub notebook_service: Arc<dyn NotebookService>,
    pub authorization: Arc<dyn AuthorizationService>,
    pub interpreters: Arc<dyn InterpreterRegistry>,
    pub jobs: Arc<dyn JobManagerService>,
    pub configuration: Arc<dyn ConfigurationService>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

impl Services {
    /// Use one object for every collaborator
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: Notebook
            + NotebookService
            + AuthorizationService
            + InterpreterRegistry
            + JobManagerService
            + ConfigurationService
            + 'static,
    {
        Self {
            notebook: backend.clone(),
            notebook_service: backend.clone(),
            authorization: backend.clone(),
            interpreters: backend.clone(),
            jobs: backend.clone(),
            configuration: backend,
        }
    }
}
