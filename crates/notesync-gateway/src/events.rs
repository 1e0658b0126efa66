//! Events raised by execution backends.
//!
//! Interpreters stream output, progress and status changes for paragraphs
//! they run. Each event updates the in-memory note where needed and fans the
//! change out to the note's viewers. Backends may also ask the gateway to run
//! paragraphs or list them.

use std::sync::Arc;

use chrono::Utc;
use notesync_core::{
    AngularObject, AuthenticationInfo, Note, NotebookExt, ParagraphInfo, ParagraphStatus,
    ServiceContext, ServiceError, ServiceResult,
};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::angular::AngularBridge;
use crate::dispatcher::JOB_MANAGER_PAGE;
use crate::fanout::Fanout;
use crate::pool::TaskPool;
use crate::protocol::{Op, OutboundMessage};
use crate::services::Services;

/// Window of job changes included in a job-manager update
const JOB_UPDATE_WINDOW_MS: i64 = 5000;

#[derive(Debug, Clone)]
pub enum BackendEvent {
    OutputAppend {
        note_id: String,
        paragraph_id: String,
        index: usize,
        output: String,
    },
    OutputUpdate {
        note_id: String,
        paragraph_id: String,
        index: usize,
        kind: String,
        output: String,
    },
    OutputClear {
        note_id: String,
        paragraph_id: String,
    },
    AppOutputAppend {
        note_id: String,
        paragraph_id: String,
        app_id: String,
        output: String,
    },
    AppOutputUpdate {
        note_id: String,
        paragraph_id: String,
        app_id: String,
        kind: String,
        output: String,
    },
    AppLoad {
        note_id: String,
        paragraph_id: String,
        app_id: String,
        pkg: Value,
    },
    AppStatusChange {
        note_id: String,
        paragraph_id: String,
        app_id: String,
        status: String,
    },
    Progress {
        note_id: String,
        paragraph_id: String,
        progress: u32,
    },
    StatusChange {
        note_id: String,
        paragraph_id: String,
        status: ParagraphStatus,
    },
    CheckpointOutput {
        note_id: String,
        paragraph_id: String,
    },
    NoteRunningStatus {
        note_id: String,
        running: bool,
    },
    ParaInfos {
        note_id: String,
        paragraph_id: String,
        setting_id: String,
        infos: Map<String, Value>,
    },
    NoteCreated {
        note_id: String,
    },
    NoteRemoved {
        note_id: String,
    },
    ParagraphCreated {
        note_id: String,
        paragraph_id: String,
    },
    ParagraphRemoved {
        note_id: String,
        paragraph_id: String,
    },
    AngularUpdated {
        group_id: String,
        object: AngularObject,
    },
    AngularRemoved {
        group_id: String,
        object: AngularObject,
    },
    Notice(String),
}

impl BackendEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::OutputAppend { .. } => "output_append",
            Self::OutputUpdate { .. } => "output_update",
            Self::OutputClear { .. } => "output_clear",
            Self::AppOutputAppend { .. } => "app_output_append",
            Self::AppOutputUpdate { .. } => "app_output_update",
            Self::AppLoad { .. } => "app_load",
            Self::AppStatusChange { .. } => "app_status_change",
            Self::Progress { .. } => "progress",
            Self::StatusChange { .. } => "status_change",
            Self::CheckpointOutput { .. } => "checkpoint_output",
            Self::NoteRunningStatus { .. } => "note_running_status",
            Self::ParaInfos { .. } => "para_infos",
            Self::NoteCreated { .. } => "note_created",
            Self::NoteRemoved { .. } => "note_removed",
            Self::ParagraphCreated { .. } => "paragraph_created",
            Self::ParagraphRemoved { .. } => "paragraph_removed",
            Self::AngularUpdated { .. } => "angular_updated",
            Self::AngularRemoved { .. } => "angular_removed",
            Self::Notice(_) => "notice",
        }
    }
}

/// Entry point for backend callbacks
#[derive(Clone)]
pub struct BackendEvents {
    fanout: Arc<Fanout>,
    angular: Arc<AngularBridge>,
    services: Services,
    pool: TaskPool,
    progress: bool,
}

impl std::fmt::Debug for BackendEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEvents")
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

fn not_existed_note(note_id: &str) -> ServiceError {
    ServiceError::not_found(format!("Not existed noteId: {}", note_id))
}

impl BackendEvents {
    /// `progress` forwards streamed output and progress to clients
    pub fn new(
        fanout: Arc<Fanout>,
        angular: Arc<AngularBridge>,
        services: Services,
        pool: TaskPool,
        progress: bool,
    ) -> Self {
        Self {
            fanout,
            angular,
            services,
            pool,
            progress,
        }
    }

    /// Handle `event` on the task pool
    pub fn submit(&self, event: BackendEvent) -> JoinHandle<()> {
        let this = self.clone();
        self.pool.submit("backend_event", async move {
            let name = event.name();
            if let Err(e) = this.handle(event).await {
                warn!(event = name, error = %e, "failed to handle backend event");
            }
        })
    }

    pub async fn handle(&self, event: BackendEvent) -> ServiceResult<()> {
        debug!(event = event.name(), "backend event");
        match event {
            BackendEvent::OutputAppend {
                note_id,
                paragraph_id,
                index,
                output,
            } => {
                if self.progress {
                    self.fanout.broadcast(
                        &note_id,
                        &OutboundMessage::new(Op::ParagraphAppendOutput)
                            .put("noteId", &note_id)
                            .put("paragraphId", &paragraph_id)
                            .put("index", index)
                            .put("data", output),
                    );
                }
                Ok(())
            }
            BackendEvent::OutputUpdate {
                note_id,
                paragraph_id,
                index,
                kind,
                output,
            } => {
                if self.progress {
                    self.output_updated(&note_id, &paragraph_id, index, &kind, &output);
                }
                Ok(())
            }
            BackendEvent::OutputClear {
                note_id,
                paragraph_id,
            } => {
                self.services.notebook.process_note(&note_id, |note| {
                    let Some(note) = note else {
                        return;
                    };
                    let Some(paragraph) = note.paragraph_mut(&paragraph_id) else {
                        return;
                    };
                    paragraph.clear_output();
                    let note: &Note = note;
                    if let Some(paragraph) = note.paragraph(&paragraph_id) {
                        self.fanout.broadcast_paragraph(note, paragraph, None);
                    }
                });
                Ok(())
            }
            BackendEvent::AppOutputAppend {
                note_id,
                paragraph_id,
                app_id,
                output,
            } => {
                self.fanout.broadcast(
                    &note_id,
                    &OutboundMessage::new(Op::AppAppendOutput)
                        .put("noteId", &note_id)
                        .put("paragraphId", &paragraph_id)
                        .put("appId", app_id)
                        .put("data", output),
                );
                Ok(())
            }
            BackendEvent::AppOutputUpdate {
                note_id,
                paragraph_id,
                app_id,
                kind,
                output,
            } => {
                self.fanout.broadcast(
                    &note_id,
                    &OutboundMessage::new(Op::AppUpdateOutput)
                        .put("noteId", &note_id)
                        .put("paragraphId", &paragraph_id)
                        .put("appId", app_id)
                        .put("type", kind)
                        .put("data", output),
                );
                Ok(())
            }
            BackendEvent::AppLoad {
                note_id,
                paragraph_id,
                app_id,
                pkg,
            } => {
                self.fanout.broadcast(
                    &note_id,
                    &OutboundMessage::new(Op::AppLoad)
                        .put("noteId", &note_id)
                        .put("paragraphId", &paragraph_id)
                        .put("appId", app_id)
                        .put("pkg", pkg),
                );
                Ok(())
            }
            BackendEvent::AppStatusChange {
                note_id,
                paragraph_id,
                app_id,
                status,
            } => {
                self.fanout.broadcast(
                    &note_id,
                    &OutboundMessage::new(Op::AppStatusChange)
                        .put("noteId", &note_id)
                        .put("paragraphId", &paragraph_id)
                        .put("appId", app_id)
                        .put("status", status),
                );
                Ok(())
            }
            BackendEvent::Progress {
                note_id,
                paragraph_id,
                progress,
            } => {
                if self.progress {
                    self.fanout.broadcast(
                        &note_id,
                        &OutboundMessage::new(Op::Progress)
                            .put("id", &paragraph_id)
                            .put("progress", progress),
                    );
                }
                Ok(())
            }
            BackendEvent::StatusChange {
                note_id,
                paragraph_id,
                status,
            } => self.status_changed(&note_id, &paragraph_id, status).await,
            BackendEvent::CheckpointOutput {
                note_id,
                paragraph_id,
            } => self.services.notebook.process_note(&note_id, |note| -> ServiceResult<()> {
                let note = note.ok_or_else(|| not_existed_note(&note_id))?;
                if let Some(paragraph) = note.paragraph_mut(&paragraph_id) {
                    paragraph.checkpoint_output();
                }
                self.services
                    .notebook
                    .save_note(note, &AuthenticationInfo::anonymous())
            }),
            BackendEvent::NoteRunningStatus { note_id, running } => {
                self.services.notebook.process_note(&note_id, |note| {
                    if let Some(note) = note {
                        note.running = running;
                    }
                });
                self.fanout.broadcast(
                    &note_id,
                    &OutboundMessage::new(Op::NoteRunningStatus).put("status", running),
                );
                Ok(())
            }
            BackendEvent::ParaInfos {
                note_id,
                paragraph_id,
                setting_id,
                infos,
            } => self.para_infos_received(&note_id, &paragraph_id, &setting_id, infos),
            BackendEvent::NoteCreated { .. }
            | BackendEvent::ParagraphCreated { .. }
            | BackendEvent::ParagraphRemoved { .. } => {
                self.update_note_jobs().await;
                Ok(())
            }
            BackendEvent::NoteRemoved { note_id } => {
                let jobs = self
                    .services
                    .jobs
                    .remove_note_job_info(&note_id, &ServiceContext::system())
                    .await?;
                self.broadcast_note_jobs(jobs);
                Ok(())
            }
            BackendEvent::AngularUpdated { group_id, object } => {
                self.angular.on_remote_update(&group_id, &object);
                Ok(())
            }
            BackendEvent::AngularRemoved { group_id, object } => {
                self.angular.on_remote_remove(&group_id, &object);
                Ok(())
            }
            BackendEvent::Notice(notice) => {
                self.notice(&notice);
                Ok(())
            }
        }
    }

    fn output_updated(&self, note_id: &str, paragraph_id: &str, index: usize, kind: &str, output: &str) {
        let message = OutboundMessage::new(Op::ParagraphUpdateOutput)
            .put("noteId", note_id)
            .put("paragraphId", paragraph_id)
            .put("index", index)
            .put("type", kind)
            .put("data", output);

        self.services.notebook.process_note(note_id, |note| {
            let Some(note) = note else {
                return;
            };
            let personalized = note.personalized_mode;
            let Some(paragraph) = note.paragraph_mut(paragraph_id) else {
                return;
            };
            if !paragraph.update_output_buffer(index, kind, output) {
                warn!(note_id, paragraph_id, index, "output index out of range, dropping update");
                return;
            }
            if !personalized {
                self.fanout.broadcast(note_id, &message);
            } else if let Some(user) = paragraph.user.as_deref() {
                self.fanout.multicast_to_user(user, &message);
            }
        });
    }

    async fn status_changed(
        &self,
        note_id: &str,
        paragraph_id: &str,
        status: ParagraphStatus,
    ) -> ServiceResult<()> {
        let changed = self
            .services
            .notebook
            .process_note(note_id, |note| -> ServiceResult<bool> {
                let note = note.ok_or_else(|| not_existed_note(note_id))?;
                let Some(paragraph) = note.paragraph_mut(paragraph_id) else {
                    return Ok(false);
                };
                paragraph.status = status;
                paragraph.set_status_to_user_paragraphs();
                if status.is_terminated() || status.is_running() {
                    self.services
                        .notebook
                        .save_note(note, &AuthenticationInfo::anonymous())?;
                }
                let note: &Note = note;
                if let Some(paragraph) = note.paragraph(paragraph_id) {
                    self.fanout.broadcast_paragraph(note, paragraph, None);
                }
                Ok(true)
            })?;
        if changed {
            self.update_note_jobs().await;
        }
        Ok(())
    }

    fn para_infos_received(
        &self,
        note_id: &str,
        paragraph_id: &str,
        setting_id: &str,
        mut infos: Map<String, Value>,
    ) -> ServiceResult<()> {
        let text = |value: Option<Value>| match value {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let label = text(infos.remove("label"));
        let tooltip = text(infos.remove("tooltip"));
        let group = self
            .services
            .interpreters
            .setting(setting_id)
            .map(|setting| setting.group)
            .unwrap_or_else(|| setting_id.to_string());

        let runtime_infos = self
            .services
            .notebook
            .process_note(note_id, |note| -> ServiceResult<Option<Map<String, Value>>> {
            let note = note.ok_or_else(|| not_existed_note(note_id))?;
            let Some(paragraph) = note.paragraph_mut(paragraph_id) else {
                return Ok(None);
            };
            paragraph.update_runtime_infos(&label, &tooltip, &infos, &group, setting_id);
            let runtime_infos = paragraph.runtime_infos.clone();
            self.services
                .notebook
                .save_note(note, &AuthenticationInfo::anonymous())?;
            Ok(Some(runtime_infos))
        })?;

        if let Some(runtime_infos) = runtime_infos {
            self.fanout.broadcast(
                note_id,
                &OutboundMessage::new(Op::ParasInfo)
                    .put("id", paragraph_id)
                    .put("infos", runtime_infos),
            );
        }
        Ok(())
    }

    /// Push recent job changes to the job manager page
    async fn update_note_jobs(&self) {
        let since = Utc::now().timestamp_millis() - JOB_UPDATE_WINDOW_MS;
        match self
            .services
            .jobs
            .note_job_info_since(since, &ServiceContext::system())
            .await
        {
            Ok(jobs) => self.broadcast_note_jobs(jobs),
            Err(e) => warn!(error = %e, "failed to collect note job updates"),
        }
    }

    fn broadcast_note_jobs<T: serde::Serialize>(&self, jobs: T) {
        self.fanout.broadcast_channel(
            JOB_MANAGER_PAGE,
            &OutboundMessage::new(Op::ListUpdateNoteJobs).put(
                "noteRunningJobs",
                json!({
                    "lastResponseUnixTime": Utc::now().timestamp_millis(),
                    "jobs": jobs,
                }),
            ),
        );
    }

    /// Run paragraphs on behalf of a backend.
    ///
    /// Targets are given either by id or by index, never both; with neither,
    /// every paragraph of the note runs. `current`, the paragraph that made
    /// the request, is always skipped. Runs happen in order on the pool and
    /// stop at the first failure.
    pub fn run_paragraphs(
        &self,
        note_id: &str,
        indices: &[usize],
        ids: &[String],
        current: Option<&str>,
    ) -> ServiceResult<JoinHandle<()>> {
        if !indices.is_empty() && !ids.is_empty() {
            return Err(ServiceError::invalid_argument(
                "Can not specify paragraphIds and paragraphIndices together",
            ));
        }
        let targets = self
            .services
            .notebook
            .process_note(note_id, |note| -> ServiceResult<Vec<String>> {
            let note = note.ok_or_else(|| not_existed_note(note_id))?;
            if !ids.is_empty() {
                if let Some(missing) = ids.iter().find(|id| note.paragraph(id).is_none()) {
                    return Err(ServiceError::not_found(format!(
                        "Not existed paragraphId: {}",
                        missing
                    )));
                }
                return Ok(ids.to_vec());
            }
            if !indices.is_empty() {
                return indices
                    .iter()
                    .map(|&index| {
                        note.paragraphs
                            .get(index)
                            .map(|p| p.id.clone())
                            .ok_or_else(|| {
                                ServiceError::not_found(format!("Not existed paragraphIndex: {}", index))
                            })
                    })
                    .collect::<ServiceResult<Vec<_>>>();
            }
            Ok(note.paragraphs.iter().map(|p| p.id.clone()).collect())
        })?;

        let targets: Vec<String> = targets
            .into_iter()
            .filter(|id| Some(id.as_str()) != current)
            .collect();
        let note_id = note_id.to_string();
        let services = self.services.clone();
        Ok(self.pool.submit("run_paragraphs", async move {
            let ctx = ServiceContext::system();
            for paragraph_id in &targets {
                if let Err(e) = services
                    .notebook_service
                    .execute_paragraph(&note_id, paragraph_id, &ctx)
                    .await
                {
                    warn!(note_id = %note_id, paragraph_id = %paragraph_id, error = %e, "paragraph run failed, stopping");
                    break;
                }
            }
        }))
    }

    /// Paragraphs of a note, for a backend acting as `user`
    pub fn paragraph_list(&self, user: &str, note_id: &str) -> ServiceResult<Vec<ParagraphInfo>> {
        let mut user_and_roles = self.services.authorization.roles(user);
        user_and_roles.insert(user.to_string());
        if !self
            .services
            .authorization
            .is_reader(note_id, &user_and_roles)
        {
            return Err(ServiceError::forbidden(format!(
                "Current user {} is not authorized to read note {}",
                user, note_id
            )));
        }
        self.services
            .notebook
            .process_note(note_id, |note| -> ServiceResult<Vec<ParagraphInfo>> {
            let note = note.ok_or_else(|| not_existed_note(note_id))?;
            Ok(note
                .paragraphs
                .iter()
                .map(|p| ParagraphInfo {
                    note_id: note.id.clone(),
                    paragraph_id: p.id.clone(),
                    paragraph_title: p.title.clone(),
                    paragraph_text: p.text.clone(),
                })
                .collect())
        })
    }

    /// Send a notice to every open connection
    pub fn notice(&self, notice: &str) {
        self.fanout
            .broadcast_all(&OutboundMessage::new(Op::Notice).put("notice", notice));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{test_connection, ConnectionHandle};
    use crate::registry::ConnectionRegistry;
    use notesync_core::testing::MemoryBackend;
    use notesync_core::{Notebook, Paragraph};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        registry: Arc<ConnectionRegistry>,
        events: BackendEvents,
        note_id: String,
    }

    fn fixture(progress: bool) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let mut note = Note::new("events");
        note.paragraphs = vec![Paragraph::new("p1"), Paragraph::new("p2"), Paragraph::new("p3")];
        let note_id = note.id.clone();
        backend.insert_note(note);

        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Arc::new(Fanout::new(Arc::clone(&registry), false));
        let services = Services::from_backend(backend.clone());
        let angular = Arc::new(AngularBridge::new(Arc::clone(&fanout), services.clone()));
        let events = BackendEvents::new(fanout, angular, services, TaskPool::new(2), progress);
        Fixture {
            backend,
            registry,
            events,
            note_id,
        }
    }

    fn viewer(fx: &Fixture, id: &str, user: &str) -> (Arc<ConnectionHandle>, UnboundedReceiver<Arc<String>>) {
        let (conn, rx) = test_connection(id);
        fx.registry.add(conn.clone());
        fx.registry.bind_user(&conn, user);
        fx.registry.subscribe_document(&conn, &fx.note_id);
        (conn, rx)
    }

    fn ops(rx: &mut UnboundedReceiver<Arc<String>>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_output_is_gated_by_progress_flag() {
        let fx = fixture(false);
        let (_conn, mut rx) = viewer(&fx, "c1", "alice");
        fx.events
            .handle(BackendEvent::OutputAppend {
                note_id: fx.note_id.clone(),
                paragraph_id: "p1".into(),
                index: 0,
                output: "hello".into(),
            })
            .await
            .unwrap();
        fx.events
            .handle(BackendEvent::Progress {
                note_id: fx.note_id.clone(),
                paragraph_id: "p1".into(),
                progress: 50,
            })
            .await
            .unwrap();
        assert!(ops(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_output_update_fills_buffer_and_broadcasts() {
        let fx = fixture(true);
        let (_conn, mut rx) = viewer(&fx, "c1", "alice");
        fx.events
            .handle(BackendEvent::OutputUpdate {
                note_id: fx.note_id.clone(),
                paragraph_id: "p1".into(),
                index: 1,
                kind: "HTML".into(),
                output: "<b>x</b>".into(),
            })
            .await
            .unwrap();

        let frames = ops(&mut rx);
        assert_eq!(frames[0]["op"], "PARAGRAPH_UPDATE_OUTPUT");
        assert_eq!(frames[0]["data"]["type"], "HTML");
        let note = fx.backend.snapshot(&fx.note_id).unwrap();
        assert_eq!(note.paragraphs[0].output_buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_output_update_past_block_limit_is_dropped() {
        let fx = fixture(true);
        let (_conn, mut rx) = viewer(&fx, "c1", "alice");
        fx.events
            .handle(BackendEvent::OutputUpdate {
                note_id: fx.note_id.clone(),
                paragraph_id: "p1".into(),
                index: usize::MAX,
                kind: "TEXT".into(),
                output: "runaway".into(),
            })
            .await
            .unwrap();

        assert!(ops(&mut rx).is_empty());
        let note = fx.backend.snapshot(&fx.note_id).unwrap();
        assert!(note.paragraphs[0].output_buffer.is_empty());
    }

    #[tokio::test]
    async fn test_personalized_output_goes_to_paragraph_user() {
        let fx = fixture(true);
        fx.backend.note(&fx.note_id).unwrap().lock().personalized_mode = true;
        fx.backend.note(&fx.note_id).unwrap().lock().paragraphs[0].user = Some("bob".into());
        let (_a, mut rx_a) = viewer(&fx, "c1", "alice");
        let (_b, mut rx_b) = viewer(&fx, "c2", "bob");

        fx.events
            .handle(BackendEvent::OutputUpdate {
                note_id: fx.note_id.clone(),
                paragraph_id: "p1".into(),
                index: 0,
                kind: "TEXT".into(),
                output: "mine".into(),
            })
            .await
            .unwrap();

        assert!(ops(&mut rx_a).is_empty());
        assert_eq!(ops(&mut rx_b)[0]["data"]["data"], "mine");
    }

    #[tokio::test]
    async fn test_status_change_saves_and_updates_job_page() {
        let fx = fixture(true);
        let (_viewer, mut rx) = viewer(&fx, "c1", "alice");
        let (jobs, mut rx_jobs) = test_connection("jobs");
        fx.registry.add(jobs.clone());
        fx.registry.subscribe_channel(&jobs, JOB_MANAGER_PAGE);

        fx.events
            .handle(BackendEvent::StatusChange {
                note_id: fx.note_id.clone(),
                paragraph_id: "p2".into(),
                status: ParagraphStatus::Finished,
            })
            .await
            .unwrap();

        assert_eq!(fx.backend.save_count(), 1);
        let frames = ops(&mut rx);
        let paragraph = frames.iter().find(|f| f["op"] == "PARAGRAPH").unwrap();
        assert_eq!(paragraph["data"]["paragraph"]["status"], "FINISHED");
        assert_eq!(ops(&mut rx_jobs)[0]["op"], "LIST_UPDATE_NOTE_JOBS");
    }

    #[tokio::test]
    async fn test_pending_status_is_not_saved() {
        let fx = fixture(true);
        fx.events
            .handle(BackendEvent::StatusChange {
                note_id: fx.note_id.clone(),
                paragraph_id: "p1".into(),
                status: ParagraphStatus::Pending,
            })
            .await
            .unwrap();
        assert_eq!(fx.backend.save_count(), 0);
    }

    #[tokio::test]
    async fn test_para_infos_strip_label_and_tooltip() {
        let fx = fixture(true);
        let (_conn, mut rx) = viewer(&fx, "c1", "alice");
        let mut infos = Map::new();
        infos.insert("label".into(), json!("SPARK JOB"));
        infos.insert("tooltip".into(), json!("View in Spark web UI"));
        infos.insert("jobUrl".into(), json!("http://spark/1"));

        fx.events
            .handle(BackendEvent::ParaInfos {
                note_id: fx.note_id.clone(),
                paragraph_id: "p1".into(),
                setting_id: "spark".into(),
                infos,
            })
            .await
            .unwrap();

        let frames = ops(&mut rx);
        assert_eq!(frames[0]["op"], "PARAS_INFO");
        let info = &frames[0]["data"]["infos"]["jobUrl"];
        assert_eq!(info["label"], "SPARK JOB");
        assert!(frames[0]["data"]["infos"].get("label").is_none());
    }

    #[tokio::test]
    async fn test_run_paragraphs_validation() {
        let fx = fixture(true);
        let err = fx
            .events
            .run_paragraphs(&fx.note_id, &[0], &["p1".to_string()], None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Can not specify paragraphIds and paragraphIndices together"
        );

        let err = fx.events.run_paragraphs("missing", &[], &[], None).unwrap_err();
        assert_eq!(err.to_string(), "Not existed noteId: missing");

        let err = fx
            .events
            .run_paragraphs(&fx.note_id, &[], &["nope".to_string()], None)
            .unwrap_err();
        assert_eq!(err.to_string(), "Not existed paragraphId: nope");

        let err = fx.events.run_paragraphs(&fx.note_id, &[7], &[], None).unwrap_err();
        assert_eq!(err.to_string(), "Not existed paragraphIndex: 7");
    }

    #[tokio::test]
    async fn test_run_paragraphs_skips_current() {
        let fx = fixture(true);
        fx.events
            .run_paragraphs(&fx.note_id, &[], &[], Some("p2"))
            .unwrap()
            .await
            .unwrap();

        let runs: Vec<String> = fx.backend.runs().into_iter().map(|(_, p)| p).collect();
        assert_eq!(runs, vec!["p1".to_string(), "p3".to_string()]);
    }

    #[tokio::test]
    async fn test_paragraph_list_requires_read_permission() {
        let fx = fixture(true);
        fx.backend.set_permissions(
            &fx.note_id,
            notesync_core::testing::NotePermissions::readers(&["alice"]),
        );

        let infos = fx.events.paragraph_list("alice", &fx.note_id).unwrap();
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].paragraph_id, "p1");

        let err = fx.events.paragraph_list("mallory", &fx.note_id).unwrap_err();
        assert!(err.is_forbidden());
    }

    #[tokio::test]
    async fn test_notice_reaches_every_connection() {
        let fx = fixture(true);
        let (_a, mut rx_a) = viewer(&fx, "c1", "alice");
        let (idle, mut rx_idle) = test_connection("c2");
        fx.registry.add(idle);

        fx.events
            .submit(BackendEvent::Notice("maintenance at noon".into()))
            .await
            .unwrap();

        assert_eq!(ops(&mut rx_a)[0]["data"]["notice"], "maintenance at noon");
        assert_eq!(ops(&mut rx_idle)[0]["op"], "NOTICE");
    }
}
