//! Snap3D task poller
//!
//! After a job is submitted its status is polled at a fixed delay. Each stage
//! transition makes one new artifact available; the poller fetches it once,
//! emits it, and finishes once the job reports `completed` and every listed
//! artifact has been retrieved. Dropping the [`TaskHandle`] stops polling.
//!
//! ```text
//! Initialized -> Running(image_gen -> base_mesh_gen -> refined_mesh_gen) -> Completed
//!                      \------------------- any failure ------------------> Failed
//! ```
//!
//! There is no overall timeout; a job that never completes is polled until
//! it is cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use smallvec::{smallvec, SmallVec};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{
    Asset, ArtifactKind, GltfModel, RetrievedArtifact, Stage, StatusResponse, SubmitBody,
    SubmitRequest, SubmitResponse, TaskEvent, TaskStatus, Texture, TrackedTask,
};
use crate::config::PollerConfig;
use crate::error::{TaskError, UNKNOWN_ERROR_CODE};

/// Request/response transport for the Snap3D endpoints
#[async_trait]
pub trait TaskTransport: Send + Sync {
    async fn submit(&self, body: &SubmitBody) -> Result<SubmitResponse, TaskError>;

    async fn get_status(&self, task_id: &str) -> Result<StatusResponse, TaskError>;
}

/// Turns artifact URLs into usable assets
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load_texture(&self, url: &str) -> Result<Texture, TaskError>;

    async fn load_model(&self, url: &str) -> Result<GltfModel, TaskError>;
}

/// Handle to one tracked job
pub struct TaskHandle {
    task_id: String,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<TrackedTask>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next progress event; `None` once the job is finished.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }

    /// Stop polling before the next iteration.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait for polling to end and return the final task view.
    pub async fn finish(self) -> Result<TrackedTask, TaskError> {
        // a closed receiver stops the loop, so hold it until the end
        let Self { events: _events, task, .. } = self;
        task.await.map_err(|e| TaskError::transport(UNKNOWN_ERROR_CODE, e.to_string()))
    }
}

pub struct AsyncTaskPoller<T, L> {
    transport: Arc<T>,
    loader: Arc<L>,
    config: PollerConfig,
}

impl<T, L> AsyncTaskPoller<T, L>
where
    T: TaskTransport + 'static,
    L: ResourceLoader + 'static,
{
    pub fn new(transport: T, loader: L, config: PollerConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            loader: Arc::new(loader),
            config,
        }
    }

    /// Submit a job and return its id without tracking it.
    pub async fn submit(&self, request: &SubmitRequest) -> Result<String, TaskError> {
        let body = SubmitBody {
            request: request.clone(),
            use_case: self.config.use_case.clone(),
        };
        let response = self.transport.submit(&body).await?;
        info!("Snap3D task submitted: {}", response.task_id);
        Ok(response.task_id)
    }

    /// One status query. A `failed` status is reported as an error.
    pub async fn get_status(&self, task_id: &str) -> Result<StatusResponse, TaskError> {
        let status = self.transport.get_status(task_id).await?;
        if status.status == TaskStatus::Failed {
            return Err(vendor_error(&status));
        }
        Ok(status)
    }

    /// Submit a job and poll it in the background.
    pub async fn submit_and_track(&self, request: &SubmitRequest) -> Result<TaskHandle, TaskError> {
        let task_id = self.submit(request).await?;
        Ok(self.track(task_id))
    }

    /// Poll an already submitted job.
    pub fn track(&self, task_id: String) -> TaskHandle {
        let (events_tx, events) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.loader),
            self.config.clone(),
            TrackedTask::new(task_id.clone()),
            events_tx,
            Arc::clone(&cancel),
        ));

        TaskHandle {
            task_id,
            events,
            cancel,
            task,
        }
    }
}

fn vendor_error(status: &StatusResponse) -> TaskError {
    TaskError::Vendor {
        code: status.error_code.unwrap_or(UNKNOWN_ERROR_CODE),
        message: status.error_msg.clone().unwrap_or_default(),
    }
}

async fn poll_loop<T, L>(
    transport: Arc<T>,
    loader: Arc<L>,
    config: PollerConfig,
    mut task: TrackedTask,
    events: mpsc::UnboundedSender<TaskEvent>,
    cancel: Arc<AtomicBool>,
) -> TrackedTask
where
    T: TaskTransport + ?Sized,
    L: ResourceLoader + ?Sized,
{
    debug!("Polling Snap3D task {}", task.task_id);

    let outcome = 'poll: loop {
        if cancel.load(Ordering::SeqCst) || events.is_closed() {
            break Err(TaskError::Cancelled);
        }

        let status = match transport.get_status(&task.task_id).await {
            Ok(status) => status,
            Err(e) => break Err(e),
        };
        task.stage = status.stage;

        if status.status == TaskStatus::Failed {
            break Err(vendor_error(&status));
        }
        if status.status == TaskStatus::Running {
            task.status = TaskStatus::Running;
        }

        let completed = status.status == TaskStatus::Completed;
        let stage = status.stage;
        let steps: SmallVec<[ArtifactKind; 3]> = if completed {
            // without refinement a finished job has no refined mesh
            [ArtifactKind::Image, ArtifactKind::BaseMesh, ArtifactKind::RefinedMesh]
                .into_iter()
                .filter(|kind| !task.has(*kind) && status.artifact(*kind).is_some())
                .collect()
        } else if stage == Some(Stage::BaseMeshGen) && !task.has(ArtifactKind::Image) {
            smallvec![ArtifactKind::Image]
        } else if stage == Some(Stage::RefinedMeshGen) && !task.has(ArtifactKind::BaseMesh) {
            smallvec![ArtifactKind::BaseMesh]
        } else {
            SmallVec::new()
        };

        for kind in steps {
            let Some(artifact) = status.artifact(kind) else {
                debug!("Stage artifact {} not listed yet", kind.as_str());
                continue;
            };
            let url = artifact.url.clone();
            let loaded = match kind {
                ArtifactKind::Image => loader.load_texture(&url).await.map(Asset::Texture),
                _ => loader.load_model(&url).await.map(Asset::Model),
            };
            match loaded {
                Ok(asset) => {
                    info!("Snap3D task {}: {} ready", task.task_id, kind.as_str());
                    task.artifacts.push(RetrievedArtifact {
                        kind,
                        url: url.clone(),
                    });
                    let _ = events.send(TaskEvent::Artifact { kind, url, asset });
                }
                Err(e) => break 'poll Err(e),
            }
        }

        if completed {
            break Ok(());
        }

        tokio::time::sleep(config.poll_interval).await;
    };

    match outcome {
        Ok(()) => {
            task.status = TaskStatus::Completed;
            info!("✅ Snap3D task {} completed", task.task_id);
        }
        Err(e) => {
            error!("Snap3D task {} failed: {}", task.task_id, e);
            task.status = TaskStatus::Failed;
            let _ = events.send(TaskEvent::Failed(e));
        }
    }
    task
}
