//! Snap3D text-to-3D generation
//!
//! A job is submitted once and then polled until its refined mesh is ready.
//! The request and status bodies mirror the gateway's JSON (snake_case).

pub mod poller;
pub mod transport;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::TaskError;

pub use poller::{AsyncTaskPoller, ResourceLoader, TaskHandle, TaskTransport};
pub use transport::{HttpResourceLoader, HttpTaskTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    #[default]
    Glb,
}

/// Parameters of one generation job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub prompt: String,
    #[serde(default)]
    pub format: FileFormat,
    /// Also produce a refined mesh after the base mesh
    #[serde(default)]
    pub refine: bool,
    #[serde(default)]
    pub use_vertex_color: bool,
}

impl SubmitRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            format: FileFormat::Glb,
            refine: true,
            use_vertex_color: false,
        }
    }
}

/// What actually goes over the wire for a submit
#[derive(Debug, Clone, Serialize)]
pub struct SubmitBody {
    #[serde(flatten)]
    pub request: SubmitRequest,
    pub use_case: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub success: bool,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRequest {
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Initialized,
    Running,
    Completed,
    Failed,
}

/// Generation stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ImageGen,
    BaseMeshGen,
    RefinedMeshGen,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    BaseMesh,
    RefinedMesh,
    #[serde(other)]
    Other,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::BaseMesh => "base_mesh",
            Self::RefinedMesh => "refined_mesh",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub url: String,
    pub artifact_type: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Body of a `get_status` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: TaskStatus,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl StatusResponse {
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.artifact_type == kind)
    }
}

/// A decoded preview image
#[derive(Debug, Clone)]
pub struct Texture {
    pub image: DynamicImage,
}

impl Texture {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// A downloaded glTF asset, validated but not parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GltfModel {
    pub bytes: Vec<u8>,
    /// `.glb` container rather than JSON glTF
    pub binary: bool,
}

#[derive(Debug, Clone)]
pub enum Asset {
    Texture(Texture),
    Model(GltfModel),
}

/// Progress of a tracked job
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Artifact {
        kind: ArtifactKind,
        url: String,
        asset: Asset,
    },
    /// Terminal; no more events follow
    Failed(TaskError),
}

/// Artifact already retrieved for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedArtifact {
    pub kind: ArtifactKind,
    pub url: String,
}

/// Poller-side view of one job
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedTask {
    pub task_id: String,
    pub status: TaskStatus,
    pub stage: Option<Stage>,
    pub artifacts: SmallVec<[RetrievedArtifact; 3]>,
}

impl TrackedTask {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Initialized,
            stage: None,
            artifacts: SmallVec::new(),
        }
    }

    pub fn has(&self, kind: ArtifactKind) -> bool {
        self.artifacts.iter().any(|a| a.kind == kind)
    }
}
