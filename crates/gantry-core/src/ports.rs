//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestrator and the
//! external collaborators it drives.

use crate::artifact::{Artifact, ConsolidatedArtifact};
use crate::ids::{JobKey, RunId};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// One step handed to a build collaborator.
#[derive(Debug, Clone)]
pub struct CollaboratorRequest {
    pub run_id: RunId,
    pub stage: String,
    pub job: JobKey,
    pub step: String,
    pub script: String,
    /// Fully resolved execution environment.
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    /// Time left before the owning job times out.
    pub timeout: Duration,
    /// Bundles consolidated for the owning stage.
    pub inputs: Vec<ConsolidatedArtifact>,
}

/// What a build collaborator reports back for one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollaboratorResponse {
    pub exit_code: i32,
    pub outputs: BTreeMap<String, String>,
    /// Files produced by the step, to be matched against artifact declarations.
    pub files: Vec<PathBuf>,
}

impl CollaboratorResponse {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Opaque package/image builder invoked per step.
#[async_trait]
pub trait BuildCollaborator: Send + Sync {
    /// Run a step to completion.
    ///
    /// `Ok` with a non-zero exit code is a step failure; `Err` means the
    /// collaborator could not run the step at all.
    async fn invoke(&self, request: &CollaboratorRequest) -> Result<CollaboratorResponse>;
}

/// Run-scoped artifact storage keyed by `(run_id, name)`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Create an empty entry for a logical name. Fails if it exists.
    async fn create(&self, run_id: RunId, name: &str) -> Result<()>;

    /// Add one producer's variant. Fails if the producer already wrote one.
    async fn append(&self, run_id: RunId, artifact: Artifact) -> Result<()>;

    /// Merge every variant of `name` under the consolidation conflict policy.
    async fn fetch_consolidated(&self, run_id: RunId, name: &str) -> Result<ConsolidatedArtifact>;

    /// All variants written during a run.
    async fn list(&self, run_id: RunId) -> Result<Vec<Artifact>>;
}
