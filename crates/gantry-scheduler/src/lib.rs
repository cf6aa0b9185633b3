//! Stage scheduling and job orchestration for Gantry.
//!
//! The [`Orchestrator`] drives a validated [`PipelinePlan`] to completion:
//! it evaluates stage conditions against upstream outputs, expands job
//! matrices, consolidates artifacts for consuming stages and dispatches
//! every job instance to a build collaborator.

pub mod artifacts;
pub mod cancel;
pub mod changes;
pub mod condition;
pub mod dag;
pub mod dispatcher;
pub mod matrix;
pub mod outputs;
pub mod plan;
pub mod scheduler;

pub use artifacts::{ArtifactConsolidator, InMemoryArtifactStore};
pub use cancel::CancellationHandle;
pub use changes::{ChangeDetector, ChangeSet};
pub use condition::{ConditionEvaluator, EvaluationEnv};
pub use dag::{DagBuilder, PipelineDag, Readiness};
pub use dispatcher::{JobContext, JobDispatcher, JobResult};
pub use matrix::{JobInstance, MatrixExpander};
pub use outputs::{OutputKey, OutputStore};
pub use plan::PipelinePlan;
pub use scheduler::{Orchestrator, OrchestratorConfig, RunRequest};
