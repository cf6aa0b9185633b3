//! Error types for Gantry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// A condition referenced a variable that cannot be resolved, or resolved to
/// a value of the wrong type.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Cannot resolve '{reference}': {reason}")]
pub struct ConditionResolutionError {
    pub reference: String,
    pub reason: String,
}

impl ConditionResolutionError {
    pub fn new(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

/// Matrix instances do not share a key set, or the matrix is empty.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Matrix instance '{instance}' has keys {found:?}, expected {expected:?}")]
pub struct MatrixShapeError {
    pub instance: String,
    pub expected: BTreeSet<String>,
    pub found: BTreeSet<String>,
}

/// Two matrix instances share a name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Duplicate matrix instance '{instance}'")]
pub struct DuplicateInstanceError {
    pub instance: String,
}

/// Two contributors to a consolidated artifact provide the same path.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Artifact '{artifact}': path '{path}' is provided by both '{first}' and '{second}'")]
pub struct ConsolidationConflictError {
    pub artifact: String,
    pub path: String,
    pub first: String,
    pub second: String,
}

/// Failure surfaced from a build collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobExecutionError {
    #[error("Step '{step}' exited with code {exit_code}")]
    NonZeroExit { step: String, exit_code: i32 },

    #[error("Job timed out after {minutes} minutes")]
    Timeout { minutes: u32 },

    #[error("Collaborator failed on step '{step}': {message}")]
    Collaborator { step: String, message: String },
}

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Unknown stage dependency: {stage} depends on {dependency}")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Cycle detected in stage dependencies: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error(transparent)]
    MatrixShape(#[from] MatrixShapeError),

    #[error(transparent)]
    DuplicateInstance(#[from] DuplicateInstanceError),

    // Execution errors
    #[error(transparent)]
    ConditionResolution(#[from] ConditionResolutionError),

    #[error(transparent)]
    ConsolidationConflict(#[from] ConsolidationConflictError),

    #[error(transparent)]
    JobExecution(#[from] JobExecutionError),

    // Store errors
    #[error("Output already written: {0}")]
    OutputConflict(String),

    #[error("Artifact '{name}' already has a variant from '{producer}'")]
    ArtifactConflict { name: String, producer: String },

    #[error("Artifact already exists: {0}")]
    ArtifactExists(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Whether the error invalidates the definition itself, so no job may start.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPipeline(_)
                | Error::UnknownDependency { .. }
                | Error::CycleDetected { .. }
                | Error::MatrixShape(_)
                | Error::DuplicateInstance(_)
        )
    }
}
