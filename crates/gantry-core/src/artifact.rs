//! Artifact types.

use crate::ids::JobKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Files produced by one job instance under a logical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub producer: JobKey,
    pub stage: String,
    /// Published even when the producing job failed.
    pub always: bool,
    /// Relative path inside the artifact to the file's source location.
    pub files: BTreeMap<String, PathBuf>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, producer: JobKey, stage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            producer,
            stage: stage.into(),
            always: false,
            files: BTreeMap::new(),
        }
    }

    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }

    pub fn with_file(mut self, relative: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        self.files.insert(relative.into(), source.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedFile {
    pub source: PathBuf,
    pub producer: JobKey,
}

/// Union of every same-name artifact produced during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedArtifact {
    pub name: String,
    pub files: BTreeMap<String, ConsolidatedFile>,
    pub contributors: BTreeSet<JobKey>,
}

impl ConsolidatedArtifact {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
