//! Scoped store for cross-stage output variables.

use gantry_core::condition::{OutputValue, VariableRef};
use gantry_core::ids::JobKey;
use gantry_core::run::OutputRecord;
use gantry_core::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputKey {
    pub stage: String,
    pub job: JobKey,
    pub task: String,
    pub name: String,
}

impl OutputKey {
    pub fn new(
        stage: impl Into<String>,
        job: JobKey,
        task: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            job,
            task: task.into(),
            name: name.into(),
        }
    }
}

impl From<&VariableRef> for OutputKey {
    fn from(var: &VariableRef) -> Self {
        Self::new(&var.stage, JobKey::new(&var.job), &var.task, &var.name)
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.stage, self.job, self.task, self.name)
    }
}

/// Outputs published by terminal stages during one run.
///
/// Each key is written once by its producer and is read-only afterward.
#[derive(Debug, Default)]
pub struct OutputStore {
    values: BTreeMap<OutputKey, OutputValue>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: OutputKey, value: OutputValue) -> Result<()> {
        if self.values.contains_key(&key) {
            return Err(Error::OutputConflict(key.to_string()));
        }
        self.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &OutputKey) -> Option<&OutputValue> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn records(&self) -> Vec<OutputRecord> {
        self.values
            .iter()
            .map(|(key, value)| OutputRecord {
                stage: key.stage.clone(),
                job: key.job.clone(),
                task: key.task.clone(),
                name: key.name.clone(),
                value: value.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outputs_are_write_once() {
        let mut store = OutputStore::new();
        let key = OutputKey::new("Check", JobKey::new("detect"), "files", "RUNTIMEBUILD");

        store.insert(key.clone(), true.into()).unwrap();
        let err = store.insert(key.clone(), false.into()).unwrap_err();

        assert!(matches!(err, Error::OutputConflict(k) if k == "Check.detect.files.RUNTIMEBUILD"));
        assert_eq!(store.get(&key), Some(&OutputValue::Bool(true)));
    }

    #[test]
    fn test_key_from_variable_ref() {
        let var: VariableRef = "Check.detect.files.RUNTIMEBUILD".parse().unwrap();
        assert_eq!(
            OutputKey::from(&var),
            OutputKey::new("Check", JobKey::new("detect"), "files", "RUNTIMEBUILD")
        );
    }
}
