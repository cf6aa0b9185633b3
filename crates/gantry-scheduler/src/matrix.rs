//! Matrix expansion into concrete job instances.

use gantry_core::error::{DuplicateInstanceError, MatrixShapeError};
use gantry_core::ids::JobKey;
use gantry_core::pipeline::{JobDefinition, MatrixDefinition, MatrixInstance, StageDefinition};
use gantry_core::Result;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// A job materialized for one matrix instance (or the job itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInstance {
    pub key: JobKey,
    pub stage: String,
    pub job: String,
    pub instance: Option<String>,
    pub bindings: BTreeMap<String, String>,
    pub display_name: String,
}

/// Expander for matrix configurations.
///
/// A matrix is a flat list of named instances; there is no cartesian
/// product and no include/exclude filtering.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Validate a matrix and return its instances in declaration order.
    pub fn expand(&self, matrix: &MatrixDefinition) -> Result<Vec<MatrixInstance>> {
        let Some(first) = matrix.instances.first() else {
            return Err(MatrixShapeError {
                instance: String::new(),
                expected: BTreeSet::new(),
                found: BTreeSet::new(),
            }
            .into());
        };
        let expected: BTreeSet<String> = first.variables.keys().cloned().collect();

        let mut seen = HashSet::new();
        for instance in &matrix.instances {
            if !seen.insert(instance.name.as_str()) {
                return Err(DuplicateInstanceError {
                    instance: instance.name.clone(),
                }
                .into());
            }

            let found: BTreeSet<String> = instance.variables.keys().cloned().collect();
            if found != expected {
                return Err(MatrixShapeError {
                    instance: instance.name.clone(),
                    expected,
                    found,
                }
                .into());
            }
        }

        Ok(matrix.instances.clone())
    }

    /// Materialize the job instances of one job.
    pub fn expand_job(&self, stage: &StageDefinition, job: &JobDefinition) -> Result<Vec<JobInstance>> {
        let Some(matrix) = &job.matrix else {
            return Ok(vec![JobInstance {
                key: JobKey::for_instance(&job.name, None),
                stage: stage.name.clone(),
                job: job.name.clone(),
                instance: None,
                bindings: BTreeMap::new(),
                display_name: job.display_name.clone().unwrap_or_else(|| job.name.clone()),
            }]);
        };

        let instances = self
            .expand(matrix)
            .map_err(|e| annotate(e, &stage.name, &job.name))?;

        Ok(instances
            .into_iter()
            .map(|instance| {
                let display_name = self.format_display_name(job, &instance);
                JobInstance {
                    key: JobKey::for_instance(&job.name, Some(&instance.name)),
                    stage: stage.name.clone(),
                    job: job.name.clone(),
                    instance: Some(instance.name),
                    bindings: instance.variables,
                    display_name,
                }
            })
            .collect())
    }

    fn format_display_name(&self, job: &JobDefinition, instance: &MatrixInstance) -> String {
        let base = job.display_name.as_deref().unwrap_or(&job.name);
        if instance.variables.is_empty() {
            return format!("{base} ({})", instance.name);
        }

        let parts: Vec<String> = instance
            .variables
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        format!("{base} ({}: {})", instance.name, parts.join(", "))
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

// An empty matrix has no instance to blame; name the job instead.
fn annotate(err: gantry_core::Error, stage: &str, job: &str) -> gantry_core::Error {
    match err {
        gantry_core::Error::MatrixShape(mut shape) if shape.instance.is_empty() => {
            shape.instance = format!("{stage}.{job} (empty matrix)");
            shape.into()
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Error;
    use pretty_assertions::assert_eq;

    fn matrix(instances: &[(&str, &[(&str, &str)])]) -> MatrixDefinition {
        MatrixDefinition::new(
            instances
                .iter()
                .map(|(name, vars)| MatrixInstance::new(*name, vars.iter().copied()))
                .collect(),
        )
    }

    fn job(matrix: Option<MatrixDefinition>) -> JobDefinition {
        JobDefinition {
            name: "package".to_string(),
            display_name: None,
            matrix,
            max_parallel: None,
            timeout_minutes: None,
            continue_on_error: false,
            variables: Default::default(),
            steps: vec![],
            outputs: vec![],
            artifacts: vec![],
        }
    }

    fn stage() -> StageDefinition {
        StageDefinition {
            name: "PackageEdgelet".to_string(),
            display_name: None,
            depends_on: vec![],
            condition: None,
            timeout_minutes: None,
            variables: Default::default(),
            consumes: vec![],
            jobs: vec![],
        }
    }

    #[test]
    fn test_flat_enumeration_in_declaration_order() {
        let m = matrix(&[
            ("Debian11-amd64", &[("arch", "amd64"), ("os", "debian11")]),
            ("Ubuntu2204-arm64v8", &[("arch", "arm64v8"), ("os", "ubuntu22.04")]),
            ("RedHat9-amd64", &[("arch", "amd64"), ("os", "redhat9")]),
        ]);

        let instances = MatrixExpander::new().expand(&m).unwrap();

        assert_eq!(instances.len(), 3);
        let names: Vec<&str> = instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Debian11-amd64", "Ubuntu2204-arm64v8", "RedHat9-amd64"]);
        for instance in &instances {
            let keys: Vec<&str> = instance.variables.keys().map(String::as_str).collect();
            assert_eq!(keys, vec!["arch", "os"]);
        }
    }

    #[test]
    fn test_mismatched_keys_are_rejected() {
        let m = matrix(&[
            ("amd64", &[("arch", "amd64"), ("os", "debian11")]),
            ("arm64", &[("arch", "arm64")]),
        ]);

        let err = MatrixExpander::new().expand(&m).unwrap_err();
        match err {
            Error::MatrixShape(shape) => {
                assert_eq!(shape.instance, "arm64");
                assert!(shape.expected.contains("os"));
                assert!(!shape.found.contains("os"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_extra_key_is_rejected() {
        let m = matrix(&[
            ("amd64", &[("arch", "amd64")]),
            ("arm64", &[("arch", "arm64"), ("os", "debian11")]),
        ]);
        assert!(matches!(
            MatrixExpander::new().expand(&m),
            Err(Error::MatrixShape(_))
        ));
    }

    #[test]
    fn test_duplicate_instance_names() {
        let m = matrix(&[("amd64", &[("arch", "amd64")]), ("amd64", &[("arch", "x86_64")])]);
        let err = MatrixExpander::new().expand(&m).unwrap_err();
        assert!(matches!(err, Error::DuplicateInstance(d) if d.instance == "amd64"));
    }

    #[test]
    fn test_empty_matrix_is_a_shape_error() {
        let err = MatrixExpander::new()
            .expand_job(&stage(), &job(Some(MatrixDefinition::new(vec![]))))
            .unwrap_err();
        match err {
            Error::MatrixShape(shape) => assert!(shape.instance.contains("PackageEdgelet.package")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_job_without_matrix_is_a_single_instance() {
        let instances = MatrixExpander::new().expand_job(&stage(), &job(None)).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].key.as_str(), "package");
        assert_eq!(instances[0].instance, None);
        assert!(instances[0].bindings.is_empty());
    }

    #[test]
    fn test_matrix_job_keys_and_display_names() {
        let m = matrix(&[("amd64", &[("arch", "amd64")]), ("arm64", &[("arch", "arm64")])]);
        let instances = MatrixExpander::new().expand_job(&stage(), &job(Some(m))).unwrap();

        assert_eq!(instances[0].key.as_str(), "package_amd64");
        assert_eq!(instances[1].key.as_str(), "package_arm64");
        assert_eq!(instances[1].display_name, "package (arm64: arch=arm64)");
        assert_eq!(instances[1].bindings["arch"], "arm64");
    }
}
