//! Definition validation and up-front expansion of a run.

use crate::changes::ChangeDetector;
use crate::dag::{DagBuilder, PipelineDag};
use crate::matrix::{JobInstance, MatrixExpander};
use gantry_core::pipeline::{PipelineDefinition, StageDefinition};
use gantry_core::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// A validated pipeline with every job instance materialized.
#[derive(Debug)]
pub struct PipelinePlan {
    pub definition: PipelineDefinition,
    pub dag: PipelineDag,
    instances: HashMap<String, Vec<JobInstance>>,
}

impl PipelinePlan {
    /// Validate `definition` and expand every matrix.
    ///
    /// Any error here is a definition error: no job may start.
    pub fn build(definition: PipelineDefinition) -> Result<Self> {
        let dag = DagBuilder::new().build(&definition)?;
        let expander = MatrixExpander::new();

        let declared_artifacts: BTreeSet<&str> = definition
            .stages
            .iter()
            .flat_map(|s| s.jobs.iter())
            .flat_map(|j| j.artifacts.iter())
            .map(|a| a.name.as_str())
            .collect();

        let mut instances = HashMap::new();
        for stage in &definition.stages {
            validate_stage(stage, &declared_artifacts)?;
            validate_consumes(stage, &definition, &dag)?;

            let mut stage_instances = Vec::new();
            let mut keys = HashSet::new();
            for job in &stage.jobs {
                for instance in expander.expand_job(stage, job)? {
                    if !keys.insert(instance.key.clone()) {
                        return Err(Error::InvalidPipeline(format!(
                            "stage '{}': job key '{}' is produced twice",
                            stage.name, instance.key
                        )));
                    }
                    stage_instances.push(instance);
                }
            }
            instances.insert(stage.name.clone(), stage_instances);
        }

        debug!(
            pipeline = %definition.name,
            stages = definition.stages.len(),
            jobs = instances.values().map(Vec::len).sum::<usize>(),
            "Pipeline plan built"
        );

        Ok(Self {
            definition,
            dag,
            instances,
        })
    }

    /// Job instances of a stage, in declaration order.
    pub fn instances(&self, stage: &str) -> &[JobInstance] {
        self.instances.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Artifact names declared anywhere in the pipeline.
    pub fn artifact_names(&self) -> BTreeSet<String> {
        self.definition
            .stages
            .iter()
            .flat_map(|s| s.jobs.iter())
            .flat_map(|j| j.artifacts.iter())
            .map(|a| a.name.clone())
            .collect()
    }
}

/// A consumer must run after every stage that produces what it consumes,
/// otherwise it would see a partial bundle.
fn validate_consumes(
    stage: &StageDefinition,
    definition: &PipelineDefinition,
    dag: &PipelineDag,
) -> Result<()> {
    for name in &stage.consumes {
        let producers = definition.stages.iter().filter(|s| {
            s.jobs
                .iter()
                .any(|j| j.artifacts.iter().any(|a| &a.name == name))
        });
        for producer in producers {
            if producer.name == stage.name {
                return Err(Error::InvalidPipeline(format!(
                    "stage '{}': consumes artifact '{name}' that it produces itself",
                    stage.name
                )));
            }
            if !dag.depends_transitively(&stage.name, &producer.name) {
                return Err(Error::InvalidPipeline(format!(
                    "stage '{}': consumes artifact '{name}' produced by '{}' but does not depend on it",
                    stage.name, producer.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_stage(stage: &StageDefinition, declared_artifacts: &BTreeSet<&str>) -> Result<()> {
    let invalid = |msg: String| Error::InvalidPipeline(format!("stage '{}': {msg}", stage.name));

    if let Some(condition) = &stage.condition {
        for var in condition.references() {
            if !stage.depends_on.contains(&var.stage) {
                return Err(invalid(format!(
                    "condition references '{var}' but '{}' is not in depends_on",
                    var.stage
                )));
            }
        }
    }

    for name in &stage.consumes {
        if !declared_artifacts.contains(name.as_str()) {
            return Err(invalid(format!("consumes undeclared artifact '{name}'")));
        }
    }

    let mut job_names = HashSet::new();
    for job in &stage.jobs {
        if !job_names.insert(job.name.as_str()) {
            return Err(invalid(format!("duplicate job name '{}'", job.name)));
        }
        if job.max_parallel == Some(0) {
            return Err(invalid(format!("job '{}': max_parallel must be at least 1", job.name)));
        }

        let mut step_names = HashSet::new();
        for step in &job.steps {
            if !step_names.insert(step.name.as_str()) {
                return Err(invalid(format!(
                    "job '{}': duplicate step name '{}'",
                    job.name, step.name
                )));
            }
            step.validate_action()
                .map_err(|e| invalid(format!("job '{}': {e}", job.name)))?;
            if let Some(config) = &step.detect_changes {
                ChangeDetector::new(config)?;
            }
        }

        let mut artifact_names = HashSet::new();
        for artifact in &job.artifacts {
            if !artifact_names.insert(artifact.name.as_str()) {
                return Err(invalid(format!(
                    "job '{}': duplicate artifact '{}'",
                    job.name, artifact.name
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDGE_RUNTIME: &str = include_str!("../../../pipelines/edge-runtime.yaml");

    fn parse(yaml: &str) -> PipelineDefinition {
        serde_yaml::from_str(yaml).expect("parse")
    }

    #[test]
    fn test_edge_runtime_plan() {
        let plan = PipelinePlan::build(parse(EDGE_RUNTIME)).unwrap();

        assert_eq!(plan.instances("PackageEdgelet").len(), 5);
        assert_eq!(plan.instances("BuildLibrocksdb").len(), 3);
        assert_eq!(plan.instances("CheckBuildImages").len(), 2);
        assert!(plan.instances("Missing").is_empty());
        assert!(plan.artifact_names().contains("logs"));
    }

    #[test]
    fn test_condition_must_reference_a_dependency() {
        let yaml = r#"
version: "1"
name: bad
stages:
  - name: Check
    jobs:
      - name: detect
        steps:
          - name: files
            detect_changes: { output: CHANGED, patterns: [doc] }
  - name: Build
    condition: { var: Check.detect.files.CHANGED }
    jobs:
      - name: build
        steps:
          - name: build
            run: make
"#;
        let err = PipelinePlan::build(parse(yaml)).unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline(msg) if msg.contains("not in depends_on")));
    }

    #[test]
    fn test_duplicate_steps_and_bad_patterns() {
        let yaml = r#"
version: "1"
name: bad
stages:
  - name: Build
    jobs:
      - name: build
        steps:
          - name: a
            run: make
          - name: a
            run: make test
"#;
        let err = PipelinePlan::build(parse(yaml)).unwrap_err();
        assert!(err.to_string().contains("duplicate step name 'a'"));

        let yaml = r#"
version: "1"
name: bad
stages:
  - name: Check
    jobs:
      - name: detect
        steps:
          - name: files
            detect_changes: { output: CHANGED, patterns: ["(doc"] }
"#;
        let err = PipelinePlan::build(parse(yaml)).unwrap_err();
        assert!(err.is_definition_error());
    }

    #[test]
    fn test_matrix_key_collision_with_plain_job() {
        let yaml = r#"
version: "1"
name: bad
stages:
  - name: Build
    jobs:
      - name: build
        matrix:
          amd64: { arch: amd64 }
        steps:
          - name: a
            run: make
      - name: build_amd64
        steps:
          - name: a
            run: make
"#;
        let err = PipelinePlan::build(parse(yaml)).unwrap_err();
        assert!(err.to_string().contains("produced twice"));
    }

    #[test]
    fn test_matrix_errors_abort_planning() {
        let yaml = r#"
version: "1"
name: bad
stages:
  - name: Build
    jobs:
      - name: build
        matrix:
          amd64: { arch: amd64, os: debian11 }
          arm64: { arch: arm64 }
        steps:
          - name: a
            run: make
"#;
        let err = PipelinePlan::build(parse(yaml)).unwrap_err();
        assert!(matches!(err, Error::MatrixShape(_)));
    }

    #[test]
    fn test_consumes_must_be_declared() {
        let yaml = r#"
version: "1"
name: bad
stages:
  - name: Images
    consumes: [binaries]
    jobs:
      - name: build
        steps:
          - name: a
            run: make
"#;
        let err = PipelinePlan::build(parse(yaml)).unwrap_err();
        assert!(err.to_string().contains("undeclared artifact 'binaries'"));
    }

    #[test]
    fn test_consumer_must_depend_on_every_producer() {
        let yaml = r#"
version: "1"
name: bad
stages:
  - name: Producer
    jobs:
      - name: prod
        steps:
          - name: build
            run: make
        artifacts:
          - { name: bin, path: out }
  - name: Consumer
    consumes: [bin]
    jobs:
      - name: cons
        steps:
          - name: use
            run: ls
"#;
        let err = PipelinePlan::build(parse(yaml)).unwrap_err();
        assert!(matches!(
            &err,
            Error::InvalidPipeline(msg) if msg.contains("produced by 'Producer' but does not depend on it")
        ));

        let transitive = yaml.replace(
            "  - name: Consumer\n",
            "  - name: Middle\n    depends_on: [Producer]\n    jobs:\n      - name: mid\n        steps:\n          - name: mid\n            run: make\n  - name: Consumer\n    depends_on: [Middle]\n",
        );
        let plan = PipelinePlan::build(parse(&transitive)).unwrap();
        assert_eq!(plan.instances("Consumer").len(), 1);
    }

    #[test]
    fn test_stage_cannot_consume_its_own_artifact() {
        let yaml = r#"
version: "1"
name: bad
stages:
  - name: Build
    consumes: [bin]
    jobs:
      - name: build
        steps:
          - name: build
            run: make
        artifacts:
          - { name: bin, path: out }
"#;
        let err = PipelinePlan::build(parse(yaml)).unwrap_err();
        assert!(err.to_string().contains("that it produces itself"));
    }
}
