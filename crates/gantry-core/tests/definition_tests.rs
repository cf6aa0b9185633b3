//! Parsing tests for pipeline definitions.

use gantry_core::condition::{Condition, Operand, OutputValue};
use gantry_core::pipeline::*;
use pretty_assertions::assert_eq;

const EDGE_RUNTIME: &str = include_str!("../../../pipelines/edge-runtime.yaml");

#[test]
fn test_edge_runtime_pipeline_parses() {
    let def: PipelineDefinition = serde_yaml::from_str(EDGE_RUNTIME).expect("parse");

    assert_eq!(def.name, "edge-runtime");
    assert_eq!(def.timeout_minutes, 90);
    assert_eq!(def.parameters.get("e2e"), Some(&OutputValue::Bool(true)));

    let names: Vec<&str> = def.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "CheckBuildImages",
            "BuildExecutables",
            "BuildLibrocksdb",
            "PackageEdgelet",
            "BuildImages"
        ]
    );

    let images = def.stage("BuildImages").unwrap();
    assert_eq!(images.consumes, vec!["dotnet_artifacts", "librocksdb"]);
    assert_eq!(images.depends_on, vec!["BuildExecutables", "BuildLibrocksdb"]);
}

#[test]
fn test_matrix_keeps_declaration_order() {
    let def: PipelineDefinition = serde_yaml::from_str(EDGE_RUNTIME).expect("parse");
    let job = def.stage("PackageEdgelet").unwrap().job("package").unwrap();
    let matrix = job.matrix.as_ref().unwrap();

    let names: Vec<&str> = matrix.instances.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Debian11-amd64",
            "Debian11-arm32v7",
            "Ubuntu2204-amd64",
            "Ubuntu2204-arm64v8",
            "RedHat9-amd64"
        ]
    );
    assert_eq!(matrix.instances[2].variables["os"], "ubuntu22.04");
    assert_eq!(job.max_parallel, Some(3));
}

#[test]
fn test_detector_steps_and_outputs() {
    let def: PipelineDefinition = serde_yaml::from_str(EDGE_RUNTIME).expect("parse");
    let stage = def.stage("CheckBuildImages").unwrap();

    let runtime = stage.job("check_source_change_runtime").unwrap();
    let detector = runtime.steps[0].detect_changes.as_ref().unwrap();
    assert_eq!(detector.patterns, vec!["test", "doc", "edgelet"]);
    assert!(!detector.invert);
    assert!(runtime.steps[0].validate_action().is_ok());

    let declared = runtime.output("check_files", "RUNTIMEBUILD").unwrap();
    assert_eq!(declared.skipped_default, OutputValue::Bool(false));

    let packages = stage.job("check_source_change_packages").unwrap();
    assert!(packages.steps[0].detect_changes.as_ref().unwrap().invert);
}

#[test]
fn test_condition_tree_from_yaml() {
    let def: PipelineDefinition = serde_yaml::from_str(EDGE_RUNTIME).expect("parse");
    let condition = def
        .stage("BuildExecutables")
        .unwrap()
        .condition
        .clone()
        .unwrap();

    assert_eq!(
        condition,
        Condition::And(vec![
            Condition::Eq(
                Operand::Param {
                    param: "e2e".to_string()
                },
                Operand::Literal(OutputValue::Bool(true)),
            ),
            Condition::var("CheckBuildImages.check_source_change_runtime.check_files.RUNTIMEBUILD")
                .unwrap(),
        ])
    );
}

#[test]
fn test_always_steps_and_artifacts() {
    let def: PipelineDefinition = serde_yaml::from_str(EDGE_RUNTIME).expect("parse");
    let job = def.stage("PackageEdgelet").unwrap().job("package").unwrap();

    assert_eq!(job.steps[0].condition, StepCondition::Succeeded);
    assert_eq!(job.steps[1].condition, StepCondition::Always);

    let logs = job.artifacts.iter().find(|a| a.name == "logs").unwrap();
    assert!(logs.always);
    assert_eq!(logs.path, ".gantry/logs");
}

#[test]
fn test_numeric_matrix_values_become_strings() {
    let yaml = r#"
version: "1"
name: numeric
stages:
  - name: Build
    jobs:
      - name: build
        matrix:
          old: { version: 11, lts: true }
          new: { version: "20.10", lts: false }
        steps:
          - name: build
            run: echo $version
"#;
    let def: PipelineDefinition = serde_yaml::from_str(yaml).expect("parse");
    let matrix = def.stages[0].jobs[0].matrix.as_ref().unwrap();

    assert_eq!(matrix.instances[0].variables["version"], "11");
    assert_eq!(matrix.instances[0].variables["lts"], "true");
    assert_eq!(matrix.instances[1].variables["version"], "20.10");
    assert_eq!(def.timeout_minutes, 60);
}

#[test]
fn test_decimal_matrix_values_must_be_quoted() {
    let yaml = r#"
version: "1"
name: numeric
stages:
  - name: Build
    jobs:
      - name: build
        matrix:
          u2010: { os_version: 20.10 }
        steps:
          - name: build
            run: echo $os_version
"#;
    let err = serde_yaml::from_str::<PipelineDefinition>(yaml).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("'os_version'"), "{message}");
    assert!(message.contains("quote it"), "{message}");
}

#[test]
fn test_step_action_validation() {
    let step = StepDefinition {
        name: "empty".to_string(),
        display_name: None,
        run: None,
        detect_changes: None,
        condition: StepCondition::Succeeded,
        continue_on_error: false,
        working_directory: None,
        variables: Default::default(),
    };
    assert!(step.validate_action().is_err());
}
