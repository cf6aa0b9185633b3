//! Shell collaborator tests against a real `sh`.

use gantry_core::artifact::{ConsolidatedArtifact, ConsolidatedFile};
use gantry_core::error::JobExecutionError;
use gantry_core::ids::{JobKey, RunId};
use gantry_core::ports::{BuildCollaborator, CollaboratorRequest};
use gantry_core::Error;
use gantry_runner::{OutputStream, RunnerConfig, ShellCollaborator};
use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn request(workspace: &Path, job: &str, step: &str, script: &str) -> CollaboratorRequest {
    CollaboratorRequest {
        run_id: RunId::new(),
        stage: "Build".to_string(),
        job: JobKey::new(job),
        step: step.to_string(),
        script: script.to_string(),
        env: BTreeMap::new(),
        working_dir: workspace.to_path_buf(),
        timeout: Duration::from_secs(30),
        inputs: Vec::new(),
    }
}

fn collaborator(dir: &TempDir) -> ShellCollaborator {
    ShellCollaborator::new(RunnerConfig::new(dir.path()))
}

#[tokio::test]
async fn test_successful_step_writes_log() {
    let dir = TempDir::new().unwrap();
    let shell = collaborator(&dir);

    let response = shell
        .invoke(&request(dir.path(), "build", "compile", "echo hello\necho oops >&2"))
        .await
        .unwrap();

    assert!(response.success());
    let log = dir.path().join(".gantry/logs/build/compile.log");
    assert_eq!(response.files, vec![log.clone()]);

    let content = std::fs::read_to_string(&log).unwrap();
    assert!(content.contains("hello\n"));
    assert!(content.contains("[stderr] oops\n"));
}

#[tokio::test]
async fn test_non_zero_exit_is_reported_not_raised() {
    let dir = TempDir::new().unwrap();
    let shell = collaborator(&dir);

    let response = shell
        .invoke(&request(dir.path(), "build", "fail", "exit 3"))
        .await
        .unwrap();

    assert_eq!(response.exit_code, 3);
    assert!(!response.success());
    // Logs are kept for failed steps too.
    assert_eq!(response.files.len(), 1);
}

#[tokio::test]
async fn test_outputs_and_manifest() {
    let dir = TempDir::new().unwrap();
    let shell = collaborator(&dir);

    let script = r#"
mkdir -p target
echo built > target/app.bin
echo VERSION=1.4.0 >> "$GANTRY_OUTPUT"
echo "CHANGED=true" >> "$GANTRY_OUTPUT"
echo target/app.bin >> "$GANTRY_ARTIFACTS"
"#;
    let response = shell
        .invoke(&request(dir.path(), "build", "compile", script))
        .await
        .unwrap();

    assert!(response.success());
    assert_eq!(response.outputs["VERSION"], "1.4.0");
    assert_eq!(response.outputs["CHANGED"], "true");
    assert_eq!(response.files[0], dir.path().join("target/app.bin"));
    assert!(response.files[0].exists());
}

#[tokio::test]
async fn test_env_and_working_dir() {
    let dir = TempDir::new().unwrap();
    let shell = collaborator(&dir);

    let mut req = request(
        dir.path(),
        "package_arm64",
        "env",
        r#"echo "ARCH=$ARCH" >> "$GANTRY_OUTPUT"; echo "CWD=$(basename "$PWD")" >> "$GANTRY_OUTPUT""#,
    );
    req.env.insert("ARCH".to_string(), "arm64".to_string());
    req.working_dir = dir.path().join("edgelet");

    let response = shell.invoke(&req).await.unwrap();

    assert_eq!(response.outputs["ARCH"], "arm64");
    assert_eq!(response.outputs["CWD"], "edgelet");
}

#[tokio::test]
async fn test_timeout_kills_step() {
    let dir = TempDir::new().unwrap();
    let shell = collaborator(&dir);

    let mut req = request(dir.path(), "build", "hang", "sleep 30");
    req.timeout = Duration::from_millis(200);

    let err = shell.invoke(&req).await.unwrap_err();
    assert!(matches!(
        err,
        Error::JobExecution(JobExecutionError::Timeout { .. })
    ));
}

#[tokio::test]
async fn test_runner_cap_overrides_job_budget() {
    let dir = TempDir::new().unwrap();
    let mut config = RunnerConfig::new(dir.path());
    config.timeout_seconds = Some(0);
    let shell = ShellCollaborator::new(config);

    let err = shell
        .invoke(&request(dir.path(), "build", "hang", "sleep 30"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobExecution(_)));
}

#[tokio::test]
async fn test_empty_script_is_rejected() {
    let dir = TempDir::new().unwrap();
    let shell = collaborator(&dir);

    let err = shell
        .invoke(&request(dir.path(), "build", "noop", "   "))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("has no script"));
}

#[tokio::test]
async fn test_output_lines_are_forwarded() {
    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let shell = collaborator(&dir).with_output(tx);

    shell
        .invoke(&request(dir.path(), "build", "compile", "echo one\necho two >&2"))
        .await
        .unwrap();
    drop(shell);

    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        lines.push(line);
    }

    assert_eq!(lines.len(), 2);
    let stdout = lines.iter().find(|l| l.stream == OutputStream::Stdout).unwrap();
    assert_eq!(stdout.content, "one");
    assert_eq!(stdout.line_number, 1);
    assert_eq!(stdout.job, JobKey::new("build"));
    assert_eq!(stdout.step, "compile");
    assert!(lines.iter().any(|l| l.stream == OutputStream::Stderr && l.content == "two"));
}

#[tokio::test]
async fn test_inputs_manifest() {
    let dir = TempDir::new().unwrap();
    let shell = collaborator(&dir);

    let producer = JobKey::new("build_amd64");
    let mut files = BTreeMap::new();
    files.insert(
        "amd64/librocksdb.a".to_string(),
        ConsolidatedFile {
            source: PathBuf::from("/work/out/amd64/librocksdb.a"),
            producer: producer.clone(),
        },
    );
    let mut req = request(
        dir.path(),
        "image",
        "inspect",
        r#"cp "$GANTRY_INPUTS" inputs.json"#,
    );
    req.inputs = vec![ConsolidatedArtifact {
        name: "librocksdb".to_string(),
        files,
        contributors: BTreeSet::from([producer]),
    }];

    let response = shell.invoke(&req).await.unwrap();
    assert!(response.success());

    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("inputs.json")).unwrap())
            .unwrap();
    assert_eq!(
        manifest["librocksdb"]["amd64/librocksdb.a"],
        "/work/out/amd64/librocksdb.a"
    );
}
