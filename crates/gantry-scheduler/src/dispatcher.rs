//! Job dispatch: runs the steps of one job instance through a collaborator.

use crate::changes::{ChangeDetector, ChangeSet};
use crate::matrix::JobInstance;
use chrono::{DateTime, Utc};
use gantry_core::artifact::{Artifact, ConsolidatedArtifact};
use gantry_core::condition::OutputValue;
use gantry_core::error::JobExecutionError;
use gantry_core::ids::{JobKey, RunId};
use gantry_core::pipeline::{
    ArtifactDeclaration, JobDefinition, PipelineDefinition, StageDefinition, StepCondition,
    StepDefinition,
};
use gantry_core::ports::{BuildCollaborator, CollaboratorRequest};
use gantry_core::run::{JobReport, JobStatus, StepReport, StepStatus};
use gantry_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Time granted to `always` steps once the job deadline has passed.
pub const ALWAYS_STEP_GRACE: Duration = Duration::from_secs(300);

/// Run-wide inputs shared by every job of a stage.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: RunId,
    pub pipeline: Arc<PipelineDefinition>,
    pub working_dir: PathBuf,
    pub changes: Arc<ChangeSet>,
    /// Bundles consolidated for the stage.
    pub inputs: Arc<Vec<ConsolidatedArtifact>>,
}

/// An output published by one step of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub task: String,
    pub name: String,
    pub value: OutputValue,
}

/// Terminal result of one job instance.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub key: JobKey,
    pub job: String,
    pub instance: Option<String>,
    pub status: JobStatus,
    pub error: Option<JobExecutionError>,
    pub steps: Vec<StepReport>,
    pub outputs: Vec<JobOutput>,
    /// Artifacts to publish; already filtered by the job outcome.
    pub artifacts: Vec<Artifact>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl JobResult {
    /// A job that never started because the run was cancelled.
    pub fn cancelled(instance: &JobInstance) -> Self {
        Self {
            key: instance.key.clone(),
            job: instance.job.clone(),
            instance: instance.instance.clone(),
            status: JobStatus::Cancelled,
            error: None,
            steps: vec![],
            outputs: vec![],
            artifacts: vec![],
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            key: self.key.clone(),
            job: self.job.clone(),
            instance: self.instance.clone(),
            status: self.status,
            error: self.error.clone(),
            steps: self.steps.clone(),
            outputs: self
                .outputs
                .iter()
                .map(|o| (format!("{}.{}", o.task, o.name), o.value.clone()))
                .collect(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
        }
    }
}

/// Invokes the build collaborator for each step of a job.
#[derive(Clone)]
pub struct JobDispatcher {
    collaborator: Arc<dyn BuildCollaborator>,
    always_grace: Duration,
}

impl JobDispatcher {
    pub fn new(collaborator: Arc<dyn BuildCollaborator>) -> Self {
        Self {
            collaborator,
            always_grace: ALWAYS_STEP_GRACE,
        }
    }

    pub fn with_always_grace(mut self, grace: Duration) -> Self {
        self.always_grace = grace;
        self
    }

    /// Run a job instance to a terminal status.
    ///
    /// Never fails: every problem is folded into the returned status.
    pub async fn dispatch(&self, instance: &JobInstance, ctx: &JobContext) -> JobResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut result = JobResult {
            key: instance.key.clone(),
            job: instance.job.clone(),
            instance: instance.instance.clone(),
            status: JobStatus::Running,
            error: None,
            steps: vec![],
            outputs: vec![],
            artifacts: vec![],
            started_at: Some(started_at),
            completed_at: None,
            duration_ms: None,
        };

        let definitions = ctx.pipeline.stage(&instance.stage).and_then(|stage| {
            stage.job(&instance.job).map(|job| (stage, job))
        });
        let Some((stage, job)) = definitions else {
            result.status = JobStatus::Failed;
            result.error = Some(JobExecutionError::Collaborator {
                step: String::new(),
                message: format!("no definition for {}.{}", instance.stage, instance.job),
            });
            return finish(result, start);
        };

        let minutes = job
            .timeout_minutes
            .or(stage.timeout_minutes)
            .unwrap_or(ctx.pipeline.timeout_minutes);
        let deadline = start + Duration::from_secs(u64::from(minutes) * 60);
        let base_env = self.base_env(instance, stage, job, ctx);

        info!(
            stage = %instance.stage,
            job = %instance.key,
            timeout_minutes = minutes,
            "Job started"
        );

        let mut failed = false;
        let mut timed_out = false;
        let mut issues = false;
        let mut produced: Vec<PathBuf> = Vec::new();

        for step in &job.steps {
            if (failed || timed_out) && step.condition == StepCondition::Succeeded {
                debug!(job = %instance.key, step = %step.name, "Step skipped");
                result.steps.push(StepReport {
                    name: step.name.clone(),
                    status: StepStatus::Skipped,
                    exit_code: None,
                    duration_ms: 0,
                });
                continue;
            }

            let step_start = Instant::now();
            let outcome = if let Some(config) = &step.detect_changes {
                ChangeDetector::new(config).map(|detector| {
                    let relevant = detector.relevant(&ctx.changes);
                    info!(
                        job = %instance.key,
                        step = %step.name,
                        output = %detector.output(),
                        relevant,
                        "Change detection published"
                    );
                    result.outputs.push(JobOutput {
                        task: step.name.clone(),
                        name: detector.output().to_string(),
                        value: OutputValue::Bool(relevant),
                    });
                    StepOutcome::Exited(0)
                })
            } else {
                let budget = if timed_out {
                    self.always_grace
                } else {
                    deadline.saturating_duration_since(Instant::now())
                };
                self.run_step(instance, step, &base_env, budget, ctx, &mut result, &mut produced)
                    .await
            };
            let duration_ms = step_start.elapsed().as_millis() as u64;

            let (status, exit_code) = match outcome {
                Ok(StepOutcome::Exited(0)) => (StepStatus::Succeeded, Some(0)),
                Ok(StepOutcome::Exited(code)) => {
                    if step.continue_on_error {
                        warn!(job = %instance.key, step = %step.name, exit_code = code, "Step failed, continuing");
                        issues = true;
                    } else if !failed && !timed_out {
                        failed = true;
                        result.error = Some(JobExecutionError::NonZeroExit {
                            step: step.name.clone(),
                            exit_code: code,
                        });
                    }
                    (StepStatus::Failed, Some(code))
                }
                Ok(StepOutcome::TimedOut) => {
                    if !timed_out && !failed {
                        result.error = Some(JobExecutionError::Timeout { minutes });
                    }
                    timed_out = true;
                    warn!(job = %instance.key, step = %step.name, "Job timed out");
                    (StepStatus::Failed, None)
                }
                Err(e) => {
                    if !failed && !timed_out {
                        result.error = Some(JobExecutionError::Collaborator {
                            step: step.name.clone(),
                            message: e.to_string(),
                        });
                    }
                    failed = true;
                    warn!(job = %instance.key, step = %step.name, error = %e, "Collaborator failed");
                    (StepStatus::Failed, None)
                }
            };

            result.steps.push(StepReport {
                name: step.name.clone(),
                status,
                exit_code,
                duration_ms,
            });
        }

        result.status = if failed || timed_out {
            if job.continue_on_error {
                JobStatus::SucceededWithIssues
            } else {
                JobStatus::Failed
            }
        } else if issues {
            JobStatus::SucceededWithIssues
        } else {
            JobStatus::Succeeded
        };

        let succeeded = !failed && !timed_out;
        result.artifacts = job
            .artifacts
            .iter()
            .filter(|decl| decl.always || succeeded)
            .filter_map(|decl| collect_artifact(instance, decl, &produced, &ctx.working_dir))
            .collect();

        let result = finish(result, start);
        info!(
            stage = %instance.stage,
            job = %instance.key,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "Job finished"
        );
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        instance: &JobInstance,
        step: &StepDefinition,
        base_env: &BTreeMap<String, String>,
        budget: Duration,
        ctx: &JobContext,
        result: &mut JobResult,
        produced: &mut Vec<PathBuf>,
    ) -> Result<StepOutcome> {
        if budget.is_zero() {
            return Ok(StepOutcome::TimedOut);
        }

        let mut env = base_env.clone();
        env.extend(step.variables.clone());
        env.insert("GANTRY_STEP".to_string(), step.name.clone());

        let working_dir = match &step.working_directory {
            Some(dir) => ctx.working_dir.join(dir),
            None => ctx.working_dir.clone(),
        };

        let request = CollaboratorRequest {
            run_id: ctx.run_id,
            stage: instance.stage.clone(),
            job: instance.key.clone(),
            step: step.name.clone(),
            script: step.run.clone().unwrap_or_default(),
            env,
            working_dir,
            timeout: budget,
            inputs: ctx.inputs.as_ref().clone(),
        };

        debug!(job = %instance.key, step = %step.name, "Invoking collaborator");
        let response = match tokio::time::timeout(budget, self.collaborator.invoke(&request)).await {
            Err(_) => return Ok(StepOutcome::TimedOut),
            Ok(Err(Error::JobExecution(JobExecutionError::Timeout { .. }))) => {
                return Ok(StepOutcome::TimedOut);
            }
            Ok(other) => other?,
        };

        produced.extend(response.files.iter().cloned());
        for (name, raw) in &response.outputs {
            result.outputs.push(JobOutput {
                task: step.name.clone(),
                name: name.clone(),
                value: OutputValue::parse_lenient(raw),
            });
        }

        Ok(StepOutcome::Exited(response.exit_code))
    }

    /// Pipeline, stage, job and matrix bindings, later layers winning.
    fn base_env(
        &self,
        instance: &JobInstance,
        stage: &StageDefinition,
        job: &JobDefinition,
        ctx: &JobContext,
    ) -> BTreeMap<String, String> {
        let mut env = ctx.pipeline.variables.clone();
        env.extend(stage.variables.clone());
        env.extend(job.variables.clone());
        env.extend(instance.bindings.clone());
        env.insert("GANTRY_RUN_ID".to_string(), ctx.run_id.to_string());
        env.insert("GANTRY_STAGE".to_string(), instance.stage.clone());
        env.insert("GANTRY_JOB".to_string(), instance.key.to_string());
        if let Some(name) = &instance.instance {
            env.insert("GANTRY_MATRIX_INSTANCE".to_string(), name.clone());
        }
        env
    }
}

enum StepOutcome {
    Exited(i32),
    TimedOut,
}

fn finish(mut result: JobResult, start: Instant) -> JobResult {
    result.completed_at = Some(Utc::now());
    result.duration_ms = Some(start.elapsed().as_millis() as u64);
    result
}

/// Match produced files against one artifact declaration by path prefix.
fn collect_artifact(
    instance: &JobInstance,
    decl: &ArtifactDeclaration,
    produced: &[PathBuf],
    working_dir: &Path,
) -> Option<Artifact> {
    let prefix = normalize(Path::new(&decl.path));
    let mut artifact = Artifact::new(&decl.name, instance.key.clone(), &instance.stage);
    if decl.always {
        artifact = artifact.always();
    }

    let absolute_workdir = std::path::absolute(working_dir).unwrap_or_else(|_| working_dir.to_path_buf());

    for file in produced {
        let relative_to_workdir = if file.is_absolute() {
            match file
                .strip_prefix(working_dir)
                .or_else(|_| file.strip_prefix(&absolute_workdir))
            {
                Ok(rel) => normalize(rel),
                Err(_) => continue,
            }
        } else {
            normalize(file)
        };

        let Ok(inside) = relative_to_workdir.strip_prefix(&prefix) else {
            continue;
        };
        let relative = inside
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if relative.is_empty() {
            continue;
        }
        artifact
            .files
            .insert(relative, working_dir.join(&relative_to_workdir));
    }

    (decl.always || !artifact.files.is_empty()).then_some(artifact)
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
