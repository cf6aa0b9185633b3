//! Dependency-gated stage scheduling for one pipeline run.

use crate::cancel::CancellationHandle;
use crate::changes::ChangeSet;
use crate::condition::{ConditionEvaluator, EvaluationEnv};
use crate::dag::Readiness;
use crate::dispatcher::{JobContext, JobDispatcher, JobResult};
use crate::matrix::JobInstance;
use crate::outputs::{OutputKey, OutputStore};
use crate::plan::PipelinePlan;
use chrono::Utc;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream;
use gantry_core::artifact::ConsolidatedArtifact;
use gantry_core::condition::OutputValue;
use gantry_core::ids::RunId;
use gantry_core::pipeline::{PipelineDefinition, StageDefinition};
use gantry_core::ports::{ArtifactStore, BuildCollaborator};
use gantry_core::run::{
    ArtifactPublication, JobStatus, PublishOutcome, RunReport, RunStatus, StageReason,
    StageReport, StageStatus,
};
use gantry_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Orchestrator-wide settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global cap on concurrently running jobs across all stages.
    pub max_parallel_jobs: usize,
    pub working_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            working_dir: PathBuf::from("."),
        }
    }
}

/// Per-run inputs.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub changes: ChangeSet,
    /// Overrides for declared pipeline parameters.
    pub parameters: BTreeMap<String, OutputValue>,
}

impl RunRequest {
    pub fn new(changes: ChangeSet) -> Self {
        Self {
            changes,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<OutputValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// What a stage task hands back to the run loop.
struct StageOutcome {
    jobs: Vec<JobResult>,
    publications: Vec<ArtifactPublication>,
    inputs: Vec<String>,
    reason: Option<StageReason>,
}

/// Drives a pipeline definition through one run.
pub struct Orchestrator {
    dispatcher: JobDispatcher,
    store: Arc<dyn ArtifactStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        collaborator: Arc<dyn BuildCollaborator>,
        store: Arc<dyn ArtifactStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            dispatcher: JobDispatcher::new(collaborator),
            store,
            config,
        }
    }

    /// Execute a pipeline to completion.
    ///
    /// Definition errors are returned before any job starts. Once jobs run,
    /// every stage and job failure is recorded in the returned report.
    pub async fn run(
        &self,
        definition: PipelineDefinition,
        request: RunRequest,
        cancel: CancellationHandle,
    ) -> Result<RunReport> {
        let plan = PipelinePlan::build(definition)?;
        let parameters = resolve_parameters(&plan.definition, request.parameters)?;

        let run_id = RunId::new();
        let started_at = Utc::now();
        let pipeline = Arc::new(plan.definition.clone());
        let changes = Arc::new(request.changes);
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_jobs.max(1)));

        for name in plan.artifact_names() {
            self.store.create(run_id, &name).await?;
        }

        info!(
            %run_id,
            pipeline = %pipeline.name,
            stages = pipeline.stages.len(),
            "Pipeline run started"
        );

        let order: Vec<String> = plan
            .dag
            .topological_order()
            .into_iter()
            .map(|node| node.name.clone())
            .collect();

        let mut statuses: HashMap<String, StageStatus> = pipeline
            .stages
            .iter()
            .map(|s| (s.name.clone(), StageStatus::Pending))
            .collect();
        let mut reports: HashMap<String, StageReport> = pipeline
            .stages
            .iter()
            .map(|s| (s.name.clone(), StageReport::pending(&s.name, s.display_name.clone())))
            .collect();
        let mut outputs = OutputStore::new();
        let mut publications = Vec::new();
        let mut join_set: JoinSet<(String, Result<StageOutcome>)> = JoinSet::new();
        let mut cancelled = false;
        let evaluator = ConditionEvaluator::new();

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                warn!(%run_id, "Run cancelled, skipping stages that have not started");
            }

            for name in &order {
                let status = statuses[name];
                if !matches!(status, StageStatus::Pending | StageStatus::Blocked) {
                    continue;
                }
                let Some(stage) = pipeline.stage(name) else {
                    continue;
                };

                if cancelled {
                    statuses.insert(name.clone(), StageStatus::Skipped);
                    conclude(&mut reports, name, StageStatus::Skipped, Some(StageReason::Cancelled));
                    continue;
                }

                let decision = match plan.dag.readiness(name, &statuses) {
                    Readiness::Waiting => {
                        statuses.insert(name.clone(), StageStatus::Blocked);
                        continue;
                    }
                    Readiness::DependencyFailed(dependency) => Err(StageReason::DependencyFailed {
                        dependency,
                    }),
                    Readiness::Ready => match &stage.condition {
                        None => Ok(true),
                        Some(condition) => {
                            let env = EvaluationEnv {
                                consumer: stage,
                                pipeline: &pipeline,
                                statuses: &statuses,
                                outputs: &outputs,
                                parameters: &parameters,
                            };
                            evaluator
                                .evaluate(condition, &env)
                                .map_err(|error| StageReason::ConditionUnresolved { error })
                        }
                    },
                };

                match decision {
                    Ok(true) => {
                        info!(%run_id, stage = %name, "Stage started");
                        statuses.insert(name.clone(), StageStatus::Running);
                        if let Some(report) = reports.get_mut(name) {
                            report.status = StageStatus::Running;
                            report.started_at = Some(Utc::now());
                        }

                        let ctx = JobContext {
                            run_id,
                            pipeline: Arc::clone(&pipeline),
                            working_dir: self.config.working_dir.clone(),
                            changes: Arc::clone(&changes),
                            inputs: Arc::new(vec![]),
                        };
                        let task = StageTask {
                            dispatcher: self.dispatcher.clone(),
                            store: Arc::clone(&self.store),
                            semaphore: Arc::clone(&semaphore),
                            cancel: cancel.clone(),
                            stage: stage.clone(),
                            instances: plan.instances(name).to_vec(),
                        };
                        let stage_name = name.clone();
                        join_set.spawn(async move {
                            let outcome = task.run(ctx).await;
                            (stage_name, outcome)
                        });
                    }
                    Ok(false) => {
                        info!(%run_id, stage = %name, "Stage skipped, condition is false");
                        statuses.insert(name.clone(), StageStatus::Skipped);
                        conclude(&mut reports, name, StageStatus::Skipped, Some(StageReason::ConditionFalse));
                    }
                    Err(reason) => {
                        warn!(%run_id, stage = %name, reason = ?reason, "Stage failed before starting");
                        statuses.insert(name.clone(), StageStatus::Failed);
                        conclude(&mut reports, name, StageStatus::Failed, Some(reason));
                    }
                }
            }

            if join_set.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = join_set.join_next() => joined,
                _ = cancel.cancelled(), if !cancelled => continue,
            };
            let Some(joined) = joined else {
                break;
            };
            let (name, outcome) =
                joined.map_err(|e| Error::Internal(format!("stage task failed: {e}")))?;
            let outcome = outcome?;

            for job in &outcome.jobs {
                for output in &job.outputs {
                    outputs.insert(
                        OutputKey::new(&name, job.key.clone(), &output.task, &output.name),
                        output.value.clone(),
                    )?;
                }
            }
            publications.extend(outcome.publications.iter().cloned());

            let (status, reason) = stage_verdict(&outcome);
            match status {
                StageStatus::Succeeded => info!(%run_id, stage = %name, "Stage succeeded"),
                _ => error!(%run_id, stage = %name, reason = ?reason, "Stage failed"),
            }
            statuses.insert(name.clone(), status);
            if let Some(report) = reports.get_mut(&name) {
                report.jobs = outcome.jobs.iter().map(JobResult::report).collect();
                report.inputs = outcome.inputs;
            }
            conclude(&mut reports, &name, status, reason);
        }

        let completed_at = Utc::now();
        let stages: Vec<StageReport> = pipeline
            .stages
            .iter()
            .filter_map(|s| reports.remove(&s.name))
            .collect();

        let status = if cancelled {
            RunStatus::Cancelled
        } else if stages.iter().any(|s| s.status == StageStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        info!(%run_id, status = ?status, "Pipeline run finished");

        Ok(RunReport {
            run_id,
            pipeline: pipeline.name.clone(),
            status,
            stages,
            artifacts: publications,
            outputs: outputs.records(),
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
        })
    }
}

/// Runs the jobs of one stage.
struct StageTask {
    dispatcher: JobDispatcher,
    store: Arc<dyn ArtifactStore>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationHandle,
    stage: StageDefinition,
    instances: Vec<JobInstance>,
}

impl StageTask {
    async fn run(self, mut ctx: JobContext) -> Result<StageOutcome> {
        let mut inputs = Vec::with_capacity(self.stage.consumes.len());
        for name in &self.stage.consumes {
            match self.store.fetch_consolidated(ctx.run_id, name).await {
                Ok(bundle) => inputs.push(bundle),
                Err(Error::ConsolidationConflict(error)) => {
                    return Ok(StageOutcome {
                        jobs: vec![],
                        publications: vec![],
                        inputs: vec![],
                        reason: Some(StageReason::ConsolidationConflict { error }),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        let input_names = inputs.iter().map(|b: &ConsolidatedArtifact| b.name.clone()).collect();
        ctx.inputs = Arc::new(inputs);

        let this = Arc::new(self);
        let ctx = Arc::new(ctx);
        let per_job = this.stage.jobs.iter().map(|job| {
            let instances: Vec<(usize, JobInstance)> = this
                .instances
                .iter()
                .enumerate()
                .filter(|(_, instance)| instance.job == job.name)
                .map(|(index, instance)| (index, instance.clone()))
                .collect();
            let limit = job
                .max_parallel
                .map(|n| n as usize)
                .unwrap_or(instances.len())
                .max(1);

            let this = Arc::clone(&this);
            let ctx = Arc::clone(&ctx);
            stream::iter(instances)
                .map(move |(index, instance)| {
                    let this = Arc::clone(&this);
                    let ctx = Arc::clone(&ctx);
                    async move { (index, this.run_instance(&instance, &ctx).await) }
                })
                .buffer_unordered(limit)
                .collect::<Vec<_>>()
        });

        let mut results: Vec<(usize, (JobResult, Vec<ArtifactPublication>))> =
            join_all(per_job).await.into_iter().flatten().collect();
        results.sort_by_key(|(index, _)| *index);

        let mut jobs = Vec::with_capacity(results.len());
        let mut publications = Vec::new();
        for (_, (job, published)) in results {
            jobs.push(job);
            publications.extend(published);
        }

        Ok(StageOutcome {
            jobs,
            publications,
            inputs: input_names,
            reason: None,
        })
    }

    async fn run_instance(
        &self,
        instance: &JobInstance,
        ctx: &JobContext,
    ) -> (JobResult, Vec<ArtifactPublication>) {
        if self.cancel.is_cancelled() {
            return (JobResult::cancelled(instance), vec![]);
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
            _ = self.cancel.cancelled() => return (JobResult::cancelled(instance), vec![]),
        };
        let Ok(_permit) = permit else {
            return (JobResult::cancelled(instance), vec![]);
        };
        if self.cancel.is_cancelled() {
            return (JobResult::cancelled(instance), vec![]);
        }

        let result = self.dispatcher.dispatch(instance, ctx).await;

        let mut publications = Vec::with_capacity(result.artifacts.len());
        for artifact in &result.artifacts {
            let outcome = match self.store.append(ctx.run_id, artifact.clone()).await {
                Ok(()) => PublishOutcome::Published,
                Err(e) => {
                    warn!(artifact = %artifact.name, producer = %artifact.producer, error = %e, "Artifact publication failed");
                    PublishOutcome::Failed {
                        message: e.to_string(),
                    }
                }
            };
            publications.push(ArtifactPublication {
                name: artifact.name.clone(),
                producer: artifact.producer.clone(),
                stage: artifact.stage.clone(),
                always: artifact.always,
                files: artifact.files.len(),
                outcome,
            });
        }

        (result, publications)
    }
}

fn stage_verdict(outcome: &StageOutcome) -> (StageStatus, Option<StageReason>) {
    if let Some(reason) = &outcome.reason {
        return (StageStatus::Failed, Some(reason.clone()));
    }
    if outcome.jobs.iter().any(|j| j.status == JobStatus::Cancelled) {
        return (StageStatus::Failed, Some(StageReason::Cancelled));
    }
    let failed: Vec<_> = outcome
        .jobs
        .iter()
        .filter(|j| !j.status.is_success())
        .map(|j| j.key.clone())
        .collect();
    if failed.is_empty() {
        (StageStatus::Succeeded, None)
    } else {
        (StageStatus::Failed, Some(StageReason::JobsFailed { jobs: failed }))
    }
}

fn conclude(
    reports: &mut HashMap<String, StageReport>,
    name: &str,
    status: StageStatus,
    reason: Option<StageReason>,
) {
    let Some(report) = reports.get_mut(name) else {
        return;
    };
    let now = Utc::now();
    report.status = status;
    report.reason = reason;
    report.completed_at = Some(now);
    if let Some(started) = report.started_at {
        report.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
    }
}

fn resolve_parameters(
    definition: &PipelineDefinition,
    overrides: BTreeMap<String, OutputValue>,
) -> Result<BTreeMap<String, OutputValue>> {
    let mut parameters = definition.parameters.clone();
    for (name, value) in overrides {
        if !parameters.contains_key(&name) {
            return Err(Error::InvalidPipeline(format!("unknown parameter '{name}'")));
        }
        parameters.insert(name, value);
    }
    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ids::JobKey;
    use gantry_core::run::JobReport;

    fn job(key: &str, status: JobStatus) -> JobResult {
        let mut result = JobResult::cancelled(&JobInstance {
            key: JobKey::new(key),
            stage: "Build".to_string(),
            job: key.to_string(),
            instance: None,
            bindings: BTreeMap::new(),
            display_name: key.to_string(),
        });
        result.status = status;
        result
    }

    fn outcome(jobs: Vec<JobResult>) -> StageOutcome {
        StageOutcome {
            jobs,
            publications: vec![],
            inputs: vec![],
            reason: None,
        }
    }

    #[test]
    fn test_stage_verdict() {
        let ok = outcome(vec![
            job("a", JobStatus::Succeeded),
            job("b", JobStatus::SucceededWithIssues),
        ]);
        assert_eq!(stage_verdict(&ok), (StageStatus::Succeeded, None));

        let failed = outcome(vec![job("a", JobStatus::Succeeded), job("b", JobStatus::Failed)]);
        assert_eq!(
            stage_verdict(&failed),
            (
                StageStatus::Failed,
                Some(StageReason::JobsFailed {
                    jobs: vec![JobKey::new("b")]
                })
            )
        );

        let cancelled = outcome(vec![job("a", JobStatus::Failed), job("b", JobStatus::Cancelled)]);
        assert_eq!(
            stage_verdict(&cancelled),
            (StageStatus::Failed, Some(StageReason::Cancelled))
        );
    }

    #[test]
    fn test_parameter_overrides() {
        let def: PipelineDefinition = serde_yaml::from_str(
            r#"
version: "1"
name: p
parameters: { e2e: true }
stages: []
"#,
        )
        .unwrap();

        let overrides = BTreeMap::from([("e2e".to_string(), OutputValue::Bool(false))]);
        let resolved = resolve_parameters(&def, overrides).unwrap();
        assert_eq!(resolved["e2e"], OutputValue::Bool(false));

        let unknown = BTreeMap::from([("nope".to_string(), OutputValue::Bool(false))]);
        assert!(resolve_parameters(&def, unknown).is_err());
    }

    #[test]
    fn test_job_report_conversion() {
        let report: JobReport = job("a", JobStatus::Succeeded).report();
        assert_eq!(report.key.as_str(), "a");
        assert!(report.outputs.is_empty());
    }
}
