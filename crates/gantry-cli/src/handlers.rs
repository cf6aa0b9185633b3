//! Command handlers.

use crate::changes;
use crate::commands::ChangeArgs;
use crate::config::CliConfig;
use anyhow::{Context, anyhow};
use console::{StyledObject, style};
use gantry_core::condition::OutputValue;
use gantry_core::pipeline::PipelineDefinition;
use gantry_core::run::{JobStatus, PublishOutcome, RunReport, StageReason, StageStatus};
use gantry_runner::{OutputLine, OutputStream, RunnerConfig, ShellCollaborator};
use gantry_scheduler::{
    CancellationHandle, ChangeDetector, ChangeSet, InMemoryArtifactStore, Orchestrator,
    OrchestratorConfig, PipelinePlan, RunRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Options for a local run.
pub struct RunOptions {
    pub path: PathBuf,
    pub params: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub verbose: bool,
    pub changes: ChangeArgs,
}

fn load_definition(path: &Path) -> anyhow::Result<PipelineDefinition> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Validate a pipeline definition.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let plan = PipelinePlan::build(load_definition(path)?)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        plan.definition.name
    );
    println!("  Stages: {}", plan.definition.stages.len());

    for stage in &plan.definition.stages {
        println!(
            "    - {} ({} jobs)",
            stage.name,
            plan.instances(&stage.name).len()
        );
    }

    Ok(())
}

/// Print the stages in execution order with their job instances.
pub fn plan(path: &Path) -> anyhow::Result<()> {
    let plan = PipelinePlan::build(load_definition(path)?)?;

    println!("{} {}", style("Pipeline").bold(), plan.definition.name);
    for node in plan.dag.topological_order() {
        let stage = &node.definition;
        print!("  {}", style(&stage.name).cyan());
        if !stage.depends_on.is_empty() {
            print!(" {}", style(format!("<- {}", stage.depends_on.join(", "))).dim());
        }
        println!();
        if let Some(condition) = &stage.condition {
            println!("      if {condition}");
        }
        if !stage.consumes.is_empty() {
            println!("      consumes {}", stage.consumes.join(", "));
        }
        for instance in plan.instances(&stage.name) {
            println!("      - {}", instance.display_name);
        }
    }

    Ok(())
}

/// Evaluate change detectors against a change-set.
pub async fn detect(
    pipeline: Option<&Path>,
    exclude: &[String],
    include: &[String],
    args: &ChangeArgs,
) -> anyhow::Result<()> {
    let changes = changes::resolve(args, Path::new(".")).await?;
    print_changes(&changes);

    if let Some(path) = pipeline {
        let definition = load_definition(path)?;
        for stage in &definition.stages {
            for job in &stage.jobs {
                for step in &job.steps {
                    let Some(config) = &step.detect_changes else {
                        continue;
                    };
                    let detector = ChangeDetector::new(config)?;
                    println!(
                        "  {}.{}.{}.{} = {}",
                        stage.name,
                        job.name,
                        step.name,
                        detector.output(),
                        verdict(detector.relevant(&changes))
                    );
                }
            }
        }
        return Ok(());
    }

    let detector = if include.is_empty() {
        let patterns: Vec<&str> = exclude.iter().map(String::as_str).collect();
        ChangeDetector::excluding("CHANGES", &patterns)?
    } else {
        let patterns: Vec<&str> = include.iter().map(String::as_str).collect();
        ChangeDetector::including("CHANGES", &patterns)?
    };
    println!("  relevant = {}", verdict(detector.relevant(&changes)));
    Ok(())
}

fn print_changes(changes: &ChangeSet) {
    match changes {
        ChangeSet::Paths(paths) => {
            println!("{} {} changed paths", style("i").blue(), paths.len());
        }
        ChangeSet::Unknown => {
            println!("{} change-set unknown, every detector fires", style("!").yellow());
        }
    }
}

fn verdict(relevant: bool) -> StyledObject<bool> {
    if relevant {
        style(relevant).green()
    } else {
        style(relevant).dim()
    }
}

/// Parse `name=value` parameter overrides.
pub fn parse_params(params: &[String]) -> anyhow::Result<Vec<(String, OutputValue)>> {
    params
        .iter()
        .map(|raw| {
            let (name, value) = raw
                .split_once('=')
                .ok_or_else(|| anyhow!("Invalid parameter '{raw}', expected NAME=VALUE"))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(anyhow!("Invalid parameter '{raw}', name is empty"));
            }
            Ok((name.to_string(), OutputValue::parse_lenient(value.trim())))
        })
        .collect()
}

/// Execute a pipeline locally. Returns whether the run succeeded.
pub async fn run_pipeline(config: &CliConfig, options: RunOptions) -> anyhow::Result<bool> {
    let definition = load_definition(&options.path)?;

    let workdir = options
        .workdir
        .or_else(|| config.default_workdir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let workdir = std::path::absolute(&workdir)
        .with_context(|| format!("resolving {}", workdir.display()))?;

    let changes = changes::resolve(&options.changes, &workdir).await?;
    let mut request = RunRequest::new(changes);
    for (name, value) in parse_params(&options.params)? {
        request = request.with_parameter(name, value);
    }

    let mut collaborator = ShellCollaborator::new(RunnerConfig::new(&workdir));
    let printer = if options.verbose {
        let (tx, rx) = mpsc::channel(1024);
        collaborator = collaborator.with_output(tx);
        Some(tokio::spawn(print_output(rx)))
    } else {
        None
    };

    let orchestrator = Orchestrator::new(
        Arc::new(collaborator),
        Arc::new(InMemoryArtifactStore::default()),
        OrchestratorConfig {
            max_parallel_jobs: options.max_parallel.unwrap_or(config.max_parallel_jobs),
            working_dir: workdir.clone(),
        },
    );

    let cancel = CancellationHandle::new();
    let on_signal = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    println!(
        "{} Running {} in {}",
        style("▶").cyan(),
        style(&definition.name).bold(),
        style(workdir.display()).dim()
    );

    let result = orchestrator.run(definition, request, cancel).await;
    signal.abort();
    // Dropping the orchestrator closes the output channel.
    drop(orchestrator);
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    let report = result?;

    print_report(&report);

    if let Some(path) = &options.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "Run report written");
    }

    Ok(report.is_success())
}

async fn print_output(mut rx: mpsc::Receiver<OutputLine>) {
    while let Some(line) = rx.recv().await {
        let prefix = format!("[{}/{}]", line.job, line.step);
        match line.stream {
            OutputStream::Stdout => println!("{} {}", style(prefix).dim(), line.content),
            OutputStream::Stderr => eprintln!("{} {}", style(prefix).red(), line.content),
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    for stage in &report.stages {
        let (icon, status) = match stage.status {
            StageStatus::Succeeded => (style("✓").green(), "succeeded"),
            StageStatus::Skipped => (style("-").dim(), "skipped"),
            StageStatus::Failed => (style("✗").red(), "failed"),
            StageStatus::Blocked => (style("…").yellow(), "blocked"),
            StageStatus::Pending | StageStatus::Running => (style("?").yellow(), "incomplete"),
        };
        print!("{icon} {} {}", style(&stage.name).bold(), style(status).dim());
        if let Some(reason) = &stage.reason {
            print!(" ({})", describe_reason(reason));
        }
        println!();

        for job in &stage.jobs {
            let icon = match job.status {
                JobStatus::Succeeded => style("✓").green(),
                JobStatus::SucceededWithIssues => style("!").yellow(),
                JobStatus::Failed => style("✗").red(),
                JobStatus::Cancelled => style("-").yellow(),
                JobStatus::Pending | JobStatus::Running => style("?").dim(),
            };
            print!("    {icon} {}", job.key);
            if let Some(ms) = job.duration_ms {
                print!(" {}", style(format!("{ms}ms")).dim());
            }
            if let Some(error) = &job.error {
                print!(" {}", style(error).red());
            }
            println!();
        }
    }

    let failed: Vec<_> = report
        .artifacts
        .iter()
        .filter_map(|a| match &a.outcome {
            PublishOutcome::Failed { message } => Some((a, message)),
            PublishOutcome::Published => None,
        })
        .collect();
    for (artifact, message) in &failed {
        println!(
            "{} artifact {} from {}: {message}",
            style("!").yellow(),
            artifact.name,
            artifact.producer
        );
    }

    let summary = format!("Run {} {:?} in {}ms", report.run_id, report.status, report.duration_ms);
    if report.is_success() {
        println!("\n{} {summary}", style("✓").green());
    } else {
        println!("\n{} {summary}", style("✗").red());
    }
}

fn describe_reason(reason: &StageReason) -> String {
    match reason {
        StageReason::ConditionFalse => "condition is false".to_string(),
        StageReason::DependencyFailed { dependency } => format!("dependency {dependency} failed"),
        StageReason::ConditionUnresolved { error } => error.to_string(),
        StageReason::ConsolidationConflict { error } => error.to_string(),
        StageReason::JobsFailed { jobs } => {
            let jobs: Vec<String> = jobs.iter().map(ToString::to_string).collect();
            format!("failed jobs: {}", jobs.join(", "))
        }
        StageReason::Cancelled => "cancelled".to_string(),
    }
}

/// Print the JSON schema of pipeline definitions.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> anyhow::Result<()> {
    println!("{}", style("Current configuration:").bold());
    print!("{}", serde_yaml::to_string(config)?);
    println!("\nConfig file: {}", CliConfig::config_path()?.display());
    Ok(())
}

/// Set a configuration value.
pub fn set_config(key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}
