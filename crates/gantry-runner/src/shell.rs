//! Shell-based build collaborator running steps on the host.

use crate::runner::{OutputLine, OutputStream, RunnerConfig};
use async_trait::async_trait;
use gantry_core::artifact::ConsolidatedArtifact;
use gantry_core::error::JobExecutionError;
use gantry_core::ids::JobKey;
use gantry_core::ports::{BuildCollaborator, CollaboratorRequest, CollaboratorResponse};
use gantry_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

const OUTPUT_FILE: &str = "output.env";
const ARTIFACTS_FILE: &str = "artifacts.txt";
const INPUTS_FILE: &str = "inputs.json";

/// Runs step scripts with `sh -c`.
///
/// Scripts publish outputs by appending `key=value` lines to
/// `$GANTRY_OUTPUT` and report produced files by appending paths to
/// `$GANTRY_ARTIFACTS`. Consolidated inputs are described by the JSON file
/// at `$GANTRY_INPUTS`.
pub struct ShellCollaborator {
    config: RunnerConfig,
    output_tx: Option<mpsc::Sender<OutputLine>>,
}

impl ShellCollaborator {
    pub fn new(mut config: RunnerConfig) -> Self {
        // Scripts may run in a sub-directory, so exported paths must be absolute.
        if let Ok(absolute) = std::path::absolute(&config.workspace) {
            config.workspace = absolute;
        }
        Self {
            config,
            output_tx: None,
        }
    }

    /// Forward every output line to `tx` as well as the step log.
    pub fn with_output(mut self, tx: mpsc::Sender<OutputLine>) -> Self {
        self.output_tx = Some(tx);
        self
    }

    async fn prepare_scratch(&self, request: &CollaboratorRequest) -> Result<PathBuf> {
        let scratch = self.config.scratch_dir(&request.job, &request.step);
        fs::create_dir_all(&scratch).await?;
        fs::write(scratch.join(OUTPUT_FILE), b"").await?;
        fs::write(scratch.join(ARTIFACTS_FILE), b"").await?;
        fs::write(scratch.join(INPUTS_FILE), inputs_manifest(&request.inputs)?).await?;
        Ok(scratch)
    }

    async fn execute_command(
        &self,
        request: &CollaboratorRequest,
        scratch: &Path,
        log_path: &Path,
    ) -> Result<i32> {
        let start = std::time::Instant::now();

        info!(
            job = %request.job,
            step = %request.step,
            workspace = %request.working_dir.display(),
            "Executing shell command"
        );

        fs::create_dir_all(&request.working_dir).await?;
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut log = fs::File::create(log_path).await?;

        let mut child = Command::new(&self.config.shell)
            .arg("-c")
            .arg(&request.script)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .env("GANTRY_OUTPUT", scratch.join(OUTPUT_FILE))
            .env("GANTRY_ARTIFACTS", scratch.join(ARTIFACTS_FILE))
            .env("GANTRY_INPUTS", scratch.join(INPUTS_FILE))
            .env("GANTRY_WORKSPACE", &self.config.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn process: {e}")))?;

        let (line_tx, mut line_rx) = mpsc::channel::<OutputLine>(256);
        let stdout_handle = child.stdout.take().map(|stdout| {
            tokio::spawn(stream_lines(
                stdout,
                OutputStream::Stdout,
                request.job.clone(),
                request.step.clone(),
                line_tx.clone(),
            ))
        });
        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(stream_lines(
                stderr,
                OutputStream::Stderr,
                request.job.clone(),
                request.step.clone(),
                line_tx.clone(),
            ))
        });
        drop(line_tx);

        // Tee streamed lines into the step log and the optional listener.
        let forward = self.output_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                let prefix = match line.stream {
                    OutputStream::Stdout => "",
                    OutputStream::Stderr => "[stderr] ",
                };
                let _ = log
                    .write_all(format!("{prefix}{}\n", line.content).as_bytes())
                    .await;
                if let Some(tx) = &forward {
                    let _ = tx.send(line).await;
                }
            }
            let _ = log.flush().await;
        });

        let mut budget = request.timeout;
        if let Some(cap) = self.config.timeout_seconds {
            budget = budget.min(Duration::from_secs(cap));
        }

        let wait_result = match timeout(budget, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    job = %request.job,
                    step = %request.step,
                    timeout_secs = budget.as_secs(),
                    "Command timed out, killing process"
                );
                let _ = child.kill().await;
                return Err(JobExecutionError::Timeout {
                    minutes: budget.as_secs().div_ceil(60).max(1) as u32,
                }
                .into());
            }
        };

        // Wait for output streaming to complete
        if let Some(handle) = stdout_handle {
            let _ = handle.await;
        }
        if let Some(handle) = stderr_handle {
            let _ = handle.await;
        }
        let _ = writer.await;

        let status =
            wait_result.map_err(|e| Error::Internal(format!("Failed to wait for process: {e}")))?;
        let exit_code = status.code().unwrap_or(-1);

        debug!(
            job = %request.job,
            step = %request.step,
            exit_code,
            duration_ms = start.elapsed().as_millis() as u64,
            "Command completed"
        );
        Ok(exit_code)
    }
}

impl Default for ShellCollaborator {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl BuildCollaborator for ShellCollaborator {
    async fn invoke(&self, request: &CollaboratorRequest) -> Result<CollaboratorResponse> {
        if request.script.trim().is_empty() {
            return Err(Error::Internal(format!("step '{}' has no script", request.step)));
        }

        let scratch = self.prepare_scratch(request).await?;
        let log_path = self.config.log_path(&request.job, &request.step);

        let exit_code = self.execute_command(request, &scratch, &log_path).await?;

        let outputs = parse_outputs(&fs::read_to_string(scratch.join(OUTPUT_FILE)).await?);
        let mut files = parse_manifest(
            &fs::read_to_string(scratch.join(ARTIFACTS_FILE)).await?,
            &request.working_dir,
        );
        files.push(log_path);

        Ok(CollaboratorResponse {
            exit_code,
            outputs,
            files,
        })
    }
}

async fn stream_lines<R>(
    reader: R,
    stream: OutputStream,
    job: JobKey,
    step: String,
    tx: mpsc::Sender<OutputLine>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    let mut line_number = 0u32;

    while let Ok(Some(content)) = lines.next_line().await {
        line_number += 1;
        let line = OutputLine {
            job: job.clone(),
            step: step.clone(),
            stream,
            content,
            line_number,
            timestamp: chrono::Utc::now(),
        };
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Parse `key=value` lines written to `$GANTRY_OUTPUT`.
///
/// Also accepts the multi-line form `key<<DELIM`, value lines, `DELIM`.
pub fn parse_outputs(content: &str) -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let line = line.trim_end();
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let heredoc = line
            .split_once("<<")
            .filter(|(key, _)| !key.contains('='));
        if let Some((key, delimiter)) = heredoc {
            let delimiter = delimiter.trim();
            let mut value = Vec::new();
            for next in lines.by_ref() {
                if next.trim_end() == delimiter {
                    break;
                }
                value.push(next);
            }
            let key = key.trim();
            if !key.is_empty() {
                outputs.insert(key.to_string(), value.join("\n"));
            }
        } else if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                outputs.insert(key.to_string(), value.trim().to_string());
            }
        }
    }

    outputs
}

/// Parse the produced-file manifest, resolving relative paths.
pub fn parse_manifest(content: &str, working_dir: &Path) -> Vec<PathBuf> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let path = Path::new(line);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                working_dir.join(path)
            }
        })
        .collect()
}

fn inputs_manifest(inputs: &[ConsolidatedArtifact]) -> Result<Vec<u8>> {
    let manifest: BTreeMap<&str, BTreeMap<&str, &Path>> = inputs
        .iter()
        .map(|bundle| {
            let files = bundle
                .files
                .iter()
                .map(|(relative, file)| (relative.as_str(), file.source.as_path()))
                .collect();
            (bundle.name.as_str(), files)
        })
        .collect();
    Ok(serde_json::to_vec_pretty(&manifest)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_outputs() {
        let outputs = parse_outputs(
            "VERSION=1.4.0\n\n# comment\nCHANNEL = stable\nNOTES<<EOF\nline one\nline two\nEOF\n=ignored\n",
        );
        assert_eq!(outputs["VERSION"], "1.4.0");
        assert_eq!(outputs["CHANNEL"], "stable");
        assert_eq!(outputs["NOTES"], "line one\nline two");
        assert_eq!(outputs.len(), 3);
    }

    #[test]
    fn test_parse_outputs_value_containing_heredoc_marker() {
        let outputs = parse_outputs("FLAGS=a<<b\nVERSION=1.4.0\n");
        assert_eq!(outputs["FLAGS"], "a<<b");
        assert_eq!(outputs["VERSION"], "1.4.0");
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_parse_manifest_resolves_relative_paths() {
        let files = parse_manifest("target/a.dll\n\n/abs/b.dll\n", Path::new("/work"));
        assert_eq!(
            files,
            vec![PathBuf::from("/work/target/a.dll"), PathBuf::from("/abs/b.dll")]
        );
    }
}
