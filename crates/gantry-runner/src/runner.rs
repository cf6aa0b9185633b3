//! Runner configuration and streamed output types.

use gantry_core::ids::JobKey;
use std::path::PathBuf;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub job: JobKey,
    pub step: String,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root of the checkout; logs and scratch files live under `.gantry/`.
    pub workspace: PathBuf,
    /// Interpreter invoked as `<shell> -c <script>`.
    pub shell: String,
    /// Hard cap applied on top of the job budget.
    pub timeout_seconds: Option<u64>,
}

impl RunnerConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Default::default()
        }
    }

    pub fn log_path(&self, job: &JobKey, step: &str) -> PathBuf {
        self.workspace
            .join(".gantry")
            .join("logs")
            .join(job.as_str())
            .join(format!("{step}.log"))
    }

    pub fn scratch_dir(&self, job: &JobKey, step: &str) -> PathBuf {
        self.workspace
            .join(".gantry")
            .join("scratch")
            .join(job.as_str())
            .join(step)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            shell: "sh".to_string(),
            timeout_seconds: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_layout() {
        let config = RunnerConfig::new("/work");
        assert_eq!(
            config.log_path(&JobKey::new("package_Debian11-amd64"), "package"),
            PathBuf::from("/work/.gantry/logs/package_Debian11-amd64/package.log")
        );
    }
}
