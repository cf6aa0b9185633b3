//! Change detection over version-control change-sets.

use gantry_core::pipeline::ChangeDetectorConfig;
use gantry_core::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Paths changed by the revision under build, relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSet {
    Paths(Vec<String>),
    /// History was not available (shallow or detached clone).
    Unknown,
}

impl ChangeSet {
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ChangeSet::Paths(paths.into_iter().map(Into::into).collect())
    }

    /// Parse `git diff --name-only` style output: one path per line.
    pub fn from_lines(text: &str) -> Self {
        ChangeSet::from_paths(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| line.trim_start_matches("./")),
        )
    }

    /// Detection is inconclusive when there is nothing to look at.
    pub fn is_conclusive(&self) -> bool {
        matches!(self, ChangeSet::Paths(paths) if !paths.is_empty())
    }
}

/// Decides whether a change-set touches the paths a class of work cares about.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    output: String,
    patterns: Vec<Regex>,
    invert: bool,
}

impl ChangeDetector {
    pub fn new(config: &ChangeDetectorConfig) -> Result<Self> {
        let patterns = config
            .patterns
            .iter()
            .map(|pattern| {
                Regex::new(&format!("^(?:{pattern})(?:/|$)")).map_err(|e| {
                    Error::InvalidPipeline(format!(
                        "invalid change pattern '{pattern}' for output '{}': {e}",
                        config.output
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            output: config.output.clone(),
            patterns,
            invert: config.invert,
        })
    }

    /// Detector that reports changes outside `patterns`.
    pub fn excluding(output: &str, patterns: &[&str]) -> Result<Self> {
        Self::new(&ChangeDetectorConfig {
            output: output.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            invert: false,
        })
    }

    /// Detector that reports changes inside `patterns`.
    pub fn including(output: &str, patterns: &[&str]) -> Result<Self> {
        Self::new(&ChangeDetectorConfig {
            output: output.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            invert: true,
        })
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    fn matches(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        self.patterns.iter().any(|re| re.is_match(path))
    }

    /// Whether the change-set contains relevant changes.
    ///
    /// An inconclusive change-set always yields `true`: expensive work is
    /// skipped only when it is proven unnecessary.
    pub fn relevant(&self, changes: &ChangeSet) -> bool {
        let ChangeSet::Paths(paths) = changes else {
            debug!(output = %self.output, "Change-set unknown, assuming relevant changes");
            return true;
        };
        if paths.is_empty() {
            debug!(output = %self.output, "Change-set empty, assuming relevant changes");
            return true;
        }

        let relevant = if self.invert {
            paths.iter().any(|p| self.matches(p))
        } else {
            paths.iter().any(|p| !self.matches(p))
        };

        debug!(
            output = %self.output,
            invert = self.invert,
            paths = paths.len(),
            relevant,
            "Change detection completed"
        );
        relevant
    }
}
