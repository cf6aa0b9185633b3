//! Resolving the change-set for a run.

use crate::commands::ChangeArgs;
use anyhow::Context;
use gantry_scheduler::ChangeSet;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

/// Build the change-set from command-line arguments.
///
/// Explicit paths win over a changes file, which wins over a git diff.
/// With no source at all the change-set is unknown.
pub async fn resolve(args: &ChangeArgs, repo: &Path) -> anyhow::Result<ChangeSet> {
    if !args.paths.is_empty() {
        return Ok(ChangeSet::from_paths(args.paths.iter().cloned()));
    }
    if let Some(file) = &args.changes_file {
        let text = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("reading changes file {}", file.display()))?;
        return Ok(ChangeSet::from_lines(&text));
    }
    if let Some(base) = &args.base {
        return Ok(git_diff(base, repo).await);
    }
    Ok(ChangeSet::Unknown)
}

/// `git diff --name-only <base>...HEAD`; any failure yields `Unknown`.
pub async fn git_diff(base: &str, repo: &Path) -> ChangeSet {
    let output = Command::new("git")
        .arg("diff")
        .arg("--name-only")
        .arg(format!("{base}...HEAD"))
        .current_dir(repo)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            let changes = ChangeSet::from_lines(&String::from_utf8_lossy(&output.stdout));
            debug!(base, ?changes, "Resolved change-set from git");
            changes
        }
        Ok(output) => {
            warn!(
                base,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git diff failed, treating changes as unknown"
            );
            ChangeSet::Unknown
        }
        Err(e) => {
            warn!(base, error = %e, "Could not run git, treating changes as unknown");
            ChangeSet::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_explicit_paths_win() {
        let args = ChangeArgs {
            changes_file: Some(PathBuf::from("/does/not/exist")),
            base: None,
            paths: vec!["edgelet/src/main.rs".to_string()],
        };
        let changes = resolve(&args, Path::new(".")).await.unwrap();
        assert_eq!(changes, ChangeSet::from_paths(["edgelet/src/main.rs"]));
    }

    #[tokio::test]
    async fn test_changes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("changes.txt");
        std::fs::write(&file, "edgelet/src/main.rs\n\n./doc/README.md\n").unwrap();

        let args = ChangeArgs {
            changes_file: Some(file),
            ..Default::default()
        };
        let changes = resolve(&args, dir.path()).await.unwrap();
        assert_eq!(
            changes,
            ChangeSet::from_paths(["edgelet/src/main.rs", "doc/README.md"])
        );
    }

    #[tokio::test]
    async fn test_missing_changes_file_is_an_error() {
        let args = ChangeArgs {
            changes_file: Some(PathBuf::from("/does/not/exist")),
            ..Default::default()
        };
        assert!(resolve(&args, Path::new(".")).await.is_err());
    }

    #[tokio::test]
    async fn test_no_source_is_unknown() {
        let changes = resolve(&ChangeArgs::default(), Path::new(".")).await.unwrap();
        assert_eq!(changes, ChangeSet::Unknown);
    }

    #[tokio::test]
    async fn test_git_failure_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let changes = git_diff("origin/main", dir.path()).await;
        assert_eq!(changes, ChangeSet::Unknown);
    }
}
