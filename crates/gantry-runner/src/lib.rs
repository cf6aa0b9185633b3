//! Step execution for Gantry.
//!
//! [`ShellCollaborator`] implements the build collaborator port by running
//! step scripts with `sh -c` on the host.

pub mod runner;
pub mod shell;

pub use runner::{OutputLine, OutputStream, RunnerConfig};
pub use shell::ShellCollaborator;
