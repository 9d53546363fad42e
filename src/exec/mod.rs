//! Command execution seam.
//!
//! Everything launchpad does to a host goes through [`CommandRunner`]: shell
//! commands, file writes and uploads. [`LocalRunner`] targets the current
//! machine, [`SshRunner`] a remote one through the system `ssh`/`scp` clients.
//!
//! Non-zero exit codes are returned as data in [`CommandOutput`]; only a
//! failure to run the command at all is a [`TransportError`].

pub mod local;
pub mod ssh;

#[cfg(test)]
pub mod fake;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::TransportError;

pub use local::{LocalRunner, ProgramSpec, copy_tree, run_program};
pub use ssh::{SshAuth, SshRunner, SshTarget};

/// Whether a command needs elevated privileges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Sudo,
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout, convenient for single-value probes like `whoami`.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// The most useful error text: stderr if present, otherwise stdout.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    pub(crate) fn from_std(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// A target host that can run shell commands and receive files.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Human-readable target, e.g. `localhost` or `deploy@example.com:22`.
    fn describe(&self) -> String;

    /// Run a `sh -c` command line on the target.
    async fn run(&self, command: &str, privilege: Privilege)
    -> Result<CommandOutput, TransportError>;

    /// Run a command, failing with [`TransportError::Timeout`] after `limit`.
    async fn run_with_timeout(
        &self,
        command: &str,
        privilege: Privilege,
        limit: Duration,
    ) -> Result<CommandOutput, TransportError> {
        match tokio::time::timeout(limit, self.run(command, privilege)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                command: command.to_string(),
                secs: limit.as_secs(),
            }),
        }
    }

    /// Write `contents` to `path` on the target, creating parent directories.
    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        privilege: Privilege,
    ) -> Result<(), TransportError>;

    /// Copy a single local file to `remote`.
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Copy a local directory tree so that its contents land in `remote`.
    async fn upload_dir(&self, local: &Path, remote: &str) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput {
            exit_code: 0,
            stdout: "root\n".to_string(),
            stderr: String::new(),
        };
        assert!(ok.success());
        assert_eq!(ok.stdout_trimmed(), "root");

        let failed = CommandOutput {
            exit_code: 2,
            stdout: "partial".to_string(),
            stderr: "  boom \n".to_string(),
        };
        assert!(!failed.success());
        assert_eq!(failed.error_text(), "boom");
    }

    #[test]
    fn test_error_text_falls_back_to_stdout() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "nginx: configuration file test failed\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(out.error_text(), "nginx: configuration file test failed");
    }

    #[tokio::test]
    async fn test_run_with_timeout_expires() {
        let runner = LocalRunner::new();
        let err = runner
            .run_with_timeout("sleep 5", Privilege::User, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }
}
