use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CommandOutput, CommandRunner, Privilege};
use crate::errors::TransportError;
use crate::util::shell_quote;

/// How to authenticate an SSH session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// Private key file passed with `-i`.
    Key(PathBuf),
    /// Password fed to `sshpass -e` through the `SSHPASS` environment variable.
    Password(String),
    /// Whatever the local ssh agent / config provides.
    Agent,
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub auth: SshAuth,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Runs commands on a remote host through the system OpenSSH client.
pub struct SshRunner {
    target: SshTarget,
}

impl SshRunner {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Open a session by running a no-op. Authentication failures are retried
    /// once before giving up.
    pub async fn connect(target: SshTarget) -> Result<Self, TransportError> {
        let runner = Self::new(target);
        let mut last_error = String::new();
        for attempt in 1..=2 {
            let out = runner.exec_ssh("true", None).await?;
            if out.success() {
                tracing::info!(host = %runner.describe(), "SSH connection established");
                return Ok(runner);
            }
            last_error = out.error_text();
            tracing::warn!(attempt, error = %last_error, "SSH connection attempt failed");
        }
        Err(TransportError::ConnectFailed {
            target: runner.describe(),
            message: last_error,
        })
    }

    fn is_root(&self) -> bool {
        self.target.user == "root"
    }

    fn program(&self, name: &str) -> Command {
        match &self.target.auth {
            SshAuth::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(name).env("SSHPASS", password);
                cmd
            }
            _ => Command::new(name),
        }
    }

    fn common_options(&self, cmd: &mut Command) {
        cmd.args([
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            "ConnectTimeout=15",
        ]);
        match &self.target.auth {
            SshAuth::Key(path) => {
                cmd.arg("-i").arg(path).args(["-o", "BatchMode=yes"]);
            }
            SshAuth::Password(_) => {
                cmd.args([
                    "-o",
                    "PreferredAuthentications=password",
                    "-o",
                    "PubkeyAuthentication=no",
                ]);
            }
            SshAuth::Agent => {
                cmd.args(["-o", "BatchMode=yes"]);
            }
        }
    }

    /// Run `remote_command` over ssh, optionally feeding `stdin`.
    async fn exec_ssh(
        &self,
        remote_command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, TransportError> {
        let mut cmd = self.program("ssh");
        self.common_options(&mut cmd);
        cmd.arg("-p")
            .arg(self.target.port.to_string())
            .arg(self.target.destination())
            .arg(remote_command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            program: "ssh".to_string(),
            source,
        })?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes).await?;
        }
        let output = child.wait_with_output().await?;
        Ok(CommandOutput::from_std(output))
    }

    /// Wrap a command for privilege elevation on the remote side.
    ///
    /// With password auth the password is piped to `sudo -S`; otherwise
    /// `sudo -n` is used and fails fast if a password would be needed.
    fn elevate(&self, command: &str, privilege: Privilege) -> (String, Option<Vec<u8>>) {
        if privilege == Privilege::User || self.is_root() {
            return (command.to_string(), None);
        }
        match &self.target.auth {
            SshAuth::Password(password) => (
                format!("sudo -S -p '' sh -c {}", shell_quote(command)),
                Some(format!("{}\n", password).into_bytes()),
            ),
            _ => (format!("sudo -n sh -c {}", shell_quote(command)), None),
        }
    }

    async fn scp(&self, args: &[&str], local: &Path, remote: &str) -> Result<(), TransportError> {
        let mut cmd = self.program("scp");
        self.common_options(&mut cmd);
        cmd.arg("-P")
            .arg(self.target.port.to_string())
            .args(args)
            .arg(local)
            .arg(format!("{}:{}", self.target.destination(), remote))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = cmd.output().await.map_err(|source| TransportError::Spawn {
            program: "scp".to_string(),
            source,
        })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::Transfer {
                path: remote.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn ensure_parent(&self, remote: &str) -> Result<(), TransportError> {
        if let Some(parent) = Path::new(remote).parent() {
            let parent = parent.to_string_lossy();
            if !parent.is_empty() {
                let out = self
                    .exec_ssh(&format!("mkdir -p {}", shell_quote(&parent)), None)
                    .await?;
                if !out.success() {
                    return Err(TransportError::Transfer {
                        path: remote.to_string(),
                        message: out.error_text(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    fn describe(&self) -> String {
        format!("{}:{}", self.target.destination(), self.target.port)
    }

    async fn run(
        &self,
        command: &str,
        privilege: Privilege,
    ) -> Result<CommandOutput, TransportError> {
        tracing::debug!(host = %self.describe(), command, ?privilege, "running remote command");
        let (remote, stdin) = self.elevate(command, privilege);
        let out = self.exec_ssh(&remote, stdin.as_deref()).await?;
        if out.exit_code == 255 && looks_like_connection_failure(&out.stderr) {
            return Err(TransportError::ConnectFailed {
                target: self.describe(),
                message: out.error_text(),
            });
        }
        Ok(out)
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        privilege: Privilege,
    ) -> Result<(), TransportError> {
        let needs_sudo = privilege == Privilege::Sudo && !self.is_root();
        let staging = if needs_sudo {
            format!("/tmp/launchpad-{}-{}", crate::util::timestamp_suffix(), std::process::id())
        } else {
            path.to_string()
        };

        self.ensure_parent(&staging).await?;
        let out = self
            .exec_ssh(&format!("cat > {}", shell_quote(&staging)), Some(contents))
            .await?;
        if !out.success() {
            return Err(TransportError::Transfer {
                path: path.to_string(),
                message: out.error_text(),
            });
        }

        if needs_sudo {
            let parent = Path::new(path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string());
            let out = self
                .run(
                    &format!(
                        "mkdir -p {} && mv {} {}",
                        shell_quote(&parent),
                        shell_quote(&staging),
                        shell_quote(path)
                    ),
                    Privilege::Sudo,
                )
                .await?;
            if !out.success() {
                return Err(TransportError::Transfer {
                    path: path.to_string(),
                    message: out.error_text(),
                });
            }
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.ensure_parent(remote).await?;
        self.scp(&[], local, remote).await
    }

    async fn upload_dir(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let out = self
            .exec_ssh(&format!("mkdir -p {}", shell_quote(remote)), None)
            .await?;
        if !out.success() {
            return Err(TransportError::Transfer {
                path: remote.to_string(),
                message: out.error_text(),
            });
        }
        // "dir/." copies the contents rather than nesting the directory.
        let source = local.join(".");
        self.scp(&["-r"], &source, remote).await
    }
}

fn looks_like_connection_failure(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    [
        "permission denied",
        "connection refused",
        "connection timed out",
        "could not resolve hostname",
        "no route to host",
        "host key verification failed",
        "connection closed",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
}
