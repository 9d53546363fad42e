use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use walkdir::WalkDir;

use super::{CommandOutput, CommandRunner, Privilege};
use crate::errors::TransportError;

/// Runs commands on the current host.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    is_root: bool,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRunner {
    pub fn new() -> Self {
        Self {
            is_root: current_uid_is_root(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    fn needs_sudo(&self, privilege: Privilege) -> bool {
        privilege == Privilege::Sudo && !self.is_root
    }
}

/// Whether the current process runs with effective uid 0.
pub fn current_uid_is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    fn describe(&self) -> String {
        "localhost".to_string()
    }

    async fn run(
        &self,
        command: &str,
        privilege: Privilege,
    ) -> Result<CommandOutput, TransportError> {
        tracing::debug!(command, ?privilege, "running local command");
        let mut cmd = if self.needs_sudo(privilege) {
            let mut c = Command::new("sudo");
            c.args(["-n", "sh", "-c", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };
        let output = cmd
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                program: "sh".to_string(),
                source,
            })?;
        Ok(CommandOutput::from_std(output))
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        privilege: Privilege,
    ) -> Result<(), TransportError> {
        if self.needs_sudo(privilege) {
            let parent = Path::new(path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string());
            let command = format!(
                "mkdir -p {} && tee {} >/dev/null",
                crate::util::shell_quote(&parent),
                crate::util::shell_quote(path)
            );
            let mut child = Command::new("sudo")
                .args(["-n", "sh", "-c", &command])
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|source| TransportError::Spawn {
                    program: "sudo".to_string(),
                    source,
                })?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(contents).await?;
            }
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(TransportError::Transfer {
                    path: path.to_string(),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            return Ok(());
        }

        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        if let Some(parent) = Path::new(remote).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, remote)
            .await
            .map_err(|e| TransportError::Transfer {
                path: remote.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn upload_dir(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let src = local.to_path_buf();
        let dest = PathBuf::from(remote);
        tokio::task::spawn_blocking(move || copy_tree(&src, &dest, UPLOAD_SKIP))
            .await
            .map_err(|e| TransportError::Transfer {
                path: remote.to_string(),
                message: e.to_string(),
            })?
    }
}

/// Directory names never shipped by `upload_dir`.
pub const UPLOAD_SKIP: &[&str] = &["node_modules", ".git"];

/// Recursively copy `src` into `dest`, skipping directories named in `skip`.
pub fn copy_tree(src: &Path, dest: &Path, skip: &[&str]) -> Result<(), TransportError> {
    std::fs::create_dir_all(dest)?;
    let walker = WalkDir::new(src).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        entry.depth() == 0 || !skip.iter().any(|s| *s == name)
    });
    for entry in walker {
        let entry = entry.map_err(|e| TransportError::Transfer {
            path: dest.display().to_string(),
            message: e.to_string(),
        })?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// A program invocation with its own working directory and environment.
///
/// Used for local steps like `npm install` that need isolated caches and a
/// time limit, where a bare `sh -c` string is not enough.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub command: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl ProgramSpec {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

/// Run a [`ProgramSpec`] through `sh -c` on the local host.
pub async fn run_program(spec: &ProgramSpec) -> Result<CommandOutput, TransportError> {
    tracing::debug!(command = %spec.command, cwd = %spec.cwd.display(), "running program");
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&spec.command)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    let child = cmd.spawn().map_err(|source| TransportError::Spawn {
        program: "sh".to_string(),
        source,
    })?;

    let output = match spec.timeout {
        Some(limit) => match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::Timeout {
                    command: spec.command.clone(),
                    secs: limit.as_secs(),
                });
            }
        },
        None => child.wait_with_output().await?,
    };
    Ok(CommandOutput::from_std(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let runner = LocalRunner::new();
        let out = runner
            .run("echo hello; echo oops >&2; exit 3", Privilege::User)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout_trimmed(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_write_file_creates_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/site.conf");
        let runner = LocalRunner::new();
        runner
            .write_file(path.to_str().unwrap(), b"server {}", Privilege::User)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "server {}");
    }

    #[tokio::test]
    async fn test_upload_dir_skips_node_modules() {
        let src = tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("pages")).unwrap();
        std::fs::create_dir_all(src.path().join("node_modules/react")).unwrap();
        std::fs::write(src.path().join("package.json"), "{}").unwrap();
        std::fs::write(src.path().join("pages/index.js"), "export default 1").unwrap();
        std::fs::write(src.path().join("node_modules/react/index.js"), "x").unwrap();

        let dest = tempdir().unwrap();
        let target = dest.path().join("app");
        let runner = LocalRunner::new();
        runner
            .upload_dir(src.path(), target.to_str().unwrap())
            .await
            .unwrap();

        assert!(target.join("package.json").exists());
        assert!(target.join("pages/index.js").exists());
        assert!(!target.join("node_modules").exists());
    }

    #[tokio::test]
    async fn test_run_program_env_and_cwd() {
        let dir = tempdir().unwrap();
        let spec = ProgramSpec::new("pwd; echo $GREETING", dir.path()).env("GREETING", "hi");
        let out = run_program(&spec).await.unwrap();
        assert!(out.success());
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(
            std::fs::canonicalize(lines[0]).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(lines[1], "hi");
    }

    #[tokio::test]
    async fn test_run_program_timeout() {
        let dir = tempdir().unwrap();
        let spec = ProgramSpec::new("sleep 5", dir.path()).timeout(Duration::from_millis(100));
        let err = run_program(&spec).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { secs: 0, .. }));
    }
}
