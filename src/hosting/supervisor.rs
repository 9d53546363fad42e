//! PID-file process supervision.
//!
//! Used when systemd units cannot be written. Everything lives under
//! `{apps_dir}/{site}/`: the PID file, the captured output log and the
//! deployment record. State is derived from the PID file and a signal-0
//! liveness probe, never cached in memory.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::process::Command;

use crate::util::shell_quote;

/// Observed state of a supervised app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AppState {
    /// No PID file.
    NotStarted,
    /// PID file present and the process answers signal 0.
    Running { pid: i32 },
    /// PID file present but the process is gone. The file is removed when
    /// this state is observed.
    Stale { pid: i32 },
}

impl AppState {
    pub fn is_running(&self) -> bool {
        matches!(self, AppState::Running { .. })
    }
}

/// Supervises one site's process through a PID file.
#[derive(Debug, Clone)]
pub struct PidSupervisor {
    site: String,
    dir: PathBuf,
}

impl PidSupervisor {
    pub fn new(apps_dir: &Path, site: &str) -> Self {
        Self {
            site: site.to_string(),
            dir: apps_dir.join(site),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(format!("{}.pid", self.site))
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.site))
    }

    fn read_pid(&self) -> Option<i32> {
        std::fs::read_to_string(self.pid_file())
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .filter(|pid| *pid > 1)
    }

    pub fn status(&self) -> AppState {
        let pid_file = self.pid_file();
        if !pid_file.exists() {
            return AppState::NotStarted;
        }
        match self.read_pid() {
            Some(pid) if process_alive(pid) => AppState::Running { pid },
            other => {
                let _ = std::fs::remove_file(&pid_file);
                AppState::Stale {
                    pid: other.unwrap_or(0),
                }
            }
        }
    }

    /// Start `command` in `cwd`, stopping any running instance first.
    ///
    /// The process is backgrounded by a throwaway shell so it is re-parented
    /// away from this process and survives it. With `setsid` available it also
    /// leads its own process group, so `stop` reaches its children too.
    pub async fn start(&self, command: &str, cwd: &Path, port: u16) -> Result<i32> {
        self.stop()?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let log = self.log_file();
        std::fs::write(
            &log,
            format!("Starting {} at {}\n", self.site, chrono::Local::now().to_rfc3339()),
        )
        .with_context(|| format!("Failed to write {}", log.display()))?;

        let inner = format!(
            "sh -c {} >> {} 2>&1 < /dev/null &",
            shell_quote(command),
            shell_quote(&log.to_string_lossy())
        );
        let launcher = format!(
            "if command -v setsid >/dev/null 2>&1; then setsid {inner} else nohup {inner} fi; echo $!"
        );
        let output = Command::new("sh")
            .arg("-c")
            .arg(&launcher)
            .current_dir(cwd)
            .env("NODE_ENV", "production")
            .env("PORT", port.to_string())
            .env(
                "PATH",
                std::env::var("PATH")
                    .unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
            )
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to spawn app process")?;

        let pid: i32 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .with_context(|| {
                format!(
                    "Launcher did not report a PID: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )
            })?;
        if pid <= 1 {
            bail!("Launcher reported an invalid PID: {}", pid);
        }

        std::fs::write(self.pid_file(), pid.to_string())
            .with_context(|| format!("Failed to write {}", self.pid_file().display()))?;
        tracing::info!(site = %self.site, pid, "app started");
        Ok(pid)
    }

    /// Stop the app. Returns `Ok(false)` when nothing was running.
    pub fn stop(&self) -> Result<bool> {
        match self.status() {
            AppState::Running { pid } => {
                // SAFETY: kill has no memory-safety preconditions. pid > 1 is
                // guaranteed by read_pid, so -pid names exactly the group the
                // app leads (ESRCH when it does not lead one).
                let mut rc = unsafe { libc::kill(-pid, libc::SIGTERM) };
                if rc != 0 {
                    // SAFETY: as above, signalling the single process.
                    rc = unsafe { libc::kill(pid, libc::SIGTERM) };
                }
                if rc != 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ESRCH) {
                        return Err(err).context(format!("Failed to signal process {}", pid));
                    }
                }
                let _ = std::fs::remove_file(self.pid_file());
                tracing::info!(site = %self.site, pid, "app stopped");
                Ok(true)
            }
            AppState::NotStarted | AppState::Stale { .. } => Ok(false),
        }
    }

    /// The last `lines` lines of captured output.
    pub fn logs(&self, lines: usize) -> Result<String> {
        let log = self.log_file();
        if !log.exists() {
            return Ok(String::new());
        }
        let text = std::fs::read_to_string(&log)
            .with_context(|| format!("Failed to read {}", log.display()))?;
        Ok(crate::util::tail_lines(&text, lines))
    }
}

/// Signal-0 liveness probe.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 1 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
