//! Process-manager descriptors: PM2 ecosystem files and systemd units.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which supervisor keeps an app running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProcessManager {
    #[default]
    #[serde(rename = "pm2")]
    Pm2,
    #[serde(rename = "systemd")]
    Systemd,
    /// PID-file supervisor under a writable temp directory.
    #[serde(rename = "readonly-simple")]
    PidFile,
}

impl ProcessManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessManager::Pm2 => "pm2",
            ProcessManager::Systemd => "systemd",
            ProcessManager::PidFile => "readonly-simple",
        }
    }
}

impl fmt::Display for ProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessManager {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pm2" => Ok(ProcessManager::Pm2),
            "systemd" => Ok(ProcessManager::Systemd),
            "readonly-simple" | "pidfile" => Ok(ProcessManager::PidFile),
            other => Err(format!("Unknown process manager: {}", other)),
        }
    }
}

// ── PM2 ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pm2Ecosystem {
    pub apps: Vec<Pm2App>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pm2App {
    pub name: String,
    pub cwd: String,
    pub script: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub args: String,
    pub instances: u32,
    pub exec_mode: String,
    pub autorestart: bool,
    pub watch: bool,
    pub max_memory_restart: String,
    pub log_date_format: String,
    pub error_file: String,
    pub out_file: String,
    pub log_file: String,
    pub env: BTreeMap<String, String>,
}

/// Inputs for a PM2 app entry.
#[derive(Debug, Clone)]
pub struct Pm2Params<'a> {
    pub name: &'a str,
    pub cwd: &'a Path,
    pub start_command: &'a str,
    pub port: u16,
    pub instances: u32,
    pub env: &'a BTreeMap<String, String>,
    pub log_dir: &'a Path,
}

impl Pm2Ecosystem {
    pub fn single(params: &Pm2Params<'_>) -> Self {
        let mut parts = params.start_command.split_whitespace();
        let script = parts.next().unwrap_or("npm").to_string();
        let args = parts.collect::<Vec<_>>().join(" ");

        let mut env = BTreeMap::new();
        env.insert("NODE_ENV".to_string(), "production".to_string());
        env.insert("PORT".to_string(), params.port.to_string());
        for (k, v) in params.env {
            env.insert(k.clone(), v.clone());
        }

        let instances = params.instances.max(1);
        let log = |suffix: &str| {
            params
                .log_dir
                .join(format!("{}{}", params.name, suffix))
                .display()
                .to_string()
        };

        Self {
            apps: vec![Pm2App {
                name: params.name.to_string(),
                cwd: params.cwd.display().to_string(),
                script,
                args,
                instances,
                exec_mode: if instances > 1 { "cluster" } else { "fork" }.to_string(),
                autorestart: true,
                watch: false,
                max_memory_restart: "1G".to_string(),
                log_date_format: "YYYY-MM-DD HH:mm Z".to_string(),
                error_file: log(".error.log"),
                out_file: log(".out.log"),
                log_file: log(".log"),
                env,
            }],
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Extract the privileged command `pm2 startup` asks the user to run.
///
/// pm2 prints a line like `sudo env PATH=$PATH:/usr/bin pm2 startup systemd -u deploy --hp /home/deploy`.
pub fn pm2_startup_command(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("sudo ") && line.contains("pm2"))
        .map(|line| line.trim_start_matches("sudo ").trim().to_string())
}

// ── systemd ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SystemdUnit {
    pub description: String,
    pub user: String,
    pub working_dir: PathBuf,
    pub environment: Vec<(String, String)>,
    pub exec_start: String,
    pub restart_sec: u32,
    pub syslog_identifier: String,
    pub timeout_start_secs: Option<u32>,
}

impl SystemdUnit {
    /// Unit for a Node.js app; the start command runs through `/bin/sh -c`.
    pub fn node_app(
        site: &str,
        working_dir: &Path,
        port: u16,
        start_command: &str,
        user: &str,
    ) -> Self {
        let npm_based = start_command.contains("npm") || start_command.contains("next");
        Self {
            description: format!("Node.js App - {}", site),
            user: user.to_string(),
            working_dir: working_dir.to_path_buf(),
            environment: vec![
                ("NODE_ENV".to_string(), "production".to_string()),
                ("PORT".to_string(), port.to_string()),
                (
                    "PATH".to_string(),
                    "/usr/bin:/bin:/usr/local/bin:/usr/local/sbin".to_string(),
                ),
            ],
            exec_start: format!("/bin/sh -c {}", systemd_quote(start_command)),
            restart_sec: if npm_based { 10 } else { 5 },
            syslog_identifier: format!("{}-app", site),
            timeout_start_secs: npm_based.then_some(300),
        }
    }

    /// Unit running the hosting control API.
    pub fn hosting_api(binary: &Path, working_dir: &Path, host: &str, port: u16) -> Self {
        Self {
            description: "launchpad hosting API".to_string(),
            user: "root".to_string(),
            working_dir: working_dir.to_path_buf(),
            environment: vec![
                ("PATH".to_string(), "/usr/bin:/bin:/usr/local/bin".to_string()),
                ("RUST_LOG".to_string(), "info".to_string()),
            ],
            exec_start: format!(
                "{} host api --host {} --port {}",
                binary.display(),
                host,
                port
            ),
            restart_sec: 3,
            syslog_identifier: "hosting-api".to_string(),
            timeout_start_secs: None,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Unit]\n");
        let _ = writeln!(out, "Description={}", self.description);
        out.push_str("After=network.target nginx.service\n");
        out.push_str("Wants=network-online.target\n\n");
        out.push_str("[Service]\nType=simple\n");
        let _ = writeln!(out, "User={}", self.user);
        let _ = writeln!(out, "Group={}", self.user);
        let _ = writeln!(out, "WorkingDirectory={}", self.working_dir.display());
        for (key, value) in &self.environment {
            let _ = writeln!(out, "Environment={}={}", key, value);
        }
        let _ = writeln!(out, "ExecStart={}", self.exec_start);
        out.push_str("ExecReload=/bin/kill -HUP $MAINPID\n");
        out.push_str("Restart=always\n");
        let _ = writeln!(out, "RestartSec={}", self.restart_sec);
        out.push_str("StartLimitBurst=5\nStartLimitInterval=60\n");
        out.push_str("StandardOutput=journal\nStandardError=journal\n");
        let _ = writeln!(out, "SyslogIdentifier={}", self.syslog_identifier);
        if let Some(secs) = self.timeout_start_secs {
            let _ = writeln!(out, "TimeoutStartSec={}", secs);
        }
        out.push_str("\n[Install]\nWantedBy=multi-user.target\n");
        out
    }
}

/// Quote an argument for a systemd `ExecStart=` line.
///
/// systemd expands `$` and `%` itself, so both are doubled to pass through.
pub fn systemd_quote(arg: &str) -> String {
    let escaped = arg
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%")
        .replace('$', "$$");
    format!("\"{}\"", escaped)
}
