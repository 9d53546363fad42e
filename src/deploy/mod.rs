//! Remote project deployment.
//!
//! [`ProjectDeployer`] ships a Next.js project to a server prepared by
//! `provision`: back up the previous release, upload, write `.env`, install,
//! build, configure nginx, start under PM2 or systemd and request a
//! certificate. A failure after the backup restores it.
//!
//! | Module | Role |
//! |--------|------|
//! | `site` | write, link, validate and reload nginx sites |

pub mod site;

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::ProjectProfile;
use crate::errors::DeployError;
use crate::exec::{CommandOutput, CommandRunner, Privilege};
use crate::render::{
    NginxSite, Pm2Ecosystem, Pm2Params, ProcessManager, SiteKind, SystemdUnit, TlsCert,
    render_env_file,
};
use crate::render::process::pm2_startup_command;
use crate::util::{shell_quote, timestamp_suffix, truncate};

use site::{NginxLayout, SiteApplier};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// certbot invocation through the nginx plugin, redirecting HTTP to HTTPS.
pub fn certbot_command(names: &[String], email: &str) -> String {
    let domains: Vec<String> = names.iter().map(|n| format!("-d {}", shell_quote(n))).collect();
    format!(
        "certbot --nginx {} --non-interactive --agree-tos --email {} --redirect",
        domains.join(" "),
        shell_quote(email)
    )
}

// ── Report ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub time: String,
    pub level: LogLevel,
    pub message: String,
}

/// Summary of one deployment, printed or emitted as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub success: bool,
    pub project: String,
    pub url: Option<String>,
    pub duration_secs: f64,
    pub log: Vec<LogLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    pub rolled_back: bool,
}

#[derive(Debug, Default)]
struct Journal {
    lines: Vec<LogLine>,
}

impl Journal {
    fn push(&mut self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        self.lines.push(LogLine {
            time: chrono::Local::now().format("%H:%M:%S").to_string(),
            level,
            message,
        });
    }

    fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into());
    }

    fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }
}

// ── Deployer ─────────────────────────────────────────────────────────

pub struct ProjectDeployer<'a> {
    runner: &'a dyn CommandRunner,
    owner: String,
    layout: NginxLayout,
    systemd_dir: String,
}

impl<'a> ProjectDeployer<'a> {
    /// `owner` receives ownership of the app directory and runs the app.
    pub fn new(runner: &'a dyn CommandRunner, owner: &str) -> Self {
        Self {
            runner,
            owner: owner.to_string(),
            layout: NginxLayout::default(),
            systemd_dir: "/etc/systemd/system".to_string(),
        }
    }

    /// Deploy `source` (a directory or a `.zip`) as `project`.
    ///
    /// Never returns an error: failures land in the report, which also says
    /// whether the previous release was restored.
    pub async fn deploy(&self, project: &ProjectProfile, source: &Path) -> DeployReport {
        let started = Instant::now();
        let mut journal = Journal::default();
        let name = project.name();
        journal.info(format!(
            "Deploying {} to {} on {}",
            name,
            project.app_dir(),
            self.runner.describe()
        ));

        let mut backup = None;
        let result = match self.prepare(project, source, &mut journal).await {
            Ok(b) => {
                backup = b;
                self.run_steps(project, source, &mut journal).await
            }
            Err(e) => Err(e),
        };

        let mut rolled_back = false;
        let (url, error) = match result {
            Ok(url) => {
                journal.info(format!("Deployment complete: {}", url));
                (Some(url), None)
            }
            Err(e) => {
                journal.error(format!("Deployment failed: {}", e));
                if let Some(backup) = &backup {
                    rolled_back = self.rollback(project, backup, &mut journal).await;
                }
                (None, Some(e.to_string()))
            }
        };

        DeployReport {
            success: error.is_none(),
            project: name,
            url,
            duration_secs: started.elapsed().as_secs_f64(),
            log: journal.lines,
            error,
            backup,
            rolled_back,
        }
    }

    /// Validate inputs and move any existing release aside.
    async fn prepare(
        &self,
        project: &ProjectProfile,
        source: &Path,
        journal: &mut Journal,
    ) -> Result<Option<String>, DeployError> {
        project.validate()?;
        if !source.exists() {
            return Err(DeployError::SourceMissing(source.to_path_buf()));
        }
        let app_dir = project.app_dir();
        let exists = self
            .runner
            .run(&format!("test -d {}", shell_quote(&app_dir)), Privilege::Sudo)
            .await?
            .success();
        if !exists {
            return Ok(None);
        }
        let backup = format!("{}.backup-{}", app_dir, timestamp_suffix());
        self.must(
            "backup",
            &format!("mv {} {}", shell_quote(&app_dir), shell_quote(&backup)),
            Privilege::Sudo,
            None,
        )
        .await?;
        journal.info(format!("Backed up previous release to {}", backup));
        Ok(Some(backup))
    }

    async fn run_steps(
        &self,
        project: &ProjectProfile,
        source: &Path,
        journal: &mut Journal,
    ) -> Result<String, DeployError> {
        let app_dir = project.app_dir();
        let dir = shell_quote(&app_dir);
        let owner = shell_quote(&format!("{0}:{0}", self.owner));

        self.must(
            "create app directory",
            &format!("mkdir -p {dir} && chown -R {owner} {dir}"),
            Privilege::Sudo,
            None,
        )
        .await?;

        self.upload(project, source, journal).await?;
        self.must("chown", &format!("chown -R {owner} {dir}"), Privilege::Sudo, None)
            .await?;

        if !project.env_vars.is_empty() {
            let env_path = format!("{}/{}", app_dir, project.env_file_name);
            self.runner
                .write_file(&env_path, render_env_file(&project.env_vars).as_bytes(), Privilege::User)
                .await?;
            journal.info(format!(
                "Wrote {} variables to {}",
                project.env_vars.len(),
                env_path
            ));
        }

        let has_package = self
            .runner
            .run(&format!("test -f {dir}/package.json"), Privilege::User)
            .await?
            .success();
        if !has_package {
            return Err(DeployError::MissingPackageJson(app_dir));
        }

        journal.info("Installing dependencies");
        self.must(
            "npm install",
            &format!("cd {dir} && npm install --no-audit --no-fund"),
            Privilege::User,
            Some(INSTALL_TIMEOUT),
        )
        .await?;

        if !project.build_command.trim().is_empty() {
            journal.info(format!("Building: {}", project.build_command));
            self.must(
                "build",
                &format!("cd {dir} && {}", project.build_command),
                Privilege::User,
                Some(BUILD_TIMEOUT),
            )
            .await?;
        }

        self.configure_nginx(project, journal).await?;

        match project.process_manager {
            ProcessManager::Systemd => self.start_systemd(project, journal).await?,
            _ => self.start_pm2(project, journal).await?,
        }

        let mut scheme = "http";
        if project.ssl_enabled {
            let command = certbot_command(&project.server_names(), &project.certbot_email());
            let out = self.runner.run(&command, Privilege::Sudo).await?;
            if out.success() {
                journal.info("SSL certificate installed");
                scheme = "https";
            } else {
                journal.warn(format!(
                    "SSL setup failed (site stays on HTTP): {}",
                    truncate(&out.error_text(), 300)
                ));
            }
        }

        Ok(format!("{}://{}", scheme, project.fqdn()))
    }

    async fn upload(
        &self,
        project: &ProjectProfile,
        source: &Path,
        journal: &mut Journal,
    ) -> Result<(), DeployError> {
        let app_dir = project.app_dir();
        let is_zip = source
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if !is_zip {
            journal.info(format!("Uploading {}", source.display()));
            self.runner.upload_dir(source, &app_dir).await?;
            return Ok(());
        }

        let remote_zip = format!("/tmp/{}-{}.zip", project.name(), timestamp_suffix());
        journal.info(format!("Uploading archive {}", source.display()));
        self.runner.upload_file(source, &remote_zip).await?;
        let dir = shell_quote(&app_dir);
        let zip = shell_quote(&remote_zip);
        self.must(
            "unzip",
            &format!("cd {dir} && unzip -oq {zip} && rm -f {zip}"),
            Privilege::Sudo,
            None,
        )
        .await?;
        // Archives made by zipping a folder put everything one level down.
        self.must(
            "flatten archive",
            &format!(
                "cd {dir} && if [ ! -f package.json ]; then \
                 sub=$(find . -mindepth 2 -maxdepth 2 -name package.json | head -n 1); \
                 if [ -n \"$sub\" ]; then sub=$(dirname \"$sub\"); cp -a \"$sub\"/. . && rm -rf \"$sub\"; fi; fi"
            ),
            Privilege::Sudo,
            None,
        )
        .await?;
        Ok(())
    }

    async fn configure_nginx(
        &self,
        project: &ProjectProfile,
        journal: &mut Journal,
    ) -> Result<(), DeployError> {
        let fqdn = project.fqdn();
        let cert = TlsCert::letsencrypt(&fqdn);
        let has_cert = self
            .runner
            .run(
                &format!("test -f {}", shell_quote(&cert.certificate.to_string_lossy())),
                Privilege::Sudo,
            )
            .await?
            .success();
        let site = NginxSite::new(
            project.server_names(),
            SiteKind::NextJs {
                port: project.port,
                app_dir: project.app_dir().into(),
            },
        )
        .with_tls(has_cert.then_some(cert));

        let applied = SiteApplier::new(self.runner, self.layout.clone())
            .apply(&project.name(), &site.render())
            .await?;
        if applied.reloaded {
            journal.info(format!("Nginx configured ({})", applied.config_path));
        } else {
            journal.warn("Nginx config is valid but nginx could not be reloaded");
        }
        Ok(())
    }

    async fn start_pm2(&self, project: &ProjectProfile, journal: &mut Journal) -> Result<(), DeployError> {
        let name = project.name();
        let app_dir = project.app_dir();
        let log_dir = format!("{}/logs", app_dir);
        let ecosystem = Pm2Ecosystem::single(&Pm2Params {
            name: &name,
            cwd: Path::new(&app_dir),
            start_command: &project.start_command,
            port: project.port,
            instances: project.pm2_instances,
            env: &project.env_vars,
            log_dir: Path::new(&log_dir),
        });
        let json = ecosystem
            .to_json()
            .map_err(|e| DeployError::Other(anyhow::anyhow!("Failed to render PM2 config: {}", e)))?;
        let eco_path = format!("{}/ecosystem.config.json", app_dir);
        self.runner
            .write_file(&eco_path, json.as_bytes(), Privilege::User)
            .await?;

        let quoted = shell_quote(&name);
        self.must("create log dir", &format!("mkdir -p {}", shell_quote(&log_dir)), Privilege::User, None)
            .await?;
        self.runner
            .run(&format!("pm2 delete {quoted} || true"), Privilege::User)
            .await?;
        self.must("pm2 start", &format!("pm2 start {}", shell_quote(&eco_path)), Privilege::User, None)
            .await?;
        self.must("pm2 save", "pm2 save", Privilege::User, None).await?;
        journal.info(format!("Started {} with PM2", name));

        let startup = self.runner.run("pm2 startup", Privilege::User).await?;
        if let Some(follow_up) = pm2_startup_command(&startup.stdout) {
            let out = self.runner.run(&follow_up, Privilege::Sudo).await?;
            if !out.success() {
                journal.warn(format!("pm2 startup registration failed: {}", out.error_text()));
            }
        }
        Ok(())
    }

    async fn start_systemd(&self, project: &ProjectProfile, journal: &mut Journal) -> Result<(), DeployError> {
        let name = project.name();
        let unit = SystemdUnit::node_app(
            &name,
            Path::new(&project.app_dir()),
            project.port,
            &project.start_command,
            &self.owner,
        );
        let path = format!("{}/{}.service", self.systemd_dir, name);
        self.runner
            .write_file(&path, unit.render().as_bytes(), Privilege::Sudo)
            .await?;
        let quoted = shell_quote(&name);
        self.must(
            "systemd start",
            &format!("systemctl daemon-reload && systemctl enable {quoted} && systemctl restart {quoted}"),
            Privilege::Sudo,
            None,
        )
        .await?;
        journal.info(format!("Started {} with systemd", name));
        Ok(())
    }

    /// Put the backup back in place and restart the previous release.
    async fn rollback(&self, project: &ProjectProfile, backup: &str, journal: &mut Journal) -> bool {
        let dir = shell_quote(&project.app_dir());
        let command = format!("rm -rf {dir} && mv {} {dir}", shell_quote(backup));
        match self.runner.run(&command, Privilege::Sudo).await {
            Ok(out) if out.success() => {}
            Ok(out) => {
                journal.error(format!("Rollback failed: {}", out.error_text()));
                return false;
            }
            Err(e) => {
                journal.error(format!("Rollback failed: {}", e));
                return false;
            }
        }
        let name = shell_quote(&project.name());
        let restart = match project.process_manager {
            ProcessManager::Systemd => format!("systemctl restart {name}"),
            _ => format!("pm2 restart {name} || (cd {dir} && pm2 start ecosystem.config.json)"),
        };
        let privilege = if project.process_manager == ProcessManager::Systemd {
            Privilege::Sudo
        } else {
            Privilege::User
        };
        if let Ok(out) = self.runner.run(&restart, privilege).await {
            if !out.success() {
                journal.warn(format!("Previous release restored but not restarted: {}", out.error_text()));
            }
        }
        journal.warn(format!("Rolled back to {}", backup));
        true
    }

    /// Run a step that must succeed.
    async fn must(
        &self,
        step: &str,
        command: &str,
        privilege: Privilege,
        limit: Option<Duration>,
    ) -> Result<CommandOutput, DeployError> {
        let out = match limit {
            Some(limit) => self.runner.run_with_timeout(command, privilege, limit).await?,
            None => self.runner.run(command, privilege).await?,
        };
        if !out.success() {
            return Err(DeployError::StepFailed {
                step: step.to_string(),
                exit_code: out.exit_code,
                stderr: truncate(&out.error_text(), 500),
            });
        }
        Ok(out)
    }
}

// ── Inspection ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pm2Process {
    pub name: String,
    pub status: String,
    pub pid: Option<i64>,
    pub restarts: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentListing {
    pub processes: Vec<Pm2Process>,
    pub directories: Vec<String>,
}

/// Parse `pm2 jlist` output. Unparseable output yields an empty list.
pub fn parse_pm2_jlist(json: &str) -> Vec<Pm2Process> {
    let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(json) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| Pm2Process {
            name: item["name"].as_str().unwrap_or_default().to_string(),
            status: item["pm2_env"]["status"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
            pid: item["pid"].as_i64().filter(|p| *p > 0),
            restarts: item["pm2_env"]["restart_time"].as_u64().unwrap_or(0),
            memory_bytes: item["monit"]["memory"].as_u64().unwrap_or(0),
        })
        .collect()
}

/// PM2 processes and deployed directories under `deploy_path`.
pub async fn list_deployments(
    runner: &dyn CommandRunner,
    deploy_path: &str,
) -> Result<DeploymentListing, DeployError> {
    let pm2 = runner.run("pm2 jlist", Privilege::User).await?;
    let processes = if pm2.success() {
        parse_pm2_jlist(&pm2.stdout)
    } else {
        tracing::warn!(error = %pm2.error_text(), "pm2 jlist failed");
        Vec::new()
    };
    let ls = runner
        .run(&format!("ls -1 {}", shell_quote(deploy_path)), Privilege::User)
        .await?;
    let directories = ls
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains(".backup-"))
        .map(str::to_string)
        .collect();
    Ok(DeploymentListing {
        processes,
        directories,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub target: String,
    pub user: String,
    pub working_dir: String,
    pub system: String,
}

/// Run `whoami`, `pwd` and `uname -a` on the target.
pub async fn test_connection(runner: &dyn CommandRunner) -> Result<ConnectionReport, DeployError> {
    let mut values = Vec::with_capacity(3);
    for command in ["whoami", "pwd", "uname -a"] {
        let out = runner.run(command, Privilege::User).await?;
        if !out.success() {
            return Err(DeployError::StepFailed {
                step: command.to_string(),
                exit_code: out.exit_code,
                stderr: out.error_text(),
            });
        }
        values.push(out.stdout_trimmed().to_string());
    }
    let system = values.pop().unwrap_or_default();
    let working_dir = values.pop().unwrap_or_default();
    let user = values.pop().unwrap_or_default();
    Ok(ConnectionReport {
        target: runner.describe(),
        user,
        working_dir,
        system,
    })
}
