//! Node.js app deployment for the hosting manager.
//!
//! Files arrive as a path → content map. They are staged in a scratch
//! directory, installed and built there with an isolated npm environment,
//! then moved into `{web_root}/{site}` and supervised by systemd, or by the
//! PID-file supervisor when systemd is unavailable or the root is read-only.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::HostingConfig;
use crate::deploy::site::SiteApplier;
use crate::errors::HostingError;
use crate::exec::{CommandRunner, Privilege, ProgramSpec, copy_tree, run_program};
use crate::render::{NginxSite, ProcessManager, SiteKind, SystemdUnit};
use crate::util::{is_valid_app_name, shell_quote, timestamp_suffix, truncate};

use super::nginx_layout;
use super::supervisor::PidSupervisor;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const BUILD_TIMEOUT: Duration = Duration::from_secs(600);
const RECORD_FILE: &str = "deployment.json";

/// A deployment request as posted to `/api/deploy/nodejs`.
#[derive(Debug, Clone)]
pub struct NodeAppRequest {
    pub name: String,
    pub files: BTreeMap<String, String>,
    pub port: u16,
}

/// Persisted description of a deployed app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub site_name: String,
    pub port: u16,
    pub cwd: PathBuf,
    pub process_manager: ProcessManager,
    pub start_command: String,
    pub created_at: String,
    pub readonly_mode: bool,
}

impl AppRecord {
    pub fn path(records_dir: &Path, site: &str) -> PathBuf {
        records_dir.join(site).join(RECORD_FILE)
    }

    pub fn load(records_dir: &Path, site: &str) -> anyhow::Result<Option<Self>> {
        let path = Self::path(records_dir, site);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    pub fn save(&self, records_dir: &Path) -> anyhow::Result<PathBuf> {
        let path = Self::path(records_dir, &self.site_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Response for a completed deployment.
#[derive(Debug, Clone, Serialize)]
pub struct AppDeployment {
    pub site_name: String,
    pub domain: String,
    pub port: u16,
    pub status: String,
    pub process_manager: ProcessManager,
    pub url: String,
    pub files_path: PathBuf,
    pub created_at: String,
    pub readonly_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    Nodejs,
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppStatusReport {
    pub site_name: String,
    #[serde(rename = "type")]
    pub kind: AppKind,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_manager: Option<ProcessManager>,
    pub readonly_mode: bool,
}

// ── Project inspection ───────────────────────────────────────────────

fn read_package_json(dir: &Path) -> Option<serde_json::Value> {
    let content = std::fs::read_to_string(dir.join("package.json")).ok()?;
    serde_json::from_str(&content).ok()
}

fn has_script(package: Option<&serde_json::Value>, name: &str) -> bool {
    package
        .and_then(|p| p.get("scripts"))
        .and_then(|s| s.get(name))
        .is_some()
}

fn declares_dependencies(package: &serde_json::Value) -> bool {
    ["dependencies", "devDependencies"].iter().any(|key| {
        package
            .get(key)
            .and_then(|d| d.as_object())
            .is_some_and(|d| !d.is_empty())
    })
}

/// Pick the command that starts the app in `dir`.
///
/// Next.js projects start through the local `next` binary (building first
/// when `.next/server` is missing); otherwise npm `start`/`dev` scripts win,
/// then the first conventional entry file.
pub fn detect_start_command(dir: &Path) -> String {
    let package = read_package_json(dir);
    let is_next = dir.join("next.config.mjs").exists()
        || dir.join("next.config.js").exists()
        || package
            .as_ref()
            .and_then(|p| p.get("dependencies"))
            .and_then(|d| d.get("next"))
            .is_some();

    if is_next {
        let start = "node node_modules/next/dist/bin/next start";
        if dir.join(".next/server").is_dir() {
            return start.to_string();
        }
        return format!("npm run build && {}", start);
    }
    if has_script(package.as_ref(), "start") {
        return "npm start".to_string();
    }
    if has_script(package.as_ref(), "dev") {
        return "npm run dev".to_string();
    }
    for entry in ["server.js", "app.js", "index.js", "main.js"] {
        if dir.join(entry).exists() {
            return format!("node {}", entry);
        }
    }
    "npm start".to_string()
}

/// Write every `(relative path, content)` pair under `target`.
///
/// Absolute paths and `..` components are rejected before anything is
/// written.
pub fn extract_files(files: &BTreeMap<String, String>, target: &Path) -> Result<usize, HostingError> {
    for name in files.keys() {
        let path = Path::new(name);
        let safe = !name.is_empty()
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(HostingError::CommandFailed {
                action: "extract files".to_string(),
                message: format!("Refusing unsafe path '{}'", name),
            });
        }
    }
    for (name, content) in files {
        let full = target.join(name);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&full, content)
            .with_context(|| format!("Failed to write {}", full.display()))?;
    }
    tracing::info!(count = files.len(), dir = %target.display(), "extracted project files");
    Ok(files.len())
}

// ── npm ──────────────────────────────────────────────────────────────

/// Per-deployment npm cache, prefix and temp dirs, removed afterwards.
#[derive(Debug)]
pub struct NpmSandbox {
    pub cache: PathBuf,
    pub prefix: PathBuf,
    pub tmp: PathBuf,
}

impl NpmSandbox {
    pub fn create(scratch: &Path, stamp: &str) -> anyhow::Result<Self> {
        let sandbox = Self {
            cache: scratch.join(format!("npm-cache-{stamp}")),
            prefix: scratch.join(format!("npm-prefix-{stamp}")),
            tmp: scratch.join(format!("deploy-tmp-{stamp}")),
        };
        for dir in [&sandbox.cache, &sandbox.prefix, &sandbox.tmp] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(sandbox)
    }

    pub fn env(&self) -> Vec<(String, String)> {
        let path = |p: &Path| p.to_string_lossy().into_owned();
        vec![
            ("npm_config_cache".to_string(), path(&self.cache)),
            ("npm_config_prefix".to_string(), path(&self.prefix)),
            ("npm_config_fund".to_string(), "false".to_string()),
            ("npm_config_audit".to_string(), "false".to_string()),
            ("npm_config_loglevel".to_string(), "warn".to_string()),
            ("HOME".to_string(), path(&self.tmp)),
            ("TMPDIR".to_string(), path(&self.tmp)),
            ("NODE_ENV".to_string(), "production".to_string()),
            ("NO_UPDATE_NOTIFIER".to_string(), "1".to_string()),
        ]
    }

    pub fn cleanup(&self) {
        for dir in [&self.cache, &self.prefix, &self.tmp] {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

/// Install commands tried in order until one succeeds.
pub fn install_strategies(cache: &Path) -> Vec<String> {
    let cache = shell_quote(&cache.to_string_lossy());
    vec![
        format!("npm install --cache {cache} --no-audit --no-fund --prefer-offline --silent"),
        "npm install --no-audit --no-fund --silent".to_string(),
        format!("npm ci --cache {cache} --silent"),
        "npm install".to_string(),
    ]
}

async fn npm_install(dir: &Path, sandbox: &NpmSandbox) -> Result<(), HostingError> {
    let mut last_error = String::new();
    for (attempt, command) in install_strategies(&sandbox.cache).iter().enumerate() {
        tracing::info!(attempt = attempt + 1, command = %command, "npm install");
        let spec = ProgramSpec::new(command.as_str(), dir)
            .envs(&sandbox.env())
            .timeout(INSTALL_TIMEOUT);
        match run_program(&spec).await {
            Ok(out) if out.success() => return Ok(()),
            Ok(out) => last_error = truncate(&out.error_text(), 500),
            Err(e) => last_error = e.to_string(),
        }
        tracing::warn!(attempt = attempt + 1, error = %last_error, "npm install strategy failed");
    }
    Err(HostingError::CommandFailed {
        action: "npm install".to_string(),
        message: last_error,
    })
}

async fn npm_build(dir: &Path, sandbox: &NpmSandbox) -> Result<(), HostingError> {
    tracing::info!(dir = %dir.display(), "npm run build");
    let spec = ProgramSpec::new("npm run build --silent", dir)
        .envs(&sandbox.env())
        .timeout(BUILD_TIMEOUT);
    let out = run_program(&spec).await?;
    if !out.success() {
        return Err(HostingError::CommandFailed {
            action: "npm run build".to_string(),
            message: truncate(&out.error_text(), 500),
        });
    }
    Ok(())
}

// ── Deployer ─────────────────────────────────────────────────────────

fn unit_name(site: &str) -> String {
    format!("nodejs-{}", site)
}

/// Deploys and supervises Node.js apps on the local host.
pub struct AppDeployer<'a> {
    config: &'a HostingConfig,
    runner: &'a dyn CommandRunner,
}

impl<'a> AppDeployer<'a> {
    pub fn new(config: &'a HostingConfig, runner: &'a dyn CommandRunner) -> Self {
        Self { config, runner }
    }

    /// Public hostname for `site`.
    pub fn app_domain(&self, site: &str) -> String {
        match &self.config.app_domain_suffix {
            Some(suffix) if !suffix.is_empty() => format!("{}.{}", site, suffix),
            _ => site.to_string(),
        }
    }

    pub async fn deploy(&self, request: &NodeAppRequest) -> Result<AppDeployment, HostingError> {
        let site = request.name.as_str();
        if !is_valid_app_name(site) {
            return Err(HostingError::InvalidDomain(site.to_string()));
        }
        if request.port == 0 {
            return Err(HostingError::InvalidPort(0));
        }
        if request.files.is_empty() {
            return Err(HostingError::CommandFailed {
                action: "deploy".to_string(),
                message: "No files supplied".to_string(),
            });
        }

        let stamp = timestamp_suffix();
        let scratch = &self.config.scratch_dir;
        let staging = scratch.join(format!("deploy_{}_{}", site, stamp));
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("Failed to create {}", staging.display()))?;
        let sandbox = NpmSandbox::create(scratch, &stamp)?;

        tracing::info!(site, port = request.port, staging = %staging.display(), "deploying node app");
        let result = self.deploy_staged(request, &staging, &sandbox).await;

        sandbox.cleanup();
        let _ = std::fs::remove_dir_all(&staging);
        result
    }

    async fn deploy_staged(
        &self,
        request: &NodeAppRequest,
        staging: &Path,
        sandbox: &NpmSandbox,
    ) -> Result<AppDeployment, HostingError> {
        let site = request.name.as_str();
        extract_files(&request.files, staging)?;

        let package = read_package_json(staging);
        if let Some(package) = &package {
            if declares_dependencies(package) {
                npm_install(staging, sandbox).await?;
            } else {
                tracing::info!(site, "package.json declares no dependencies, skipping install");
            }
            if has_script(Some(package), "build") {
                npm_build(staging, sandbox).await?;
            }
        }
        let start_command = detect_start_command(staging);

        let final_dir = self.config.site_dir(site);
        replace_dir(staging, &final_dir)?;
        if !self.config.readonly() {
            let owner = format!("{0}:{0}", self.config.owner_user);
            let chown = format!(
                "chown -R {} {}",
                shell_quote(&owner),
                shell_quote(&final_dir.to_string_lossy())
            );
            match self.runner.run(&chown, Privilege::Sudo).await {
                Ok(out) if !out.success() => {
                    tracing::warn!(error = %out.error_text(), "could not chown app directory")
                }
                Err(e) => tracing::warn!(error = %e, "could not chown app directory"),
                _ => {}
            }
        }

        let process_manager = self
            .supervise(site, &final_dir, request.port, &start_command)
            .await?;

        let domain = self.app_domain(site);
        if !self.config.readonly() {
            let mut names = vec![site.to_string()];
            if domain != site {
                names.push(domain.clone());
            }
            let content = NginxSite::new(
                names,
                SiteKind::Proxy {
                    port: request.port,
                    static_dir: None,
                },
            )
            .render();
            let applier = SiteApplier::new(self.runner, nginx_layout(self.config));
            if let Err(e) = applier.apply(site, &content).await {
                tracing::error!(site, error = %e, "nginx configuration failed, stopping app");
                if let Err(stop_err) = self.stop_with(site, process_manager).await {
                    tracing::warn!(site, error = %stop_err, "failed to stop app");
                }
                return Err(e.into());
            }
        } else {
            tracing::info!(site, "read-only mode, nginx configuration skipped");
        }

        let created_at = chrono::Local::now().to_rfc3339();
        let record = AppRecord {
            site_name: site.to_string(),
            port: request.port,
            cwd: final_dir.clone(),
            process_manager,
            start_command,
            created_at: created_at.clone(),
            readonly_mode: self.config.readonly(),
        };
        if let Err(e) = record.save(&self.config.app_records_dir) {
            tracing::warn!(site, error = %e, "could not save deployment record");
        }

        tracing::info!(site, manager = %process_manager, "node app deployed");
        Ok(AppDeployment {
            site_name: site.to_string(),
            url: format!("http://{}", domain),
            domain,
            port: request.port,
            status: "running".to_string(),
            process_manager,
            files_path: final_dir,
            created_at,
            readonly_mode: self.config.readonly(),
            notes: self
                .config
                .readonly()
                .then(|| "Deployed in read-only filesystem mode with limited features".to_string()),
        })
    }

    async fn supervise(
        &self,
        site: &str,
        dir: &Path,
        port: u16,
        start_command: &str,
    ) -> Result<ProcessManager, HostingError> {
        if !self.config.readonly() {
            let unit = SystemdUnit::node_app(site, dir, port, start_command, &self.config.owner_user);
            let unit_path = self
                .config
                .systemd_dir
                .join(format!("{}.service", unit_name(site)));
            match self
                .runner
                .write_file(&unit_path.to_string_lossy(), unit.render().as_bytes(), Privilege::Sudo)
                .await
            {
                Ok(()) => {
                    self.start_systemd(site).await?;
                    return Ok(ProcessManager::Systemd);
                }
                Err(e) => {
                    tracing::warn!(site, error = %e, "cannot write systemd unit, using PID supervisor")
                }
            }
        }
        PidSupervisor::new(&self.config.apps_dir, site)
            .start(start_command, dir, port)
            .await?;
        Ok(ProcessManager::PidFile)
    }

    async fn start_systemd(&self, site: &str) -> Result<(), HostingError> {
        let unit = unit_name(site);
        for command in [
            "systemctl daemon-reload".to_string(),
            format!("systemctl enable {}", unit),
            format!("systemctl restart {}", unit),
        ] {
            let out = self.runner.run(&command, Privilege::Sudo).await?;
            if !out.success() {
                return Err(HostingError::CommandFailed {
                    action: command,
                    message: out.error_text(),
                });
            }
        }
        for attempt in 0..3 {
            if self.systemd_active(site).await {
                return Ok(());
            }
            if attempt < 2 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        let journal = self
            .runner
            .run(&format!("journalctl -u {} -n 20 --no-pager", unit), Privilege::Sudo)
            .await
            .map(|out| out.stdout)
            .unwrap_or_default();
        Err(HostingError::CommandFailed {
            action: format!("start {}", unit),
            message: truncate(journal.trim(), 1000),
        })
    }

    async fn systemd_active(&self, site: &str) -> bool {
        self.runner
            .run(&format!("systemctl is-active {}", unit_name(site)), Privilege::User)
            .await
            .is_ok_and(|out| out.stdout_trimmed() == "active")
    }

    /// `Ok(false)` when nothing was running or the stop command exited non-zero.
    async fn stop_with(&self, site: &str, manager: ProcessManager) -> Result<bool, HostingError> {
        let (command, privilege) = match manager {
            ProcessManager::PidFile => {
                return Ok(PidSupervisor::new(&self.config.apps_dir, site).stop()?);
            }
            ProcessManager::Systemd => (format!("systemctl stop {}", unit_name(site)), Privilege::Sudo),
            ProcessManager::Pm2 => (format!("pm2 stop {}", shell_quote(site)), Privilege::User),
        };
        let out = self.runner.run(&command, privilege).await?;
        if !out.success() {
            tracing::warn!(site, error = %out.error_text(), "failed to stop app");
        }
        Ok(out.success())
    }

    fn record(&self, site: &str) -> Result<AppRecord, HostingError> {
        AppRecord::load(&self.config.app_records_dir, site)?
            .ok_or_else(|| HostingError::AppNotFound(site.to_string()))
    }

    pub async fn status(&self, site: &str) -> Result<AppStatusReport, HostingError> {
        if let Some(record) = AppRecord::load(&self.config.app_records_dir, site)? {
            let running = match record.process_manager {
                ProcessManager::Systemd => self.systemd_active(site).await,
                ProcessManager::PidFile => PidSupervisor::new(&self.config.apps_dir, site)
                    .status()
                    .is_running(),
                ProcessManager::Pm2 => self
                    .runner
                    .run(&format!("pm2 pid {}", shell_quote(site)), Privilege::User)
                    .await
                    .is_ok_and(|out| {
                        let pid = out.stdout_trimmed();
                        !pid.is_empty() && pid != "0"
                    }),
            };
            return Ok(AppStatusReport {
                site_name: site.to_string(),
                kind: AppKind::Nodejs,
                status: if running { "running" } else { "stopped" }.to_string(),
                port: Some(record.port),
                process_manager: Some(record.process_manager),
                readonly_mode: record.readonly_mode,
            });
        }
        if self.config.site_dir(site).is_dir() {
            return Ok(AppStatusReport {
                site_name: site.to_string(),
                kind: AppKind::Static,
                status: "running".to_string(),
                port: None,
                process_manager: None,
                readonly_mode: self.config.readonly(),
            });
        }
        Err(HostingError::AppNotFound(site.to_string()))
    }

    pub async fn start(&self, site: &str) -> Result<(), HostingError> {
        let record = self.record(site)?;
        match record.process_manager {
            ProcessManager::PidFile => {
                PidSupervisor::new(&self.config.apps_dir, site)
                    .start(&record.start_command, &record.cwd, record.port)
                    .await?;
            }
            manager => {
                let command = match manager {
                    ProcessManager::Pm2 => format!("pm2 start {}", shell_quote(site)),
                    _ => format!("systemctl start {}", unit_name(site)),
                };
                let out = self.runner.run(&command, Privilege::Sudo).await?;
                if !out.success() {
                    return Err(HostingError::CommandFailed {
                        action: command,
                        message: out.error_text(),
                    });
                }
            }
        }
        tracing::info!(site, "app started");
        Ok(())
    }

    pub async fn stop(&self, site: &str) -> Result<bool, HostingError> {
        let record = self.record(site)?;
        let stopped = self.stop_with(site, record.process_manager).await?;
        tracing::info!(site, stopped, "app stop requested");
        Ok(stopped)
    }
}

/// Move `staging` to `target`, replacing whatever was there.
fn replace_dir(staging: &Path, target: &Path) -> Result<(), HostingError> {
    if target.exists() {
        std::fs::remove_dir_all(target)
            .with_context(|| format!("Failed to clear {}", target.display()))?;
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    // rename fails across filesystems; fall back to a full copy.
    if std::fs::rename(staging, target).is_err() {
        copy_tree(staging, target, &[])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FsCapability;
    use crate::exec::fake::FakeRunner;
    use tempfile::tempdir;

    fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_detect_next_app_needs_build() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies":{"next":"14.0.0","react":"18.0.0"}}"#,
        )
        .unwrap();
        assert_eq!(
            detect_start_command(dir.path()),
            "npm run build && node node_modules/next/dist/bin/next start"
        );

        std::fs::create_dir_all(dir.path().join(".next/server")).unwrap();
        assert_eq!(
            detect_start_command(dir.path()),
            "node node_modules/next/dist/bin/next start"
        );
    }

    #[test]
    fn test_detect_scripts_and_entry_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "").unwrap();
        assert_eq!(detect_start_command(dir.path()), "node app.js");

        std::fs::write(dir.path().join("package.json"), r#"{"scripts":{"dev":"vite"}}"#).unwrap();
        assert_eq!(detect_start_command(dir.path()), "npm run dev");

        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"dev":"vite","start":"node app.js"}}"#,
        )
        .unwrap();
        assert_eq!(detect_start_command(dir.path()), "npm start");
    }

    #[test]
    fn test_extract_files_rejects_traversal() {
        let dir = tempdir().unwrap();
        let err = extract_files(&files(&[("../escape.js", "x")]), dir.path()).unwrap_err();
        assert!(err.to_string().contains("unsafe path"));
        assert!(extract_files(&files(&[("/etc/passwd", "x")]), dir.path()).is_err());
        assert!(!dir.path().join("escape.js").exists());
    }

    #[test]
    fn test_extract_files_creates_nested_dirs() {
        let dir = tempdir().unwrap();
        let count = extract_files(
            &files(&[("package.json", "{}"), ("pages/api/hello.js", "export default 1")]),
            dir.path(),
        )
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("pages/api/hello.js")).unwrap(),
            "export default 1"
        );
    }

    #[test]
    fn test_install_strategies_use_isolated_cache() {
        let strategies = install_strategies(Path::new("/tmp/npm-cache-1"));
        assert_eq!(strategies.len(), 4);
        assert!(strategies[0].contains("--cache /tmp/npm-cache-1"));
        assert!(strategies[2].starts_with("npm ci"));
        assert_eq!(strategies[3], "npm install");
    }

    #[test]
    fn test_npm_sandbox_env_and_cleanup() {
        let dir = tempdir().unwrap();
        let sandbox = NpmSandbox::create(dir.path(), "42").unwrap();
        let env: BTreeMap<_, _> = sandbox.env().into_iter().collect();
        assert_eq!(env["NODE_ENV"], "production");
        assert_eq!(env["HOME"], env["TMPDIR"]);
        assert!(env["npm_config_cache"].ends_with("npm-cache-42"));
        sandbox.cleanup();
        assert!(!sandbox.cache.exists());
    }

    #[test]
    fn test_record_round_trip_on_disk() {
        let dir = tempdir().unwrap();
        let record = AppRecord {
            site_name: "shop".to_string(),
            port: 3001,
            cwd: PathBuf::from("/var/www/domains/shop"),
            process_manager: ProcessManager::PidFile,
            start_command: "npm start".to_string(),
            created_at: "2024-01-01T00:00:00+00:00".to_string(),
            readonly_mode: true,
        };
        let path = record.save(dir.path()).unwrap();
        assert!(path.ends_with("shop/deployment.json"));
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"process_manager\": \"readonly-simple\""));
        assert_eq!(AppRecord::load(dir.path(), "shop").unwrap(), Some(record));
        assert_eq!(AppRecord::load(dir.path(), "other").unwrap(), None);
    }

    fn request(name: &str, port: u16) -> NodeAppRequest {
        NodeAppRequest {
            name: name.to_string(),
            files: files(&[
                ("package.json", r#"{"name":"demo","scripts":{"start":"node server.js"}}"#),
                ("server.js", "require('http').createServer().listen(process.env.PORT)"),
            ]),
            port,
        }
    }

    #[tokio::test]
    async fn test_writable_deploy_uses_systemd_and_nginx() {
        let root = tempdir().unwrap();
        let config = HostingConfig::sandboxed(root.path(), FsCapability::Writable);
        let runner = FakeRunner::new();
        runner
            .respond("systemctl is-active", 0, "active\n", "")
            .fail("test -f", "");
        let deployer = AppDeployer::new(&config, &runner);

        let deployment = deployer.deploy(&request("shop", 4000)).await.unwrap();

        assert_eq!(deployment.process_manager, ProcessManager::Systemd);
        assert_eq!(deployment.files_path, config.site_dir("shop"));
        assert!(config.site_dir("shop").join("server.js").exists());

        let unit_path = config.systemd_dir.join("nodejs-shop.service");
        let unit = runner.file(&unit_path.to_string_lossy()).unwrap();
        assert!(unit.contains("Environment=PORT=4000"));
        assert!(unit.contains("npm start"));
        assert!(runner.ran("systemctl enable nodejs-shop"));

        let site_path = config.nginx_sites_dir.join("shop");
        let site = runner.file(&site_path.to_string_lossy()).unwrap();
        assert!(site.contains("proxy_pass http://localhost:4000;"));

        let record = AppRecord::load(&config.app_records_dir, "shop").unwrap().unwrap();
        assert_eq!(record.port, 4000);
        assert!(!record.readonly_mode);

        let status = deployer.status("shop").await.unwrap();
        assert_eq!(status.status, "running");
        assert_eq!(status.kind, AppKind::Nodejs);

        // Staging and npm scratch space are gone.
        let leftovers: Vec<_> = std::fs::read_dir(&config.scratch_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_nginx_failure_stops_systemd_app() {
        let root = tempdir().unwrap();
        let config = HostingConfig::sandboxed(root.path(), FsCapability::Writable);
        let runner = FakeRunner::new();
        runner
            .respond("systemctl is-active", 0, "active", "")
            .fail("test -f", "")
            .fail("nginx -t", "nginx: [emerg] duplicate listen options");
        let deployer = AppDeployer::new(&config, &runner);

        let err = deployer.deploy(&request("shop", 4000)).await.unwrap_err();

        assert!(matches!(err, HostingError::Site(_)));
        assert!(runner.ran("systemctl stop nodejs-shop"));
        assert!(AppRecord::load(&config.app_records_dir, "shop").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unwritable_systemd_falls_back_to_pid_supervisor() {
        let root = tempdir().unwrap();
        let config = HostingConfig::sandboxed(root.path(), FsCapability::Writable);
        let runner = FakeRunner::new();
        runner.fail("test -f", "");
        runner.fail_writes_under(&config.systemd_dir.to_string_lossy());
        let deployer = AppDeployer::new(&config, &runner);

        let deployment = deployer.deploy(&request("blog", 4100)).await.unwrap();

        assert_eq!(deployment.process_manager, ProcessManager::PidFile);
        assert!(!runner.ran("systemctl enable"));
        deployer.stop("blog").await.unwrap();
    }

    #[tokio::test]
    async fn test_readonly_deploy_skips_systemd_and_nginx() {
        let root = tempdir().unwrap();
        let config = HostingConfig::sandboxed(root.path(), FsCapability::ReadOnly);
        let runner = FakeRunner::new();
        let deployer = AppDeployer::new(&config, &runner);

        let deployment = deployer.deploy(&request("notes", 4200)).await.unwrap();

        assert_eq!(deployment.process_manager, ProcessManager::PidFile);
        assert!(deployment.readonly_mode);
        assert!(deployment.notes.is_some());
        assert!(runner.commands().is_empty());
        let record = AppRecord::load(&config.app_records_dir, "notes").unwrap().unwrap();
        assert!(record.readonly_mode);
        deployer.stop("notes").await.unwrap();
    }

    #[tokio::test]
    async fn test_status_static_and_missing() {
        let root = tempdir().unwrap();
        let config = HostingConfig::sandboxed(root.path(), FsCapability::Writable);
        std::fs::create_dir_all(config.public_dir("plain.com")).unwrap();
        let runner = FakeRunner::new();
        let deployer = AppDeployer::new(&config, &runner);

        let status = deployer.status("plain.com").await.unwrap();
        assert_eq!(status.kind, AppKind::Static);
        assert!(status.port.is_none());

        assert!(deployer.status("nothing").await.unwrap_err().is_not_found());
        assert!(deployer.start("nothing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_bad_requests() {
        let root = tempdir().unwrap();
        let config = HostingConfig::sandboxed(root.path(), FsCapability::Writable);
        let runner = FakeRunner::new();
        let deployer = AppDeployer::new(&config, &runner);

        let mut bad = request("../evil", 3000);
        assert!(deployer.deploy(&bad).await.unwrap_err().is_client_error());
        bad.name = "fine".to_string();
        bad.files.clear();
        assert!(deployer.deploy(&bad).await.is_err());
    }
}
