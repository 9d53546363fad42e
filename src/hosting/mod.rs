//! Local hosting manager.
//!
//! Owns the resolved [`HostingConfig`], a [`CommandRunner`] for privileged
//! host commands and the [`RegistryHandle`]. The CLI `host` subcommands and
//! the HTTP API both drive the same [`HostingManager`].
//!
//! | Module | Role |
//! |--------|------|
//! | `registry` | SQLite record of domains and the action log |
//! | `supervisor` | PID-file supervision for read-only hosts |
//! | `apps` | Node.js app deployment and supervision |

pub mod apps;
pub mod registry;
pub mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::config::HostingConfig;
use crate::deploy::site::{NginxLayout, SiteApplier};
use crate::errors::HostingError;
use crate::exec::{CommandRunner, Privilege};
use crate::provision::StepReport;
use crate::render::{NginxSite, SiteKind, SystemdUnit, render_placeholder_page};
use crate::util::{is_valid_domain, shell_quote, truncate};

pub use apps::{AppDeployer, AppDeployment, AppRecord, AppStatusReport, NodeAppRequest};
pub use registry::{
    DomainCounts, DomainRecord, DomainRegistry, DomainStatus, LogEntry, RegistryHandle, SiteType,
};
pub use supervisor::{AppState, PidSupervisor};

pub(crate) fn nginx_layout(config: &HostingConfig) -> NginxLayout {
    NginxLayout {
        sites_available: config.nginx_sites_dir.to_string_lossy().into_owned(),
        sites_enabled: config.nginx_enabled_dir.to_string_lossy().into_owned(),
        binary: config.nginx_binary.clone(),
    }
}

/// A domain as presented to users: the registry row plus derived locations.
#[derive(Debug, Clone, Serialize)]
pub struct DomainView {
    #[serde(flatten)]
    pub record: DomainRecord,
    pub url: String,
    pub files_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainDeployment {
    pub domain_name: String,
    pub port: u16,
    pub site_type: SiteType,
    pub url: String,
    pub files_path: PathBuf,
    pub nginx_configured: bool,
    pub readonly_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostingStatus {
    pub nginx_running: bool,
    pub database_ok: bool,
    pub domains: DomainCounts,
    pub user: String,
    pub readonly_mode: bool,
    pub web_root: PathBuf,
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SetupReport {
    pub steps: Vec<StepReport>,
}

impl SetupReport {
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.ok)
    }
}

/// Sudo rules letting the API user manage nginx, certbot and app units.
/// Site link rules follow the configured nginx directories.
pub fn sudoers_content(user: &str, nginx: &str, layout: &NginxLayout) -> String {
    let available = &layout.sites_available;
    let enabled = &layout.sites_enabled;
    let rules = [
        format!("{nginx} -t"),
        format!("{nginx} -t -p /tmp"),
        "/bin/systemctl reload nginx".to_string(),
        "/bin/systemctl restart nginx".to_string(),
        "/bin/systemctl start nginx".to_string(),
        "/bin/systemctl stop nginx".to_string(),
        "/bin/systemctl daemon-reload".to_string(),
        "/bin/systemctl * nodejs-*".to_string(),
        "/usr/bin/certbot *".to_string(),
        format!("/bin/ln -sf {available}/* {enabled}/*"),
        format!("/bin/rm -f {enabled}/*"),
        format!("/bin/rm -f {enabled}/* {available}/*"),
    ];
    let mut out = String::from("# launchpad hosting API\n");
    for rule in rules {
        out.push_str(&format!("{user} ALL=(ALL) NOPASSWD: {rule}\n"));
    }
    out
}

pub struct HostingManager {
    config: Arc<HostingConfig>,
    runner: Arc<dyn CommandRunner>,
    registry: RegistryHandle,
}

impl HostingManager {
    pub fn new(config: HostingConfig, runner: Arc<dyn CommandRunner>, registry: RegistryHandle) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            registry,
        }
    }

    /// Open (creating if needed) the registry at `config.database_path`.
    pub fn open(config: HostingConfig, runner: Arc<dyn CommandRunner>) -> anyhow::Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let registry = DomainRegistry::new(&config.database_path)?;
        tracing::debug!(path = %config.database_path.display(), "registry opened");
        Ok(Self::new(config, runner, RegistryHandle::new(registry)))
    }

    pub fn config(&self) -> &HostingConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn apps(&self) -> AppDeployer<'_> {
        AppDeployer::new(&self.config, self.runner.as_ref())
    }

    fn applier(&self) -> SiteApplier<'_> {
        SiteApplier::new(self.runner.as_ref(), nginx_layout(&self.config))
    }

    fn url_for(&self, record: &DomainRecord) -> String {
        let scheme = if record.ssl_enabled { "https" } else { "http" };
        format!("{}://{}", scheme, record.domain_name)
    }

    async fn log_action(&self, domain: &str, action: &'static str, status: &'static str, message: String) {
        let domain = domain.to_string();
        if let Err(e) = self
            .registry
            .call(move |r| r.append_log(&domain, action, status, &message))
            .await
        {
            tracing::warn!(action, error = %e, "could not record deployment log");
        }
    }

    async fn sudo_step(&self, step: &mut StepReport, command: &str) -> Result<bool, HostingError> {
        let out = self.runner.run(command, Privilege::Sudo).await?;
        if !out.success() {
            tracing::warn!(step = %step.name, command, "setup command failed");
            step.fail(format!("{}: {}", command, truncate(&out.error_text(), 300)));
        }
        Ok(out.success())
    }

    // ── Setup ────────────────────────────────────────────────────────

    /// Prepare the host: directories, packages, sudo rules, database, nginx
    /// and the API service. Writable-only steps are skipped on read-only
    /// hosts.
    pub async fn setup(&self, api_binary: &Path) -> Result<SetupReport, HostingError> {
        let mut report = SetupReport::default();
        let readonly = self.config.readonly();
        tracing::info!(readonly, "setting up hosting environment");

        if !readonly {
            let mut packages = StepReport::new("packages");
            if self
                .sudo_step(&mut packages, "DEBIAN_FRONTEND=noninteractive apt-get update")
                .await?
            {
                self.sudo_step(
                    &mut packages,
                    "DEBIAN_FRONTEND=noninteractive apt-get install -y nginx sqlite3 certbot python3-certbot-nginx curl nodejs npm",
                )
                .await?;
            }
            if !packages.ok {
                return Err(HostingError::CommandFailed {
                    action: "package installation".to_string(),
                    message: packages.failures.join("; "),
                });
            }
            report.steps.push(packages);
        }

        report.steps.push(self.setup_directories().await?);

        if !readonly {
            report.steps.push(self.setup_sudoers().await?);
        }

        let mut database = StepReport::new("database");
        if let Err(e) = self.registry.call(|r| r.self_test()).await {
            database.fail(e.to_string());
            report.steps.push(database);
            return Err(HostingError::Registry(e));
        }
        report.steps.push(database);

        if !readonly {
            let mut nginx = StepReport::new("nginx");
            let default_site = self.config.nginx_enabled_dir.join("default");
            self.sudo_step(
                &mut nginx,
                &format!("rm -f {}", shell_quote(&default_site.to_string_lossy())),
            )
            .await?;
            let applier = self.applier();
            match applier.validate().await? {
                validation if validation.is_ok() => {
                    if !applier.reload().await {
                        nginx.fail("nginx reload failed");
                    }
                }
                validation => nginx.fail(format!("{:?}", validation)),
            }
            report.steps.push(nginx);

            report.steps.push(self.setup_api_service(api_binary).await?);
        }

        tracing::info!(clean = report.is_clean(), "hosting setup finished");
        Ok(report)
    }

    async fn setup_directories(&self) -> Result<StepReport, HostingError> {
        let mut step = StepReport::new("directories");
        let mut dirs = self.config.writable_dirs();
        dirs.push(self.config.scratch_dir.clone());
        if !self.config.readonly() {
            dirs.push(self.config.nginx_sites_dir.clone());
            dirs.push(self.config.nginx_enabled_dir.clone());
        }
        for dir in &dirs {
            if std::fs::create_dir_all(dir).is_err() {
                self.sudo_step(&mut step, &format!("mkdir -p {}", shell_quote(&dir.to_string_lossy())))
                    .await?;
            }
        }
        if !self.config.readonly() {
            let owner = format!("{0}:{0}", self.config.owner_user);
            for dir in [&self.config.web_root, &self.config.log_dir] {
                self.sudo_step(
                    &mut step,
                    &format!("chown -R {} {}", shell_quote(&owner), shell_quote(&dir.to_string_lossy())),
                )
                .await?;
            }
        }
        Ok(step)
    }

    async fn setup_sudoers(&self) -> Result<StepReport, HostingError> {
        let mut step = StepReport::new("sudoers");
        let path = self.config.sudoers_path.to_string_lossy().into_owned();
        let nginx = self
            .runner
            .run("command -v nginx", Privilege::User)
            .await?
            .stdout_trimmed()
            .to_string();
        let nginx = if nginx.is_empty() { "/usr/sbin/nginx".to_string() } else { nginx };
        let content = sudoers_content(&self.config.owner_user, &nginx, &nginx_layout(&self.config));
        self.runner
            .write_file(&path, content.as_bytes(), Privilege::Sudo)
            .await?;
        self.sudo_step(&mut step, &format!("chmod 440 {}", shell_quote(&path)))
            .await?;
        if !self.sudo_step(&mut step, "visudo -c").await? {
            // A broken drop-in locks everyone out of sudo.
            self.runner
                .run(&format!("rm -f {}", shell_quote(&path)), Privilege::Sudo)
                .await?;
            return Err(HostingError::CommandFailed {
                action: "sudoers validation".to_string(),
                message: step.failures.join("; "),
            });
        }
        Ok(step)
    }

    async fn setup_api_service(&self, api_binary: &Path) -> Result<StepReport, HostingError> {
        let mut step = StepReport::new("api service");
        let unit = SystemdUnit::hosting_api(
            api_binary,
            Path::new("/"),
            &self.config.api_host,
            self.config.api_port,
        );
        let path = self.config.systemd_dir.join("hosting-api.service");
        self.runner
            .write_file(&path.to_string_lossy(), unit.render().as_bytes(), Privilege::Sudo)
            .await?;
        if self.sudo_step(&mut step, "systemctl daemon-reload").await? {
            self.sudo_step(&mut step, "systemctl enable hosting-api").await?;
        }
        Ok(step)
    }

    // ── Domains ──────────────────────────────────────────────────────

    /// Create the site directory, configure nginx and record the domain.
    pub async fn deploy_domain(
        &self,
        domain: &str,
        port: i64,
        site_type: &str,
    ) -> Result<DomainDeployment, HostingError> {
        if !is_valid_domain(domain) {
            return Err(HostingError::InvalidDomain(domain.to_string()));
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or(HostingError::InvalidPort(port))?;
        let site_type: SiteType = site_type
            .parse()
            .map_err(|_| HostingError::InvalidSiteType(site_type.to_string()))?;

        tracing::info!(domain, port, site_type = %site_type, "deploying domain");
        let public = self.config.public_dir(domain);
        std::fs::create_dir_all(&public)
            .with_context(|| format!("Failed to create {}", public.display()))?;
        let index = public.join("index.html");
        if !index.exists() {
            let page = render_placeholder_page(
                domain,
                site_type.as_str(),
                &chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            );
            std::fs::write(&index, page)
                .with_context(|| format!("Failed to write {}", index.display()))?;
        }

        let nginx_configured = if self.config.readonly() {
            tracing::info!(domain, "read-only mode, nginx configuration skipped");
            false
        } else {
            let owner = format!("{0}:{0}", self.config.owner_user);
            let site_dir = self.config.site_dir(domain);
            match self
                .runner
                .run(
                    &format!("chown -R {} {}", shell_quote(&owner), shell_quote(&site_dir.to_string_lossy())),
                    Privilege::Sudo,
                )
                .await
            {
                Ok(out) if !out.success() => {
                    tracing::warn!(domain, error = %out.error_text(), "could not chown site directory")
                }
                Err(e) => tracing::warn!(domain, error = %e, "could not chown site directory"),
                _ => {}
            }

            let kind = if site_type.is_proxied() {
                SiteKind::Proxy {
                    port,
                    static_dir: Some(public.clone()),
                }
            } else {
                SiteKind::Static { root: public.clone() }
            };
            let content = NginxSite::new(vec![domain.to_string()], kind).render();
            if let Err(e) = self.applier().apply(domain, &content).await {
                self.log_action(domain, "deploy", "failed", e.to_string()).await;
                return Err(e.into());
            }
            true
        };

        let name = domain.to_string();
        let record = self
            .registry
            .call(move |r| r.upsert_domain(&name, port, site_type))
            .await
            .map_err(HostingError::Registry)?;
        self.log_action(domain, "deploy", "success", "Domain deployed successfully".to_string())
            .await;

        Ok(DomainDeployment {
            domain_name: record.domain_name.clone(),
            port,
            site_type,
            url: self.url_for(&record),
            files_path: public,
            nginx_configured,
            readonly_mode: self.config.readonly(),
        })
    }

    async fn active_domain(&self, domain: &str) -> Result<DomainRecord, HostingError> {
        let name = domain.to_string();
        self.registry
            .call(move |r| r.get_active(&name))
            .await
            .map_err(HostingError::Registry)?
            .ok_or_else(|| HostingError::DomainNotFound(domain.to_string()))
    }

    /// Request a Let's Encrypt certificate through certbot's nginx plugin.
    pub async fn add_ssl(&self, domain: &str) -> Result<DomainRecord, HostingError> {
        if self.config.readonly() {
            return Err(HostingError::ReadOnly("SSL certificate management".to_string()));
        }
        self.active_domain(domain).await?;

        let email = self
            .config
            .certbot_email
            .clone()
            .unwrap_or_else(|| format!("admin@{}", domain));
        let command = crate::deploy::certbot_command(&[domain.to_string()], &email);
        tracing::info!(domain, "requesting certificate");
        let out = self.runner.run(&command, Privilege::Sudo).await?;
        if !out.success() {
            let message = truncate(&out.error_text(), 500);
            self.log_action(domain, "ssl_add", "failed", message.clone()).await;
            return Err(HostingError::CommandFailed {
                action: "certbot".to_string(),
                message,
            });
        }

        let name = domain.to_string();
        self.registry
            .call(move |r| r.mark_ssl(&name))
            .await
            .map_err(HostingError::Registry)?;
        self.log_action(
            domain,
            "ssl_add",
            "success",
            "Let's Encrypt SSL certificate added successfully".to_string(),
        )
        .await;
        self.active_domain(domain).await
    }

    /// Disable the nginx site and mark the domain removed. Site files stay.
    pub async fn remove_domain(&self, domain: &str) -> Result<(), HostingError> {
        self.active_domain(domain).await?;
        if self.config.readonly() {
            tracing::info!(domain, "read-only mode, nginx configs not removed");
        } else {
            self.applier().remove(domain).await?;
        }
        let name = domain.to_string();
        self.registry
            .call(move |r| r.mark_removed(&name))
            .await
            .map_err(HostingError::Registry)?;
        self.log_action(domain, "remove", "success", "Domain removed successfully".to_string())
            .await;
        tracing::info!(domain, "domain removed");
        Ok(())
    }

    pub async fn list_domains(&self) -> Result<Vec<DomainView>, HostingError> {
        let records = self
            .registry
            .call(|r| r.list_active())
            .await
            .map_err(HostingError::Registry)?;
        Ok(records
            .into_iter()
            .map(|record| DomainView {
                url: self.url_for(&record),
                files_path: self.config.public_dir(&record.domain_name),
                record,
            })
            .collect())
    }

    pub async fn logs(&self, limit: u32, domain: Option<String>) -> Result<Vec<LogEntry>, HostingError> {
        self.registry
            .call(move |r| r.list_logs(limit, domain.as_deref()))
            .await
            .map_err(HostingError::Registry)
    }

    pub async fn status(&self) -> Result<HostingStatus, HostingError> {
        let nginx_running = self
            .runner
            .run("systemctl is-active nginx", Privilege::User)
            .await
            .is_ok_and(|out| out.stdout_trimmed() == "active");
        let database_ok = self.registry.call(|r| r.ping()).await.is_ok();
        let domains = self
            .registry
            .call(|r| r.counts())
            .await
            .map_err(HostingError::Registry)?;
        let user = self
            .runner
            .run("whoami", Privilege::User)
            .await
            .map(|out| out.stdout_trimmed().to_string())
            .unwrap_or_default();
        Ok(HostingStatus {
            nginx_running,
            database_ok,
            domains,
            user,
            readonly_mode: self.config.readonly(),
            web_root: self.config.web_root.clone(),
            database_path: self.config.database_path.clone(),
        })
    }
}
