//! Activating nginx sites through a [`CommandRunner`].
//!
//! The same applier serves remote deployments (over SSH) and the local
//! hosting manager. A site is never left enabled with a config that fails
//! `nginx -t`: on failure the previous file is restored, or the new file and
//! its link are removed.

use crate::errors::SiteError;
use crate::exec::{CommandOutput, CommandRunner, Privilege};
use crate::util::shell_quote;

/// Where nginx keeps its site files and how to invoke it.
#[derive(Debug, Clone)]
pub struct NginxLayout {
    pub sites_available: String,
    pub sites_enabled: String,
    pub binary: String,
}

impl Default for NginxLayout {
    fn default() -> Self {
        Self {
            sites_available: "/etc/nginx/sites-available".to_string(),
            sites_enabled: "/etc/nginx/sites-enabled".to_string(),
            binary: "nginx".to_string(),
        }
    }
}

impl NginxLayout {
    pub fn available_path(&self, name: &str) -> String {
        format!("{}/{}", self.sites_available.trim_end_matches('/'), name)
    }

    pub fn enabled_path(&self, name: &str) -> String {
        format!("{}/{}", self.sites_enabled.trim_end_matches('/'), name)
    }
}

/// Outcome of `nginx -t`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// Syntax passed but nginx could not open its pid or log files, which
    /// happens on read-only roots. Treated as valid.
    SyntaxOnly(String),
    Invalid(String),
}

impl Validation {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Validation::Invalid(_))
    }
}

/// Result of a successful [`SiteApplier::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedSite {
    pub config_path: String,
    pub reloaded: bool,
    pub backup: Option<String>,
}

pub struct SiteApplier<'a> {
    runner: &'a dyn CommandRunner,
    layout: NginxLayout,
}

impl<'a> SiteApplier<'a> {
    pub fn new(runner: &'a dyn CommandRunner, layout: NginxLayout) -> Self {
        Self { runner, layout }
    }

    pub fn layout(&self) -> &NginxLayout {
        &self.layout
    }

    /// Write, link, validate and reload the site `name`.
    pub async fn apply(&self, name: &str, content: &str) -> Result<AppliedSite, SiteError> {
        let available = self.layout.available_path(name);
        let enabled = self.layout.enabled_path(name);

        let previous = self.read_existing(&available).await?;
        let backup = match &previous {
            Some(_) => {
                let backup = format!("{}.bak", available);
                self.sudo(
                    "backup site config",
                    &format!("cp -p {} {}", shell_quote(&available), shell_quote(&backup)),
                )
                .await?;
                Some(backup)
            }
            None => None,
        };
        let was_enabled = self
            .runner
            .run(&format!("test -L {}", shell_quote(&enabled)), Privilege::Sudo)
            .await?
            .success();

        self.runner
            .write_file(&available, content.as_bytes(), Privilege::Sudo)
            .await
            .map_err(|source| SiteError::Write {
                path: available.clone(),
                source,
            })?;
        self.sudo(
            "enable site",
            &format!(
                "mkdir -p {} && ln -sf {} {}",
                shell_quote(&self.layout.sites_enabled),
                shell_quote(&available),
                shell_quote(&enabled)
            ),
        )
        .await?;

        match self.validate().await? {
            Validation::Invalid(message) => {
                tracing::warn!(site = name, "nginx rejected config, reverting");
                self.revert(&available, &enabled, previous.as_deref(), was_enabled)
                    .await;
                Err(SiteError::Invalid(message))
            }
            validation => {
                if let Validation::SyntaxOnly(note) = &validation {
                    tracing::warn!(site = name, note = %note, "nginx syntax ok, runtime files not writable");
                }
                let reloaded = self.reload().await;
                tracing::info!(site = name, reloaded, "nginx site applied");
                Ok(AppliedSite {
                    config_path: available,
                    reloaded,
                    backup,
                })
            }
        }
    }

    /// Disable and delete the site `name`, then reload if the remaining
    /// configuration is valid. Returns whether nginx was reloaded.
    pub async fn remove(&self, name: &str) -> Result<bool, SiteError> {
        let available = self.layout.available_path(name);
        let enabled = self.layout.enabled_path(name);
        self.sudo(
            "remove site",
            &format!("rm -f {} {}", shell_quote(&enabled), shell_quote(&available)),
        )
        .await?;
        match self.validate().await? {
            Validation::Invalid(message) => {
                tracing::warn!(site = name, error = %message, "nginx config invalid after removal, not reloading");
                Ok(false)
            }
            _ => Ok(self.reload().await),
        }
    }

    /// Run `nginx -t`, tolerating an unwritable pid/log location.
    pub async fn validate(&self) -> Result<Validation, SiteError> {
        let out = self
            .runner
            .run(&format!("{} -t", self.layout.binary), Privilege::Sudo)
            .await?;
        if out.success() {
            return Ok(Validation::Valid);
        }
        if let Some(validation) = syntax_only(&out) {
            return Ok(validation);
        }
        if is_runtime_file_failure(&combined(&out)) {
            let retry = self
                .runner
                .run(&format!("{} -t -p /tmp", self.layout.binary), Privilege::Sudo)
                .await?;
            if retry.success() {
                return Ok(Validation::SyntaxOnly(out.error_text()));
            }
            if let Some(validation) = syntax_only(&retry) {
                return Ok(validation);
            }
        }
        Ok(Validation::Invalid(out.error_text()))
    }

    /// Reload nginx, falling back to a restart. Returns whether either worked.
    pub async fn reload(&self) -> bool {
        let attempts = [
            "systemctl reload nginx".to_string(),
            "systemctl restart nginx".to_string(),
            format!("{} -s reload", self.layout.binary),
        ];
        for command in &attempts {
            match self.runner.run(command, Privilege::Sudo).await {
                Ok(out) if out.success() => return true,
                Ok(out) => {
                    tracing::debug!(command = %command, error = %out.error_text(), "nginx reload attempt failed")
                }
                Err(e) => tracing::debug!(command = %command, error = %e, "nginx reload attempt failed"),
            }
        }
        tracing::warn!("could not reload nginx");
        false
    }

    async fn read_existing(&self, path: &str) -> Result<Option<String>, SiteError> {
        let quoted = shell_quote(path);
        let out = self
            .runner
            .run(&format!("test -f {quoted} && cat {quoted}"), Privilege::Sudo)
            .await?;
        Ok(out.success().then_some(out.stdout))
    }

    /// Put back the previous file, or remove the new one. A link created by
    /// this apply is always dropped.
    async fn revert(&self, available: &str, enabled: &str, previous: Option<&str>, was_enabled: bool) {
        let result = match previous {
            Some(content) => {
                let restored = self
                    .runner
                    .write_file(available, content.as_bytes(), Privilege::Sudo)
                    .await
                    .map(|_| ());
                match restored {
                    Ok(()) if !was_enabled => self
                        .runner
                        .run(&format!("rm -f {}", shell_quote(enabled)), Privilege::Sudo)
                        .await
                        .map(|_| ()),
                    other => other,
                }
            }
            None => self
                .runner
                .run(
                    &format!("rm -f {} {}", shell_quote(enabled), shell_quote(available)),
                    Privilege::Sudo,
                )
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            tracing::error!(path = available, error = %e, "failed to revert nginx site");
        }
    }

    async fn sudo(&self, step: &str, command: &str) -> Result<CommandOutput, SiteError> {
        let out = self.runner.run(command, Privilege::Sudo).await?;
        if !out.success() {
            return Err(SiteError::Command {
                step: step.to_string(),
                message: out.error_text(),
            });
        }
        Ok(out)
    }
}

fn combined(out: &CommandOutput) -> String {
    format!("{}\n{}", out.stdout, out.stderr)
}

fn is_runtime_file_failure(text: &str) -> bool {
    text.contains("Read-only file system")
        || text.contains("Permission denied")
        || text.contains("could not open error log")
}

fn syntax_only(out: &CommandOutput) -> Option<Validation> {
    let text = combined(out);
    (text.contains("syntax is ok") && is_runtime_file_failure(&text))
        .then(|| Validation::SyntaxOnly(out.error_text()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;

    fn layout() -> NginxLayout {
        NginxLayout {
            sites_available: "/etc/nginx/sites-available".to_string(),
            sites_enabled: "/etc/nginx/sites-enabled".to_string(),
            binary: "nginx".to_string(),
        }
    }

    #[tokio::test]
    async fn test_apply_new_site_writes_links_and_reloads() {
        let runner = FakeRunner::new();
        runner.fail("test -f", "");
        let applier = SiteApplier::new(&runner, layout());

        let applied = applier.apply("example.com", "server {}").await.unwrap();

        assert_eq!(applied.config_path, "/etc/nginx/sites-available/example.com");
        assert!(applied.reloaded);
        assert!(applied.backup.is_none());
        assert_eq!(
            runner.file("/etc/nginx/sites-available/example.com").as_deref(),
            Some("server {}")
        );
        assert!(runner.ran("ln -sf /etc/nginx/sites-available/example.com /etc/nginx/sites-enabled/example.com"));
        assert!(runner.ran("nginx -t"));
        assert!(runner.ran("systemctl reload nginx"));
    }

    #[tokio::test]
    async fn test_invalid_config_never_reloads_and_is_removed() {
        let runner = FakeRunner::new();
        runner
            .fail("test -f", "")
            .fail("nginx -t", "nginx: [emerg] unknown directive \"bogus\"");
        let applier = SiteApplier::new(&runner, layout());

        let err = applier.apply("bad.com", "bogus;").await.unwrap_err();

        assert!(matches!(err, SiteError::Invalid(ref m) if m.contains("bogus")));
        assert!(!runner.ran("systemctl reload"));
        assert!(!runner.ran("systemctl restart"));
        assert!(runner.ran(
            "rm -f /etc/nginx/sites-enabled/bad.com /etc/nginx/sites-available/bad.com"
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_drops_link_it_created() {
        let runner = FakeRunner::new();
        runner
            .respond("test -f", 0, "server { listen 8080; }", "")
            .fail("test -L", "")
            .fail("nginx -t", "nginx: configuration file test failed");
        let applier = SiteApplier::new(&runner, layout());

        applier.apply("draft.com", "broken").await.unwrap_err();

        assert_eq!(
            runner.file("/etc/nginx/sites-available/draft.com").as_deref(),
            Some("server { listen 8080; }")
        );
        assert!(runner.ran("rm -f /etc/nginx/sites-enabled/draft.com"));
        assert!(!runner.ran("rm -f /etc/nginx/sites-enabled/draft.com /etc/nginx/sites-available"));
    }

    #[tokio::test]
    async fn test_invalid_config_restores_previous_file() {
        let runner = FakeRunner::new();
        runner
            .respond("test -f", 0, "server { listen 80; }", "")
            .fail("nginx -t", "nginx: configuration file test failed");
        let applier = SiteApplier::new(&runner, layout());

        applier.apply("old.com", "broken").await.unwrap_err();

        assert!(runner.ran("cp -p"));
        assert_eq!(
            runner.file("/etc/nginx/sites-available/old.com").as_deref(),
            Some("server { listen 80; }")
        );
        assert!(!runner.ran("rm -f"));
        assert!(!runner.ran("reload"));
    }

    #[tokio::test]
    async fn test_readonly_syntax_ok_is_accepted() {
        let runner = FakeRunner::new();
        runner.fail("test -f", "").respond(
            "nginx -t",
            1,
            "",
            "nginx: the configuration file /etc/nginx/nginx.conf syntax is ok\n\
             nginx: [emerg] open() \"/run/nginx.pid\" failed (30: Read-only file system)",
        );
        let applier = SiteApplier::new(&runner, layout());

        assert!(matches!(
            applier.validate().await.unwrap(),
            Validation::SyntaxOnly(_)
        ));
        assert!(applier.apply("ro.com", "server {}").await.is_ok());
    }

    #[tokio::test]
    async fn test_permission_failure_retries_with_tmp_prefix() {
        let runner = FakeRunner::new();
        runner
            .respond("nginx -t -p /tmp", 0, "", "")
            .respond("nginx -t", 1, "", "nginx: [alert] could not open error log file: Permission denied");
        let applier = SiteApplier::new(&runner, layout());

        assert!(applier.validate().await.unwrap().is_ok());
        assert!(runner.ran("nginx -t -p /tmp"));
    }

    #[tokio::test]
    async fn test_reload_falls_back_to_restart() {
        let runner = FakeRunner::new();
        runner.fail("systemctl reload nginx", "not running");
        let applier = SiteApplier::new(&runner, layout());
        assert!(applier.reload().await);
        assert!(runner.ran("systemctl restart nginx"));
    }

    #[tokio::test]
    async fn test_remove_skips_reload_when_invalid() {
        let runner = FakeRunner::new();
        runner.fail("nginx -t", "nginx: [emerg] host not found");
        let applier = SiteApplier::new(&runner, layout());
        assert!(!applier.remove("gone.com").await.unwrap());
        assert!(runner.ran("rm -f /etc/nginx/sites-enabled/gone.com"));
        assert!(!runner.ran("reload"));
    }
}
