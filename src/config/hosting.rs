//! Configuration for the local hosting manager.
//!
//! Settings are layered: built-in defaults, then a TOML file, then
//! `LAUNCHPAD_*` environment variables, then CLI flags. Path defaults depend
//! on the detected [`FsCapability`]: on a read-only host everything moves
//! under `/tmp`. Explicitly configured paths are always respected.
//!
//! # Configuration File Format
//!
//! ```toml
//! filesystem = "auto"          # auto | writable | readonly
//! web_root = "/srv/www"
//! database_path = "/srv/hosting/hosting.db"
//! owner_user = "www-data"
//! api_host = "127.0.0.1"
//! api_port = 5000
//! app_domain_suffix = "apps.example.com"
//! certbot_email = "ops@example.com"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::capability::{FilesystemMode, FsCapability};

pub const DEFAULT_HOSTING_CONFIG: &str = "/etc/launchpad/hosting.toml";

/// Raw, partially specified settings as read from file and environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostingSettings {
    pub filesystem: FilesystemMode,
    pub database_path: Option<PathBuf>,
    pub web_root: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub nginx_sites_dir: Option<PathBuf>,
    pub nginx_enabled_dir: Option<PathBuf>,
    pub nginx_binary: Option<String>,
    pub systemd_dir: Option<PathBuf>,
    pub apps_dir: Option<PathBuf>,
    pub app_records_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub sudoers_path: Option<PathBuf>,
    pub owner_user: Option<String>,
    pub app_domain_suffix: Option<String>,
    pub certbot_email: Option<String>,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
}

impl HostingSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse hosting config")
    }

    /// Load an explicit file, or the system default when it exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = Path::new(DEFAULT_HOSTING_CONFIG);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Overlay `LAUNCHPAD_*` variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        let text = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(mode) = text("LAUNCHPAD_FILESYSTEM") {
            self.filesystem = mode.parse().map_err(anyhow::Error::msg)?;
        }
        macro_rules! overlay {
            ($field:ident, $getter:ident, $key:literal) => {
                if let Some(v) = $getter($key) {
                    self.$field = Some(v);
                }
            };
        }
        overlay!(database_path, path, "LAUNCHPAD_DATABASE_PATH");
        overlay!(web_root, path, "LAUNCHPAD_WEB_ROOT");
        overlay!(log_dir, path, "LAUNCHPAD_LOG_DIR");
        overlay!(nginx_sites_dir, path, "LAUNCHPAD_NGINX_SITES_DIR");
        overlay!(nginx_enabled_dir, path, "LAUNCHPAD_NGINX_ENABLED_DIR");
        overlay!(nginx_binary, text, "LAUNCHPAD_NGINX_BINARY");
        overlay!(systemd_dir, path, "LAUNCHPAD_SYSTEMD_DIR");
        overlay!(apps_dir, path, "LAUNCHPAD_APPS_DIR");
        overlay!(app_records_dir, path, "LAUNCHPAD_APP_RECORDS_DIR");
        overlay!(scratch_dir, path, "LAUNCHPAD_SCRATCH_DIR");
        overlay!(sudoers_path, path, "LAUNCHPAD_SUDOERS_PATH");
        overlay!(owner_user, text, "LAUNCHPAD_OWNER_USER");
        overlay!(app_domain_suffix, text, "LAUNCHPAD_APP_DOMAIN_SUFFIX");
        overlay!(certbot_email, text, "LAUNCHPAD_CERTBOT_EMAIL");
        overlay!(api_host, text, "LAUNCHPAD_API_HOST");
        if let Some(port) = text("LAUNCHPAD_API_PORT") {
            self.api_port = Some(
                port.parse()
                    .with_context(|| format!("Invalid LAUNCHPAD_API_PORT: {}", port))?,
            );
        }
        Ok(())
    }

    /// Fill every unset field from the defaults for `capability`.
    pub fn resolve(self, capability: FsCapability) -> HostingConfig {
        let readonly = capability.is_readonly();
        let pick = |value: Option<PathBuf>, writable: &str, ro: &str| {
            value.unwrap_or_else(|| PathBuf::from(if readonly { ro } else { writable }))
        };
        let apps_dir = self
            .apps_dir
            .unwrap_or_else(|| PathBuf::from("/tmp/nodejs-apps"));
        HostingConfig {
            capability,
            database_path: pick(
                self.database_path,
                "/var/lib/hosting/hosting.db",
                "/tmp/hosting/hosting.db",
            ),
            web_root: pick(self.web_root, "/var/www/domains", "/tmp/www/domains"),
            log_dir: pick(self.log_dir, "/var/log/hosting", "/tmp/hosting/logs"),
            app_records_dir: self.app_records_dir.unwrap_or_else(|| {
                if readonly {
                    apps_dir.clone()
                } else {
                    PathBuf::from("/var/lib/hosting-apps")
                }
            }),
            apps_dir,
            nginx_sites_dir: self
                .nginx_sites_dir
                .unwrap_or_else(|| PathBuf::from("/etc/nginx/sites-available")),
            nginx_enabled_dir: self
                .nginx_enabled_dir
                .unwrap_or_else(|| PathBuf::from("/etc/nginx/sites-enabled")),
            nginx_binary: self.nginx_binary.unwrap_or_else(|| "nginx".to_string()),
            systemd_dir: self
                .systemd_dir
                .unwrap_or_else(|| PathBuf::from("/etc/systemd/system")),
            scratch_dir: self.scratch_dir.unwrap_or_else(|| PathBuf::from("/tmp")),
            sudoers_path: self
                .sudoers_path
                .unwrap_or_else(|| PathBuf::from("/etc/sudoers.d/hosting-api")),
            owner_user: self.owner_user.unwrap_or_else(|| "www-data".to_string()),
            app_domain_suffix: self.app_domain_suffix,
            certbot_email: self.certbot_email,
            api_host: self.api_host.unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: self.api_port.unwrap_or(5000),
        }
    }
}

/// Fully resolved hosting configuration, built once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct HostingConfig {
    pub capability: FsCapability,
    pub database_path: PathBuf,
    pub web_root: PathBuf,
    pub log_dir: PathBuf,
    pub nginx_sites_dir: PathBuf,
    pub nginx_enabled_dir: PathBuf,
    pub nginx_binary: String,
    pub systemd_dir: PathBuf,
    pub apps_dir: PathBuf,
    pub app_records_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub sudoers_path: PathBuf,
    pub owner_user: String,
    pub app_domain_suffix: Option<String>,
    pub certbot_email: Option<String>,
    pub api_host: String,
    pub api_port: u16,
}

impl HostingConfig {
    pub fn readonly(&self) -> bool {
        self.capability.is_readonly()
    }

    /// `{web_root}/{domain}`
    pub fn site_dir(&self, domain: &str) -> PathBuf {
        self.web_root.join(domain)
    }

    /// `{web_root}/{domain}/public`
    pub fn public_dir(&self, domain: &str) -> PathBuf {
        self.site_dir(domain).join("public")
    }

    /// Directories the manager must be able to write in every mode.
    pub fn writable_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.web_root.clone(), self.log_dir.clone(), self.apps_dir.clone()];
        if let Some(parent) = self.database_path.parent() {
            dirs.insert(0, parent.to_path_buf());
        }
        if !dirs.contains(&self.app_records_dir) {
            dirs.push(self.app_records_dir.clone());
        }
        dirs
    }

    /// A config rooted entirely under `root`; used by tests and sandboxes.
    pub fn sandboxed(root: &Path, capability: FsCapability) -> Self {
        HostingSettings {
            database_path: Some(root.join("hosting/hosting.db")),
            web_root: Some(root.join("www")),
            log_dir: Some(root.join("logs")),
            nginx_sites_dir: Some(root.join("nginx/sites-available")),
            nginx_enabled_dir: Some(root.join("nginx/sites-enabled")),
            systemd_dir: Some(root.join("systemd")),
            apps_dir: Some(root.join("apps")),
            app_records_dir: Some(root.join("app-records")),
            scratch_dir: Some(root.join("scratch")),
            sudoers_path: Some(root.join("sudoers/hosting-api")),
            ..Default::default()
        }
        .resolve(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_writable_defaults() {
        let config = HostingSettings::default().resolve(FsCapability::Writable);
        assert_eq!(config.database_path, PathBuf::from("/var/lib/hosting/hosting.db"));
        assert_eq!(config.web_root, PathBuf::from("/var/www/domains"));
        assert_eq!(config.app_records_dir, PathBuf::from("/var/lib/hosting-apps"));
        assert_eq!(config.apps_dir, PathBuf::from("/tmp/nodejs-apps"));
        assert_eq!(config.api_port, 5000);
        assert!(!config.readonly());
    }

    #[test]
    fn test_readonly_defaults_move_to_tmp() {
        let config = HostingSettings::default().resolve(FsCapability::ReadOnly);
        assert_eq!(config.database_path, PathBuf::from("/tmp/hosting/hosting.db"));
        assert_eq!(config.web_root, PathBuf::from("/tmp/www/domains"));
        assert_eq!(config.log_dir, PathBuf::from("/tmp/hosting/logs"));
        assert_eq!(config.app_records_dir, PathBuf::from("/tmp/nodejs-apps"));
        assert!(config.readonly());
    }

    #[test]
    fn test_explicit_paths_survive_readonly() {
        let settings = HostingSettings::parse(
            r#"
web_root = "/srv/www"
api_port = 8080
"#,
        )
        .unwrap();
        let config = settings.resolve(FsCapability::ReadOnly);
        assert_eq!(config.web_root, PathBuf::from("/srv/www"));
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.database_path, PathBuf::from("/tmp/hosting/hosting.db"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut settings = HostingSettings::parse(
            r#"
filesystem = "writable"
web_root = "/from/file"
"#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("LAUNCHPAD_WEB_ROOT", "/from/env"),
            ("LAUNCHPAD_API_PORT", "7000"),
            ("LAUNCHPAD_FILESYSTEM", "readonly"),
            ("LAUNCHPAD_OWNER_USER", ""),
        ]
        .into_iter()
        .collect();
        settings
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.web_root, Some(PathBuf::from("/from/env")));
        assert_eq!(settings.api_port, Some(7000));
        assert_eq!(settings.filesystem, FilesystemMode::Readonly);
        assert_eq!(settings.owner_user, None);
    }

    #[test]
    fn test_bad_env_port_is_error() {
        let mut settings = HostingSettings::default();
        let err = settings
            .apply_env(|k| (k == "LAUNCHPAD_API_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("LAUNCHPAD_API_PORT"));
    }

    #[test]
    fn test_sandboxed_paths() {
        let root = Path::new("/tmp/sandbox");
        let config = HostingConfig::sandboxed(root, FsCapability::Writable);
        assert_eq!(config.public_dir("a.com"), PathBuf::from("/tmp/sandbox/www/a.com/public"));
        assert_eq!(config.nginx_enabled_dir, PathBuf::from("/tmp/sandbox/nginx/sites-enabled"));
        let dirs = config.writable_dirs();
        assert_eq!(dirs[0], PathBuf::from("/tmp/sandbox/hosting"));
        assert!(dirs.contains(&PathBuf::from("/tmp/sandbox/app-records")));
    }
}
