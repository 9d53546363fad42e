//! Deployment profiles for remote servers and projects.
//!
//! Profiles live in a YAML (or JSON) file with two maps:
//!
//! ```yaml
//! servers:
//!   production:
//!     host: 203.0.113.10
//!     username: deploy
//!     key_file: ~/.ssh/id_rsa
//!     port: 22
//!     os_type: ubuntu
//! projects:
//!   shop:
//!     domain: shop.example.com
//!     ssl_enabled: true
//!     port: 3000
//!     env_vars:
//!       NODE_ENV: production
//! ```
//!
//! The file is loaded once per invocation and never written back, except by
//! `config init` which creates the template above.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::exec::{SshAuth, SshTarget};
use crate::render::ProcessManager;

pub const DEFAULT_DEPLOY_FILE: &str = "deployment_config.yaml";

/// Linux distribution family; selects the package manager and install recipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    #[default]
    Ubuntu,
    Debian,
    Centos,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Ubuntu => "ubuntu",
            OsFamily::Debian => "debian",
            OsFamily::Centos => "centos",
        }
    }

    pub fn is_debian_like(&self) -> bool {
        matches!(self, OsFamily::Ubuntu | OsFamily::Debian)
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ubuntu" => Ok(OsFamily::Ubuntu),
            "debian" => Ok(OsFamily::Debian),
            "centos" | "rhel" | "rocky" | "almalinux" => Ok(OsFamily::Centos),
            other => Err(format!("Unsupported OS type: {}", other)),
        }
    }
}

/// How to reach a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerProfile {
    pub host: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub os_type: OsFamily,
}

fn default_ssh_port() -> u16 {
    22
}

impl ServerProfile {
    /// Resolve credentials into an SSH target.
    ///
    /// Password wins over key file; with neither, `~/.ssh/id_rsa` is used when
    /// it exists and the ssh agent otherwise.
    pub fn ssh_target(&self) -> SshTarget {
        let auth = if let Some(password) = &self.password {
            SshAuth::Password(password.clone())
        } else if let Some(key) = &self.key_file {
            SshAuth::Key(expand_home(key))
        } else {
            match dirs::home_dir().map(|h| h.join(".ssh/id_rsa")) {
                Some(key) if key.exists() => SshAuth::Key(key),
                _ => SshAuth::Agent,
            }
        };
        SshTarget {
            host: self.host.clone(),
            user: self.username.clone(),
            port: self.port,
            auth,
        }
    }
}

/// What to deploy and how.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectProfile {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub include_www: bool,
    #[serde(default = "default_true")]
    pub ssl_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_email: Option<String>,
    #[serde(default = "default_node_version")]
    pub node_version: String,
    #[serde(default = "default_app_port")]
    pub port: u16,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default = "default_build_command")]
    pub build_command: String,
    #[serde(default = "default_start_command")]
    pub start_command: String,
    #[serde(default)]
    pub process_manager: ProcessManager,
    #[serde(default = "default_instances")]
    pub pm2_instances: u32,
    #[serde(default = "default_deploy_path")]
    pub deploy_path: String,
    #[serde(default = "default_env_file_name")]
    pub env_file_name: String,
}

fn default_true() -> bool {
    true
}

fn default_node_version() -> String {
    "18".to_string()
}

fn default_app_port() -> u16 {
    3000
}

fn default_build_command() -> String {
    "npm run build".to_string()
}

fn default_start_command() -> String {
    "npm start".to_string()
}

fn default_instances() -> u32 {
    1
}

fn default_deploy_path() -> String {
    "/var/www".to_string()
}

fn default_env_file_name() -> String {
    ".env".to_string()
}

impl ProjectProfile {
    /// A profile with defaults for everything but the domain.
    pub fn for_domain(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            subdomain: None,
            project_name: String::new(),
            include_www: false,
            ssl_enabled: true,
            ssl_email: None,
            node_version: default_node_version(),
            port: default_app_port(),
            env_vars: BTreeMap::new(),
            build_command: default_build_command(),
            start_command: default_start_command(),
            process_manager: ProcessManager::Pm2,
            pm2_instances: default_instances(),
            deploy_path: default_deploy_path(),
            env_file_name: default_env_file_name(),
        }
    }

    /// Fully qualified host name, including the subdomain when set.
    pub fn fqdn(&self) -> String {
        match &self.subdomain {
            Some(sub) if !sub.is_empty() => format!("{}.{}", sub, self.domain),
            _ => self.domain.clone(),
        }
    }

    /// Directory-safe name; defaults to the domain with dots replaced.
    pub fn name(&self) -> String {
        if self.project_name.is_empty() {
            self.fqdn().replace('.', "_")
        } else {
            self.project_name.clone()
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        let fqdn = self.fqdn();
        let mut names = vec![fqdn.clone()];
        if self.include_www && !fqdn.starts_with("www.") {
            names.push(format!("www.{}", fqdn));
        }
        names
    }

    pub fn certbot_email(&self) -> String {
        self.ssl_email
            .clone()
            .unwrap_or_else(|| format!("admin@{}", self.domain))
    }

    pub fn app_dir(&self) -> String {
        format!("{}/{}", self.deploy_path.trim_end_matches('/'), self.name())
    }

    pub fn validate(&self) -> Result<()> {
        if !crate::util::is_valid_domain(&self.fqdn()) {
            bail!("Invalid domain: {}", self.fqdn());
        }
        if !crate::util::is_valid_app_name(&self.name()) {
            bail!("Invalid project name: {}", self.name());
        }
        if self.port == 0 {
            bail!("Project port must be non-zero");
        }
        if self.process_manager == ProcessManager::PidFile {
            bail!("Remote deployments support the pm2 and systemd process managers");
        }
        Ok(())
    }
}

/// The whole deployment file.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DeployFile {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerProfile>,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectProfile>,
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

impl DeployFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        if is_json(path) {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = if is_json(path) {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        } else {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Template written by `config init`.
    pub fn template() -> Self {
        let mut servers = BTreeMap::new();
        servers.insert(
            "production".to_string(),
            ServerProfile {
                host: "your-server-ip".to_string(),
                username: "deploy".to_string(),
                password: None,
                key_file: Some("~/.ssh/id_rsa".to_string()),
                port: 22,
                os_type: OsFamily::Ubuntu,
            },
        );
        let mut project = ProjectProfile::for_domain("example.com");
        project
            .env_vars
            .insert("NODE_ENV".to_string(), "production".to_string());
        let mut projects = BTreeMap::new();
        projects.insert("example".to_string(), project);
        Self { servers, projects }
    }

    pub fn server(&self, name: &str) -> Result<&ServerProfile> {
        self.servers
            .get(name)
            .with_context(|| format!("Server '{}' not found in config", name))
    }

    pub fn project(&self, name: &str) -> Result<&ProjectProfile> {
        self.projects
            .get(name)
            .with_context(|| format!("Project '{}' not found in config", name))
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Parse `KEY=VALUE` pairs given on the command line.
pub fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid env var '{}': expected KEY=VALUE", pair))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid env var '{}': empty key", pair);
        }
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Read variables from a dotenv file without touching the process environment.
pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for item in dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to open env file: {}", path.display()))?
    {
        let (key, value) =
            item.with_context(|| format!("Failed to parse env file: {}", path.display()))?;
        vars.insert(key, value);
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let yaml = r#"
servers:
  prod:
    host: 203.0.113.10
    username: deploy
projects:
  shop:
    domain: shop.example.com
"#;
        let file: DeployFile = serde_yaml::from_str(yaml).unwrap();
        let server = file.server("prod").unwrap();
        assert_eq!(server.port, 22);
        assert_eq!(server.os_type, OsFamily::Ubuntu);

        let project = file.project("shop").unwrap();
        assert!(project.ssl_enabled);
        assert_eq!(project.port, 3000);
        assert_eq!(project.node_version, "18");
        assert_eq!(project.build_command, "npm run build");
        assert_eq!(project.start_command, "npm start");
        assert_eq!(project.process_manager, ProcessManager::Pm2);
        assert_eq!(project.name(), "shop_example_com");
        assert_eq!(project.app_dir(), "/var/www/shop_example_com");
    }

    #[test]
    fn test_missing_entries_are_errors() {
        let file = DeployFile::default();
        let err = file.server("nope").unwrap_err();
        assert!(err.to_string().contains("Server 'nope' not found"));
        assert!(file.project("nope").is_err());
    }

    #[test]
    fn test_subdomain_and_www() {
        let mut project = ProjectProfile::for_domain("example.com");
        project.subdomain = Some("app".to_string());
        project.include_www = true;
        assert_eq!(project.fqdn(), "app.example.com");
        assert_eq!(project.server_names(), vec!["app.example.com", "www.app.example.com"]);
        assert_eq!(project.certbot_email(), "admin@example.com");
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut project = ProjectProfile::for_domain("bad domain");
        assert!(project.validate().is_err());
        project.domain = "ok.com".to_string();
        assert!(project.validate().is_ok());
        project.process_manager = ProcessManager::PidFile;
        assert!(project.validate().is_err());
    }

    #[test]
    fn test_template_round_trip_yaml_and_json() {
        let dir = tempdir().unwrap();
        for name in ["deploy.yaml", "deploy.json"] {
            let path = dir.path().join(name);
            DeployFile::template().save(&path).unwrap();
            let loaded = DeployFile::load(&path).unwrap();
            assert_eq!(loaded, DeployFile::template());
        }
    }

    #[test]
    fn test_ssh_target_prefers_password() {
        let profile = ServerProfile {
            host: "h".to_string(),
            username: "u".to_string(),
            password: Some("pw".to_string()),
            key_file: Some("/k".to_string()),
            port: 2200,
            os_type: OsFamily::Debian,
        };
        let target = profile.ssh_target();
        assert_eq!(target.auth, SshAuth::Password("pw".to_string()));
        assert_eq!(target.port, 2200);

        let keyed = ServerProfile {
            password: None,
            ..profile
        };
        assert_eq!(keyed.ssh_target().auth, SshAuth::Key(PathBuf::from("/k")));
    }

    #[test]
    fn test_os_family_parsing() {
        assert_eq!("Ubuntu".parse::<OsFamily>().unwrap(), OsFamily::Ubuntu);
        assert_eq!("rocky".parse::<OsFamily>().unwrap(), OsFamily::Centos);
        assert!("arch".parse::<OsFamily>().is_err());
        assert!(OsFamily::Debian.is_debian_like());
        assert!(!OsFamily::Centos.is_debian_like());
    }

    #[test]
    fn test_parse_env_pairs() {
        let vars = parse_env_pairs(&["A=1".to_string(), "URL=http://x?y=z".to_string()]).unwrap();
        assert_eq!(vars["A"], "1");
        assert_eq!(vars["URL"], "http://x?y=z");
        assert!(parse_env_pairs(&["novalue".to_string()]).is_err());
        assert!(parse_env_pairs(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_load_env_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env.production");
        std::fs::write(&path, "# comment\nAPI_KEY=abc\nGREETING=\"hello world\"\n").unwrap();
        let vars = load_env_file(&path).unwrap();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["API_KEY"], "abc");
        assert_eq!(vars["GREETING"], "hello world");
    }
}
