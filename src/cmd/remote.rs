//! Remote server commands: `setup`, `deploy`, `list`, `test-connection`.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use console::style;

use launchpad::config::{DeployFile, OsFamily, ProjectProfile, ServerProfile, load_env_file, parse_env_pairs};
use launchpad::deploy::{DeployReport, LogLevel, ProjectDeployer, list_deployments, test_connection};
use launchpad::exec::SshRunner;
use launchpad::provision::Provisioner;

use super::super::RemoteArgs;

/// Whether any server was named, inline or by profile.
pub(crate) fn has_server(args: &RemoteArgs) -> bool {
    args.host.is_some() || args.server.is_some()
}

/// Resolve the target server, plus the deploy file when one exists.
pub(crate) fn resolve_server(args: &RemoteArgs) -> Result<(ServerProfile, Option<DeployFile>)> {
    let file = if args.config.exists() {
        Some(DeployFile::load(&args.config)?)
    } else {
        None
    };

    if let Some(host) = &args.host {
        let os_type: OsFamily = args.os.parse().map_err(anyhow::Error::msg)?;
        let server = ServerProfile {
            host: host.clone(),
            username: args.user.clone(),
            password: args.password.clone(),
            key_file: args.key.clone(),
            port: args.ssh_port,
            os_type,
        };
        return Ok((server, file));
    }

    let Some(file) = file else {
        bail!(
            "Config file {} not found. Run `launchpad config init` or pass --host",
            args.config.display()
        );
    };
    let server = match &args.server {
        Some(name) => file.server(name)?.clone(),
        None if file.servers.len() == 1 => file
            .servers
            .values()
            .next()
            .cloned()
            .context("No servers defined")?,
        None => {
            let names: Vec<&str> = file.servers.keys().map(String::as_str).collect();
            bail!("Specify --server (available: {})", names.join(", "));
        }
    };
    Ok((server, Some(file)))
}

pub(crate) async fn connect(server: &ServerProfile) -> Result<SshRunner> {
    println!("Connecting to {}@{}:{}...", server.username, server.host, server.port);
    let runner = SshRunner::connect(server.ssh_target())
        .await
        .with_context(|| format!("Could not connect to {}", server.host))?;
    Ok(runner)
}

// ── setup ────────────────────────────────────────────────────────────

pub async fn cmd_setup(remote: &RemoteArgs, node_version: &str) -> Result<()> {
    let (server, _) = resolve_server(remote)?;
    let runner = connect(&server).await?;

    println!(
        "{}",
        style(format!("Provisioning {} ({})", server.host, server.os_type)).bold().cyan()
    );
    let report = Provisioner::new(&runner, server.os_type)
        .node_version(node_version)
        .run()
        .await?;

    for step in &report.steps {
        if step.ok {
            println!("  {} {}", style("✓").green(), step.name);
        } else {
            println!("  {} {}", style("✗").red(), step.name);
            for failure in &step.failures {
                println!("      {}", style(failure).dim());
            }
        }
    }

    if !report.is_clean() {
        bail!("Provisioning finished with failures in: {}", report.failed_steps().join(", "));
    }
    println!();
    println!("Server is ready for deployments.");
    Ok(())
}

// ── deploy ───────────────────────────────────────────────────────────

pub struct DeployOptions {
    pub project: Option<String>,
    pub path: PathBuf,
    pub env: Vec<String>,
    pub env_file: Option<PathBuf>,
    pub domain: Option<String>,
    pub port: Option<u16>,
    pub no_ssl: bool,
    pub json: bool,
}

/// Build the project profile from the deploy file and command-line overrides.
fn build_project(options: &DeployOptions, file: Option<&DeployFile>) -> Result<ProjectProfile> {
    let mut project = match (&options.project, file) {
        (Some(name), Some(file)) => file.project(name)?.clone(),
        (Some(name), None) => bail!("Project '{}' needs a deployment config file", name),
        (None, _) => {
            let domain = options
                .domain
                .as_deref()
                .context("Either --project or --domain is required")?;
            ProjectProfile::for_domain(domain)
        }
    };

    if let Some(domain) = &options.domain {
        project.domain = domain.clone();
    }
    if let Some(port) = options.port {
        project.port = port;
    }
    if options.no_ssl {
        project.ssl_enabled = false;
    }
    if let Some(env_file) = &options.env_file {
        project.env_vars.extend(load_env_file(env_file)?);
    }
    project.env_vars.extend(parse_env_pairs(&options.env)?);
    project.validate()?;
    Ok(project)
}

pub async fn cmd_deploy(remote: &RemoteArgs, options: &DeployOptions) -> Result<()> {
    let (server, file) = resolve_server(remote)?;
    let project = build_project(options, file.as_ref())?;
    let runner = connect(&server).await?;

    let report = ProjectDeployer::new(&runner, &server.username)
        .deploy(&project, &options.path)
        .await;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if !report.success {
        bail!("Deployment of {} failed", report.project);
    }
    Ok(())
}

fn print_report(report: &DeployReport) {
    println!();
    for line in &report.log {
        let tag = match line.level {
            LogLevel::Info => style("INFO ").dim(),
            LogLevel::Warn => style("WARN ").yellow(),
            LogLevel::Error => style("ERROR").red(),
        };
        println!("  {} {} {}", style(&line.time).dim(), tag, line.message);
    }
    println!();
    if report.success {
        println!("{}", style("Deployment successful").green().bold());
        if let Some(url) = &report.url {
            println!("  URL:      {}", url);
        }
    } else {
        println!("{}", style("Deployment failed").red().bold());
        if let Some(error) = &report.error {
            println!("  Error:    {}", error);
        }
        if report.rolled_back {
            println!("  Restored previous release");
        }
    }
    println!("  Duration: {:.1}s", report.duration_secs);
}

// ── list / test-connection ───────────────────────────────────────────

pub async fn cmd_list(remote: &RemoteArgs, deploy_path: &str) -> Result<()> {
    let (server, _) = resolve_server(remote)?;
    let runner = connect(&server).await?;
    let listing = list_deployments(&runner, deploy_path).await?;

    println!();
    println!("{}", style("PM2 processes").bold());
    if listing.processes.is_empty() {
        println!("  (none)");
    }
    for p in &listing.processes {
        let status = if p.status == "online" {
            style(p.status.clone()).green()
        } else {
            style(p.status.clone()).red()
        };
        println!(
            "  {:<24} {:<10} restarts: {:<4} memory: {} MB",
            p.name,
            status,
            p.restarts,
            p.memory_bytes / (1024 * 1024)
        );
    }
    println!();
    println!("{}", style(format!("Deployed in {}", deploy_path)).bold());
    if listing.directories.is_empty() {
        println!("  (none)");
    }
    for dir in &listing.directories {
        println!("  {}", dir);
    }
    Ok(())
}

pub async fn cmd_test_connection(remote: &RemoteArgs) -> Result<()> {
    let (server, _) = resolve_server(remote)?;
    let runner = connect(&server).await?;
    let report = test_connection(&runner).await?;
    println!("{}", style("Connection successful").green().bold());
    println!("  User:      {}", report.user);
    println!("  Directory: {}", report.working_dir);
    println!("  System:    {}", report.system);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn remote(config: PathBuf) -> RemoteArgs {
        RemoteArgs {
            config,
            server: None,
            host: None,
            user: "root".to_string(),
            password: None,
            key: None,
            ssh_port: 22,
            os: "ubuntu".to_string(),
        }
    }

    fn options() -> DeployOptions {
        DeployOptions {
            project: None,
            path: PathBuf::from("."),
            env: vec![],
            env_file: None,
            domain: None,
            port: None,
            no_ssl: false,
            json: false,
        }
    }

    #[test]
    fn test_inline_host_wins() {
        let dir = tempdir().unwrap();
        let mut args = remote(dir.path().join("missing.yaml"));
        args.host = Some("203.0.113.5".to_string());
        args.os = "centos".to_string();
        let (server, file) = resolve_server(&args).unwrap();
        assert_eq!(server.host, "203.0.113.5");
        assert_eq!(server.os_type, OsFamily::Centos);
        assert!(file.is_none());
    }

    #[test]
    fn test_single_server_is_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deploy.yaml");
        DeployFile::template().save(&path).unwrap();
        let (server, file) = resolve_server(&remote(path)).unwrap();
        assert_eq!(server.username, "deploy");
        assert!(file.is_some());
    }

    #[test]
    fn test_missing_config_is_explained() {
        let dir = tempdir().unwrap();
        let err = resolve_server(&remote(dir.path().join("none.yaml"))).unwrap_err();
        assert!(err.to_string().contains("config init"));
    }

    #[test]
    fn test_project_overrides() {
        let dir = tempdir().unwrap();
        let env_file = dir.path().join(".env.production");
        std::fs::write(&env_file, "API_URL=https://api.example.com\nPORT=9\n").unwrap();
        let mut opts = options();
        opts.project = Some("example".to_string());
        opts.domain = Some("shop.example.com".to_string());
        opts.port = Some(4000);
        opts.no_ssl = true;
        opts.env_file = Some(env_file);
        opts.env = vec!["PORT=4000".to_string()];

        let project = build_project(&opts, Some(&DeployFile::template())).unwrap();
        assert_eq!(project.fqdn(), "shop.example.com");
        assert_eq!(project.port, 4000);
        assert!(!project.ssl_enabled);
        assert_eq!(project.env_vars["NODE_ENV"], "production");
        assert_eq!(project.env_vars["API_URL"], "https://api.example.com");
        assert_eq!(project.env_vars["PORT"], "4000");
    }

    #[test]
    fn test_project_requires_domain_or_profile() {
        let err = build_project(&options(), None).unwrap_err();
        assert!(err.to_string().contains("--project or --domain"));
    }
}
