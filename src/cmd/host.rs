//! Local hosting commands: `launchpad host ...`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;

use launchpad::capability::{CapabilityProbe, FilesystemMode};
use launchpad::config::HostingSettings;
use launchpad::exec::LocalRunner;
use launchpad::hosting::HostingManager;

use super::super::HostCommands;

/// Resolve settings (file, environment, flags), detect the filesystem mode
/// and open the registry.
pub fn open_hosting(config: Option<&Path>, readonly: bool, writable: bool) -> Result<HostingManager> {
    let mut settings = HostingSettings::load_or_default(config)?;
    settings.apply_env(|key| std::env::var(key).ok())?;
    if readonly {
        settings.filesystem = FilesystemMode::Readonly;
    } else if writable {
        settings.filesystem = FilesystemMode::Writable;
    }
    let capability = CapabilityProbe::default().resolve(settings.filesystem);
    let config = settings.resolve(capability);
    tracing::debug!(?config, "hosting configuration resolved");
    HostingManager::open(config, Arc::new(LocalRunner::new()))
}

pub async fn cmd_host(manager: HostingManager, command: HostCommands) -> Result<()> {
    let readonly = manager.config().readonly();
    if readonly {
        println!("{}", style("Read-only filesystem mode").yellow());
    }

    match command {
        HostCommands::Setup => {
            let exe = std::env::current_exe().context("Failed to locate the launchpad binary")?;
            let report = manager.setup(&exe).await?;
            for step in &report.steps {
                let mark = if step.ok { style("✓").green() } else { style("✗").red() };
                println!("  {} {}", mark, step.name);
                for failure in &step.failures {
                    println!("      {}", style(failure).dim());
                }
            }
            if !report.is_clean() {
                bail!("Hosting setup finished with failures");
            }
            println!("Hosting environment ready.");
        }
        HostCommands::Deploy {
            domain,
            port,
            site_type,
        } => {
            let deployment = manager.deploy_domain(&domain, port, &site_type).await?;
            println!("{}", style(format!("Deployed {}", deployment.domain_name)).green().bold());
            println!("  Type:  {}", deployment.site_type);
            println!("  Port:  {}", deployment.port);
            println!("  Files: {}", deployment.files_path.display());
            println!("  URL:   {}", deployment.url);
            if !deployment.nginx_configured {
                println!("  nginx: not configured (read-only mode)");
            }
        }
        HostCommands::Ssl { domain } => {
            let record = manager.add_ssl(&domain).await?;
            println!(
                "{}",
                style(format!("SSL enabled for https://{}", record.domain_name)).green().bold()
            );
        }
        HostCommands::Remove { domain } => {
            manager.remove_domain(&domain).await?;
            println!("Removed {} (site files kept)", domain);
        }
        HostCommands::List => {
            let domains = manager.list_domains().await?;
            if domains.is_empty() {
                println!("No active domains.");
                return Ok(());
            }
            println!("{:<32} {:<8} {:<6} {:<5} {}", "DOMAIN", "TYPE", "PORT", "SSL", "FILES");
            for d in &domains {
                println!(
                    "{:<32} {:<8} {:<6} {:<5} {}",
                    d.record.domain_name,
                    d.record.site_type.as_str(),
                    d.record.port,
                    if d.record.ssl_enabled { "yes" } else { "no" },
                    d.files_path.display()
                );
            }
        }
        HostCommands::Status => {
            let status = manager.status().await?;
            let yes_no = |ok: bool| if ok { style("ok").green() } else { style("down").red() };
            println!("nginx:      {}", yes_no(status.nginx_running));
            println!("database:   {} ({})", yes_no(status.database_ok), status.database_path.display());
            println!("domains:    {} active, {} with SSL", status.domains.active, status.domains.ssl_enabled);
            println!("web root:   {}", status.web_root.display());
            println!("user:       {}", status.user);
            println!("filesystem: {}", if status.readonly_mode { "read-only" } else { "writable" });
        }
        HostCommands::Api { host, port } => {
            let host = host.unwrap_or_else(|| manager.config().api_host.clone());
            let port = port.unwrap_or(manager.config().api_port);
            launchpad::api::start_server(manager, &host, port).await?;
        }
    }
    Ok(())
}
