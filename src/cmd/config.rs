//! Deployment config commands: `launchpad config`.

use anyhow::{Result, bail};

use launchpad::config::DeployFile;

use super::super::ConfigCommands;

pub fn cmd_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Init { path, force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            DeployFile::template().save(&path)?;
            println!("Created {}", path.display());
            println!("Edit the servers and projects sections, then run `launchpad deploy`.");
        }
        ConfigCommands::Show { path } => {
            let file = DeployFile::load(&path)?;
            println!("Config file: {}", path.display());
            println!();
            println!("Servers:");
            if file.servers.is_empty() {
                println!("  (none)");
            }
            for (name, server) in &file.servers {
                let auth = if server.password.is_some() {
                    "password".to_string()
                } else {
                    server
                        .key_file
                        .clone()
                        .unwrap_or_else(|| "default key / agent".to_string())
                };
                println!(
                    "  {}: {}@{}:{} ({}, {})",
                    name, server.username, server.host, server.port, server.os_type, auth
                );
            }
            println!();
            println!("Projects:");
            if file.projects.is_empty() {
                println!("  (none)");
            }
            for (name, project) in &file.projects {
                println!(
                    "  {}: {} -> {} (port {}, {}, ssl: {})",
                    name,
                    project.fqdn(),
                    project.app_dir(),
                    project.port,
                    project.process_manager.as_str(),
                    if project.ssl_enabled { "yes" } else { "no" }
                );
                if !project.env_vars.is_empty() {
                    let keys: Vec<&str> = project.env_vars.keys().map(String::as_str).collect();
                    println!("      env: {}", keys.join(", "));
                }
            }
        }
    }
    Ok(())
}
