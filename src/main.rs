use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "launchpad")]
#[command(version, about = "Deploy Next.js sites behind nginx with PM2, systemd and Let's Encrypt")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// How to reach a remote server: a profile from the deploy file, or inline
/// connection flags.
#[derive(Args, Clone, Debug)]
pub struct RemoteArgs {
    /// Deployment config file (YAML or JSON)
    #[arg(long, default_value = launchpad::config::DEFAULT_DEPLOY_FILE)]
    pub config: PathBuf,

    /// Server profile name from the config file
    #[arg(long)]
    pub server: Option<String>,

    /// Server address (overrides --server)
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long, default_value = "root")]
    pub user: String,

    #[arg(long)]
    pub password: Option<String>,

    /// Private key file
    #[arg(long)]
    pub key: Option<String>,

    #[arg(long, default_value = "22")]
    pub ssh_port: u16,

    /// Server OS for inline connections: ubuntu, debian or centos
    #[arg(long, default_value = "ubuntu")]
    pub os: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision a server with Node.js, nginx, PM2, certbot and a firewall
    Setup {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Node.js major version to install
        #[arg(long, default_value = "18")]
        node_version: String,
    },
    /// Deploy a project directory or .zip archive to a server
    Deploy {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Project profile name from the config file
        #[arg(long)]
        project: Option<String>,

        /// Project directory or .zip archive
        #[arg(long)]
        path: PathBuf,

        /// Extra environment variable (KEY=VALUE), repeatable
        #[arg(long = "env")]
        env: Vec<String>,

        /// Read environment variables from a dotenv file
        #[arg(long)]
        env_file: Option<PathBuf>,

        /// Domain (overrides the profile; required without --project)
        #[arg(long)]
        domain: Option<String>,

        /// App port (overrides the profile)
        #[arg(long)]
        port: Option<u16>,

        /// Skip certificate issuance
        #[arg(long)]
        no_ssl: bool,

        /// Print the deployment report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List PM2 processes and deployed directories on a server
    List {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Directory holding deployed projects
        #[arg(long, default_value = "/var/www")]
        deploy_path: String,
    },
    /// Check that the server is reachable
    TestConnection {
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Run troubleshooting checks (locally unless a server is given)
    Doctor {
        #[command(flatten)]
        remote: RemoteArgs,

        #[arg(long)]
        json: bool,
    },
    /// Manage domains and apps hosted on this machine
    Host {
        /// Hosting config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Force read-only filesystem mode
        #[arg(long, conflicts_with = "writable")]
        readonly: bool,

        /// Force writable filesystem mode
        #[arg(long)]
        writable: bool,

        #[command(subcommand)]
        command: HostCommands,
    },
    /// Convert an HTML file into a React component
    Jsx {
        input: PathBuf,

        /// Output file (defaults to the input with a .jsx extension)
        output: Option<PathBuf>,

        /// Component name (defaults to one derived from the file name)
        #[arg(short = 'c', long)]
        component: Option<String>,

        /// Omit the React import
        #[arg(long)]
        no_imports: bool,
    },
    /// Create or inspect the deployment config file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum HostCommands {
    /// Prepare directories, packages, sudo rules, database and API service
    Setup,
    /// Create a site and point nginx at it
    Deploy {
        domain: String,
        port: i64,
        /// static, api, node or app
        #[arg(default_value = "static")]
        site_type: String,
    },
    /// Request a Let's Encrypt certificate for a domain
    Ssl { domain: String },
    /// Disable a domain (files are kept)
    Remove { domain: String },
    /// List active domains
    List,
    /// Show nginx, database and domain status
    Status,
    /// Serve the JSON control API
    Api {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Write a template deployment config
    Init {
        #[arg(long, default_value = launchpad::config::DEFAULT_DEPLOY_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the servers and projects in a deployment config
    Show {
        #[arg(long, default_value = launchpad::config::DEFAULT_DEPLOY_FILE)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _guard = match launchpad::logging::init(cli.verbose, cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(&cli).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Setup {
            remote,
            node_version,
        } => cmd::cmd_setup(remote, node_version).await?,
        Commands::Deploy {
            remote,
            project,
            path,
            env,
            env_file,
            domain,
            port,
            no_ssl,
            json,
        } => {
            let options = cmd::DeployOptions {
                project: project.clone(),
                path: path.clone(),
                env: env.clone(),
                env_file: env_file.clone(),
                domain: domain.clone(),
                port: *port,
                no_ssl: *no_ssl,
                json: *json,
            };
            cmd::cmd_deploy(remote, &options).await?;
        }
        Commands::List {
            remote,
            deploy_path,
        } => cmd::cmd_list(remote, deploy_path).await?,
        Commands::TestConnection { remote } => cmd::cmd_test_connection(remote).await?,
        Commands::Doctor { remote, json } => cmd::cmd_doctor(remote, *json).await?,
        Commands::Host {
            config,
            readonly,
            writable,
            command,
        } => {
            let manager = cmd::open_hosting(config.as_deref(), *readonly, *writable)?;
            cmd::cmd_host(manager, command.clone()).await?;
        }
        Commands::Jsx {
            input,
            output,
            component,
            no_imports,
        } => cmd::cmd_jsx(input, output.as_deref(), component.as_deref(), !*no_imports)?,
        Commands::Config { command } => cmd::cmd_config(command.clone())?,
    }

    Ok(())
}
