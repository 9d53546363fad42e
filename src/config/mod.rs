//! Configuration loading.
//!
//! - `deploy`: server and project profiles for remote deployments (YAML/JSON)
//! - `hosting`: layered settings for the local hosting manager (TOML + env)

pub mod deploy;
pub mod hosting;

pub use deploy::{
    DEFAULT_DEPLOY_FILE, DeployFile, OsFamily, ProjectProfile, ServerProfile, load_env_file,
    parse_env_pairs,
};
pub use hosting::{DEFAULT_HOSTING_CONFIG, HostingConfig, HostingSettings};
