//! Typed error hierarchy for launchpad.
//!
//! Four enums cover the subsystems:
//! - `TransportError`: running commands and moving files (local or SSH)
//! - `SiteError`: activating an nginx site
//! - `DeployError`: remote project deployment steps
//! - `HostingError`: the local hosting manager and its HTTP API
//!
//! A command that runs and exits non-zero is *not* a `TransportError`; it is
//! returned as a `CommandOutput` and the caller decides whether it matters.

use thiserror::Error;

/// Errors from the command execution layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {target}: {message}")]
    ConnectFailed { target: String, message: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    #[error("Transfer to {path} failed: {message}")]
    Transfer { path: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from writing, linking and validating an nginx site.
#[derive(Debug, Error)]
pub enum SiteError {
    #[error("Nginx configuration rejected: {0}")]
    Invalid(String),

    #[error("Failed to write site config {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("{step} failed: {message}")]
    Command { step: String, message: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from a remote project deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Step '{step}' failed with exit code {exit_code}: {stderr}")]
    StepFailed {
        step: String,
        exit_code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Site(#[from] SiteError),

    #[error("No package.json found in {0}")]
    MissingPackageJson(String),

    #[error("Source path {0} does not exist")]
    SourceMissing(std::path::PathBuf),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the local hosting manager.
#[derive(Debug, Error)]
pub enum HostingError {
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("Port must be between 1 and 65535, got {0}")]
    InvalidPort(i64),

    #[error("Invalid site type '{0}' (expected static, api, node or app)")]
    InvalidSiteType(String),

    #[error("Domain {0} not found or not active")]
    DomainNotFound(String),

    #[error("App {0} not found")]
    AppNotFound(String),

    #[error("{0} is not available on a read-only filesystem")]
    ReadOnly(String),

    #[error(transparent)]
    Site(#[from] SiteError),

    #[error("{action} failed: {message}")]
    CommandFailed { action: String, message: String },

    #[error("Registry error: {0}")]
    Registry(#[source] anyhow::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HostingError {
    /// Whether the error was caused by the caller's input rather than the host.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            HostingError::InvalidDomain(_)
                | HostingError::InvalidPort(_)
                | HostingError::InvalidSiteType(_)
                | HostingError::ReadOnly(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HostingError::DomainNotFound(_) | HostingError::AppNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Timeout {
            command: "npm install".to_string(),
            secs: 300,
        };
        assert_eq!(err.to_string(), "Command timed out after 300s: npm install");
    }

    #[test]
    fn test_deploy_error_from_transport() {
        let err: DeployError = TransportError::ConnectFailed {
            target: "deploy@example.com:22".to_string(),
            message: "Permission denied".to_string(),
        }
        .into();
        assert!(matches!(err, DeployError::Transport(_)));
        assert!(err.to_string().contains("deploy@example.com:22"));
    }

    #[test]
    fn test_hosting_error_classification() {
        assert!(HostingError::InvalidPort(0).is_client_error());
        assert!(HostingError::ReadOnly("SSL".into()).is_client_error());
        assert!(!HostingError::DomainNotFound("a.com".into()).is_client_error());
        assert!(HostingError::DomainNotFound("a.com".into()).is_not_found());
        assert!(!HostingError::Site(SiteError::Invalid("x".into())).is_not_found());
    }

    #[test]
    fn test_site_error_passes_through() {
        let err: HostingError = SiteError::Invalid("unknown directive \"bogus\"".into()).into();
        assert_eq!(
            err.to_string(),
            "Nginx configuration rejected: unknown directive \"bogus\""
        );
    }

    #[test]
    fn test_step_failed_display() {
        let err = DeployError::StepFailed {
            step: "npm install".to_string(),
            exit_code: 1,
            stderr: "ERESOLVE".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'npm install' failed with exit code 1: ERESOLVE"
        );
    }
}
