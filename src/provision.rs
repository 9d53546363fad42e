//! Server provisioning.
//!
//! Installs and configures the stack a Next.js deployment needs: system
//! updates, Node.js from NodeSource, nginx with a tuned main config, PM2,
//! certbot, a firewall and a `deploy` user. Each command's failure is logged
//! and recorded in the report; only losing the connection aborts the run.

use serde::Serialize;

use crate::config::OsFamily;
use crate::errors::TransportError;
use crate::exec::{CommandRunner, Privilege};
use crate::render::nginx::render_main_config;
use crate::render::process::pm2_startup_command;
use crate::util::truncate;

const NGINX_CONF: &str = "/etc/nginx/nginx.conf";

/// Outcome of one named step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl StepReport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            failures: Vec::new(),
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.ok = false;
        self.failures.push(message.into());
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    pub steps: Vec<StepReport>,
}

impl ProvisionReport {
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.ok)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| !s.ok)
            .map(|s| s.name.as_str())
            .collect()
    }
}

pub struct Provisioner<'a> {
    runner: &'a dyn CommandRunner,
    os: OsFamily,
    node_version: String,
    deploy_user: String,
}

impl<'a> Provisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, os: OsFamily) -> Self {
        Self {
            runner,
            os,
            node_version: "18".to_string(),
            deploy_user: "deploy".to_string(),
        }
    }

    pub fn node_version(mut self, version: &str) -> Self {
        self.node_version = version.to_string();
        self
    }

    fn install(&self, packages: &str) -> String {
        if self.os.is_debian_like() {
            format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {}", packages)
        } else {
            format!("yum install -y {}", packages)
        }
    }

    fn nginx_user(&self) -> &'static str {
        if self.os.is_debian_like() { "www-data" } else { "nginx" }
    }

    pub fn update_commands(&self) -> Vec<String> {
        if self.os.is_debian_like() {
            vec![
                "DEBIAN_FRONTEND=noninteractive apt-get update && DEBIAN_FRONTEND=noninteractive apt-get upgrade -y"
                    .to_string(),
            ]
        } else {
            vec!["yum update -y".to_string()]
        }
    }

    pub fn nodejs_commands(&self) -> Vec<String> {
        let repo = if self.os.is_debian_like() { "deb" } else { "rpm" };
        vec![
            format!(
                "curl -fsSL https://{}.nodesource.com/setup_{}.x | bash -",
                repo, self.node_version
            ),
            self.install("nodejs"),
            "npm install -g npm@latest".to_string(),
        ]
    }

    pub fn certbot_commands(&self) -> Vec<String> {
        if self.os.is_debian_like() {
            vec![
                self.install("snapd"),
                "snap install core; snap refresh core".to_string(),
                "snap install --classic certbot".to_string(),
                "ln -sf /snap/bin/certbot /usr/bin/certbot".to_string(),
            ]
        } else {
            vec![
                self.install("epel-release"),
                self.install("certbot python3-certbot-nginx"),
            ]
        }
    }

    pub fn firewall_commands(&self) -> Vec<String> {
        if self.os.is_debian_like() {
            vec![
                "ufw allow ssh".to_string(),
                "ufw allow 'Nginx Full'".to_string(),
                "ufw --force enable".to_string(),
            ]
        } else {
            vec![
                "firewall-cmd --permanent --add-service=ssh --add-service=http --add-service=https"
                    .to_string(),
                "firewall-cmd --reload".to_string(),
            ]
        }
    }

    pub fn user_commands(&self) -> Vec<String> {
        let user = &self.deploy_user;
        let admin_group = if self.os.is_debian_like() { "sudo" } else { "wheel" };
        vec![
            format!("id -u {user} >/dev/null 2>&1 || useradd -m -s /bin/bash {user}"),
            format!("usermod -aG {admin_group} {user}"),
            format!("mkdir -p /home/{user}/.ssh"),
            format!("chown {user}:{user} /home/{user}/.ssh"),
            format!("chmod 700 /home/{user}/.ssh"),
        ]
    }

    /// Run every step in order.
    pub async fn run(&self) -> Result<ProvisionReport, TransportError> {
        tracing::info!(host = %self.runner.describe(), os = self.os.as_str(), "provisioning server");
        let mut report = ProvisionReport::default();

        report.steps.push(self.run_step("update", &self.update_commands()).await?);
        report.steps.push(self.run_step("nodejs", &self.nodejs_commands()).await?);
        report.steps.push(self.nginx_step().await?);
        report.steps.push(self.pm2_step().await?);
        report.steps.push(self.run_step("certbot", &self.certbot_commands()).await?);
        report.steps.push(self.run_step("firewall", &self.firewall_commands()).await?);
        report.steps.push(self.run_step("deploy user", &self.user_commands()).await?);

        if report.is_clean() {
            tracing::info!("server provisioned");
        } else {
            tracing::warn!(failed = ?report.failed_steps(), "server provisioned with failures");
        }
        Ok(report)
    }

    async fn run_step(&self, name: &str, commands: &[String]) -> Result<StepReport, TransportError> {
        tracing::info!(step = name, "provisioning step");
        let mut step = StepReport::new(name);
        for command in commands {
            self.run_soft(&mut step, command).await?;
        }
        Ok(step)
    }

    /// Run one command; a non-zero exit is recorded, not raised.
    async fn run_soft(&self, step: &mut StepReport, command: &str) -> Result<bool, TransportError> {
        let out = self.runner.run(command, Privilege::Sudo).await?;
        if !out.success() {
            let message = format!("{}: {}", command, truncate(&out.error_text(), 300));
            tracing::warn!(step = %step.name, command, exit_code = out.exit_code, "command failed");
            step.fail(message);
        }
        Ok(out.success())
    }

    async fn nginx_step(&self) -> Result<StepReport, TransportError> {
        tracing::info!(step = "nginx", "provisioning step");
        let mut step = StepReport::new("nginx");
        for command in [
            self.install("nginx"),
            "systemctl start nginx".to_string(),
            "systemctl enable nginx".to_string(),
            "mkdir -p /etc/nginx/sites-available /etc/nginx/sites-enabled".to_string(),
            format!("cp -p {NGINX_CONF} {NGINX_CONF}.launchpad-bak"),
        ] {
            self.run_soft(&mut step, &command).await?;
        }

        let config = render_main_config(self.nginx_user());
        if let Err(e) = self
            .runner
            .write_file(NGINX_CONF, config.as_bytes(), Privilege::Sudo)
            .await
        {
            step.fail(format!("write {}: {}", NGINX_CONF, e));
            return Ok(step);
        }

        if self.run_soft(&mut step, "nginx -t").await? {
            self.run_soft(&mut step, "systemctl reload nginx").await?;
        } else {
            tracing::warn!("tuned nginx.conf rejected, restoring previous config");
            self.run_soft(&mut step, &format!("cp -p {NGINX_CONF}.launchpad-bak {NGINX_CONF}"))
                .await?;
        }
        Ok(step)
    }

    async fn pm2_step(&self) -> Result<StepReport, TransportError> {
        tracing::info!(step = "pm2", "provisioning step");
        let mut step = StepReport::new("pm2");
        if !self.run_soft(&mut step, "npm install -g pm2").await? {
            return Ok(step);
        }
        let out = self
            .runner
            .run(&format!("pm2 startup systemd -u {0} --hp /home/{0}", self.deploy_user), Privilege::Sudo)
            .await?;
        // pm2 prints the command it wants run as root when it cannot run it itself.
        if let Some(follow_up) = pm2_startup_command(&out.stdout) {
            self.run_soft(&mut step, &follow_up).await?;
        } else if !out.success() {
            step.fail(format!("pm2 startup: {}", truncate(&out.error_text(), 300)));
        }
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;

    #[test]
    fn test_debian_and_centos_commands_differ() {
        let runner = FakeRunner::new();
        let debian = Provisioner::new(&runner, OsFamily::Ubuntu).node_version("20");
        assert!(debian.nodejs_commands()[0].contains("deb.nodesource.com/setup_20.x"));
        assert!(debian.certbot_commands().iter().any(|c| c.contains("snap install --classic certbot")));
        assert!(debian.user_commands()[1].contains("-aG sudo deploy"));

        let centos = Provisioner::new(&runner, OsFamily::Centos);
        assert_eq!(centos.update_commands(), vec!["yum update -y".to_string()]);
        assert!(centos.nodejs_commands()[0].contains("rpm.nodesource.com/setup_18.x"));
        assert!(centos.certbot_commands()[0].contains("epel-release"));
        assert!(centos.firewall_commands()[0].starts_with("firewall-cmd"));
    }

    #[tokio::test]
    async fn test_run_collects_failures_and_continues() {
        let runner = FakeRunner::new();
        runner.fail("ufw --force enable", "ERROR: problem running iptables");
        let report = Provisioner::new(&runner, OsFamily::Ubuntu).run().await.unwrap();

        assert_eq!(report.steps.len(), 7);
        assert_eq!(report.failed_steps(), vec!["firewall"]);
        assert!(!report.is_clean());
        // Steps after the failure still ran.
        assert!(runner.ran("useradd -m -s /bin/bash deploy"));
        assert!(runner.file(NGINX_CONF).unwrap().contains("user www-data;"));
    }

    #[tokio::test]
    async fn test_rejected_nginx_conf_is_restored() {
        let runner = FakeRunner::new();
        runner.fail("nginx -t", "nginx: [emerg] unknown directive");
        let report = Provisioner::new(&runner, OsFamily::Debian).run().await.unwrap();

        assert_eq!(report.failed_steps(), vec!["nginx"]);
        assert!(runner.ran("cp -p /etc/nginx/nginx.conf.launchpad-bak /etc/nginx/nginx.conf"));
        assert!(!runner.ran("systemctl reload nginx"));
    }

    #[tokio::test]
    async fn test_pm2_startup_follow_up_is_run() {
        let runner = FakeRunner::new();
        runner.respond(
            "pm2 startup",
            0,
            "[PM2] To setup the Startup Script, copy/paste the following command:\n\
             sudo env PATH=$PATH:/usr/bin pm2 startup systemd -u deploy --hp /home/deploy\n",
            "",
        );
        let report = Provisioner::new(&runner, OsFamily::Ubuntu).run().await.unwrap();
        assert!(report.is_clean());
        assert!(runner.ran("env PATH=$PATH:/usr/bin pm2 startup systemd -u deploy"));
        assert!(!runner.ran("sudo env"));
    }
}
