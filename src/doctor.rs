//! Troubleshooting checks for an nginx/Node.js host.
//!
//! Runs read-only probes through any [`CommandRunner`] and groups the
//! findings into sections. Problems that break serving are collected as
//! issues; things worth a look are warnings.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::deploy::parse_pm2_jlist;
use crate::errors::TransportError;
use crate::exec::{CommandOutput, CommandRunner, Privilege};
use crate::util::tail_lines;

const REQUIRED_PORTS: [u16; 3] = [80, 443, 22];
const DIRECTORIES: [&str; 4] = [
    "/var/www",
    "/etc/nginx/sites-available",
    "/etc/nginx/sites-enabled",
    "/var/log/nginx",
];

pub const QUICK_FIXES: &[&str] = &[
    "Restart nginx: sudo systemctl restart nginx",
    "Check config: sudo nginx -t",
    "View error logs: sudo tail -f /var/log/nginx/error.log",
    "Check PM2 status: pm2 status",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub status: Status,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub title: String,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub target: String,
    pub started_at: String,
    pub sections: Vec<Section>,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl DoctorReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty() && self.warnings.is_empty()
    }

    fn section(&mut self, title: &str) {
        self.sections.push(Section {
            title: title.to_string(),
            findings: Vec::new(),
        });
    }

    fn note(&mut self, status: Status, message: impl Into<String>) {
        if let Some(section) = self.sections.last_mut() {
            section.findings.push(Finding {
                status,
                message: message.into(),
            });
        }
    }

    fn issue(&mut self, message: impl Into<String>, summary: impl Into<String>) {
        self.note(Status::Error, message);
        self.issues.push(summary.into());
    }

    fn warn(&mut self, message: impl Into<String>, summary: impl Into<String>) {
        self.note(Status::Warning, message);
        self.warnings.push(summary.into());
    }
}

pub struct Doctor<'a> {
    runner: &'a dyn CommandRunner,
    public_host: Option<String>,
}

impl<'a> Doctor<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            public_host: None,
        }
    }

    /// Also probe `http://{host}` from the target.
    pub fn public_host(mut self, host: &str) -> Self {
        self.public_host = Some(host.to_string());
        self
    }

    pub async fn run(&self) -> Result<DoctorReport, TransportError> {
        tracing::info!(host = %self.runner.describe(), "running diagnostics");
        let mut report = DoctorReport {
            target: self.runner.describe(),
            started_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            sections: Vec::new(),
            issues: Vec::new(),
            warnings: Vec::new(),
        };

        self.system(&mut report).await?;
        self.services(&mut report).await?;
        self.nginx_config(&mut report).await?;
        self.ports(&mut report).await?;
        self.firewall(&mut report).await?;
        self.certificates(&mut report).await?;
        self.pm2(&mut report).await?;
        self.directories(&mut report).await?;
        self.logs(&mut report).await?;
        self.connectivity(&mut report).await?;

        tracing::info!(
            issues = report.issues.len(),
            warnings = report.warnings.len(),
            "diagnostics finished"
        );
        Ok(report)
    }

    async fn sh(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.runner.run(command, Privilege::User).await
    }

    async fn sudo(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.runner.run(command, Privilege::Sudo).await
    }

    async fn system(&self, report: &mut DoctorReport) -> Result<(), TransportError> {
        report.section("System");
        let out = self.sh("uname -a").await?;
        if out.success() {
            report.note(Status::Info, format!("System: {}", out.stdout_trimmed()));
        }
        let out = self.sh("uptime").await?;
        if out.success() {
            report.note(Status::Info, format!("Uptime: {}", out.stdout_trimmed()));
        }
        let out = self.sh("df -h /").await?;
        if out.success() {
            if let Some(usage) = disk_usage(&out.stdout) {
                report.note(Status::Info, format!("Disk usage: {}", usage));
            }
        }
        let out = self.sh("free -h").await?;
        if out.success() {
            if let Some((used, total)) = memory_usage(&out.stdout) {
                report.note(Status::Info, format!("Memory: {} used / {} total", used, total));
            }
        }
        Ok(())
    }

    async fn services(&self, report: &mut DoctorReport) -> Result<(), TransportError> {
        report.section("Services");
        let out = self.sh("systemctl is-active nginx").await?;
        if out.success() && out.stdout_trimmed() == "active" {
            report.note(Status::Ok, "nginx service is running");
        } else {
            report.issue("nginx service is not running", "nginx service not active");
        }
        if self.sh("systemctl is-enabled nginx").await?.success() {
            report.note(Status::Ok, "nginx is enabled on boot");
        } else {
            report.warn("nginx is not enabled on boot", "nginx not enabled for auto-start");
        }
        Ok(())
    }

    async fn nginx_config(&self, report: &mut DoctorReport) -> Result<(), TransportError> {
        report.section("Nginx configuration");
        let out = self.sudo("nginx -t").await?;
        if out.success() {
            report.note(Status::Ok, "nginx configuration is valid");
        } else {
            let error = out.error_text();
            report.issue(
                format!("nginx configuration error: {}", error),
                format!("nginx config error: {}", error),
            );
        }

        let out = self.sh("ls /etc/nginx/sites-enabled/ 2>/dev/null").await?;
        let sites: Vec<&str> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if out.success() && !sites.is_empty() {
            report.note(Status::Info, format!("Active sites: {}", sites.len()));
            for site in sites {
                report.note(Status::Info, format!("  - {}", site));
            }
        } else {
            report.warn("No sites enabled", "No sites configured");
        }
        Ok(())
    }

    async fn ports(&self, report: &mut DoctorReport) -> Result<(), TransportError> {
        report.section("Ports");
        let out = self
            .sudo("ss -tlnp 2>/dev/null || netstat -tlnp 2>/dev/null")
            .await?;
        let listening = listening_ports(&out.stdout);
        for port in REQUIRED_PORTS {
            if listening.contains(&port) {
                report.note(Status::Ok, format!("Port {} is listening", port));
            } else {
                report.warn(
                    format!("Port {} not listening", port),
                    format!("Port {} not accessible", port),
                );
            }
        }
        Ok(())
    }

    async fn firewall(&self, report: &mut DoctorReport) -> Result<(), TransportError> {
        report.section("Firewall");
        let out = self.sudo("ufw status").await?;
        if !out.success() {
            report.note(Status::Error, "Could not check firewall status");
            return Ok(());
        }
        if !out.stdout.contains("Status: active") {
            report.warn("UFW firewall is inactive", "Firewall is not active");
            return Ok(());
        }
        report.note(Status::Ok, "UFW firewall is active");
        for port in REQUIRED_PORTS {
            if firewall_allows(&out.stdout, port) {
                report.note(Status::Ok, format!("Port {} is allowed in firewall", port));
            } else {
                report.warn(
                    format!("Port {} not allowed in firewall", port),
                    format!("Port {} not in firewall rules", port),
                );
            }
        }
        Ok(())
    }

    async fn certificates(&self, report: &mut DoctorReport) -> Result<(), TransportError> {
        report.section("SSL certificates");
        if !self.sh("which certbot").await?.success() {
            report.warn(
                "Certbot is not installed",
                "Certbot not installed - SSL not available",
            );
            return Ok(());
        }
        report.note(Status::Ok, "Certbot is installed");
        let out = self.sudo("certbot certificates").await?;
        if !out.success() {
            report.note(Status::Warning, "Could not list certificates");
        } else if out.stdout.contains("No certificates found") {
            report.note(Status::Info, "No SSL certificates found");
        } else {
            for line in out.stdout.lines().map(str::trim).filter(|l| {
                l.starts_with("Certificate Name:") || l.starts_with("Domains:") || l.starts_with("Expiry Date:")
            }) {
                report.note(Status::Info, format!("  {}", line));
            }
        }
        Ok(())
    }

    async fn pm2(&self, report: &mut DoctorReport) -> Result<(), TransportError> {
        report.section("PM2 processes");
        if !self.sh("which pm2").await?.success() {
            report.warn(
                "PM2 is not installed",
                "PM2 not installed - process management not available",
            );
            return Ok(());
        }
        report.note(Status::Ok, "PM2 is installed");
        let out = self.sh("pm2 jlist").await?;
        if !out.success() {
            report.note(Status::Warning, "Could not list PM2 processes");
            return Ok(());
        }
        let processes = parse_pm2_jlist(&out.stdout);
        if processes.is_empty() {
            report.note(Status::Info, "No PM2 processes running");
        }
        for p in processes {
            let status = if p.status == "online" {
                Status::Ok
            } else {
                Status::Warning
            };
            report.note(status, format!("  - {}: {} ({} restarts)", p.name, p.status, p.restarts));
        }
        Ok(())
    }

    async fn directories(&self, report: &mut DoctorReport) -> Result<(), TransportError> {
        report.section("Directories");
        for dir in DIRECTORIES {
            if !self.sh(&format!("test -d {}", dir)).await?.success() {
                report.issue(
                    format!("{} does not exist", dir),
                    format!("Missing directory: {}", dir),
                );
                continue;
            }
            let perms = self.sh(&format!("stat -c '%a' {}", dir)).await?;
            if perms.success() {
                report.note(
                    Status::Ok,
                    format!("{} exists (permissions: {})", dir, perms.stdout_trimmed()),
                );
            } else {
                report.note(Status::Ok, format!("{} exists", dir));
            }
        }
        Ok(())
    }

    async fn logs(&self, report: &mut DoctorReport) -> Result<(), TransportError> {
        report.section("Logs");
        let out = self.sudo("tail -n 20 /var/log/nginx/error.log").await?;
        if out.success() && !out.stdout.trim().is_empty() {
            report.note(Status::Warning, "Recent nginx errors found:");
            for line in tail_lines(&out.stdout, 5).lines() {
                report.note(Status::Warning, format!("  {}", line));
            }
        } else {
            report.note(Status::Ok, "No recent nginx errors");
        }
        Ok(())
    }

    async fn connectivity(&self, report: &mut DoctorReport) -> Result<(), TransportError> {
        report.section("Connectivity");
        let probe = |url: &str| format!("curl -s -o /dev/null -w '%{{http_code}}' {}", url);

        let out = self.sh(&probe("http://localhost")).await?;
        if out.success() {
            let code = out.stdout_trimmed();
            let status = if is_healthy_http(code) { Status::Ok } else { Status::Warning };
            report.note(status, format!("Local nginx responds with HTTP {}", code));
        } else {
            report.issue("Local nginx not responding", "nginx not responding locally");
        }

        if let Some(host) = &self.public_host {
            let out = self.sh(&probe(&format!("http://{}", host))).await?;
            if out.success() {
                let code = out.stdout_trimmed();
                let status = if is_healthy_http(code) { Status::Ok } else { Status::Warning };
                report.note(status, format!("External nginx responds with HTTP {}", code));
            } else {
                report.note(Status::Warning, "External nginx not responding");
            }
        }
        Ok(())
    }
}

fn is_healthy_http(code: &str) -> bool {
    matches!(code, "200" | "301" | "302")
}

/// `Use%` of the root filesystem from `df -h /`.
fn disk_usage(df: &str) -> Option<String> {
    df.lines().nth(1)?.split_whitespace().nth(4).map(str::to_string)
}

/// `(used, total)` from the `Mem:` row of `free -h`.
fn memory_usage(free: &str) -> Option<(String, String)> {
    let row = free.lines().find(|l| l.starts_with("Mem:"))?;
    let cols: Vec<&str> = row.split_whitespace().collect();
    Some((cols.get(2)?.to_string(), cols.get(1)?.to_string()))
}

/// Local ports from `ss -tlnp` or `netstat -tlnp`; both put the local
/// address in the fourth column.
fn listening_ports(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|addr| addr.rsplit_once(':'))
        .filter_map(|(_, port)| port.parse().ok())
        .collect()
}

fn firewall_allows(ufw: &str, port: u16) -> bool {
    let by_profile = match port {
        22 => ufw.contains("OpenSSH") || ufw.lines().any(|l| l.trim_start().starts_with("ssh")),
        80 => ufw.contains("Nginx Full") || ufw.contains("Nginx HTTP"),
        443 => ufw.contains("Nginx Full") || ufw.contains("Nginx HTTPS"),
        _ => false,
    };
    by_profile
        || ufw.lines().any(|l| {
            l.split_whitespace()
                .next()
                .is_some_and(|rule| rule == port.to_string() || rule == format!("{}/tcp", port))
        })
}
