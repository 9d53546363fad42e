//! Troubleshooting command: `launchpad doctor`.

use anyhow::Result;
use console::style;

use launchpad::doctor::{Doctor, DoctorReport, QUICK_FIXES, Status};
use launchpad::exec::LocalRunner;

use super::super::RemoteArgs;
use super::remote::{connect, has_server, resolve_server};

pub async fn cmd_doctor(remote: &RemoteArgs, json: bool) -> Result<()> {
    let report = if has_server(remote) {
        let (server, _) = resolve_server(remote)?;
        let runner = connect(&server).await?;
        Doctor::new(&runner).public_host(&server.host).run().await?
    } else {
        Doctor::new(&LocalRunner::new()).run().await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &DoctorReport) {
    println!(
        "{}",
        style(format!("launchpad doctor - {} ({})", report.target, report.started_at)).bold()
    );
    for section in &report.sections {
        println!();
        println!("{}", style(&section.title).bold().cyan());
        for finding in &section.findings {
            let mark = match finding.status {
                Status::Ok => style("✓").green(),
                Status::Info => style("·").dim(),
                Status::Warning => style("!").yellow(),
                Status::Error => style("✗").red(),
            };
            println!("  {} {}", mark, finding.message);
        }
    }

    println!();
    if report.is_healthy() {
        println!("{}", style("All checks passed.").green().bold());
        return;
    }
    if !report.issues.is_empty() {
        println!("{}", style(format!("{} issue(s):", report.issues.len())).red().bold());
        for issue in &report.issues {
            println!("  - {}", issue);
        }
    }
    if !report.warnings.is_empty() {
        println!("{}", style(format!("{} warning(s):", report.warnings.len())).yellow().bold());
        for warning in &report.warnings {
            println!("  - {}", warning);
        }
    }
    println!();
    println!("Quick fixes:");
    for fix in QUICK_FIXES {
        println!("  • {}", fix);
    }
}
