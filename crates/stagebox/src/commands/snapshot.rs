//! Snapshot and audit command handlers.

use owo_colors::OwoColorize;
use stagebox_core::audit::{AuditStatus, SnapshotStore};
use tabled::Tabled;

use crate::cli::{AuditArgs, OutputFormat, SnapshotCommand};
use crate::commands::Context;
use crate::error::CliError;
use crate::output;

pub async fn handle(
    ctx: &Context,
    cmd: SnapshotCommand,
    format: OutputFormat,
) -> Result<(), CliError> {
    let store = SnapshotStore::new(ctx.settings.snapshot.clone());

    match cmd {
        SnapshotCommand::Take => {
            let targets = ctx.registry.snapshot();
            println!("scanning {} registered device(s)...", targets.len());
            let (path, snapshot) = store.take(&targets, ctx.factory.as_ref()).await?;
            if format == OutputFormat::Json {
                return output::print_json(&snapshot);
            }
            println!(
                "wrote {} ({} of {} devices answered)",
                path.display(),
                snapshot.devices.len(),
                targets.len()
            );
            Ok(())
        }

        SnapshotCommand::List => {
            let files = store.list()?;
            if format == OutputFormat::Json {
                return output::print_json(&files);
            }
            for file in &files {
                println!("{}", file.display());
            }
            println!("{} snapshot(s)", files.len());
            Ok(())
        }
    }
}

#[derive(Tabled)]
struct AuditRow {
    #[tabled(rename = "MAC")]
    mac: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Differences")]
    differences: String,
}

pub async fn audit(ctx: &Context, args: AuditArgs, format: OutputFormat) -> Result<(), CliError> {
    let store = SnapshotStore::new(ctx.settings.snapshot.clone());

    let reference_path = match args.snapshot {
        Some(path) => path,
        None => store.latest()?.ok_or_else(|| CliError::NoSnapshot {
            dir: ctx.settings.snapshot.dir.display().to_string(),
        })?,
    };
    let reference = store.load(&reference_path)?;

    println!(
        "auditing against {} ({} devices)...",
        reference_path.display(),
        reference.devices.len()
    );
    let targets = ctx.registry.snapshot();
    let report = store.audit(&targets, &reference, ctx.factory.as_ref()).await;

    if format == OutputFormat::Json {
        return output::print_json(&report);
    }

    let rows: Vec<AuditRow> = report
        .devices
        .iter()
        .map(|device| AuditRow {
            mac: device.mac.to_string(),
            status: match device.status {
                AuditStatus::Ok => "ok".green().to_string(),
                AuditStatus::Changed => "changed".yellow().to_string(),
                AuditStatus::Offline => "offline".red().to_string(),
                AuditStatus::New => "new".cyan().to_string(),
            },
            ip: device.ip.map(|ip| ip.to_string()).unwrap_or_default(),
            name: device.name.clone().unwrap_or_default(),
            differences: device.differences.join("; "),
        })
        .collect();
    output::print_table(rows);
    println!(
        "{} ok, {} changed, {} offline, {} new",
        report.count(AuditStatus::Ok),
        report.count(AuditStatus::Changed),
        report.count(AuditStatus::Offline),
        report.count(AuditStatus::New)
    );

    if report.count(AuditStatus::Changed) + report.count(AuditStatus::Offline) > 0 {
        std::process::exit(crate::error::exit_code::GENERAL);
    }
    Ok(())
}
