//! Stage command handlers.
//!
//! Stage 1 runs directly (it serializes onto one wireless interface);
//! stages 2 and 4 fan out device-by-device through the job tracker and
//! stream results as workers finish. Every stage ends with a single
//! registry save: stage 3 batches inside its runner, stages 2 and 4
//! collect edits from the workers and commit once the job is done.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use owo_colors::OwoColorize;
use serde_json::json;
use stagebox_core::job::{JobStage, JobState, JobStatus, JobTracker};
use stagebox_core::scan;
use stagebox_core::stage::stage1::{CycleOutcome, NmcliStation, Stage1Runner};
use stagebox_core::stage::stage2::{AdoptionEdit, AdoptionPlan, Stage2Runner};
use stagebox_core::stage::stage3::Stage3Runner;
use stagebox_core::stage::stage4::{ConfigureEdit, Stage4Runner};
use stagebox_core::stage::DeviceOutcome;
use stagebox_core::MacAddress;
use tokio_util::sync::CancellationToken;

use crate::cli::{OutputFormat, Stage1Args, StageArgs};
use crate::commands::{parse_mac_flag, Context};
use crate::error::CliError;
use crate::output;

const POLL_INTERVAL: Duration = Duration::from_millis(300);

// ── Stage 1 ─────────────────────────────────────────────────────────

pub async fn stage1(
    ctx: &Context,
    args: Stage1Args,
    format: OutputFormat,
) -> Result<(), CliError> {
    let station = NmcliStation::new(args.interface);
    let runner = Stage1Runner {
        registry: &ctx.registry,
        settings: &ctx.settings.stage1,
        station: &station,
        probe: ctx.probe.as_ref(),
        factory: ctx.factory.as_ref(),
        dry_run: args.dry_run,
        mac_filter: parse_mac_flag(args.mac.as_deref())?,
    };

    let reports = if args.run_loop {
        let cancel = CancellationToken::new();
        let handle = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("stopping after the current cycle...");
                handle.cancel();
            }
        });
        runner.run_loop(cancel).await?
    } else {
        match runner.run_once().await? {
            CycleOutcome::Provisioned(report) => vec![report],
            CycleOutcome::NothingFound => {
                println!("no device access point found");
                Vec::new()
            }
        }
    };

    if format == OutputFormat::Json {
        return output::print_json(&reports);
    }
    for report in &reports {
        output::print_outcome(&report.outcome);
        println!("  cycle ended in state {:?}", report.state);
    }
    let outcomes: Vec<DeviceOutcome> = reports.into_iter().map(|r| r.outcome).collect();
    summarize(&outcomes);
    if outcomes.iter().any(|o| !o.ok) {
        std::process::exit(crate::error::exit_code::GENERAL);
    }
    Ok(())
}

// ── Stage 2 ─────────────────────────────────────────────────────────

pub async fn stage2(
    ctx: &Context,
    args: StageArgs,
    format: OutputFormat,
) -> Result<(), CliError> {
    let mac_filter = parse_mac_flag(args.mac.as_deref())?;

    println!("scanning {}...", ctx.settings.network.cidr);
    let candidates = scan::scan_candidates(&ctx.settings.network)?;
    let found = scan::discover(candidates, ctx.factory.as_ref()).await;
    if found.is_empty() {
        println!("no devices to adopt");
        return Ok(());
    }
    println!("found {} device(s)", found.len());

    // All addresses are decided here, before any worker starts.
    let (plans, settled) = stage2_runner(ctx, args.dry_run).plan(&found, mac_filter.as_ref());
    if plans.is_empty() {
        return finish(format, &settled);
    }
    if format == OutputFormat::Table {
        for outcome in &settled {
            output::print_outcome(outcome);
        }
    }

    let plans: Arc<HashMap<String, AdoptionPlan>> = Arc::new(
        plans.into_iter().map(|p| (p.mac.to_string(), p)).collect(),
    );
    let edits: Arc<Mutex<Vec<AdoptionEdit>>> = Arc::new(Mutex::new(Vec::new()));

    let settings = Arc::clone(&ctx.settings);
    let registry = Arc::clone(&ctx.registry);
    let factory = Arc::clone(&ctx.factory);
    let probe = Arc::clone(&ctx.probe);
    let dry_run = args.dry_run;

    let tracker = JobTracker::new();
    let job_id = tracker.start(
        JobStage::Adopt,
        plans.keys().cloned().collect(),
        ctx.settings.concurrency,
        {
            let plans = Arc::clone(&plans);
            let edits = Arc::clone(&edits);
            move |device: String| {
                let plans = Arc::clone(&plans);
                let edits = Arc::clone(&edits);
                let settings = Arc::clone(&settings);
                let registry = Arc::clone(&registry);
                let factory = Arc::clone(&factory);
                let probe = Arc::clone(&probe);
                async move {
                    let Some(plan) = plans.get(&device) else {
                        return DeviceOutcome::error(device, "lost between planning and adoption");
                    };
                    let runner = Stage2Runner {
                        registry: &registry,
                        network: &settings.network,
                        wifi_profiles: &settings.wifi_profiles,
                        hostname_rules: &settings.hostname,
                        probe: probe.as_ref(),
                        factory: factory.as_ref(),
                        dry_run,
                    };
                    let (outcome, edit) = runner.execute_outcome(plan).await;
                    if let Some(edit) = edit {
                        lock(&edits).push(edit);
                    }
                    outcome
                }
            }
        },
    )?;

    let status = watch_job(&tracker, &job_id, format).await?;

    let pending = std::mem::take(&mut *lock(&edits));
    stage2_runner(ctx, args.dry_run).commit(&pending)?;

    if format == OutputFormat::Json {
        return output::print_json(&json!({ "settled": settled, "job": status }));
    }
    let mut outcomes = settled;
    outcomes.extend(status.results.iter().cloned());
    summarize(&outcomes);
    if outcomes.iter().any(|o| !o.ok) {
        std::process::exit(crate::error::exit_code::GENERAL);
    }
    Ok(())
}

fn stage2_runner<'a>(ctx: &'a Context, dry_run: bool) -> Stage2Runner<'a> {
    Stage2Runner {
        registry: &ctx.registry,
        network: &ctx.settings.network,
        wifi_profiles: &ctx.settings.wifi_profiles,
        hostname_rules: &ctx.settings.hostname,
        probe: ctx.probe.as_ref(),
        factory: ctx.factory.as_ref(),
        dry_run,
    }
}

// ── Stage 3 ─────────────────────────────────────────────────────────

pub async fn stage3(
    ctx: &Context,
    args: StageArgs,
    format: OutputFormat,
) -> Result<(), CliError> {
    let mac_filter = parse_mac_flag(args.mac.as_deref())?;
    let runner = Stage3Runner {
        registry: &ctx.registry,
        ota: &ctx.settings.ota,
        friendly: &ctx.settings.friendly,
        probe: ctx.probe.as_ref(),
        factory: ctx.factory.as_ref(),
        dry_run: args.dry_run,
    };
    let outcomes = runner.run(mac_filter.as_ref()).await?;
    finish(format, &outcomes)
}

// ── Stage 4 ─────────────────────────────────────────────────────────

pub async fn stage4(
    ctx: &Context,
    args: StageArgs,
    format: OutputFormat,
) -> Result<(), CliError> {
    let mac_filter = parse_mac_flag(args.mac.as_deref())?;

    let targets: Vec<String> = ctx
        .registry
        .snapshot()
        .into_keys()
        .filter(|mac| mac_filter.as_ref().is_none_or(|f| f == mac))
        .map(|mac| mac.to_string())
        .collect();
    if targets.is_empty() {
        println!("no registered devices to configure");
        return Ok(());
    }

    let edits: Arc<Mutex<Vec<ConfigureEdit>>> = Arc::new(Mutex::new(Vec::new()));
    let settings = Arc::clone(&ctx.settings);
    let registry = Arc::clone(&ctx.registry);
    let factory = Arc::clone(&ctx.factory);
    let probe = Arc::clone(&ctx.probe);
    let dry_run = args.dry_run;

    let tracker = JobTracker::new();
    let job_id = tracker.start(
        JobStage::Configure,
        targets,
        ctx.settings.concurrency,
        {
            let edits = Arc::clone(&edits);
            move |device: String| {
                let edits = Arc::clone(&edits);
                let settings = Arc::clone(&settings);
                let registry = Arc::clone(&registry);
                let factory = Arc::clone(&factory);
                let probe = Arc::clone(&probe);
                async move {
                    let mac = match MacAddress::parse(&device) {
                        Ok(mac) => mac,
                        Err(err) => return DeviceOutcome::error(device, err.to_string()),
                    };
                    let Some(record) = registry.get(&mac) else {
                        return DeviceOutcome::error(device, "not in registry");
                    };
                    let runner = Stage4Runner {
                        registry: &registry,
                        settings: &settings.stage4,
                        probe: probe.as_ref(),
                        factory: factory.as_ref(),
                        dry_run,
                    };
                    let (outcome, edit) = runner.configure_one(&mac, &record).await;
                    if let Some(edit) = edit {
                        lock(&edits).push(edit);
                    }
                    outcome
                }
            }
        },
    )?;

    let status = watch_job(&tracker, &job_id, format).await?;

    let pending = std::mem::take(&mut *lock(&edits));
    Stage4Runner {
        registry: &ctx.registry,
        settings: &ctx.settings.stage4,
        probe: ctx.probe.as_ref(),
        factory: ctx.factory.as_ref(),
        dry_run: args.dry_run,
    }
    .commit(&pending)?;

    if format == OutputFormat::Json {
        return output::print_json(&status);
    }
    summarize(&status.results);
    if status.status == JobState::Failed {
        std::process::exit(crate::error::exit_code::GENERAL);
    }
    Ok(())
}

// ── Job progress ────────────────────────────────────────────────────

/// Poll a job until it finishes, streaming results as they land.
async fn watch_job(
    tracker: &JobTracker,
    job_id: &str,
    format: OutputFormat,
) -> Result<JobStatus, CliError> {
    let mut printed = 0;
    loop {
        let status = tracker.status(job_id)?;
        if format == OutputFormat::Table {
            for outcome in &status.results[printed..] {
                output::print_outcome(outcome);
            }
            printed = status.results.len();
        }
        if status.status != JobState::Running {
            return Ok(status);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn finish(format: OutputFormat, outcomes: &[DeviceOutcome]) -> Result<(), CliError> {
    if format == OutputFormat::Json {
        return output::print_json(&outcomes);
    }
    for outcome in outcomes {
        output::print_outcome(outcome);
    }
    summarize(outcomes);
    if outcomes.iter().any(|o| !o.ok) {
        std::process::exit(crate::error::exit_code::GENERAL);
    }
    Ok(())
}

fn summarize(outcomes: &[DeviceOutcome]) {
    let ok = outcomes.iter().filter(|o| o.ok).count();
    let failed = outcomes.len() - ok;
    if failed == 0 {
        println!("{}: {ok} device(s)", "done".green());
    } else {
        println!("{}: {ok} ok, {failed} failed", "done".yellow());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
