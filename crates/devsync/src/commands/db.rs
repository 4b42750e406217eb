use libdevsync_core::{check_log, DevsyncError, IntegrityReport, VerifyReport};
use serde::Serialize;
use crate::cli::{Cli, DbCommand};
use crate::context::DevsyncContext;
use crate::output::{output_success, output_with};

#[derive(Serialize)]
struct QuarantineOutput {
    device_id: String,
    moved_to: String,
    event_count: usize,
    fingerprint: String,
}

pub fn run(cli: &Cli, cmd: DbCommand) -> Result<(), DevsyncError> {
    match cmd {
        DbCommand::Stats => run_stats(cli),
        DbCommand::Check => run_check(cli),
        DbCommand::Verify => run_verify(cli),
        DbCommand::Quarantine { device } => run_quarantine(cli, device),
    }
}

fn run_stats(cli: &Cli) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    let store = ctx.replica.open_store()?;
    let policy = ctx.replica.config().rebuild.clone().unwrap_or_default();

    let stats = store.stats(&ctx.sled_path(), &policy)?;
    output_success(cli, stats);
    Ok(())
}

fn run_check(cli: &Cli) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    let report = check_log(ctx.replica.log())?;
    output_with(cli, report, print_check);
    Ok(())
}

fn print_check(report: &IntegrityReport) {
    println!("Checked {} events in {} segments", report.events_checked, report.segments);
    for issue in &report.corrupt_segments {
        println!("CORRUPT {} line {}: {}", issue.device_id, issue.line, issue.reason);
    }
    for gap in &report.seq_gaps {
        println!(
            "gap in {}: seq {} to {} missing",
            gap.device_id,
            gap.missing_from,
            gap.resumes_at.saturating_sub(1)
        );
    }
    for (kind, count) in &report.unknown_kinds {
        println!("unknown kind {} ({} events)", kind, count);
    }
    for device in &report.torn_tails {
        println!("torn tail in {} (repaired on next append)", device);
    }
    if report.is_healthy() && !report.has_warnings() {
        println!("OK");
    }
}

fn run_verify(cli: &Cli) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    let report = ctx.replica.verify()?;
    output_with(cli, report, print_verify);
    Ok(())
}

fn print_verify(report: &VerifyReport) {
    match &report.cached {
        None => println!("No cached state; replay gives {}", report.replayed),
        Some(_) if report.matches => println!("Cache matches replay ({})", report.replayed),
        Some(cached) if report.cache_behind => {
            println!("Cache is behind the log ({} vs {}); it catches up on next read", cached, report.replayed)
        }
        Some(cached) => {
            println!("Cache differs from replay ({} vs {})", cached, report.replayed);
            println!("Run 'devsync rebuild' to recreate it");
        }
    }
}

fn run_quarantine(cli: &Cli, device: String) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    // Later appends would reuse seqs other devices already hold
    if device == ctx.device_id() {
        return Err(DevsyncError::InvalidArgs(format!(
            "{} is this device; its own segment cannot be quarantined",
            device
        )));
    }

    let moved_to = ctx.replica.log().quarantine(&device)?;
    let report = ctx.replica.rebuild()?;

    output_with(
        cli,
        QuarantineOutput {
            device_id: device,
            moved_to: moved_to.to_string_lossy().to_string(),
            event_count: report.event_count,
            fingerprint: report.fingerprint,
        },
        |out| {
            println!("Moved segment of {} to {}", out.device_id, out.moved_to);
            println!("Rebuilt from {} events; run 'devsync rebuild --resync' to re-fetch it", out.event_count);
        },
    );
    Ok(())
}
