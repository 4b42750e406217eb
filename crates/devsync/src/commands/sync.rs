//! Push, pull and sync commands

use libdevsync_core::DevsyncError;
use libdevsync_sync::{PullReport, PushReport, Remote};
use crate::cli::Cli;
use crate::context::DevsyncContext;
use crate::output::{output_with, print_human};

pub fn run_push(cli: &Cli) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    let mut transport = ctx.transport()?;
    let report = transport.push()?;
    output_with(cli, report, print_push);
    Ok(())
}

pub fn run_pull(cli: &Cli) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    let mut transport = ctx.transport()?;
    let report = transport.pull()?;
    output_with(cli, report, print_pull);
    Ok(())
}

pub fn run_sync(cli: &Cli) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    let mut transport = ctx.transport()?;
    print_human(cli, &format!("Syncing with {}", transport.remote().describe()));
    let report = transport.sync()?;
    output_with(cli, report, |report| {
        print_pull(&report.pull);
        print_push(&report.push);
    });
    Ok(())
}

fn print_push(report: &PushReport) {
    if report.conflicts > 0 {
        println!("Remote moved during push, pulled and retried {} time(s)", report.conflicts);
    }
    if report.pushed > 0 {
        println!("Pushed {} events (remote head {})", report.pushed, report.remote_head);
    } else {
        println!("Nothing to push");
    }
}

fn print_pull(report: &PullReport) {
    for device in &report.quarantined {
        println!("Skipped corrupt segment from {} (saved to quarantine)", device);
    }
    if report.applied > 0 {
        println!("Pulled {} new events", report.applied);
    } else {
        println!("Already up to date");
    }
    if report.rejected > 0 {
        println!("Rejected {} events that broke their device's ordering", report.rejected);
    }
    if report.cache_deferred {
        println!("State cache busy; it will catch up on next read");
    }
}
