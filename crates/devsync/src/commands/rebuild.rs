use libdevsync_core::{DevsyncError, RebuildReport};
use libdevsync_sync::PullReport;
use serde::Serialize;
use crate::cli::Cli;
use crate::context::DevsyncContext;
use crate::output::{output_with, print_human};

#[derive(Serialize)]
struct RebuildOutput {
    #[serde(flatten)]
    report: RebuildReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    resync: Option<PullReport>,
}

pub fn run(cli: &Cli, resync: bool) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;

    // Segments missing locally (quarantined ones) have no frontier, so a
    // plain pull fetches them whole.
    let resync = if resync {
        if ctx.replica.config().remote.is_some() {
            print_human(cli, "Re-fetching missing segments from the remote");
            Some(ctx.transport()?.pull()?)
        } else {
            print_human(cli, "No remote configured, rebuilding from the local log only");
            None
        }
    } else {
        None
    };

    let report = ctx.replica.rebuild()?;

    output_with(cli, RebuildOutput { report, resync }, |out| {
        if let Some(pull) = &out.resync {
            println!("Fetched {} events, {} new", pull.fetched, pull.applied);
        }
        println!(
            "Rebuilt: {} events, {} live projects",
            out.report.event_count, out.report.live_projects
        );
        for device in &out.report.corrupt_segments {
            println!("Skipped corrupt segment {}; run 'devsync db quarantine {}'", device, device);
        }
        println!("Fingerprint: {}", out.report.fingerprint);
    });
    Ok(())
}
