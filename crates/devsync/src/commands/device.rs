use comfy_table::{presets::UTF8_FULL, Table};
use libdevsync_core::{DevsyncError, DeviceRecord, DeviceRegistry};
use serde::Serialize;
use crate::cli::{Cli, DeviceCommand};
use crate::context::DevsyncContext;
use crate::output::output_with;

#[derive(Serialize)]
struct DeviceShowOutput {
    device_id: String,
    label: Option<String>,
    created_ts: Option<u64>,
    /// Own events in the local log
    local_seq: u64,
    registry: DeviceRecord,
}

#[derive(Serialize)]
struct DeviceInfo {
    device_id: String,
    /// Highest seq held locally
    seq: u64,
    /// Highest seq recorded by the last pull (own device: last push)
    synced: u64,
    current: bool,
}

#[derive(Serialize)]
struct DeviceListOutput {
    devices: Vec<DeviceInfo>,
}

pub fn run(cli: &Cli, cmd: DeviceCommand) -> Result<(), DevsyncError> {
    match cmd {
        DeviceCommand::Show => run_show(cli),
        DeviceCommand::List => run_list(cli),
    }
}

fn run_show(cli: &Cli) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    let device = ctx.replica.device();
    let local_seq = ctx.replica.log().frontier()?.get(ctx.device_id()).copied().unwrap_or(0);

    let store = ctx.replica.open_store()?;
    let registry = DeviceRegistry::new(&store, ctx.device_id()).record()?;

    output_with(
        cli,
        DeviceShowOutput {
            device_id: device.device_id.clone(),
            label: device.label.clone(),
            created_ts: device.created_ts,
            local_seq,
            registry,
        },
        |out| {
            println!("Device:      {}", out.device_id);
            if let Some(label) = &out.label {
                println!("Label:       {}", label);
            }
            println!("Local seq:   {}", out.local_seq);
            println!("Last pushed: {}", out.registry.last_pushed);
            for (device, seq) in &out.registry.last_synced {
                println!("Pulled:      {} up to {}", device, seq);
            }
        },
    );
    Ok(())
}

fn run_list(cli: &Cli) -> Result<(), DevsyncError> {
    let ctx = DevsyncContext::resolve(cli)?;
    let frontier = ctx.replica.log().frontier()?;
    let store = ctx.replica.open_store()?;
    let record = DeviceRegistry::new(&store, ctx.device_id()).record()?;

    let mut devices: Vec<DeviceInfo> = frontier
        .into_iter()
        .map(|(device_id, seq)| {
            let current = device_id == ctx.device_id();
            let synced = if current {
                record.last_pushed
            } else {
                record.last_synced.get(&device_id).copied().unwrap_or(0)
            };
            DeviceInfo { device_id, seq, synced, current }
        })
        .collect();
    if !devices.iter().any(|d| d.current) {
        devices.push(DeviceInfo {
            device_id: ctx.device_id().to_string(),
            seq: 0,
            synced: record.last_pushed,
            current: true,
        });
    }

    output_with(cli, DeviceListOutput { devices }, |out| {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Device", "Local seq", "Synced", ""]);
        for device in &out.devices {
            table.add_row(vec![
                device.device_id.clone(),
                device.seq.to_string(),
                device.synced.to_string(),
                if device.current { "this device".to_string() } else { String::new() },
            ]);
        }
        println!("{}", table);
    });
    Ok(())
}
