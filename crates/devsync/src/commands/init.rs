use libdevsync_core::config::config_path;
use libdevsync_core::{DevsyncError, Replica};
use serde::Serialize;
use crate::cli::Cli;
use crate::context::DevsyncContext;
use crate::output::output_with;

#[derive(Serialize)]
struct InitOutput {
    device_id: String,
    label: Option<String>,
    data_dir: String,
    config: String,
    restore_pending: bool,
}

pub fn run(cli: &Cli, device_id: Option<String>, label: Option<String>) -> Result<(), DevsyncError> {
    let data_dir = DevsyncContext::data_dir(cli)?;
    let replica = Replica::init(&data_dir, device_id, label)?;

    let output = InitOutput {
        device_id: replica.device_id().to_string(),
        label: replica.device().label.clone(),
        data_dir: data_dir.to_string_lossy().to_string(),
        config: config_path(&data_dir).to_string_lossy().to_string(),
        restore_pending: replica.restore_pending()?,
    };

    output_with(cli, output, |out| {
        println!("Initialized device {} in {}", out.device_id, out.data_dir);
        if out.restore_pending {
            println!("Events already published as {} are taken over on the first sync", out.device_id);
        }
    });
    Ok(())
}
