use std::path::PathBuf;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtleRadioFactory;
use crate::device::connection::{radio_channel, spawn_session};
use crate::device::session::SessionOptions;
use crate::device::types::{ConnectionState, PublishedState};
use crate::error::AppRunError;

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Connects to a bluetooth heart rate sensor and prints the measured heart rate.", long_about = None)]
pub struct Args {
    /// Read the config from this file instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Connect to the device with this name or identifier as soon as it is found
    #[arg(long)]
    pub select: Option<String>,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: LevelFilter,
}

fn describe_connection(state: &PublishedState) -> Option<String> {
    let device = state.selected.as_ref()?;

    let description = match state.connection_state {
        ConnectionState::Idle => return None,
        ConnectionState::Connecting => format!("Connecting to {}…", device),
        ConnectionState::DiscoveringServices | ConnectionState::DiscoveringCharacteristics => {
            format!("Looking for the heart rate service of {}…", device)
        },
        ConnectionState::Subscribed => format!("Connected to {}", device),
    };
    Some(description)
}

/// Prints what changed between two published states.
fn report(previous: &PublishedState, current: &PublishedState) {
    if previous.adapter_state != current.adapter_state {
        println!("Bluetooth: {:?}", current.adapter_state);
    }

    if previous.is_scanning != current.is_scanning {
        println!("{}", if current.is_scanning { "Scanning…" } else { "Scanning stopped" });
    }

    if previous.devices != current.devices && !current.devices.is_empty() {
        println!("Devices:");
        for device in &current.devices {
            println!("  {}", device);
        }
    }

    if previous.selected != current.selected || previous.connection_state != current.connection_state {
        match describe_connection(current) {
            Some(description) => println!("{}", description),
            None => println!("Not connected"),
        }
    }

    if previous.heart_rate != current.heart_rate {
        if let Some(sample) = current.heart_rate {
            println!("♥ {} bpm", sample.bpm);
        }
    }
}

async fn load_config(config_io: &ConfigIO) -> Result<Config, AppRunError> {
    info!("Using config file {}", config_io.path().to_string_lossy());
    let config = config_io.read().await?;
    Ok(config)
}

async fn monitor(config_io: ConfigIO, args: Args) -> Result<(), AppRunError> {
    let mut config = load_config(&config_io).await?;
    if let Some(select) = args.select {
        config.auto_select = Some(select);
    }

    let cancel = CancellationToken::new();
    let (radio_sender, radio_receiver) = radio_channel();
    let factory = BtleRadioFactory::new(radio_sender, cancel.clone());
    let (handle, join_handle) = spawn_session(cancel.clone(), factory, radio_receiver, SessionOptions::from(&config));

    let mut state = handle.subscribe();
    let mut previous = PublishedState::default();

    'mainloop: loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!("Failed to listen for ctrl-c: {}", err);
                }
                info!("Stopping");
                break 'mainloop;
            },
            changed = state.changed() => {
                if changed.is_err() {
                    warn!("Session stopped unexpectedly");
                    break 'mainloop;
                }
                let current = state.borrow_and_update().clone();
                report(&previous, &current);
                previous = current;
            },
        }
    }

    cancel.cancel();
    if let Err(err) = join_handle.await {
        error!("Session task failed: {}", err);
    }

    Ok(())
}

pub fn run_application(args: Args) -> Result<(), AppRunError> {
    let mut config_io = ConfigIO::new_sync(args.config.clone())?;
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(monitor(config_io, args))
}
