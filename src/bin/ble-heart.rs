use clap::Parser;
use log::info;
use ble_heart::{init_logging, run};
use ble_heart::application::Args;
use ble_heart::error::{AppRunError, ConfigError};

// CoreBluetooth refuses to start without NSBluetoothAlwaysUsageDescription, even when the binary
// is launched directly instead of from an app bundle.
#[cfg(target_os = "macos")]
embed_plist::embed_info_plist!(concat!(env!("OUT_DIR"), "/Info.plist"));

fn main() -> Result<(), AppRunError> {
    let args = Args::parse();
    init_logging(args.log_level)?;
    info!(concat!("BLE Heart ", env!("CARGO_PKG_VERSION")));

    match run(args) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("This application has already been started");
            Ok(())
        },
        result => result,
    }
}
