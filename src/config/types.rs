use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::{DISCONNECT_RESCAN_DELAY, SCAN_RESTART_DELAY, SESSION_RECREATE_DELAY};

/// Delays (milliseconds) used to sequence teardown before restarting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timings {
    /// Scan restart after a disconnect request while nothing was connected.
    pub disconnect_rescan_ms: u64,
    /// Scan restart after an explicit rescan.
    pub scan_restart_ms: u64,
    /// Adapter session recreation after a hard reset.
    pub session_recreate_ms: u64,
}

impl Timings {
    pub fn disconnect_rescan(&self) -> Duration {
        Duration::from_millis(self.disconnect_rescan_ms)
    }

    pub fn scan_restart(&self) -> Duration {
        Duration::from_millis(self.scan_restart_ms)
    }

    pub fn session_recreate(&self) -> Duration {
        Duration::from_millis(self.session_recreate_ms)
    }
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            disconnect_rescan_ms: DISCONNECT_RESCAN_DELAY,
            scan_restart_ms: SCAN_RESTART_DELAY,
            session_recreate_ms: SESSION_RECREATE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub timings: Timings,
    /// Name or identifier of a device to connect to as soon as it is discovered.
    pub auto_select: Option<String>,
}
