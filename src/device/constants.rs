use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/**
 * The standard Bluetooth SIG Heart Rate service.
 */
pub const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180D);

/**
 * The Heart Rate Measurement characteristic, notify only.
 */
pub const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2A37);

/**
 * How long (milliseconds) to wait before scanning again after a disconnect request while
 * nothing was connected.
 */
pub const DISCONNECT_RESCAN_DELAY: u64 = 100;

/**
 * How long (milliseconds) to wait before scanning again after an explicit scan restart.
 */
pub const SCAN_RESTART_DELAY: u64 = 500;

/**
 * How long (milliseconds) to wait before recreating the adapter session after a hard reset.
 * Tearing down and recreating too quickly races the platform bluetooth stack.
 */
pub const SESSION_RECREATE_DELAY: u64 = 600;

/**
 * How long (milliseconds) the unfiltered scan that surfaces the permission prompt may run.
 */
pub const AUTHORIZATION_PROBE_DURATION: u64 = 100;

/**
 * Buffer size of the command channel between a SessionHandle and the session task.
 */
pub const COMMAND_CHANNEL_SIZE: usize = 16;
