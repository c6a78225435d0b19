use std::fmt;
use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of a peripheral as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub display_name: Option<String>,
}

impl Device {
    pub fn new(id: DeviceId, display_name: Option<String>) -> Self {
        Device { id, display_name }
    }

    /// The name used for sorting; an absent name sorts as the empty string.
    pub fn sort_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("")
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "<unnamed> ({})", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterState {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Whether the process may use bluetooth at all. Platforms without an authorization API always
/// report `Allowed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Authorization {
    Allowed,
    NotDetermined,
    Denied,
}

impl Authorization {
    pub fn permits_scan(self) -> bool {
        !matches!(self, Authorization::Denied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeartRateSample {
    pub bpm: u16,
}

/// Everything a front end needs to render the session. Only the session task writes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedState {
    pub devices: Vec<Device>,
    pub selected: Option<Device>,
    pub heart_rate: Option<HeartRateSample>,
    pub is_scanning: bool,
    pub adapter_state: AdapterState,
    pub connection_state: ConnectionState,
}

impl Default for PublishedState {
    fn default() -> Self {
        PublishedState {
            devices: Vec::new(),
            selected: None,
            heart_rate: None,
            is_scanning: false,
            adapter_state: AdapterState::Unknown,
            connection_state: ConnectionState::Idle,
        }
    }
}

/// Commands accepted from a front end. Each is a no-op when it does not apply to the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    StartScan,
    StopScan,
    RestartScan,
    SelectDevice(DeviceId),
    Disconnect,
}
