use indexmap::IndexMap;

use crate::device::types::{Device, DeviceId};

/// Peripherals seen during the current scan, deduplicated by identifier.
///
/// Entries are only ever dropped all at once through `reset`; a device that walks out of range
/// stays listed until the next scan restart.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: IndexMap<DeviceId, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    pub fn reset(&mut self) {
        self.devices.clear();
    }

    /// Returns true if the registry changed.
    pub fn upsert(&mut self, id: DeviceId, display_name: Option<String>) -> bool {
        match self.devices.get_mut(&id) {
            Some(existing) => {
                if existing.display_name == display_name {
                    return false;
                }
                existing.display_name = display_name;
                true
            },
            None => {
                self.devices.insert(id.clone(), Device::new(id, display_name));
                true
            },
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices ordered by display name (ordinal, case-sensitive), then by identifier.
    pub fn sorted(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| {
            a.sort_name().cmp(b.sort_name()).then_with(|| a.id.cmp(&b.id))
        });
        devices
    }
}
