use futures::channel::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::device::types::{AdapterState, Authorization, DeviceId};

/// Results reported by a radio session. Every request on `RadioSession` is fire-and-forget; its
/// outcome (if any) arrives later as one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    AdapterStateChanged(AdapterState),
    Discovered { id: DeviceId, name: Option<String> },
    Connected(DeviceId),
    ConnectFailed(DeviceId),
    Disconnected(DeviceId),
    ServicesDiscovered { id: DeviceId, services: Vec<Uuid> },
    CharacteristicsDiscovered { id: DeviceId, service: Uuid, characteristics: Vec<Uuid> },
    DiscoveryFailed(DeviceId),
    Subscribed { id: DeviceId, characteristic: Uuid },
    SubscribeFailed(DeviceId),
    Notification { id: DeviceId, characteristic: Uuid, value: Vec<u8> },
}

/// A radio event tagged with the session that produced it, so that late events from a torn
/// down session can be told apart from those of its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioMessage {
    pub generation: u64,
    pub event: RadioEvent,
}

pub type RadioEventSender = UnboundedSender<RadioMessage>;

/// One adapter session. Dropping it stops scanning and disconnects every peripheral it connected.
pub trait RadioSession: Send {
    fn authorization(&self) -> Authorization {
        Authorization::Allowed
    }

    /// Scan for peripherals advertising any of `services`; an empty slice scans for everything.
    fn start_scan(&mut self, services: &[Uuid]);
    fn stop_scan(&mut self);
    fn connect(&mut self, id: &DeviceId);
    fn cancel_connection(&mut self, id: &DeviceId);
    fn discover_services(&mut self, id: &DeviceId, services: &[Uuid]);
    fn discover_characteristics(&mut self, id: &DeviceId, service: Uuid, characteristics: &[Uuid]);
    fn subscribe(&mut self, id: &DeviceId, service: Uuid, characteristic: Uuid);
}

/// Creates fresh adapter sessions. A session reports its events on the sender it was created
/// with, tagged with the given generation.
pub trait RadioFactory: Send {
    fn create(&mut self, generation: u64) -> Box<dyn RadioSession>;
}
