use std::time::Duration;
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::config::types::{Config, Timings};
use crate::device::constants::{AUTHORIZATION_PROBE_DURATION, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
use crate::device::decoder::decode_sample;
use crate::device::radio::{RadioEvent, RadioFactory, RadioMessage, RadioSession};
use crate::device::registry::DeviceRegistry;
use crate::device::types::{
    AdapterState, Authorization, ConnectionState, Device, DeviceId, HeartRateSample, PublishedState, SessionCommand,
};

/// Deferred continuations. The session never sleeps itself; whoever drives it fires these after
/// the requested delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    StartScan,
    RecreateSession,
    EndAuthorizationProbe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimer {
    pub delay: Duration,
    pub timer: Timer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub timings: Timings,
    pub auto_select: Option<String>,
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        SessionOptions {
            timings: config.timings,
            auto_select: config.auto_select.clone(),
        }
    }
}

#[derive(Debug)]
struct Link {
    device: Device,
    // never Idle, an idle link is represented by the absence of a Link
    state: ConnectionState,
}

/// Owns all bluetooth state. Every command, radio event and timer is applied here, one at a
/// time, which is what keeps the single-connection and scan/connect exclusion rules intact.
pub struct Session<F: RadioFactory> {
    factory: F,
    radio: Box<dyn RadioSession>,
    generation: u64,
    options: SessionOptions,

    adapter_state: AdapterState,
    registry: DeviceRegistry,
    scanning: bool,
    probing: bool,
    // set between a hard reset and the replacement session, the old radio takes no new work
    resetting: bool,
    link: Option<Link>,
    heart_rate: Option<HeartRateSample>,

    pending_timers: Vec<ScheduledTimer>,
    state_tx: watch::Sender<PublishedState>,
}

impl<F: RadioFactory> Session<F> {
    pub fn new(mut factory: F, options: SessionOptions) -> (Self, watch::Receiver<PublishedState>) {
        let (state_tx, state_rx) = watch::channel(PublishedState::default());
        let radio = factory.create(0);

        let session = Session {
            factory,
            radio,
            generation: 0,
            options,
            adapter_state: AdapterState::Unknown,
            registry: DeviceRegistry::new(),
            scanning: false,
            probing: false,
            resetting: false,
            link: None,
            heart_rate: None,
            pending_timers: Vec::new(),
            state_tx,
        };

        (session, state_rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> PublishedState {
        PublishedState {
            devices: self.registry.sorted(),
            selected: self.link.as_ref().map(|link| link.device.clone()),
            heart_rate: self.heart_rate,
            is_scanning: self.scanning,
            adapter_state: self.adapter_state,
            connection_state: self.connection_state(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.as_ref().map_or(ConnectionState::Idle, |link| link.state)
    }

    /// Timers requested since the last call.
    pub fn take_timers(&mut self) -> Vec<ScheduledTimer> {
        std::mem::take(&mut self.pending_timers)
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        debug!("Command {:?}", command);

        match command {
            SessionCommand::StartScan => self.start_scan(),
            SessionCommand::StopScan => self.stop_scan(),
            SessionCommand::RestartScan => self.restart_scan(self.options.timings.scan_restart()),
            SessionCommand::SelectDevice(id) => self.select_device(&id),
            SessionCommand::Disconnect => self.disconnect(),
        }

        self.publish();
    }

    pub fn handle_timer(&mut self, timer: Timer) {
        debug!("Timer {:?}", timer);

        match timer {
            Timer::StartScan => self.start_scan(),
            Timer::RecreateSession => self.recreate_session(),
            Timer::EndAuthorizationProbe => {
                if self.probing {
                    self.probing = false;
                    if !self.scanning {
                        self.radio.stop_scan();
                    }
                }
            },
        }

        self.publish();
    }

    pub fn handle_radio(&mut self, message: RadioMessage) {
        if message.generation != self.generation {
            debug!("Ignoring event from session {}: {:?}", message.generation, message.event);
            return;
        }

        match message.event {
            RadioEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            RadioEvent::Discovered { id, name } => self.on_discovered(id, name),
            RadioEvent::Connected(id) => {
                if self.link_in(&id, ConnectionState::Connecting) {
                    info!("Connected to {}; Discovering services...", id);
                    // the scan may have been restarted by the platform while connecting
                    self.stop_scan();
                    self.set_link_state(ConnectionState::DiscoveringServices);
                    self.radio.discover_services(&id, &[HEART_RATE_SERVICE]);
                }
                else if !self.is_selected(&id) {
                    // a connect that completed after its cancellation
                    debug!("Dropping late connection to {}", id);
                    self.radio.cancel_connection(&id);
                }
            },
            RadioEvent::ConnectFailed(id) => {
                if self.is_selected(&id) {
                    warn!("Connecting to {} failed", id);
                    self.hard_reset();
                }
            },
            RadioEvent::Disconnected(id) => {
                if self.is_selected(&id) {
                    warn!("Connection to {} lost", id);
                    self.hard_reset();
                }
            },
            RadioEvent::ServicesDiscovered { id, services } => {
                if self.link_in(&id, ConnectionState::DiscoveringServices) {
                    if services.contains(&HEART_RATE_SERVICE) {
                        self.set_link_state(ConnectionState::DiscoveringCharacteristics);
                        self.radio.discover_characteristics(&id, HEART_RATE_SERVICE, &[HEART_RATE_MEASUREMENT]);
                    }
                    else {
                        warn!("{} does not expose the heart rate service", id);
                    }
                }
            },
            RadioEvent::CharacteristicsDiscovered { id, service, characteristics } => {
                if self.link_in(&id, ConnectionState::DiscoveringCharacteristics) {
                    if service == HEART_RATE_SERVICE && characteristics.contains(&HEART_RATE_MEASUREMENT) {
                        info!("Subscribing to heart rate measurements of {}", id);
                        self.radio.subscribe(&id, HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT);
                    }
                    else {
                        warn!("{} does not expose the heart rate measurement characteristic", id);
                    }
                }
            },
            RadioEvent::DiscoveryFailed(id) => {
                if self.is_selected(&id) {
                    warn!("Discovery on {} failed", id);
                }
            },
            RadioEvent::Subscribed { id, characteristic } => {
                if characteristic == HEART_RATE_MEASUREMENT && self.link_in(&id, ConnectionState::DiscoveringCharacteristics) {
                    info!("Receiving heart rate from {}", id);
                    self.set_link_state(ConnectionState::Subscribed);
                }
            },
            RadioEvent::SubscribeFailed(id) => {
                if self.is_selected(&id) {
                    warn!("Subscribing to {} failed", id);
                }
            },
            RadioEvent::Notification { id, characteristic, value } => {
                if characteristic == HEART_RATE_MEASUREMENT && self.link_in(&id, ConnectionState::Subscribed) {
                    match decode_sample(&value) {
                        Some(sample) => self.heart_rate = Some(sample),
                        None => debug!("Dropping malformed heart rate measurement {:?}", value),
                    }
                }
            },
        }

        self.publish();
    }

    fn publish(&self) {
        let next = self.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn schedule(&mut self, delay: Duration, timer: Timer) {
        self.pending_timers.push(ScheduledTimer { delay, timer });
    }

    fn is_selected(&self, id: &DeviceId) -> bool {
        self.link.as_ref().is_some_and(|link| &link.device.id == id)
    }

    fn link_in(&self, id: &DeviceId, state: ConnectionState) -> bool {
        self.link.as_ref().is_some_and(|link| &link.device.id == id && link.state == state)
    }

    fn set_link_state(&mut self, state: ConnectionState) {
        if let Some(link) = self.link.as_mut() {
            if link.state == ConnectionState::Subscribed && state != ConnectionState::Subscribed {
                self.heart_rate = None;
            }
            link.state = state;
        }
    }

    /// Drops the selection; the sample goes with it.
    fn clear_link(&mut self) -> Option<Link> {
        self.heart_rate = None;
        self.link.take()
    }

    fn start_scan(&mut self) {
        if self.resetting {
            debug!("Not scanning while the bluetooth session is being recreated");
            return;
        }
        if self.adapter_state != AdapterState::PoweredOn {
            debug!("Not scanning, adapter is {:?}", self.adapter_state);
            return;
        }
        if !self.radio.authorization().permits_scan() {
            debug!("Not scanning, bluetooth access is denied");
            return;
        }
        if self.link.is_some() {
            debug!("Not scanning while a device is selected");
            return;
        }
        if self.scanning {
            return;
        }

        info!("Scanning for heart rate sensors...");
        self.scanning = true;
        self.probing = false;
        self.registry.reset();
        self.radio.stop_scan();
        self.radio.start_scan(&[HEART_RATE_SERVICE]);
    }

    fn stop_scan(&mut self) {
        if self.scanning {
            info!("Scanning stopped");
            self.radio.stop_scan();
            self.scanning = false;
        }
    }

    fn restart_scan(&mut self, delay: Duration) {
        self.stop_scan();
        self.registry.reset();
        self.schedule(delay, Timer::StartScan);
    }

    fn select_device(&mut self, id: &DeviceId) {
        if self.resetting {
            debug!("Not connecting while the bluetooth session is being recreated");
            return;
        }
        if self.adapter_state != AdapterState::PoweredOn {
            debug!("Not connecting, adapter is {:?}", self.adapter_state);
            return;
        }

        let device = match self.registry.get(id) {
            Some(device) => device.clone(),
            None => {
                warn!("Can not select unknown device {}", id);
                return;
            },
        };

        if self.is_selected(id) {
            debug!("{} is already selected", id);
            return;
        }

        if let Some(previous) = self.clear_link() {
            info!("Releasing {}", previous.device);
            self.radio.cancel_connection(&previous.device.id);
        }

        self.stop_scan();
        info!("Connecting to {}...", device);
        self.radio.connect(&device.id);
        self.link = Some(Link { device, state: ConnectionState::Connecting });
    }

    fn disconnect(&mut self) {
        if self.link.is_some() {
            info!("Disconnecting");
            self.hard_reset();
        }
        else {
            self.heart_rate = None;
            self.restart_scan(self.options.timings.disconnect_rescan());
        }
    }

    /// Tears everything down and recreates the adapter session after a delay. There is no
    /// reconnect to the same peripheral in the same session.
    fn hard_reset(&mut self) {
        info!("Resetting bluetooth session");
        self.stop_scan();
        if let Some(link) = self.clear_link() {
            self.radio.cancel_connection(&link.device.id);
        }
        self.registry.reset();
        self.resetting = true;
        self.schedule(self.options.timings.session_recreate(), Timer::RecreateSession);
    }

    fn recreate_session(&mut self) {
        self.generation += 1;
        info!("Recreating bluetooth session {}", self.generation);

        // a second reset may fire after the first one already produced a working session
        if let Some(link) = self.clear_link() {
            self.radio.cancel_connection(&link.device.id);
        }
        self.registry.reset();
        self.scanning = false;
        self.probing = false;
        self.resetting = false;
        self.adapter_state = AdapterState::Unknown;

        // dropping the old session tears it down
        self.radio = self.factory.create(self.generation);
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        info!("Adapter state: {:?}", state);
        self.adapter_state = state;

        if state == AdapterState::PoweredOn {
            self.start_scan();
        }
        else {
            self.stop_scan();
            self.registry.reset();
            if let Some(link) = self.clear_link() {
                self.radio.cancel_connection(&link.device.id);
            }
        }

        if self.radio.authorization() == Authorization::NotDetermined && !self.scanning && !self.probing && !self.resetting {
            // a short unfiltered scan makes the platform ask the user for bluetooth access
            debug!("Bluetooth access not determined, probing");
            self.probing = true;
            self.radio.start_scan(&[]);
            self.schedule(Duration::from_millis(AUTHORIZATION_PROBE_DURATION), Timer::EndAuthorizationProbe);
        }
    }

    fn on_discovered(&mut self, id: DeviceId, name: Option<String>) {
        if !self.scanning {
            return;
        }

        if self.registry.upsert(id.clone(), name.clone()) {
            debug!("Discovered {} {:?}", id, name);
        }

        let wanted = match &self.options.auto_select {
            Some(wanted) => wanted,
            None => return,
        };

        if self.link.is_none() && (name.as_deref() == Some(wanted.as_str()) || id.as_str() == wanted) {
            info!("Automatically selecting {}", id);
            self.select_device(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Create(u64),
        StartScan(Vec<Uuid>),
        StopScan,
        Connect(DeviceId),
        CancelConnection(DeviceId),
        DiscoverServices(DeviceId, Vec<Uuid>),
        DiscoverCharacteristics(DeviceId, Uuid, Vec<Uuid>),
        Subscribe(DeviceId, Uuid, Uuid),
    }

    type Calls = Arc<Mutex<Vec<Call>>>;

    struct FakeRadio {
        calls: Calls,
        authorization: Arc<Mutex<Authorization>>,
    }

    impl FakeRadio {
        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl RadioSession for FakeRadio {
        fn authorization(&self) -> Authorization {
            *self.authorization.lock().unwrap()
        }

        fn start_scan(&mut self, services: &[Uuid]) {
            self.record(Call::StartScan(services.to_vec()));
        }

        fn stop_scan(&mut self) {
            self.record(Call::StopScan);
        }

        fn connect(&mut self, id: &DeviceId) {
            self.record(Call::Connect(id.clone()));
        }

        fn cancel_connection(&mut self, id: &DeviceId) {
            self.record(Call::CancelConnection(id.clone()));
        }

        fn discover_services(&mut self, id: &DeviceId, services: &[Uuid]) {
            self.record(Call::DiscoverServices(id.clone(), services.to_vec()));
        }

        fn discover_characteristics(&mut self, id: &DeviceId, service: Uuid, characteristics: &[Uuid]) {
            self.record(Call::DiscoverCharacteristics(id.clone(), service, characteristics.to_vec()));
        }

        fn subscribe(&mut self, id: &DeviceId, service: Uuid, characteristic: Uuid) {
            self.record(Call::Subscribe(id.clone(), service, characteristic));
        }
    }

    struct FakeFactory {
        calls: Calls,
        authorization: Arc<Mutex<Authorization>>,
    }

    impl RadioFactory for FakeFactory {
        fn create(&mut self, generation: u64) -> Box<dyn RadioSession> {
            self.calls.lock().unwrap().push(Call::Create(generation));
            Box::new(FakeRadio { calls: self.calls.clone(), authorization: self.authorization.clone() })
        }
    }

    struct Harness {
        session: Session<FakeFactory>,
        calls: Calls,
        authorization: Arc<Mutex<Authorization>>,
    }

    impl Harness {
        fn new() -> Self {
            Harness::with_options(SessionOptions::default())
        }

        fn with_options(options: SessionOptions) -> Self {
            let calls: Calls = Arc::new(Mutex::new(Vec::new()));
            let authorization = Arc::new(Mutex::new(Authorization::Allowed));
            let factory = FakeFactory { calls: calls.clone(), authorization: authorization.clone() };
            let (session, _) = Session::new(factory, options);
            Harness { session, calls, authorization }
        }

        fn event(&mut self, event: RadioEvent) {
            let generation = self.session.generation();
            self.session.handle_radio(RadioMessage { generation, event });
        }

        fn take_calls(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn powered_on(&mut self) {
            self.event(RadioEvent::AdapterStateChanged(AdapterState::PoweredOn));
        }

        fn discover(&mut self, id: &str, name: Option<&str>) {
            self.event(RadioEvent::Discovered { id: DeviceId::from(id), name: name.map(String::from) });
        }

        fn subscribe_to(&mut self, id: &str) {
            let id = DeviceId::from(id);
            self.session.handle_command(SessionCommand::SelectDevice(id.clone()));
            self.event(RadioEvent::Connected(id.clone()));
            self.event(RadioEvent::ServicesDiscovered { id: id.clone(), services: vec![HEART_RATE_SERVICE] });
            self.event(RadioEvent::CharacteristicsDiscovered {
                id: id.clone(),
                service: HEART_RATE_SERVICE,
                characteristics: vec![HEART_RATE_MEASUREMENT],
            });
            self.event(RadioEvent::Subscribed { id, characteristic: HEART_RATE_MEASUREMENT });
        }

        fn notify(&mut self, id: &str, value: &[u8]) {
            self.event(RadioEvent::Notification {
                id: DeviceId::from(id),
                characteristic: HEART_RATE_MEASUREMENT,
                value: value.to_vec(),
            });
        }

        fn fire_timers(&mut self) -> Vec<Timer> {
            let timers: Vec<Timer> = self.session.take_timers().into_iter().map(|t| t.timer).collect();
            for timer in &timers {
                self.session.handle_timer(*timer);
            }
            timers
        }
    }

    #[test]
    fn powered_on_starts_filtered_scan() {
        let mut h = Harness::new();
        assert_eq!(h.take_calls(), vec![Call::Create(0)]);

        h.powered_on();
        assert!(h.session.state().is_scanning);
        assert_eq!(h.take_calls(), vec![Call::StopScan, Call::StartScan(vec![HEART_RATE_SERVICE])]);
    }

    #[test]
    fn commands_are_ignored_until_powered_on() {
        let mut h = Harness::new();
        h.take_calls();

        h.session.handle_command(SessionCommand::StartScan);
        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("a")));
        assert!(h.take_calls().is_empty());
        assert!(!h.session.state().is_scanning);
    }

    #[test]
    fn start_scan_while_scanning_is_a_noop() {
        let mut h = Harness::new();
        h.powered_on();
        h.take_calls();

        h.session.handle_command(SessionCommand::StartScan);
        assert!(h.take_calls().is_empty());
    }

    #[test]
    fn denied_authorization_prevents_scanning() {
        let mut h = Harness::new();
        *h.authorization.lock().unwrap() = Authorization::Denied;
        h.powered_on();
        assert!(!h.session.state().is_scanning);
    }

    #[test]
    fn undetermined_authorization_is_probed_with_unfiltered_scan() {
        let mut h = Harness::new();
        *h.authorization.lock().unwrap() = Authorization::NotDetermined;
        h.take_calls();

        h.event(RadioEvent::AdapterStateChanged(AdapterState::Unauthorized));
        assert_eq!(h.take_calls(), vec![Call::StartScan(vec![])]);
        assert!(!h.session.state().is_scanning);

        // discoveries from the probe do not populate the list
        h.discover("a", Some("Polar"));
        assert!(h.session.state().devices.is_empty());

        assert_eq!(h.fire_timers(), vec![Timer::EndAuthorizationProbe]);
        assert_eq!(h.take_calls(), vec![Call::StopScan]);
    }

    #[test]
    fn discovered_devices_are_listed_sorted() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("2", Some("Wahoo"));
        h.discover("1", Some("Polar"));
        h.discover("2", Some("Garmin"));
        h.discover("3", None);

        let names: Vec<Option<String>> = h.session.state().devices.into_iter().map(|d| d.display_name).collect();
        assert_eq!(names, vec![None, Some("Garmin".to_string()), Some("Polar".to_string())]);
    }

    #[test]
    fn full_handshake_reaches_subscribed() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.take_calls();

        let id = DeviceId::from("a");
        h.session.handle_command(SessionCommand::SelectDevice(id.clone()));
        assert_eq!(h.session.connection_state(), ConnectionState::Connecting);
        assert!(!h.session.state().is_scanning);
        assert_eq!(h.take_calls(), vec![Call::StopScan, Call::Connect(id.clone())]);

        h.event(RadioEvent::Connected(id.clone()));
        assert_eq!(h.session.connection_state(), ConnectionState::DiscoveringServices);
        assert_eq!(h.take_calls(), vec![Call::DiscoverServices(id.clone(), vec![HEART_RATE_SERVICE])]);

        h.event(RadioEvent::ServicesDiscovered { id: id.clone(), services: vec![Uuid::nil(), HEART_RATE_SERVICE] });
        assert_eq!(h.session.connection_state(), ConnectionState::DiscoveringCharacteristics);
        assert_eq!(
            h.take_calls(),
            vec![Call::DiscoverCharacteristics(id.clone(), HEART_RATE_SERVICE, vec![HEART_RATE_MEASUREMENT])],
        );

        h.event(RadioEvent::CharacteristicsDiscovered {
            id: id.clone(),
            service: HEART_RATE_SERVICE,
            characteristics: vec![HEART_RATE_MEASUREMENT],
        });
        assert_eq!(h.take_calls(), vec![Call::Subscribe(id.clone(), HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT)]);
        assert_eq!(h.session.connection_state(), ConnectionState::DiscoveringCharacteristics);

        h.event(RadioEvent::Subscribed { id: id.clone(), characteristic: HEART_RATE_MEASUREMENT });
        assert_eq!(h.session.connection_state(), ConnectionState::Subscribed);

        let state = h.session.state();
        assert_eq!(state.selected.map(|d| d.id), Some(id));
        assert_eq!(state.heart_rate, None);
    }

    #[test]
    fn notifications_update_heart_rate() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.subscribe_to("a");

        h.notify("a", &[0x00, 0x4B]);
        assert_eq!(h.session.state().heart_rate, Some(HeartRateSample { bpm: 75 }));

        h.notify("a", &[0x01, 0x46, 0x00]);
        assert_eq!(h.session.state().heart_rate, Some(HeartRateSample { bpm: 70 }));

        // malformed payloads keep the previous sample
        h.notify("a", &[0x01, 0x46]);
        h.notify("a", &[]);
        assert_eq!(h.session.state().heart_rate, Some(HeartRateSample { bpm: 70 }));
    }

    #[test]
    fn notifications_before_subscribed_are_ignored() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("a")));
        h.event(RadioEvent::Connected(DeviceId::from("a")));

        h.notify("a", &[0x00, 0x4B]);
        assert_eq!(h.session.state().heart_rate, None);
    }

    #[test]
    fn missing_service_stalls_silently() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("a")));
        h.event(RadioEvent::Connected(DeviceId::from("a")));
        h.take_calls();

        h.event(RadioEvent::ServicesDiscovered { id: DeviceId::from("a"), services: vec![Uuid::nil()] });
        h.event(RadioEvent::DiscoveryFailed(DeviceId::from("a")));
        h.event(RadioEvent::SubscribeFailed(DeviceId::from("a")));

        assert_eq!(h.session.connection_state(), ConnectionState::DiscoveringServices);
        assert!(h.take_calls().is_empty());
        assert!(h.session.take_timers().is_empty());
    }

    #[test]
    fn selecting_another_device_keeps_a_single_connection() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.discover("b", Some("Wahoo"));
        h.subscribe_to("a");
        h.notify("a", &[0x00, 0x50]);
        h.take_calls();

        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("b")));
        assert_eq!(
            h.take_calls(),
            vec![Call::CancelConnection(DeviceId::from("a")), Call::Connect(DeviceId::from("b"))],
        );

        let state = h.session.state();
        assert_eq!(state.selected.map(|d| d.id), Some(DeviceId::from("b")));
        assert_eq!(state.connection_state, ConnectionState::Connecting);
        assert_eq!(state.heart_rate, None);

        // the cancelled link reports its disconnect; that is not a failure of the new one
        h.event(RadioEvent::Disconnected(DeviceId::from("a")));
        assert_eq!(h.session.connection_state(), ConnectionState::Connecting);
        assert!(h.session.take_timers().is_empty());

        // late results for the previous target are ignored
        h.notify("a", &[0x00, 0x50]);
        h.event(RadioEvent::Connected(DeviceId::from("a")));
        assert_eq!(h.session.state().selected.map(|d| d.id), Some(DeviceId::from("b")));
        assert_eq!(h.session.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn selecting_the_selected_device_is_a_noop() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("a")));
        h.take_calls();

        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("a")));
        assert!(h.take_calls().is_empty());
        assert_eq!(h.session.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn link_loss_hard_resets_and_recreates_the_session() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.subscribe_to("a");
        h.notify("a", &[0x00, 0x50]);
        h.take_calls();

        h.event(RadioEvent::Disconnected(DeviceId::from("a")));
        let state = h.session.state();
        assert_eq!(state.connection_state, ConnectionState::Idle);
        assert_eq!(state.selected, None);
        assert_eq!(state.heart_rate, None);
        assert!(state.devices.is_empty());
        assert_eq!(h.take_calls(), vec![Call::CancelConnection(DeviceId::from("a"))]);

        let timers = h.session.take_timers();
        assert_eq!(timers, vec![ScheduledTimer { delay: Duration::from_millis(600), timer: Timer::RecreateSession }]);
        h.session.handle_timer(Timer::RecreateSession);
        assert_eq!(h.take_calls(), vec![Call::Create(1)]);
        assert_eq!(h.session.state().adapter_state, AdapterState::Unknown);

        // stale events from the old session are dropped
        h.session.handle_radio(RadioMessage { generation: 0, event: RadioEvent::AdapterStateChanged(AdapterState::PoweredOn) });
        assert!(!h.session.state().is_scanning);

        h.powered_on();
        assert!(h.session.state().is_scanning);
    }

    #[test]
    fn connect_failure_hard_resets() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("a")));
        h.session.take_timers();

        h.event(RadioEvent::ConnectFailed(DeviceId::from("a")));
        assert_eq!(h.session.connection_state(), ConnectionState::Idle);
        assert_eq!(h.fire_timers(), vec![Timer::RecreateSession]);
        assert_eq!(h.session.generation(), 1);
    }

    #[test]
    fn disconnect_while_connected_takes_the_hard_reset_path() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.subscribe_to("a");
        h.notify("a", &[0x00, 0x50]);

        h.session.handle_command(SessionCommand::Disconnect);
        let state = h.session.state();
        assert_eq!(state.selected, None);
        assert_eq!(state.heart_rate, None);
        assert_eq!(state.connection_state, ConnectionState::Idle);
        assert_eq!(h.fire_timers(), vec![Timer::RecreateSession]);
    }

    #[test]
    fn disconnect_without_connection_restarts_scan_after_short_delay() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.take_calls();

        h.session.handle_command(SessionCommand::Disconnect);
        assert!(!h.session.state().is_scanning);
        assert!(h.session.state().devices.is_empty());

        let timers = h.session.take_timers();
        assert_eq!(timers, vec![ScheduledTimer { delay: Duration::from_millis(100), timer: Timer::StartScan }]);
        h.session.handle_timer(Timer::StartScan);
        assert!(h.session.state().is_scanning);
        assert_eq!(h.take_calls(), vec![Call::StopScan, Call::StopScan, Call::StartScan(vec![HEART_RATE_SERVICE])]);
    }

    #[test]
    fn restart_scan_uses_medium_delay() {
        let mut h = Harness::new();
        h.powered_on();
        h.session.handle_command(SessionCommand::RestartScan);
        let timers = h.session.take_timers();
        assert_eq!(timers, vec![ScheduledTimer { delay: Duration::from_millis(500), timer: Timer::StartScan }]);
    }

    #[test]
    fn power_loss_clears_everything_and_resumes_on_power_on() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.subscribe_to("a");
        h.notify("a", &[0x00, 0x4B]);

        h.event(RadioEvent::AdapterStateChanged(AdapterState::PoweredOff));
        let state = h.session.state();
        assert_eq!(state.connection_state, ConnectionState::Idle);
        assert!(state.devices.is_empty());
        assert_eq!(state.heart_rate, None);
        assert_eq!(state.selected, None);
        assert!(!state.is_scanning);

        h.powered_on();
        assert!(h.session.state().is_scanning);
    }

    #[test]
    fn overlapping_resets_are_harmless() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("a")));
        h.event(RadioEvent::ConnectFailed(DeviceId::from("a")));
        h.session.handle_command(SessionCommand::Disconnect);

        assert_eq!(h.fire_timers(), vec![Timer::RecreateSession, Timer::StartScan]);
        assert_eq!(h.session.generation(), 1);
        assert_eq!(h.session.connection_state(), ConnectionState::Idle);
        // the new session has not reported power yet, so the rescan did nothing
        assert!(!h.session.state().is_scanning);
    }

    #[test]
    fn old_session_takes_no_new_link_while_being_recreated() {
        let mut h = Harness::with_options(SessionOptions {
            auto_select: Some("Polar".to_string()),
            ..SessionOptions::default()
        });
        h.powered_on();
        h.discover("a", Some("Polar"));
        assert_eq!(h.session.connection_state(), ConnectionState::Connecting);

        h.event(RadioEvent::ConnectFailed(DeviceId::from("a")));
        h.session.handle_command(SessionCommand::Disconnect);
        let timers = h.session.take_timers();
        assert_eq!(timers.iter().map(|t| t.timer).collect::<Vec<_>>(), vec![Timer::RecreateSession, Timer::StartScan]);
        h.take_calls();

        // the short rescan fires before the replacement session exists
        h.session.handle_timer(Timer::StartScan);
        h.discover("a", Some("Polar"));
        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("a")));
        h.event(RadioEvent::AdapterStateChanged(AdapterState::PoweredOn));

        let state = h.session.state();
        assert!(!state.is_scanning);
        assert_eq!(state.connection_state, ConnectionState::Idle);
        assert!(h.take_calls().is_empty());

        h.session.handle_timer(Timer::RecreateSession);
        assert_eq!(h.take_calls(), vec![Call::Create(1)]);

        h.powered_on();
        h.discover("a", Some("Polar"));
        assert_eq!(h.session.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn late_connect_of_a_released_device_is_cancelled() {
        let mut h = Harness::new();
        h.powered_on();
        h.discover("a", Some("Polar"));
        h.discover("b", Some("Wahoo"));
        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("a")));
        h.session.handle_command(SessionCommand::SelectDevice(DeviceId::from("b")));
        h.take_calls();

        h.event(RadioEvent::Connected(DeviceId::from("a")));
        assert_eq!(h.take_calls(), vec![Call::CancelConnection(DeviceId::from("a"))]);
        assert_eq!(h.session.state().selected.map(|d| d.id), Some(DeviceId::from("b")));
        assert_eq!(h.session.connection_state(), ConnectionState::Connecting);

        // a duplicate for the selected device leaves the link alone
        h.event(RadioEvent::Connected(DeviceId::from("b")));
        h.event(RadioEvent::Connected(DeviceId::from("b")));
        assert_eq!(h.take_calls(), vec![Call::DiscoverServices(DeviceId::from("b"), vec![HEART_RATE_SERVICE])]);
    }

    #[test]
    fn auto_select_connects_to_matching_device() {
        let mut h = Harness::with_options(SessionOptions {
            auto_select: Some("Polar H10".to_string()),
            ..SessionOptions::default()
        });
        h.powered_on();
        h.discover("x", Some("Wahoo"));
        assert_eq!(h.session.connection_state(), ConnectionState::Idle);

        h.discover("p", Some("Polar H10"));
        assert_eq!(h.session.connection_state(), ConnectionState::Connecting);
        assert_eq!(h.session.state().selected.map(|d| d.id), Some(DeviceId::from("p")));
    }

    #[test]
    fn published_state_follows_transitions() {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let authorization = Arc::new(Mutex::new(Authorization::Allowed));
        let factory = FakeFactory { calls, authorization };
        let (mut session, mut state_rx) = Session::new(factory, SessionOptions::default());
        assert!(!state_rx.has_changed().unwrap());

        session.handle_radio(RadioMessage { generation: 0, event: RadioEvent::AdapterStateChanged(AdapterState::PoweredOn) });
        assert!(state_rx.has_changed().unwrap());
        assert!(state_rx.borrow_and_update().is_scanning);

        // nothing changes, nothing is published
        session.handle_command(SessionCommand::StartScan);
        assert!(!state_rx.has_changed().unwrap());
    }
}
