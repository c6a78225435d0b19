use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use log::{debug, info, warn};
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::radio::{RadioEvent, RadioEventSender, RadioFactory, RadioMessage, RadioSession};
use crate::device::types::{AdapterState, Authorization, DeviceId};
use crate::error::DeviceError;

#[derive(Debug)]
enum RadioRequest {
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(DeviceId),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId, Vec<Uuid>),
    DiscoverCharacteristics(DeviceId, Uuid, Vec<Uuid>),
    Subscribe(DeviceId, Uuid, Uuid),
}

#[allow(unreachable_patterns)]
fn map_central_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::new(id.to_string())
}

#[cfg(target_os = "macos")]
fn initial_authorization() -> Authorization {
    // CoreBluetooth decides on first use
    Authorization::NotDetermined
}

#[cfg(not(target_os = "macos"))]
fn initial_authorization() -> Authorization {
    Authorization::Allowed
}

/// Tags events with the generation of the session that produced them.
#[derive(Clone)]
struct Emitter {
    generation: u64,
    events: RadioEventSender,
}

impl Emitter {
    fn emit(&self, event: RadioEvent) {
        let message = RadioMessage { generation: self.generation, event };
        if let Err(err) = self.events.unbounded_send(message) {
            debug!("Session is gone, dropping radio event: {:?}", err.into_inner().event);
        }
    }
}

/// Creates btleplug backed sessions.
pub struct BtleRadioFactory {
    events: RadioEventSender,
    cancel: CancellationToken,
}

impl BtleRadioFactory {
    pub fn new(events: RadioEventSender, cancel: CancellationToken) -> Self {
        BtleRadioFactory { events, cancel }
    }
}

impl RadioFactory for BtleRadioFactory {
    fn create(&mut self, generation: u64) -> Box<dyn RadioSession> {
        let (requests, request_receiver) = unbounded::<RadioRequest>();
        let cancel = self.cancel.child_token();
        let authorization = Arc::new(Mutex::new(initial_authorization()));

        let worker = Worker {
            emitter: Emitter { generation, events: self.events.clone() },
            authorization: authorization.clone(),
            cancel: cancel.clone(),
            scan_filter: Vec::new(),
            peripherals: HashMap::new(),
            readers: HashMap::new(),
        };
        spawn(worker.run(request_receiver));

        Box::new(BtleSession { requests, cancel, authorization })
    }
}

/// Handle to one btleplug manager/adapter pair running on its own worker task.
pub struct BtleSession {
    requests: UnboundedSender<RadioRequest>,
    cancel: CancellationToken,
    authorization: Arc<Mutex<Authorization>>,
}

impl BtleSession {
    fn request(&self, request: RadioRequest) {
        if let Err(err) = self.requests.unbounded_send(request) {
            warn!("Radio worker stopped, dropping request {:?}", err.into_inner());
        }
    }
}

impl Drop for BtleSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl RadioSession for BtleSession {
    fn authorization(&self) -> Authorization {
        *self.authorization.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_scan(&mut self, services: &[Uuid]) {
        self.request(RadioRequest::StartScan(services.to_vec()));
    }

    fn stop_scan(&mut self) {
        self.request(RadioRequest::StopScan);
    }

    fn connect(&mut self, id: &DeviceId) {
        self.request(RadioRequest::Connect(id.clone()));
    }

    fn cancel_connection(&mut self, id: &DeviceId) {
        self.request(RadioRequest::CancelConnection(id.clone()));
    }

    fn discover_services(&mut self, id: &DeviceId, services: &[Uuid]) {
        self.request(RadioRequest::DiscoverServices(id.clone(), services.to_vec()));
    }

    fn discover_characteristics(&mut self, id: &DeviceId, service: Uuid, characteristics: &[Uuid]) {
        self.request(RadioRequest::DiscoverCharacteristics(id.clone(), service, characteristics.to_vec()));
    }

    fn subscribe(&mut self, id: &DeviceId, service: Uuid, characteristic: Uuid) {
        self.request(RadioRequest::Subscribe(id.clone(), service, characteristic));
    }
}

struct Worker {
    emitter: Emitter,
    authorization: Arc<Mutex<Authorization>>,
    cancel: CancellationToken,
    scan_filter: Vec<Uuid>,
    peripherals: HashMap<DeviceId, Peripheral>,
    // one notification reader per subscribed peripheral
    readers: HashMap<DeviceId, CancellationToken>,
}

impl Worker {
    fn set_authorization(&self, authorization: Authorization) {
        *self.authorization.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = authorization;
    }

    fn report_error(&self, context: &str, err: DeviceError) {
        if err.is_permission_denied() {
            warn!("{}: bluetooth access denied", context);
            self.set_authorization(Authorization::Denied);
            self.emitter.emit(RadioEvent::AdapterStateChanged(AdapterState::Unauthorized));
        }
        else {
            warn!("{}: {}", context, err);
        }
    }

    // the session can not continue, tell the owner why
    fn report_fatal(&self, context: &str, err: DeviceError) {
        let permission_denied = err.is_permission_denied();
        self.report_error(context, err);
        if !permission_denied {
            self.emitter.emit(RadioEvent::AdapterStateChanged(AdapterState::Unsupported));
        }
    }

    async fn open_adapter(&self) -> Result<Adapter, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?
            .into_iter()
            .next()
            .ok_or(DeviceError::NoAdapter)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        Ok(adapter)
    }

    async fn run(mut self, mut requests: UnboundedReceiver<RadioRequest>) {
        let cancel = self.cancel.clone();

        let adapter = match self.open_adapter().await {
            Ok(adapter) => adapter,
            Err(err) => {
                self.report_fatal("Opening bluetooth adapter failed", err);
                return;
            },
        };

        let mut central_events = match adapter.events().await {
            Ok(events) => events,
            Err(err) => {
                self.report_fatal("Listening for adapter events failed", err.into());
                return;
            },
        };

        match adapter.adapter_state().await {
            Ok(state) => self.emitter.emit(RadioEvent::AdapterStateChanged(map_central_state(state))),
            Err(err) => self.report_error("Querying adapter state failed", err.into()),
        }

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(request) = requests.next() => {
                    self.handle_request(&adapter, request).await;
                },
                Some(event) = central_events.next() => {
                    self.handle_central_event(&adapter, event).await;
                },
                else => break 'mainloop,
            }
        }

        if let Err(err) = adapter.stop_scan().await {
            debug!("Stopping scan during teardown failed: {}", err);
        }
        self.disconnect_all().await;
        info!("Radio session {} stopped", self.emitter.generation);
    }

    async fn disconnect_all(&mut self) {
        for (_, reader) in self.readers.drain() {
            reader.cancel();
        }

        for (id, peripheral) in self.peripherals.drain() {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            debug!("Disconnecting {} during teardown", id);
            if let Err(err) = peripheral.disconnect().await {
                debug!("Disconnecting {} failed: {}", id, err);
            }
        }
    }

    async fn handle_request(&mut self, adapter: &Adapter, request: RadioRequest) {
        match request {
            RadioRequest::StartScan(services) => {
                self.scan_filter = services.clone();
                match adapter.start_scan(ScanFilter { services }).await {
                    Ok(()) => {
                        if self.authorization.lock().map(|a| *a == Authorization::NotDetermined).unwrap_or(false) {
                            self.set_authorization(Authorization::Allowed);
                        }
                    },
                    Err(err) => self.report_error("Starting scan failed", err.into()),
                }
            },
            RadioRequest::StopScan => {
                if let Err(err) = adapter.stop_scan().await {
                    debug!("Stopping scan failed: {}", err);
                }
            },
            RadioRequest::Connect(id) => {
                let emitter = self.emitter.clone();
                let peripheral = match self.peripherals.get(&id) {
                    Some(peripheral) => peripheral.clone(),
                    None => {
                        warn!("{}", DeviceError::UnknownPeripheral(id.to_string()));
                        emitter.emit(RadioEvent::ConnectFailed(id));
                        return;
                    },
                };

                spawn(async move {
                    match peripheral.connect().await {
                        Ok(()) => emitter.emit(RadioEvent::Connected(id)),
                        Err(err) => {
                            warn!("Connecting to {} failed: {}", id, err);
                            emitter.emit(RadioEvent::ConnectFailed(id));
                        },
                    }
                });
            },
            RadioRequest::CancelConnection(id) => {
                if let Some(reader) = self.readers.remove(&id) {
                    reader.cancel();
                }
                if let Some(peripheral) = self.peripherals.get(&id).cloned() {
                    spawn(async move {
                        if let Err(err) = peripheral.disconnect().await {
                            debug!("Disconnecting {} failed: {}", id, err);
                        }
                    });
                }
            },
            RadioRequest::DiscoverServices(id, filter) => {
                let emitter = self.emitter.clone();
                let peripheral = match self.peripherals.get(&id) {
                    Some(peripheral) => peripheral.clone(),
                    None => {
                        emitter.emit(RadioEvent::DiscoveryFailed(id));
                        return;
                    },
                };

                spawn(async move {
                    match peripheral.discover_services().await {
                        Ok(()) => {
                            let services = peripheral.services()
                                .into_iter()
                                .map(|service| service.uuid)
                                .filter(|uuid| filter.is_empty() || filter.contains(uuid))
                                .collect();
                            emitter.emit(RadioEvent::ServicesDiscovered { id, services });
                        },
                        Err(err) => {
                            warn!("Discovering services of {} failed: {}", id, err);
                            emitter.emit(RadioEvent::DiscoveryFailed(id));
                        },
                    }
                });
            },
            RadioRequest::DiscoverCharacteristics(id, service, filter) => {
                // btleplug resolves characteristics together with the services
                let characteristics = match self.peripherals.get(&id) {
                    Some(peripheral) => peripheral.services()
                        .into_iter()
                        .filter(|candidate| candidate.uuid == service)
                        .flat_map(|candidate| candidate.characteristics.into_iter())
                        .map(|characteristic| characteristic.uuid)
                        .filter(|uuid| filter.is_empty() || filter.contains(uuid))
                        .collect(),
                    None => {
                        self.emitter.emit(RadioEvent::DiscoveryFailed(id));
                        return;
                    },
                };
                self.emitter.emit(RadioEvent::CharacteristicsDiscovered { id, service, characteristics });
            },
            RadioRequest::Subscribe(id, service, characteristic_uuid) => {
                self.subscribe(id, service, characteristic_uuid);
            },
        }
    }

    fn subscribe(&mut self, id: DeviceId, service: Uuid, characteristic_uuid: Uuid) {
        let emitter = self.emitter.clone();
        let peripheral = match self.peripherals.get(&id) {
            Some(peripheral) => peripheral.clone(),
            None => {
                emitter.emit(RadioEvent::SubscribeFailed(id));
                return;
            },
        };

        let characteristic = peripheral.characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic_uuid && c.service_uuid == service);
        let characteristic = match characteristic {
            Some(characteristic) => characteristic,
            None => {
                warn!("{} on {}", DeviceError::MissingCharacteristic, id);
                emitter.emit(RadioEvent::SubscribeFailed(id));
                return;
            },
        };

        let reader_cancel = self.cancel.child_token();
        if let Some(previous) = self.readers.insert(id.clone(), reader_cancel.clone()) {
            previous.cancel();
        }

        spawn(async move {
            // open the stream first so that the first notification is not missed
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Opening notification stream of {} failed: {}", id, err);
                    emitter.emit(RadioEvent::SubscribeFailed(id));
                    return;
                },
            };

            if let Err(err) = peripheral.subscribe(&characteristic).await {
                warn!("Subscribing to {} failed: {}", id, err);
                emitter.emit(RadioEvent::SubscribeFailed(id));
                return;
            }
            emitter.emit(RadioEvent::Subscribed { id: id.clone(), characteristic: characteristic_uuid });

            'mainloop: loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => {
                        break 'mainloop;
                    },
                    notification = notifications.next() => match notification {
                        Some(data) => {
                            if data.uuid == characteristic_uuid {
                                emitter.emit(RadioEvent::Notification {
                                    id: id.clone(),
                                    characteristic: characteristic_uuid,
                                    value: data.value,
                                });
                            }
                        },
                        None => break 'mainloop,
                    },
                }
            }

            debug!("Notification reader for {} stopped", id);
        });
    }

    async fn handle_central_event(&mut self, adapter: &Adapter, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(peripheral_id) | CentralEvent::DeviceUpdated(peripheral_id) => {
                let peripheral = match adapter.peripheral(&peripheral_id).await {
                    Ok(peripheral) => peripheral,
                    Err(err) => {
                        debug!("Peripheral {:?} vanished: {}", peripheral_id, err);
                        return;
                    },
                };

                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    Ok(None) => {
                        debug!("Peripheral {:?} has no properties", peripheral_id);
                        return;
                    },
                    Err(err) => {
                        warn!("Could not query peripheral for properties: {:?}", err);
                        return;
                    },
                };

                // Some environments ignore the scan filter, so check the advertised services again
                if !self.scan_filter.is_empty()
                    && !properties.services.iter().any(|uuid| self.scan_filter.contains(uuid)) {
                    return;
                }

                let id = device_id(&peripheral_id);
                self.peripherals.insert(id.clone(), peripheral);
                self.emitter.emit(RadioEvent::Discovered { id, name: properties.local_name });
            },
            CentralEvent::DeviceDisconnected(peripheral_id) => {
                let id = device_id(&peripheral_id);
                if let Some(reader) = self.readers.remove(&id) {
                    reader.cancel();
                }
                self.emitter.emit(RadioEvent::Disconnected(id));
            },
            CentralEvent::StateUpdate(state) => {
                self.emitter.emit(RadioEvent::AdapterStateChanged(map_central_state(state)));
            },
            _ => {},
        }
    }
}
