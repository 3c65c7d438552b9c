#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use blecentral::platform::{EventSink, GattEvent, GattLink, LinkState, PlatformAdapter, PlatformError};
use blecentral::{
    Characteristic, CharacteristicProperties, Descriptor, Error, GattStatus, Service, SessionEvent, Watchdog,
    WriteType,
};
use tokio::sync::broadcast;
use uuid::Uuid;

pub const IDENTITY: &str = "AA:BB";

pub fn uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB)
}

pub const BATTERY_SERVICE: u16 = 0x180F;
pub const BATTERY_LEVEL: u16 = 0x2A19;
pub const HEART_RATE_SERVICE: u16 = 0x180D;
pub const HEART_RATE_MEASUREMENT: u16 = 0x2A37;
pub const CCCD: u16 = 0x2902;

/// Battery level plus a notifying heart rate measurement with its CCCD.
pub fn peripheral_services() -> Vec<Service> {
    let battery_level = Characteristic {
        uuid: uuid(BATTERY_LEVEL),
        service_uuid: uuid(BATTERY_SERVICE),
        properties: CharacteristicProperties(CharacteristicProperties::READ),
        descriptors: Vec::new(),
    };
    let measurement = Characteristic {
        uuid: uuid(HEART_RATE_MEASUREMENT),
        service_uuid: uuid(HEART_RATE_SERVICE),
        properties: CharacteristicProperties(CharacteristicProperties::NOTIFY),
        descriptors: vec![Descriptor {
            uuid: uuid(CCCD),
            service_uuid: uuid(HEART_RATE_SERVICE),
            characteristic_uuid: uuid(HEART_RATE_MEASUREMENT),
        }],
    };

    vec![
        Service {
            uuid: uuid(BATTERY_SERVICE),
            primary: true,
            characteristics: vec![battery_level],
        },
        Service {
            uuid: uuid(HEART_RATE_SERVICE),
            primary: true,
            characteristics: vec![measurement],
        },
    ]
}

#[derive(Default)]
struct Script {
    calls: Vec<String>,
    /// Methods refused synchronously.
    rejected: HashSet<&'static str>,
    /// Methods accepted but never answered.
    silent: HashSet<&'static str>,
    /// Status reported for a method instead of success.
    statuses: HashMap<&'static str, GattStatus>,
    /// Statuses reported by the next connect or reconnect attempts, in order.
    connect_statuses: VecDeque<GattStatus>,
    services: Vec<Service>,
    values: HashMap<Uuid, Vec<u8>>,
    sinks: Vec<EventSink>,
}

/// In-memory platform answering every request through its event sink.
#[derive(Clone, Default)]
pub struct MockPlatform {
    script: Arc<Mutex<Script>>,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MockPlatform {
    pub fn new() -> Self {
        let platform = Self::default();
        platform.script().services = peripheral_services();
        platform
    }

    pub fn reject(&self, method: &'static str) -> &Self {
        self.script().rejected.insert(method);
        self
    }

    pub fn silence(&self, method: &'static str) -> &Self {
        self.script().silent.insert(method);
        self
    }

    pub fn answer(&self, method: &'static str) -> &Self {
        let mut script = self.script();
        script.silent.remove(method);
        script.rejected.remove(method);
        script.statuses.remove(method);
        self
    }

    pub fn fail_with(&self, method: &'static str, status: GattStatus) -> &Self {
        self.script().statuses.insert(method, status);
        self
    }

    pub fn connect_with(&self, statuses: impl IntoIterator<Item = GattStatus>) -> &Self {
        self.script().connect_statuses.extend(statuses);
        self
    }

    pub fn set_services(&self, services: Vec<Service>) -> &Self {
        self.script().services = services;
        self
    }

    pub fn set_value(&self, characteristic: Uuid, value: &[u8]) -> &Self {
        self.script().values.insert(characteristic, value.to_vec());
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.script().calls.iter().filter(|call| *call == method).count()
    }

    /// Push an event as if the platform reported it on the latest link.
    pub fn emit(&self, event: GattEvent) {
        let sink = self.script().sinks.last().cloned();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    pub fn notify(&self, characteristic: Uuid, value: &[u8]) {
        self.emit(GattEvent::CharacteristicChanged {
            characteristic,
            value: value.to_vec(),
        });
    }

    /// The peripheral went away on its own.
    pub fn drop_link(&self, status: GattStatus) {
        self.emit(GattEvent::ConnectionStateChanged {
            status,
            state: LinkState::Disconnected,
        });
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }
}

impl PlatformAdapter for MockPlatform {
    fn connect(&self, _identity: &str, events: EventSink) -> Result<Arc<dyn GattLink>, PlatformError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut script = self.script();
            script.calls.push("connect".to_string());
            if script.rejected.contains("connect") {
                return Err(PlatformError::Rejected("connect"));
            }
            script.sinks.push(events.clone());
        }

        let link = MockLink {
            platform: self.clone(),
            events,
        };
        link.attempt("connect");
        Ok(Arc::new(link))
    }
}

struct MockLink {
    platform: MockPlatform,
    events: EventSink,
}

impl MockLink {
    /// Record the call and decide how it is answered: `Err` when refused,
    /// `Ok(None)` when it stays unanswered.
    fn call(&self, method: &'static str) -> Result<Option<GattStatus>, PlatformError> {
        let mut script = self.platform.script();
        script.calls.push(method.to_string());
        if script.rejected.contains(method) {
            return Err(PlatformError::Rejected(method));
        }
        if script.silent.contains(method) {
            return Ok(None);
        }
        Ok(Some(
            script
                .statuses
                .get(method)
                .copied()
                .unwrap_or(GattStatus::SUCCESS),
        ))
    }

    fn attempt(&self, method: &'static str) {
        let status = {
            let mut script = self.platform.script();
            if script.silent.contains(method) {
                return;
            }
            script.connect_statuses.pop_front().unwrap_or(GattStatus::SUCCESS)
        };
        let state = if status.is_success() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        self.events.emit(GattEvent::ConnectionStateChanged { status, state });
    }

    fn value(&self, characteristic: Uuid) -> Vec<u8> {
        self.platform
            .script()
            .values
            .get(&characteristic)
            .cloned()
            .unwrap_or_default()
    }
}

impl GattLink for MockLink {
    fn reconnect(&self) -> Result<(), PlatformError> {
        self.call("reconnect")?;
        self.attempt("reconnect");
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PlatformError> {
        if let Some(status) = self.call("disconnect")? {
            self.events.emit(GattEvent::ConnectionStateChanged {
                status,
                state: LinkState::Disconnected,
            });
        }
        Ok(())
    }

    fn close(&self) {
        self.platform.closes.fetch_add(1, Ordering::SeqCst);
        self.platform.script().calls.push("close".to_string());
    }

    fn discover_services(&self) -> Result<(), PlatformError> {
        if let Some(status) = self.call("discoverServices")? {
            self.events.emit(GattEvent::ServicesDiscovered { status });
        }
        Ok(())
    }

    fn services(&self) -> Vec<Service> {
        self.platform.script().services.clone()
    }

    fn read_characteristic(&self, characteristic: &Characteristic) -> Result<(), PlatformError> {
        if let Some(status) = self.call("readCharacteristic")? {
            self.events.emit(GattEvent::CharacteristicRead {
                characteristic: characteristic.uuid,
                value: self.value(characteristic.uuid),
                status,
            });
        }
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        _write_type: WriteType,
    ) -> Result<(), PlatformError> {
        if let Some(status) = self.call("writeCharacteristic")? {
            if status.is_success() {
                self.platform.set_value(characteristic.uuid, value);
            }
            self.events.emit(GattEvent::CharacteristicWritten {
                characteristic: characteristic.uuid,
                status,
            });
        }
        Ok(())
    }

    fn set_notification(&self, characteristic: &Characteristic, enabled: bool) -> Result<(), PlatformError> {
        if let Some(status) = self.call("setCharacteristicNotification")? {
            self.events.emit(GattEvent::NotificationSet {
                characteristic: characteristic.uuid,
                enabled,
                status,
            });
        }
        Ok(())
    }

    fn read_descriptor(&self, descriptor: &Descriptor) -> Result<(), PlatformError> {
        if let Some(status) = self.call("readDescriptor")? {
            self.events.emit(GattEvent::DescriptorRead {
                characteristic: descriptor.characteristic_uuid,
                descriptor: descriptor.uuid,
                value: self.value(descriptor.uuid),
                status,
            });
        }
        Ok(())
    }

    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<(), PlatformError> {
        if let Some(status) = self.call("writeDescriptor")? {
            if status.is_success() {
                self.platform.set_value(descriptor.uuid, value);
            }
            self.events.emit(GattEvent::DescriptorWritten {
                characteristic: descriptor.characteristic_uuid,
                descriptor: descriptor.uuid,
                status,
            });
        }
        Ok(())
    }

    fn read_rssi(&self) -> Result<(), PlatformError> {
        if let Some(status) = self.call("readRemoteRssi")? {
            self.events.emit(GattEvent::RssiRead { rssi: -58, status });
        }
        Ok(())
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), PlatformError> {
        if let Some(status) = self.call("requestMtu")? {
            self.events.emit(GattEvent::MtuChanged {
                mtu: mtu.min(247),
                status,
            });
        }
        Ok(())
    }
}

/// Timer ids still armed for the test peripheral.
pub fn armed_timers(watchdog: &Watchdog) -> Vec<String> {
    let prefix = format!("{}__", IDENTITY);
    watchdog
        .active_ids()
        .into_iter()
        .filter(|id| id.starts_with(&prefix))
        .collect()
}

/// Let spawned tasks process whatever is queued.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}

/// Wait for the end of the session and return its reason.
pub async fn ended(events: &mut broadcast::Receiver<SessionEvent>) -> Option<Error> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Ended(error)) => return error,
            Ok(_) => {}
            Err(e) => panic!("event channel failed: {}", e),
        }
    }
}
