//! [`PlatformAdapter`] on top of `btleplug`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use btleplug::api::{
    Central, CentralEvent, Characteristic as BtleCharacteristic, Descriptor as BtleDescriptor,
    Peripheral as _, Service as BtleService, WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use stream_cancel::{Trigger, Tripwire};
use tokio::runtime::Handle;

use crate::error::GattStatus;
use crate::platform::{EventSink, GattEvent, GattLink, LinkState, PlatformAdapter, PlatformError};
use crate::{Characteristic, CharacteristicProperties, Descriptor, Result, Service, WriteType};

/// Peripherals reachable through one `btleplug` adapter, keyed by address.
#[derive(Clone)]
pub struct BtleplugAdapter {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BtleplugAdapter {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Identity a peripheral is known by.
    pub fn identity(peripheral: &Peripheral) -> String {
        peripheral.address().to_string()
    }

    /// Make `peripheral` connectable by its identity.
    pub fn remember(&self, peripheral: Peripheral) -> String {
        let identity = Self::identity(&peripheral);
        self.lock().insert(identity.clone(), peripheral);
        identity
    }

    /// Remember every peripheral the adapter currently knows about.
    pub async fn refresh(&self) -> Result<usize> {
        let peripherals = self.adapter.peripherals().await?;
        let count = peripherals.len();
        for peripheral in peripherals {
            self.remember(peripheral);
        }
        Ok(count)
    }

    pub fn peripheral(&self, identity: &str) -> Option<Peripheral> {
        self.lock().get(identity).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Peripheral>> {
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PlatformAdapter for BtleplugAdapter {
    fn connect(&self, identity: &str, events: EventSink) -> Result<Arc<dyn GattLink>, PlatformError> {
        let peripheral = self
            .peripheral(identity)
            .ok_or_else(|| PlatformError::UnknownPeripheral(identity.to_string()))?;
        let runtime = Handle::try_current().map_err(|_| PlatformError::NoRuntime)?;

        let link = BtleplugLink {
            adapter: self.adapter.clone(),
            peripheral,
            runtime,
            events,
            watchers: Mutex::new(Vec::new()),
        };
        link.spawn_connect();

        Ok(Arc::new(link))
    }
}

struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
    runtime: Handle,
    events: EventSink,
    /// Stops the notification and link-loss forwarders.
    watchers: Mutex<Vec<Trigger>>,
}

impl BtleplugLink {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }

    fn spawn_connect(&self) {
        let (trigger, tripwire) = Tripwire::new();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trigger);

        let adapter = self.adapter.clone();
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();

        self.spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    forward_notifications(&peripheral, events.clone(), tripwire.clone()).await;
                    watch_link_loss(&adapter, &peripheral, events.clone(), tripwire).await;
                    events.emit(GattEvent::ConnectionStateChanged {
                        status: GattStatus::SUCCESS,
                        state: LinkState::Connected,
                    });
                }
                Err(e) => {
                    log::warn!("Could not connect to {}: {:?}", peripheral.address(), e);
                    events.emit(GattEvent::ConnectionStateChanged {
                        status: GattStatus::FAILURE,
                        state: LinkState::Disconnected,
                    });
                }
            }
        });
    }

    fn find_characteristic(&self, characteristic: &Characteristic) -> Result<BtleCharacteristic, PlatformError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or(PlatformError::UnknownAttribute(characteristic.uuid))
    }

    fn find_descriptor(&self, descriptor: &Descriptor) -> Result<BtleDescriptor, PlatformError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.uuid == descriptor.characteristic_uuid && c.service_uuid == descriptor.service_uuid)
            .flat_map(|c| c.descriptors.into_iter())
            .find(|d| d.uuid == descriptor.uuid)
            .ok_or(PlatformError::UnknownAttribute(descriptor.uuid))
    }
}

async fn forward_notifications(peripheral: &Peripheral, events: EventSink, tripwire: Tripwire) {
    match peripheral.notifications().await {
        Ok(notifications) => {
            tokio::spawn(async move {
                let mut notifications = notifications.take_until(tripwire);
                while let Some(notification) = notifications.next().await {
                    events.emit(GattEvent::CharacteristicChanged {
                        characteristic: notification.uuid,
                        value: notification.value,
                    });
                }
            });
        }
        Err(e) => log::warn!("No notifications from {}: {:?}", peripheral.address(), e),
    }
}

async fn watch_link_loss(adapter: &Adapter, peripheral: &Peripheral, events: EventSink, tripwire: Tripwire) {
    let id = peripheral.id();
    match adapter.events().await {
        Ok(central_events) => {
            tokio::spawn(async move {
                let mut central_events = central_events.take_until(tripwire);
                while let Some(event) = central_events.next().await {
                    if let CentralEvent::DeviceDisconnected(disconnected) = event {
                        if disconnected == id {
                            events.emit(GattEvent::ConnectionStateChanged {
                                status: GattStatus::CONNECTION_TIMEOUT,
                                state: LinkState::Disconnected,
                            });
                            break;
                        }
                    }
                }
            });
        }
        Err(e) => log::warn!("Link loss of {} will go unnoticed: {:?}", peripheral.address(), e),
    }
}

fn status_of<T>(result: &btleplug::Result<T>) -> GattStatus {
    match result {
        Ok(_) => GattStatus::SUCCESS,
        Err(e) => {
            log::debug!("btleplug request failed: {:?}", e);
            GattStatus::FAILURE
        }
    }
}

impl GattLink for BtleplugLink {
    fn reconnect(&self) -> Result<(), PlatformError> {
        self.spawn_connect();
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PlatformError> {
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let result = peripheral.disconnect().await;
            events.emit(GattEvent::ConnectionStateChanged {
                status: status_of(&result),
                state: LinkState::Disconnected,
            });
        });
        Ok(())
    }

    fn close(&self) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn discover_services(&self) -> Result<(), PlatformError> {
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let result = peripheral.discover_services().await;
            events.emit(GattEvent::ServicesDiscovered {
                status: status_of(&result),
            });
        });
        Ok(())
    }

    fn services(&self) -> Vec<Service> {
        self.peripheral
            .services()
            .into_iter()
            .map(convert_service)
            .collect()
    }

    fn read_characteristic(&self, characteristic: &Characteristic) -> Result<(), PlatformError> {
        let target = self.find_characteristic(characteristic)?;
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let result = peripheral.read(&target).await;
            events.emit(GattEvent::CharacteristicRead {
                characteristic: target.uuid,
                status: status_of(&result),
                value: result.unwrap_or_default(),
            });
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), PlatformError> {
        let target = self.find_characteristic(characteristic)?;
        let value = value.to_vec();
        let write_type = match write_type {
            WriteType::WithResponse => BtleWriteType::WithResponse,
            WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
        };
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let result = peripheral.write(&target, &value, write_type).await;
            events.emit(GattEvent::CharacteristicWritten {
                characteristic: target.uuid,
                status: status_of(&result),
            });
        });
        Ok(())
    }

    fn set_notification(&self, characteristic: &Characteristic, enabled: bool) -> Result<(), PlatformError> {
        let target = self.find_characteristic(characteristic)?;
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            events.emit(GattEvent::NotificationSet {
                characteristic: target.uuid,
                enabled,
                status: status_of(&result),
            });
        });
        Ok(())
    }

    fn read_descriptor(&self, descriptor: &Descriptor) -> Result<(), PlatformError> {
        let target = self.find_descriptor(descriptor)?;
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let result = peripheral.read_descriptor(&target).await;
            events.emit(GattEvent::DescriptorRead {
                characteristic: target.characteristic_uuid,
                descriptor: target.uuid,
                status: status_of(&result),
                value: result.unwrap_or_default(),
            });
        });
        Ok(())
    }

    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<(), PlatformError> {
        let target = self.find_descriptor(descriptor)?;
        let value = value.to_vec();
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let result = peripheral.write_descriptor(&target, &value).await;
            events.emit(GattEvent::DescriptorWritten {
                characteristic: target.characteristic_uuid,
                descriptor: target.uuid,
                status: status_of(&result),
            });
        });
        Ok(())
    }

    fn read_rssi(&self) -> Result<(), PlatformError> {
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let rssi = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|props| props.rssi);
            events.emit(match rssi {
                Some(rssi) => GattEvent::RssiRead {
                    rssi,
                    status: GattStatus::SUCCESS,
                },
                None => GattEvent::RssiRead {
                    rssi: 0,
                    status: GattStatus::FAILURE,
                },
            });
        });
        Ok(())
    }

    fn request_mtu(&self, _mtu: u16) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("requestMtu"))
    }
}

fn convert_service(service: BtleService) -> Service {
    Service {
        uuid: service.uuid,
        primary: service.primary,
        characteristics: service
            .characteristics
            .into_iter()
            .map(convert_characteristic)
            .collect(),
    }
}

fn convert_characteristic(characteristic: BtleCharacteristic) -> Characteristic {
    Characteristic {
        uuid: characteristic.uuid,
        service_uuid: characteristic.service_uuid,
        properties: CharacteristicProperties(characteristic.properties.bits()),
        descriptors: characteristic
            .descriptors
            .into_iter()
            .map(|descriptor| Descriptor {
                uuid: descriptor.uuid,
                service_uuid: descriptor.service_uuid,
                characteristic_uuid: descriptor.characteristic_uuid,
            })
            .collect(),
    }
}
