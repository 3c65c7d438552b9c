use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

use crate::connection::GattConnection;
use crate::{Characteristic, Descriptor, Error, Result, Service};

/// Everything found by one discovery run.
///
/// Replaced wholesale by the next run, never merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoverySnapshot {
    services: Vec<Service>,
    characteristics: HashMap<Uuid, Vec<Characteristic>>,
    descriptors: HashMap<Uuid, Vec<Descriptor>>,
}

impl DiscoverySnapshot {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Services in the order the platform reported them.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, uuid: Uuid) -> Option<&Service> {
        self.services.iter().find(|service| service.uuid == uuid)
    }

    /// Characteristics of the given service.
    pub fn characteristics(&self, service: Uuid) -> &[Characteristic] {
        self.characteristics
            .get(&service)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Descriptors of the given characteristic.
    pub fn descriptors(&self, characteristic: Uuid) -> &[Descriptor] {
        self.descriptors
            .get(&characteristic)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// First characteristic with the given uuid, across all services.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.services.iter().find_map(|service| {
            self.characteristics(service.uuid)
                .iter()
                .find(|characteristic| characteristic.uuid == uuid)
        })
    }

    pub fn descriptor(&self, characteristic: Uuid, uuid: Uuid) -> Option<&Descriptor> {
        self.descriptors(characteristic)
            .iter()
            .find(|descriptor| descriptor.uuid == uuid)
    }

    pub fn characteristic_uuids(&self) -> Vec<Uuid> {
        self.characteristics
            .values()
            .flatten()
            .map(|characteristic| characteristic.uuid)
            .collect()
    }
}

/// Discover services, then enumerate their characteristics and descriptors.
///
/// Any failure aborts the whole run; no partial snapshot is returned.
pub async fn discover(connection: &GattConnection) -> Result<DiscoverySnapshot> {
    let identity = connection.identity();
    let mut snapshot = DiscoverySnapshot::default();

    let started = Instant::now();
    let services = connection.discover_services().await?;
    if services.is_empty() {
        return Err(Error::no_services());
    }
    log::debug!(
        "{}: {} services discovered in {:?}",
        identity,
        services.len(),
        started.elapsed()
    );
    snapshot.services = services;

    let started = Instant::now();
    snapshot.characteristics = enumerate_characteristics(&snapshot.services);
    log::debug!(
        "{}: {} characteristics enumerated in {:?}",
        identity,
        snapshot.characteristics.values().map(Vec::len).sum::<usize>(),
        started.elapsed()
    );

    let started = Instant::now();
    snapshot.descriptors = enumerate_descriptors(&snapshot.characteristics);
    log::debug!(
        "{}: {} descriptors enumerated in {:?}",
        identity,
        snapshot.descriptors.values().map(Vec::len).sum::<usize>(),
        started.elapsed()
    );

    Ok(snapshot)
}

fn enumerate_characteristics(services: &[Service]) -> HashMap<Uuid, Vec<Characteristic>> {
    services
        .iter()
        .map(|service| (service.uuid, service.characteristics.clone()))
        .collect()
}

fn enumerate_descriptors(
    characteristics: &HashMap<Uuid, Vec<Characteristic>>,
) -> HashMap<Uuid, Vec<Descriptor>> {
    characteristics
        .values()
        .flatten()
        .map(|characteristic| (characteristic.uuid, characteristic.descriptors.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CharacteristicProperties;

    fn uuid(short: u16) -> Uuid {
        Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805F9B34FB)
    }

    fn service() -> Service {
        let characteristic = Characteristic {
            uuid: uuid(0x2A37),
            service_uuid: uuid(0x180D),
            properties: CharacteristicProperties(CharacteristicProperties::NOTIFY),
            descriptors: vec![Descriptor {
                uuid: uuid(0x2902),
                service_uuid: uuid(0x180D),
                characteristic_uuid: uuid(0x2A37),
            }],
        };
        Service {
            uuid: uuid(0x180D),
            primary: true,
            characteristics: vec![characteristic],
        }
    }

    #[test]
    fn enumerates_every_level() {
        let services = vec![service()];
        let characteristics = enumerate_characteristics(&services);
        let descriptors = enumerate_descriptors(&characteristics);
        let snapshot = DiscoverySnapshot {
            services,
            characteristics,
            descriptors,
        };

        assert_eq!(snapshot.characteristics(uuid(0x180D)).len(), 1);
        assert!(snapshot.characteristic(uuid(0x2A37)).is_some());
        assert!(snapshot.descriptor(uuid(0x2A37), uuid(0x2902)).is_some());
        assert!(snapshot.characteristic(uuid(0x2A19)).is_none());
        assert_eq!(snapshot.characteristic_uuids(), vec![uuid(0x2A37)]);
    }

    #[test]
    fn unknown_service_has_no_characteristics() {
        let snapshot = DiscoverySnapshot::default();
        assert!(snapshot.is_empty());
        assert!(snapshot.characteristics(uuid(0x180F)).is_empty());
    }
}
