//! Advertising data as broadcast by peripherals: a sequence of
//! `[length, type, payload...]` structures, terminated by a zero length or
//! the end of the buffer.

use std::collections::HashMap;

use uuid::Uuid;

/// AD type values assigned by the Bluetooth SIG.
pub mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_SERVICE_UUIDS_16: u8 = 0x02;
    pub const COMPLETE_SERVICE_UUIDS_16: u8 = 0x03;
    pub const INCOMPLETE_SERVICE_UUIDS_32: u8 = 0x04;
    pub const COMPLETE_SERVICE_UUIDS_32: u8 = 0x05;
    pub const INCOMPLETE_SERVICE_UUIDS_128: u8 = 0x06;
    pub const COMPLETE_SERVICE_UUIDS_128: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    pub const SERVICE_DATA_16: u8 = 0x16;
    pub const SERVICE_DATA_32: u8 = 0x20;
    pub const SERVICE_DATA_128: u8 = 0x21;
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xFF;
}

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Largest payload a single structure can carry.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize - 1;

/// One AD structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdRecord {
    pub ad_type: u8,
    pub payload: Vec<u8>,
}

impl AdRecord {
    pub fn new(ad_type: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            ad_type,
            payload: payload.into(),
        }
    }
}

/// Parse every well-formed structure in `data`.
///
/// Stops at a zero length, at the end of the buffer, or at the first
/// structure that claims more bytes than are left. Never panics.
pub fn parse_records(data: &[u8]) -> Vec<AdRecord> {
    let mut records = Vec::new();
    let mut cursor = 0;

    while let Some(&len) = data.get(cursor) {
        let len = len as usize;
        if len == 0 {
            break;
        }

        let Some(&ad_type) = data.get(cursor + 1) else {
            break;
        };
        let start = cursor + 2;
        let end = cursor + 1 + len;
        let Some(payload) = data.get(start..end) else {
            log::trace!(
                "Advertisement structure at {} claims {} bytes, only {} left",
                cursor,
                len,
                data.len() - cursor - 1
            );
            break;
        };

        records.push(AdRecord::new(ad_type, payload));
        cursor = end;
    }

    records
}

/// Encode records into advertising data. Records with a payload longer than
/// [`MAX_PAYLOAD_LEN`] are skipped.
pub fn encode_records<'a>(records: impl IntoIterator<Item = &'a AdRecord>) -> Vec<u8> {
    let mut data = Vec::new();

    for record in records {
        if record.payload.len() > MAX_PAYLOAD_LEN {
            log::debug!(
                "Skipping AD type {:#04x}, payload of {} bytes does not fit",
                record.ad_type,
                record.payload.len()
            );
            continue;
        }
        data.push(record.payload.len() as u8 + 1);
        data.push(record.ad_type);
        data.extend_from_slice(&record.payload);
    }

    data
}

/// Raw advertising data together with its parsed structures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    raw: Vec<u8>,
    records: Vec<AdRecord>,
}

impl Advertisement {
    pub fn parse(raw: impl Into<Vec<u8>>) -> Self {
        let raw = raw.into();
        let records = parse_records(&raw);
        Self { raw, records }
    }

    pub fn from_records(records: Vec<AdRecord>) -> Self {
        Self {
            raw: encode_records(&records),
            records,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn records(&self) -> &[AdRecord] {
        &self.records
    }

    /// Payload of the first structure of the given type.
    pub fn first(&self, ad_type: u8) -> Option<&[u8]> {
        self.records
            .iter()
            .find(|record| record.ad_type == ad_type)
            .map(|record| record.payload.as_slice())
    }

    pub fn flags(&self) -> Option<u8> {
        self.first(ad_type::FLAGS)
            .and_then(|payload| payload.first().copied())
    }

    /// Complete local name, or the shortened one if that is all there is.
    pub fn local_name(&self) -> Option<String> {
        self.first(ad_type::COMPLETE_LOCAL_NAME)
            .or_else(|| self.first(ad_type::SHORTENED_LOCAL_NAME))
            .map(|name| String::from_utf8_lossy(name).into_owned())
    }

    pub fn tx_power_level(&self) -> Option<i8> {
        self.first(ad_type::TX_POWER_LEVEL)
            .and_then(|payload| payload.first())
            .map(|&level| level as i8)
    }

    /// Manufacturer data keyed by company identifier.
    pub fn manufacturer_data(&self) -> HashMap<u16, Vec<u8>> {
        self.records
            .iter()
            .filter(|record| record.ad_type == ad_type::MANUFACTURER_SPECIFIC_DATA)
            .filter(|record| record.payload.len() >= 2)
            .map(|record| {
                let company = u16::from_le_bytes([record.payload[0], record.payload[1]]);
                (company, record.payload[2..].to_vec())
            })
            .collect()
    }

    /// Advertised service uuids of every width, in order of appearance.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        let mut uuids = Vec::new();

        for record in &self.records {
            match record.ad_type {
                ad_type::INCOMPLETE_SERVICE_UUIDS_16 | ad_type::COMPLETE_SERVICE_UUIDS_16 => uuids
                    .extend(record.payload.chunks_exact(2).map(|chunk| {
                        uuid_from_u32(u16::from_le_bytes([chunk[0], chunk[1]]) as u32)
                    })),
                ad_type::INCOMPLETE_SERVICE_UUIDS_32 | ad_type::COMPLETE_SERVICE_UUIDS_32 => uuids
                    .extend(record.payload.chunks_exact(4).map(|chunk| {
                        uuid_from_u32(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    })),
                ad_type::INCOMPLETE_SERVICE_UUIDS_128 | ad_type::COMPLETE_SERVICE_UUIDS_128 => {
                    uuids.extend(record.payload.chunks_exact(16).map(uuid_from_le_slice))
                }
                _ => {}
            }
        }

        uuids
    }

    /// Service data keyed by service uuid.
    pub fn service_data(&self) -> HashMap<Uuid, Vec<u8>> {
        self.records
            .iter()
            .filter_map(|record| {
                let (uuid, data) = match record.ad_type {
                    ad_type::SERVICE_DATA_16 if record.payload.len() >= 2 => {
                        let short = u16::from_le_bytes([record.payload[0], record.payload[1]]);
                        (uuid_from_u32(short as u32), &record.payload[2..])
                    }
                    ad_type::SERVICE_DATA_32 if record.payload.len() >= 4 => {
                        let short = u32::from_le_bytes([
                            record.payload[0],
                            record.payload[1],
                            record.payload[2],
                            record.payload[3],
                        ]);
                        (uuid_from_u32(short), &record.payload[4..])
                    }
                    ad_type::SERVICE_DATA_128 if record.payload.len() >= 16 => (
                        uuid_from_le_slice(&record.payload[..16]),
                        &record.payload[16..],
                    ),
                    _ => return None,
                };
                Some((uuid, data.to_vec()))
            })
            .collect()
    }
}

/// Builds advertising data from typed fields.
#[derive(Debug, Clone, Default)]
pub struct AdvertisementBuilder {
    records: Vec<AdRecord>,
}

impl AdvertisementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.records.push(AdRecord::new(ad_type::FLAGS, [flags]));
        self
    }

    pub fn local_name(mut self, name: &str) -> Self {
        self.records
            .push(AdRecord::new(ad_type::COMPLETE_LOCAL_NAME, name.as_bytes()));
        self
    }

    pub fn tx_power_level(mut self, level: i8) -> Self {
        self.records
            .push(AdRecord::new(ad_type::TX_POWER_LEVEL, [level as u8]));
        self
    }

    pub fn manufacturer_data(mut self, company: u16, data: &[u8]) -> Self {
        let mut payload = company.to_le_bytes().to_vec();
        payload.extend_from_slice(data);
        self.records
            .push(AdRecord::new(ad_type::MANUFACTURER_SPECIFIC_DATA, payload));
        self
    }

    /// Adds the uuids as complete lists, using the shortest form each allows.
    pub fn service_uuids<'a>(mut self, uuids: impl IntoIterator<Item = &'a Uuid>) -> Self {
        let mut short = Vec::new();
        let mut long = Vec::new();
        for uuid in uuids {
            match short_form(uuid) {
                Some(value) if value <= u16::MAX as u32 => {
                    short.extend_from_slice(&(value as u16).to_le_bytes())
                }
                _ => long.extend(uuid_to_le_bytes(uuid)),
            }
        }
        if !short.is_empty() {
            self.records
                .push(AdRecord::new(ad_type::COMPLETE_SERVICE_UUIDS_16, short));
        }
        if !long.is_empty() {
            self.records
                .push(AdRecord::new(ad_type::COMPLETE_SERVICE_UUIDS_128, long));
        }
        self
    }

    pub fn service_data(mut self, uuid: &Uuid, data: &[u8]) -> Self {
        let (ad_type, mut payload) = match short_form(uuid) {
            Some(value) if value <= u16::MAX as u32 => {
                (ad_type::SERVICE_DATA_16, (value as u16).to_le_bytes().to_vec())
            }
            _ => (ad_type::SERVICE_DATA_128, uuid_to_le_bytes(uuid).to_vec()),
        };
        payload.extend_from_slice(data);
        self.records.push(AdRecord::new(ad_type, payload));
        self
    }

    pub fn build(self) -> Advertisement {
        Advertisement::from_records(self.records)
    }
}

fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// 128-bit uuids travel little-endian.
fn uuid_from_le_slice(bytes: &[u8]) -> Uuid {
    let mut be = [0u8; 16];
    for (dst, src) in be.iter_mut().zip(bytes.iter().rev()) {
        *dst = *src;
    }
    Uuid::from_bytes(be)
}

fn uuid_to_le_bytes(uuid: &Uuid) -> [u8; 16] {
    let mut le = *uuid.as_bytes();
    le.reverse();
    le
}

/// The 32-bit alias of a uuid built on the Bluetooth base uuid.
fn short_form(uuid: &Uuid) -> Option<u32> {
    let value = uuid.as_u128();
    if value & ((1u128 << 96) - 1) == BASE_UUID {
        Some((value >> 96) as u32)
    } else {
        None
    }
}
