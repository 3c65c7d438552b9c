use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{Error, Result, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic,
    SetNotification,
    ReadDescriptor,
    WriteDescriptor,
    ReadRssi,
    RequestMtu,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::DiscoverServices => "discover_services",
            OperationKind::ReadCharacteristic => "read_characteristic",
            OperationKind::WriteCharacteristic => "write_characteristic",
            OperationKind::SetNotification => "set_notification",
            OperationKind::ReadDescriptor => "read_descriptor",
            OperationKind::WriteDescriptor => "write_descriptor",
            OperationKind::ReadRssi => "read_rssi",
            OperationKind::RequestMtu => "request_mtu",
        }
    }

    /// Platform method reported in `OperationFailed` errors.
    pub fn method(self) -> &'static str {
        match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::DiscoverServices => "discoverServices",
            OperationKind::ReadCharacteristic => "readCharacteristic",
            OperationKind::WriteCharacteristic => "writeCharacteristic",
            OperationKind::SetNotification => "setCharacteristicNotification",
            OperationKind::ReadDescriptor => "readDescriptor",
            OperationKind::WriteDescriptor => "writeDescriptor",
            OperationKind::ReadRssi => "readRemoteRssi",
            OperationKind::RequestMtu => "requestMtu",
        }
    }

    /// Whether a watchdog fire for this kind only fails the operation.
    ///
    /// Everything else leaves the link in an unknown state and forces a disconnect.
    pub fn is_passive(self) -> bool {
        matches!(self, OperationKind::ReadRssi | OperationKind::RequestMtu)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an operation acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationTarget {
    Link,
    Characteristic(Uuid),
    Descriptor { characteristic: Uuid, descriptor: Uuid },
}

/// Identifies one pending operation of one peripheral.
///
/// Used as the registry key and, prefixed by the peripheral identity, as the
/// watchdog timer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub kind: OperationKind,
    pub target: OperationTarget,
}

impl OperationKey {
    pub fn link(kind: OperationKind) -> Self {
        Self {
            kind,
            target: OperationTarget::Link,
        }
    }

    pub fn characteristic(kind: OperationKind, characteristic: Uuid) -> Self {
        Self {
            kind,
            target: OperationTarget::Characteristic(characteristic),
        }
    }

    pub fn descriptor(kind: OperationKind, characteristic: Uuid, descriptor: Uuid) -> Self {
        Self {
            kind,
            target: OperationTarget::Descriptor {
                characteristic,
                descriptor,
            },
        }
    }

    /// Timer id for this operation on the peripheral with the given identity.
    pub fn timer_id(&self, identity: &str) -> String {
        format!("{}__{}", identity, self)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Uuid's Display is the lowercase hyphenated form.
        match self.target {
            OperationTarget::Link => write!(f, "{}", self.kind),
            OperationTarget::Characteristic(uuid) => write!(f, "{}__{}", self.kind, uuid),
            OperationTarget::Descriptor {
                characteristic,
                descriptor,
            } => write!(f, "{}__{}__{}", self.kind, characteristic, descriptor),
        }
    }
}

/// Value produced by a completed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
    Done,
    Value(Vec<u8>),
    Services(Vec<Service>),
    Rssi(i16),
    Mtu(u16),
}

pub type Completion = oneshot::Sender<Result<OperationOutput>>;

/// Pending completions keyed by operation.
///
/// At most one entry per key. A result is delivered at most once: `complete`
/// pops the entry before sending.
pub struct OperationRegistry<C = Completion> {
    pending: Mutex<HashMap<OperationKey, C>>,
}

impl<C> Default for OperationRegistry<C> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> OperationRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `completion` for `key`, replacing any earlier entry.
    pub fn register(&self, key: OperationKey, completion: C) {
        if self.lock().insert(key, completion).is_some() {
            log::debug!("Replaced pending completion for {}", key);
        }
    }

    /// Remove and return the completion registered for `key`.
    pub fn take(&self, key: &OperationKey) -> Option<C> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &OperationKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every pending completion without invoking it.
    pub fn clear(&self) {
        let pending = std::mem::take(&mut *self.lock());
        if !pending.is_empty() {
            log::debug!("Dropped {} pending completions", pending.len());
        }
    }

    /// Remove every pending completion.
    pub fn drain(&self) -> Vec<(OperationKey, C)> {
        self.lock().drain().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OperationKey, C>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OperationRegistry<Completion> {
    /// Deliver `result` to whoever waits on `key`.
    ///
    /// Returns false if nobody was waiting, in which case the result is dropped.
    pub fn complete(&self, key: &OperationKey, result: Result<OperationOutput>) -> bool {
        match self.take(key) {
            Some(completion) => {
                deliver(key, completion, result);
                true
            }
            None => {
                log::trace!("Nobody waiting for {}, dropping result", key);
                false
            }
        }
    }
}

/// Send a result to a waiting caller. A caller that gave up is logged and ignored.
pub(crate) fn deliver(key: &OperationKey, completion: Completion, result: Result<OperationOutput>) {
    if completion.send(result).is_err() {
        log::debug!("Caller of {} is no longer waiting", key);
    }
}

/// Map a dropped completion to the error the caller observes.
pub(crate) fn abandoned(_: oneshot::error::RecvError) -> Error {
    Error::disconnected(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    const HEART_RATE: Uuid = Uuid::from_u128(0x00002A37_0000_1000_8000_00805F9B34FB);
    const CCCD: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

    #[test]
    fn keys_render_lowercase() {
        let key = OperationKey::descriptor(OperationKind::ReadDescriptor, HEART_RATE, CCCD);
        assert_eq!(
            key.timer_id("AA:BB"),
            "AA:BB__read_descriptor__00002a37-0000-1000-8000-00805f9b34fb__00002902-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            OperationKey::link(OperationKind::Connect).timer_id("AA:BB"),
            "AA:BB__connect"
        );
    }

    #[test]
    fn characteristic_and_descriptor_keys_differ() {
        let characteristic = OperationKey::characteristic(OperationKind::ReadCharacteristic, HEART_RATE);
        let descriptor = OperationKey::descriptor(OperationKind::ReadDescriptor, HEART_RATE, CCCD);
        assert_ne!(characteristic, descriptor);
    }

    #[tokio::test]
    async fn completes_at_most_once() {
        let registry = OperationRegistry::new();
        let key = OperationKey::characteristic(OperationKind::ReadCharacteristic, HEART_RATE);
        let (tx, rx) = oneshot::channel();

        registry.register(key, tx);
        assert!(registry.complete(&key, Ok(OperationOutput::Value(vec![1]))));
        assert!(!registry.complete(&key, Err(Error::timeout(key))));

        assert_eq!(rx.await.unwrap().unwrap(), OperationOutput::Value(vec![1]));
    }

    #[tokio::test]
    async fn register_replaces_previous_waiter() {
        let registry = OperationRegistry::new();
        let key = OperationKey::link(OperationKind::ReadRssi);
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();

        registry.register(key, first_tx);
        registry.register(key, second_tx);
        assert_eq!(registry.len(), 1);

        registry.complete(&key, Ok(OperationOutput::Rssi(-40)));

        assert!(first_rx.await.is_err());
        assert_eq!(second_rx.await.unwrap().unwrap(), OperationOutput::Rssi(-40));
    }

    #[tokio::test]
    async fn clear_drops_without_delivering() {
        let registry: OperationRegistry = OperationRegistry::new();
        let key = OperationKey::link(OperationKind::DiscoverServices);
        let (tx, rx) = oneshot::channel();

        registry.register(key, tx);
        registry.clear();

        assert!(registry.is_empty());
        let error = rx.await.map_err(abandoned).unwrap_err();
        assert_eq!(error.code(), ErrorCode::Disconnected);
    }

    #[test]
    fn completing_unknown_key_is_silent() {
        let registry = OperationRegistry::new();
        let key = OperationKey::link(OperationKind::RequestMtu);
        assert!(!registry.complete(&key, Ok(OperationOutput::Mtu(247))));
    }
}
