//! The GATT-level surface a platform Bluetooth stack has to provide.
//!
//! Every request on a [`GattLink`] is fire-and-forget: the call itself only
//! reports whether the request could be issued, and the outcome arrives later
//! as a [`GattEvent`] on the link's [`EventSink`].

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::error::GattStatus;
use crate::{Characteristic, Descriptor, Service, WriteType};

/// Link-layer state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Asynchronous completion reported by the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    ConnectionStateChanged {
        status: GattStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: Uuid,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWritten {
        characteristic: Uuid,
        status: GattStatus,
    },
    NotificationSet {
        characteristic: Uuid,
        enabled: bool,
        status: GattStatus,
    },
    DescriptorRead {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWritten {
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    RssiRead {
        rssi: i16,
        status: GattStatus,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
}

/// Where a link reports its [`GattEvent`]s.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: UnboundedSender<GattEvent>,
}

impl EventSink {
    pub fn channel() -> (EventSink, UnboundedReceiver<GattEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (EventSink { sender }, receiver)
    }

    pub fn emit(&self, event: GattEvent) {
        if let Err(e) = self.sender.send(event) {
            log::debug!("Link event dropped, nobody is listening: {:?}", e.0);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Synchronous refusal to issue a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("{0} was rejected by the platform")]
    Rejected(&'static str),
    #[error("{0} is not supported by the platform")]
    Unsupported(&'static str),
    #[error("unknown peripheral {0}")]
    UnknownPeripheral(String),
    #[error("unknown attribute {0}")]
    UnknownAttribute(Uuid),
    #[error("no async runtime available")]
    NoRuntime,
}

/// Opens links to peripherals.
pub trait PlatformAdapter: Send + Sync {
    /// Create a link object for `identity` and start connecting it.
    ///
    /// Connection progress is reported as [`GattEvent::ConnectionStateChanged`].
    fn connect(&self, identity: &str, events: EventSink) -> Result<Arc<dyn GattLink>, PlatformError>;
}

/// One physical link to a peripheral.
pub trait GattLink: Send + Sync {
    /// Retry the connection on the existing link object.
    fn reconnect(&self) -> Result<(), PlatformError>;

    fn disconnect(&self) -> Result<(), PlatformError>;

    /// Release the link object. No events are expected afterwards.
    fn close(&self);

    fn discover_services(&self) -> Result<(), PlatformError>;

    /// Services found by the last completed discovery.
    fn services(&self) -> Vec<Service>;

    fn read_characteristic(&self, characteristic: &Characteristic) -> Result<(), PlatformError>;

    fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), PlatformError>;

    fn set_notification(
        &self,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> Result<(), PlatformError>;

    fn read_descriptor(&self, descriptor: &Descriptor) -> Result<(), PlatformError>;

    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<(), PlatformError>;

    fn read_rssi(&self) -> Result<(), PlatformError>;

    fn request_mtu(&self, mtu: u16) -> Result<(), PlatformError>;
}
