//! BLE central-role session engine.
//!
//! The library connects to GATT peripherals, discovers their services and runs
//! reads, writes and notification subscriptions against them. Every request is
//! guarded by a watchdog so that callers always get an answer, and a link that
//! times out is torn down instead of being left half-open.
//!
//! Advertisements picked up while scanning are parsed and collected into a
//! table of nearby peripherals that is published at a throttled rate.
//!
//! ## Usage
//!
//! Here is an example on how to find a device advertising a name, connect to
//! it and read its battery level:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use blecentral::common::characteristics::BATTERY_LEVEL;
//! use blecentral::{Central, Error, ScanConfig, Scanner};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     pretty_env_logger::init();
//!
//!     // Only report devices that advertise a name
//!     let config = ScanConfig::default().require_name();
//!
//!     // Start scanning for devices
//!     let mut scanner = Scanner::new();
//!     scanner.start(config).await?;
//!
//!     // Wait until something shows up
//!     let nearby = scanner.nearby_stream().next().await.unwrap_or_default();
//!     let Some(peripheral) = nearby.first() else {
//!         return Ok(());
//!     };
//!     println!("{:?}", peripheral.local_name());
//!
//!     // Connect and discover
//!     let central = Central::new(Arc::new(scanner.adapter().unwrap()));
//!     let session = central.session(&peripheral.address);
//!     session.start().await?;
//!
//!     // Read the battery level
//!     println!("Battery level: {:?}", session.read(BATTERY_LEVEL).await?);
//!
//!     session.end(None).await
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use btleplug::api::BDAddr;

pub use advertisement::{parse_records, AdRecord, Advertisement, AdvertisementBuilder};
pub use backend::BtleplugAdapter;
pub use central::Central;
pub use characteristic::{Characteristic, CharacteristicProperties, Descriptor, WriteType};
pub use connection::{ConnectionConfig, ConnectionState, GattConnection};
pub use discovery::DiscoverySnapshot;
pub use error::{Error, ErrorCode, ErrorKind, GattStatus, Result};
pub use nearby::{EmitterHandle, NearbyConfig, NearbyPeripheral, NearbyTable};
pub use operation::{OperationKey, OperationKind, OperationOutput, OperationRegistry, OperationTarget};
pub use scanner::{ScanConfig, Scanner};
pub use service::Service;
pub use session::{ErrorHandler, PeripheralSession, SessionConfig, SessionEvent};
pub use watchdog::Watchdog;

mod backend;
mod central;
mod connection;
mod scanner;
mod session;

mod characteristic;
mod error;
mod operation;
mod service;
mod watchdog;

pub mod advertisement;
pub mod common;
pub mod discovery;
pub mod nearby;
pub mod platform;
