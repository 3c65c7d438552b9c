//! This example finds the first device advertising the battery service
//! and reads the device's battery level.

use std::sync::Arc;

use blecentral::common::characteristics::BATTERY_LEVEL;
use blecentral::common::services::BATTERY;
use blecentral::{Central, Error, ScanConfig, Scanner};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    // Filters devices that advertise the battery service
    let config = ScanConfig::default()
        .filter(|peripheral| peripheral.advertisement.service_uuids().contains(&BATTERY));

    let mut scanner = Scanner::new();
    scanner.start(config).await?;

    // Take the first discovered device
    let mut nearby_stream = scanner.nearby_stream();
    let peripheral = loop {
        match nearby_stream.next().await {
            Some(nearby) if !nearby.is_empty() => break nearby[0].clone(),
            Some(_) => continue,
            None => return Ok(()),
        }
    };
    println!("{:?}", peripheral);

    let adapter = scanner.adapter().expect("scanner is running");
    scanner.stop().await?;

    let central = Central::new(Arc::new(adapter));
    let session = central.session(&peripheral.address);
    session.start().await?;

    // Read the battery level
    let battery_level = session.read(BATTERY_LEVEL).await?;
    println!("Battery level: {:?}", battery_level);

    session.end(None).await
}
