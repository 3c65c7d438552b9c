//! This example finds the first BLE device that advertises the heart rate service,
//! connects to it and starts listening for heart rate values.

use std::sync::Arc;

use blecentral::common::characteristics::HEART_RATE_MEASUREMENT;
use blecentral::common::services::HEART_RATE;
use blecentral::{Central, Error, ScanConfig, Scanner, SessionEvent};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let config = ScanConfig::default()
        .filter(|peripheral| peripheral.advertisement.service_uuids().contains(&HEART_RATE));

    let mut scanner = Scanner::new();
    scanner.start(config).await?;

    let mut nearby_stream = scanner.nearby_stream();
    let address = loop {
        match nearby_stream.next().await {
            Some(nearby) if !nearby.is_empty() => break nearby[0].address.clone(),
            Some(_) => continue,
            None => return Ok(()),
        }
    };

    let adapter = scanner.adapter().expect("scanner is running");
    scanner.stop().await?;

    let central = Central::new(Arc::new(adapter));
    let session = central.session(&address);

    // Report how the session ends
    let mut events = session.events();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let SessionEvent::Ended(error) = event {
                println!("Session ended: {:?}", error);
            }
        }
    });

    session.start().await?;

    for service in session.services() {
        println!("Service: {:?}", service);
    }

    let mut hr_stream = session.start_listening(HEART_RATE_MEASUREMENT).await?;

    while let Some(hr) = hr_stream.next().await {
        println!("RSSI: {}", session.read_rssi().await.unwrap_or(0));
        println!("{:?}", hr);
    }

    Ok(())
}
