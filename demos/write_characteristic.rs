//! This example powers on a SteamVR base station.
//! The device name should be given as a command line argument.

use std::str::FromStr;
use std::sync::Arc;

use blecentral::{Central, ErrorHandler, Error, ScanConfig, Scanner};
use futures::StreamExt;
use uuid::Uuid;

const POWER_UUID: &str = "00001525-1212-efde-1523-785feabcd124";

#[tokio::main]
async fn main() -> Result<(), Error> {
    let name = std::env::args().nth(1).expect("Expected device name");
    pretty_env_logger::init();

    let config = ScanConfig::default().filter_by_name(move |n| n.eq(&name));

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
    session.start().await?;

    let uuid = Uuid::from_str(POWER_UUID).unwrap();

    // Base stations that do not allow reading the power state still accept the write
    match session.read_with(uuid, &ErrorHandler::keep_session()).await {
        Ok(power) => println!("Power: {:?}", power),
        Err(e) => println!("Power state unknown: {}", e),
    }

    session.write(&[1], uuid, false).await?;

    session.end(None).await
}
