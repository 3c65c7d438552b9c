//! This example prints the list of nearby devices, strongest signal first,
//! until at least two devices have been seen.

use blecentral::{Error, ScanConfig, Scanner};
use futures::StreamExt;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    // Only devices with a reasonable signal, refreshed twice a second
    let config = ScanConfig::default()
        .min_rssi(-90)
        .sort_by(|a, b| b.rssi.cmp(&a.rssi))
        .throttle(Duration::from_millis(500));

    let mut scanner = Scanner::new();
    scanner.start(config).await?;

    // Create a stream that is provided with the nearby list
    let mut nearby_stream = scanner.nearby_stream();

    while let Some(nearby) = nearby_stream.next().await {
        println!("--- {} devices", nearby.len());
        for peripheral in &nearby {
            println!(
                "{} {:>4} dBm {}",
                peripheral.address,
                peripheral.rssi,
                peripheral.local_name().unwrap_or_default()
            );
        }

        if nearby.len() >= 2 {
            break;
        }
    }

    scanner.stop().await?;

    Ok(())
}
