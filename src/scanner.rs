use std::cmp::Ordering;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::broadcast::{self, Sender};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::advertisement::AdvertisementBuilder;
use crate::backend::BtleplugAdapter;
use crate::error::SCAN_DOMAIN;
use crate::nearby::{EmitterHandle, NearbyConfig, NearbyPeripheral, NearbyTable};
use crate::{Error, ErrorKind, Result};

#[derive(Debug, Default)]
pub struct ScanConfig {
    /// Index of the Bluetooth adapter to use. The first found adapter is used by default.
    adapter_index: usize,
    /// Filters, ordering and throttling of the emitted nearby list.
    nearby: NearbyConfig,
    /// The scan is stopped when timeout duration is reached.
    timeout: Option<Duration>,
}

impl ScanConfig {
    /// Index of bluetooth adapter to use
    pub fn adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Filter scanned devices based on the device address
    pub fn filter_by_address(mut self, func: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.nearby = self.nearby.filter_by_address(func);
        self
    }

    /// Filter scanned devices based on the advertised name
    pub fn filter_by_name(mut self, func: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.nearby = self.nearby.filter_by_name(func);
        self
    }

    /// Ignore devices with a weaker signal than `rssi`
    pub fn min_rssi(mut self, rssi: i16) -> Self {
        self.nearby = self.nearby.min_rssi(rssi);
        self
    }

    /// Filter scanned devices with a custom predicate
    pub fn filter(mut self, func: impl Fn(&NearbyPeripheral) -> bool + Send + Sync + 'static) -> Self {
        self.nearby = self.nearby.filter(func);
        self
    }

    /// Order of the emitted nearby list
    pub fn sort_by(
        mut self,
        func: impl Fn(&NearbyPeripheral, &NearbyPeripheral) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.nearby = self.nearby.sort_by(func);
        self
    }

    /// Emit the nearby list at most once per `throttle`
    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.nearby = self.nearby.throttle(throttle);
        self
    }

    /// Stop the scan after given duration
    pub fn stop_after_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require that the scanned devices have a name
    pub fn require_name(self) -> Self {
        self.filter(|peripheral| peripheral.local_name().map_or(false, |name| !name.is_empty()))
    }
}

pub(crate) struct Session {
    pub(crate) _manager: Manager,
    pub(crate) adapter: BtleplugAdapter,
    pub(crate) nearby: NearbyTable,
}

/// Scan start/stop control surface feeding the nearby-peripheral list.
pub struct Scanner {
    /// Cleared by the listener when the scan stops on its own.
    session: Arc<RwLock<Option<Arc<Session>>>>,
    nearby_sender: Sender<Vec<NearbyPeripheral>>,
    scan_stopper: Option<Trigger>,
    nearby_stream_stoppers: Arc<RwLock<Vec<Trigger>>>,
}

impl Default for Scanner {
    fn default() -> Self {
        Scanner::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        let (nearby_sender, _) = broadcast::channel(16);

        Self {
            session: Arc::new(RwLock::new(None)),
            nearby_sender,
            scan_stopper: None,
            nearby_stream_stoppers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Start scanning for ble devices.
    pub async fn start(&mut self, config: ScanConfig) -> Result<()> {
        if self.current().is_some() {
            log::info!("Scanner is already started.");
            return Ok(());
        }

        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if config.adapter_index >= adapters.len() {
            return Err(Error::new(
                ErrorKind::PreconditionFailed(format!("no adapter at index {}", config.adapter_index)),
                SCAN_DOMAIN,
            ));
        }

        let adapter = adapters.swap_remove(config.adapter_index);

        log::trace!("Using adapter: {:?}", adapter);

        let nearby = NearbyTable::with_sender(config.nearby, self.nearby_sender.clone());
        let session = Arc::new(Session {
            _manager: manager,
            adapter: BtleplugAdapter::new(adapter),
            nearby,
        });

        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());

        let started = ScanContext::start(
            config.timeout,
            session,
            self.session.clone(),
            self.nearby_stream_stoppers.clone(),
        )
        .await;

        match started {
            Ok(stopper) => {
                self.scan_stopper = Some(stopper);
                Ok(())
            }
            Err(e) => {
                self.session.write().unwrap_or_else(PoisonError::into_inner).take();
                Err(e)
            }
        }
    }

    /// Stop scanning for ble devices.
    pub async fn stop(&mut self) -> Result<()> {
        let session = self.session.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(session) = session {
            self.scan_stopper.take();
            session.adapter.adapter().stop_scan().await?;
            self.nearby_stream_stoppers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        } else {
            log::info!("Scanner is already stopped");
        }

        Ok(())
    }

    /// Adapter of the running scan, for opening sessions to scanned peripherals.
    pub fn adapter(&self) -> Option<BtleplugAdapter> {
        self.current().map(|session| session.adapter.clone())
    }

    /// Nearby-peripheral table of the running scan.
    pub fn nearby(&self) -> Option<NearbyTable> {
        self.current().map(|session| session.nearby.clone())
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Create a new stream that receives the nearby-peripheral list.
    pub fn nearby_stream(
        &mut self,
    ) -> Valved<Pin<Box<dyn Stream<Item = Vec<NearbyPeripheral>> + Send>>> {
        let receiver = self.nearby_sender.subscribe();

        let stream: Pin<Box<dyn Stream<Item = Vec<NearbyPeripheral>> + Send>> =
            Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() }));

        let (trigger, stream) = Valved::new(stream);
        self.nearby_stream_stoppers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trigger);

        stream
    }
}

struct ScanContext {
    /// Reference to the bluetooth session instance
    session: Arc<Session>,
    /// Slot of the owning scanner, emptied when the scan stops on its own.
    current: Arc<RwLock<Option<Arc<Session>>>>,
    /// The scan is stopped when timeout duration is reached.
    timeout: Option<Duration>,
    /// Publishes the nearby list while the scan runs.
    _emitter: EmitterHandle,
}

impl ScanContext {
    async fn start(
        timeout: Option<Duration>,
        session: Arc<Session>,
        current: Arc<RwLock<Option<Arc<Session>>>>,
        nearby_stream_stoppers: Arc<RwLock<Vec<Trigger>>>,
    ) -> Result<Trigger> {
        log::info!("Starting the scan");

        let adapter = session.adapter.adapter();
        let (stopper, events) = Valved::new(adapter.events().await?);

        adapter.start_scan(Default::default()).await?;

        let ctx = ScanContext {
            _emitter: session.nearby.spawn_emitter(),
            session,
            current,
            timeout,
        };

        tokio::spawn(async move {
            ctx.listen(events, nearby_stream_stoppers).await;
        });

        Ok(stopper)
    }

    async fn listen(
        self,
        mut event_stream: Valved<Pin<Box<dyn Stream<Item = CentralEvent> + Send>>>,
        nearby_stream_stoppers: Arc<RwLock<Vec<Trigger>>>,
    ) {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        while let Some(event) = next_before(&mut event_stream, deadline).await {
            match event {
                CentralEvent::DeviceDiscovered(peripheral_id)
                | CentralEvent::DeviceUpdated(peripheral_id)
                | CentralEvent::ManufacturerDataAdvertisement { id: peripheral_id, .. }
                | CentralEvent::ServiceDataAdvertisement { id: peripheral_id, .. }
                | CentralEvent::ServicesAdvertisement { id: peripheral_id, .. } => {
                    self.on_advertisement(peripheral_id).await;
                }
                _ => {}
            }
        }

        // Still ours when the loop ended without `Scanner::stop`.
        let owned = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            match current.as_ref() {
                Some(session) if Arc::ptr_eq(session, &self.session) => current.take(),
                _ => None,
            }
        };
        if owned.is_some() {
            if let Err(e) = self.session.adapter.adapter().stop_scan().await {
                log::warn!("Could not stop the scan: {}", e);
            }
        }

        nearby_stream_stoppers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        log::info!("Scanner was stopped.");
    }

    async fn on_advertisement(&self, peripheral_id: PeripheralId) {
        let adapter: &Adapter = self.session.adapter.adapter();
        let Ok(peripheral) = adapter.peripheral(&peripheral_id).await else {
            return;
        };
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            _ => return,
        };
        let Some(rssi) = properties.rssi else {
            log::trace!("No signal strength for {:?} yet", peripheral_id);
            return;
        };

        let identity = self.session.adapter.remember(peripheral);
        self.session
            .nearby
            .observe(&identity, rssi, scan_record(&properties));
    }
}

/// Next item of `events`, or `None` once the stream ends or `deadline` passes.
async fn next_before<S>(events: &mut S, deadline: Option<Instant>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    let Some(deadline) = deadline else {
        return events.next().await;
    };

    tokio::select! {
        event = events.next() => event,
        _ = tokio::time::sleep_until(deadline) => {
            log::info!("Scanner stop condition reached.");
            None
        }
    }
}

/// Rebuild advertising data from the fields the platform parsed out of it.
fn scan_record(properties: &PeripheralProperties) -> Vec<u8> {
    let mut builder = AdvertisementBuilder::new();

    if let Some(name) = &properties.local_name {
        builder = builder.local_name(name);
    }
    if let Some(level) = properties.tx_power_level {
        builder = builder.tx_power_level(level.clamp(i8::MIN as i16, i8::MAX as i16) as i8);
    }
    builder = builder.service_uuids(properties.services.iter());
    for (company, data) in &properties.manufacturer_data {
        builder = builder.manufacturer_data(*company, data);
    }
    for (uuid, data) in &properties.service_data {
        builder = builder.service_data(uuid, data);
    }

    builder.build().raw().to_vec()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use btleplug::api::bleuuid::uuid_from_u16;

    use super::*;
    use crate::advertisement::Advertisement;

    #[test]
    fn scan_record_carries_parsed_fields() {
        let heart_rate = uuid_from_u16(0x180D);
        let mut manufacturer_data = HashMap::new();
        manufacturer_data.insert(0x004C, vec![0x02, 0x15]);

        let properties = PeripheralProperties {
            local_name: Some("HRM".to_string()),
            tx_power_level: Some(-8),
            manufacturer_data,
            services: vec![heart_rate],
            ..PeripheralProperties::default()
        };

        let advertisement = Advertisement::parse(scan_record(&properties));

        assert_eq!(advertisement.local_name().as_deref(), Some("HRM"));
        assert_eq!(advertisement.tx_power_level(), Some(-8));
        assert_eq!(advertisement.service_uuids(), vec![heart_rate]);
        assert_eq!(advertisement.manufacturer_data().get(&0x004C), Some(&vec![0x02, 0x15]));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_scan_ends_at_the_deadline() {
        let start = Instant::now();
        let mut events = futures::stream::pending::<CentralEvent>();

        let event = next_before(&mut events, Some(start + Duration::from_secs(5))).await;

        assert!(event.is_none());
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn events_before_the_deadline_pass_through() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = futures::stream::iter([1, 2]);

        assert_eq!(next_before(&mut events, Some(deadline)).await, Some(1));
        assert_eq!(next_before(&mut events, Some(deadline)).await, Some(2));
        assert_eq!(next_before(&mut events, None).await, None);
    }

    #[test]
    fn out_of_range_tx_power_is_clamped() {
        let properties = PeripheralProperties {
            tx_power_level: Some(-300),
            ..PeripheralProperties::default()
        };

        let advertisement = Advertisement::parse(scan_record(&properties));
        assert_eq!(advertisement.tx_power_level(), Some(i8::MIN));
    }
}
