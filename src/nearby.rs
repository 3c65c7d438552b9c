use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use crate::advertisement::Advertisement;

/// A peripheral seen advertising.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyPeripheral {
    pub address: String,
    pub rssi: i16,
    /// The latest advertisement received from this peripheral.
    pub advertisement: Advertisement,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl NearbyPeripheral {
    pub fn local_name(&self) -> Option<String> {
        self.advertisement.local_name()
    }
}

type Predicate = Arc<dyn Fn(&NearbyPeripheral) -> bool + Send + Sync>;
type Comparator = Arc<dyn Fn(&NearbyPeripheral, &NearbyPeripheral) -> Ordering + Send + Sync>;

/// How the nearby list is filtered, ordered and paced.
#[derive(Clone)]
pub struct NearbyConfig {
    /// Minimum time between two emitted snapshots. Zero emits every change.
    throttle: Duration,
    /// All of them must accept a peripheral for it to be emitted.
    filters: Vec<Predicate>,
    order: Option<Comparator>,
}

impl Default for NearbyConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(300),
            filters: Vec::new(),
            order: None,
        }
    }
}

impl fmt::Debug for NearbyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NearbyConfig")
            .field("throttle", &self.throttle)
            .field("filters", &self.filters.len())
            .field("ordered", &self.order.is_some())
            .finish()
    }
}

impl NearbyConfig {
    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Add a predicate to the filter chain.
    pub fn filter(mut self, func: impl Fn(&NearbyPeripheral) -> bool + Send + Sync + 'static) -> Self {
        self.filters.push(Arc::new(func));
        self
    }

    pub fn filter_by_address(self, func: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.filter(move |peripheral| func(&peripheral.address))
    }

    /// Peripherals that do not advertise a name are filtered out.
    pub fn filter_by_name(self, func: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.filter(move |peripheral| {
            peripheral
                .local_name()
                .map(|name| func(&name))
                .unwrap_or(false)
        })
    }

    pub fn min_rssi(self, rssi: i16) -> Self {
        self.filter(move |peripheral| peripheral.rssi >= rssi)
    }

    pub fn sort_by(
        mut self,
        func: impl Fn(&NearbyPeripheral, &NearbyPeripheral) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.order = Some(Arc::new(func));
        self
    }

    /// Strongest signal first.
    pub fn sort_by_rssi(self) -> Self {
        self.sort_by(|a, b| b.rssi.cmp(&a.rssi))
    }

    fn accepts(&self, peripheral: &NearbyPeripheral) -> bool {
        self.filters.iter().all(|filter| filter(peripheral))
    }
}

struct Table {
    entries: Mutex<HashMap<String, NearbyPeripheral>>,
    version: watch::Sender<u64>,
    emitted: broadcast::Sender<Vec<NearbyPeripheral>>,
    config: NearbyConfig,
}

/// Peripherals currently advertising nearby, one entry per address.
///
/// Entries are updated in place and only removed explicitly. Snapshots are
/// published at most once per throttle interval by the task started with
/// [`NearbyTable::spawn_emitter`].
#[derive(Clone)]
pub struct NearbyTable {
    table: Arc<Table>,
}

/// Stops the emitter task when dropped.
pub struct EmitterHandle {
    _stopper: Trigger,
}

impl NearbyTable {
    pub fn new(config: NearbyConfig) -> Self {
        let (emitted, _) = broadcast::channel(16);
        Self::with_sender(config, emitted)
    }

    /// Publish snapshots through an existing channel.
    pub(crate) fn with_sender(
        config: NearbyConfig,
        emitted: broadcast::Sender<Vec<NearbyPeripheral>>,
    ) -> Self {
        let (version, _) = watch::channel(0);

        Self {
            table: Arc::new(Table {
                entries: Mutex::new(HashMap::new()),
                version,
                emitted,
                config,
            }),
        }
    }

    /// Record an advertisement from `address`.
    pub fn observe(&self, address: &str, rssi: i16, raw: impl Into<Vec<u8>>) {
        let advertisement = Advertisement::parse(raw);
        let now = Instant::now();

        {
            let mut entries = self.lock();
            match entries.get_mut(address) {
                Some(entry) => {
                    entry.rssi = rssi;
                    entry.advertisement = advertisement;
                    entry.last_seen = now;
                }
                None => {
                    log::debug!("New nearby peripheral {} ({} dBm)", address, rssi);
                    entries.insert(
                        address.to_string(),
                        NearbyPeripheral {
                            address: address.to_string(),
                            rssi,
                            advertisement,
                            first_seen: now,
                            last_seen: now,
                        },
                    );
                }
            }
        }

        self.table.version.send_modify(|version| *version += 1);
    }

    pub fn get(&self, address: &str) -> Option<NearbyPeripheral> {
        self.lock().get(address).cloned()
    }

    pub fn remove(&self, address: &str) -> Option<NearbyPeripheral> {
        let removed = self.lock().remove(address);
        if removed.is_some() {
            self.table.version.send_modify(|version| *version += 1);
        }
        removed
    }

    /// Keep only the entries `func` accepts. Returns how many were evicted.
    pub fn retain(&self, func: impl Fn(&NearbyPeripheral) -> bool) -> usize {
        let evicted = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|_, peripheral| func(peripheral));
            before - entries.len()
        };
        if evicted > 0 {
            log::debug!("Evicted {} nearby peripherals", evicted);
            self.table.version.send_modify(|version| *version += 1);
        }
        evicted
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.table.version.send_modify(|version| *version += 1);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every entry, unfiltered and unordered.
    pub fn entries(&self) -> Vec<NearbyPeripheral> {
        self.lock().values().cloned().collect()
    }

    /// Filtered and ordered copy of the table, as it would be emitted now.
    pub fn snapshot(&self) -> Vec<NearbyPeripheral> {
        let config = &self.table.config;
        let mut snapshot = self
            .lock()
            .values()
            .filter(|peripheral| config.accepts(peripheral))
            .cloned()
            .collect::<Vec<_>>();

        if let Some(order) = &config.order {
            snapshot.sort_by(|a, b| order(a, b));
        }
        snapshot
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<NearbyPeripheral>> {
        self.table.emitted.subscribe()
    }

    /// Create a new stream that receives the emitted snapshots.
    pub fn stream(&self) -> Pin<Box<dyn Stream<Item = Vec<NearbyPeripheral>> + Send>> {
        Box::pin(BroadcastStream::new(self.subscribe()).filter_map(|x| async move { x.ok() }))
    }

    /// Start publishing snapshots. Publishing stops when the handle is dropped.
    pub fn spawn_emitter(&self) -> EmitterHandle {
        let changes = WatchStream::from_changes(self.table.version.subscribe());
        let (stopper, mut changes) = Valved::new(Box::pin(changes));
        let table = self.clone();
        let throttle = self.table.config.throttle;

        tokio::spawn(async move {
            while changes.next().await.is_some() {
                let snapshot = table.snapshot();
                log::trace!("Emitting {} nearby peripherals", snapshot.len());
                table.table.emitted.send(snapshot).ok();

                if !throttle.is_zero() {
                    tokio::time::sleep(throttle).await;
                }
            }
            log::debug!("Nearby emitter stopped");
        });

        EmitterHandle { _stopper: stopper }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, NearbyPeripheral>> {
        self.table
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::AdvertisementBuilder;

    fn named(name: &str) -> Vec<u8> {
        AdvertisementBuilder::new().local_name(name).build().raw().to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn updates_in_place() {
        let table = NearbyTable::new(NearbyConfig::default());

        table.observe("11:22", -80, named("first"));
        let first_seen = table.get("11:22").unwrap().first_seen;
        tokio::time::sleep(Duration::from_millis(50)).await;
        table.observe("11:22", -60, named("second"));

        assert_eq!(table.len(), 1);
        let entry = table.get("11:22").unwrap();
        assert_eq!(entry.rssi, -60);
        assert_eq!(entry.local_name().as_deref(), Some("second"));
        assert_eq!(entry.first_seen, first_seen);
        assert!(entry.last_seen > first_seen);
    }

    #[tokio::test]
    async fn snapshot_filters_and_orders() {
        let config = NearbyConfig::default()
            .min_rssi(-90)
            .filter_by_name(|name| name.starts_with("HR"))
            .sort_by_rssi();
        let table = NearbyTable::new(config);

        table.observe("AA", -70, named("HR-weak"));
        table.observe("BB", -40, named("HR-strong"));
        table.observe("CC", -95, named("HR-far"));
        table.observe("DD", -30, named("scale"));
        table.observe("EE", -20, Vec::new());

        let addresses = table
            .snapshot()
            .into_iter()
            .map(|peripheral| peripheral.address)
            .collect::<Vec<_>>();
        assert_eq!(addresses, vec!["BB".to_string(), "AA".to_string()]);
        assert_eq!(table.entries().len(), 5);
    }

    #[tokio::test]
    async fn retain_evicts_explicitly() {
        let table = NearbyTable::new(NearbyConfig::default());
        table.observe("AA", -70, Vec::new());
        table.observe("BB", -99, Vec::new());

        assert_eq!(table.retain(|peripheral| peripheral.rssi > -90), 1);
        assert!(table.get("BB").is_none());
        assert!(table.remove("AA").is_some());
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn emission_is_throttled() {
        let table = NearbyTable::new(NearbyConfig::default().throttle(Duration::from_millis(300)));
        let mut snapshots = table.subscribe();
        let _emitter = table.spawn_emitter();

        // 100 advertisements per second for one second.
        for i in 0..100 {
            table.observe("11:22", -100 + i, Vec::new());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut received = Vec::new();
        while let Ok(snapshot) = snapshots.try_recv() {
            received.push(snapshot);
        }

        assert!(!received.is_empty());
        assert!(received.len() <= 4, "{} snapshots emitted", received.len());

        let rssis = received
            .iter()
            .map(|snapshot| {
                assert_eq!(snapshot.len(), 1);
                snapshot[0].rssi
            })
            .collect::<Vec<_>>();
        assert!(rssis.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn zero_throttle_emits_every_change() {
        let table = NearbyTable::new(NearbyConfig::default().throttle(Duration::ZERO));
        let mut snapshots = table.subscribe();
        let _emitter = table.spawn_emitter();

        for rssi in [-70, -60, -50] {
            table.observe("11:22", rssi, Vec::new());
            let snapshot = snapshots.recv().await.unwrap();
            assert_eq!(snapshot[0].rssi, rssi);
        }
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_emission() {
        let table = NearbyTable::new(NearbyConfig::default().throttle(Duration::ZERO));
        let mut snapshots = table.subscribe();
        let emitter = table.spawn_emitter();

        table.observe("11:22", -70, Vec::new());
        snapshots.recv().await.unwrap();

        drop(emitter);
        tokio::task::yield_now().await;
        table.observe("11:22", -60, Vec::new());
        tokio::task::yield_now().await;

        assert!(matches!(
            snapshots.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
