use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError as BroadcastRecvError};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use crate::error::GattStatus;
use crate::operation::{abandoned, deliver, OperationKey, OperationKind, OperationOutput, OperationRegistry};
use crate::platform::{EventSink, GattEvent, GattLink, LinkState, PlatformAdapter, PlatformError};
use crate::session::SessionEvent;
use crate::watchdog::Watchdog;
use crate::{Characteristic, Descriptor, Error, Result, Service, WriteType};

/// Timeouts and recovery limits of a [`GattConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    connect_timeout: Duration,
    disconnect_timeout: Duration,
    discovery_timeout: Duration,
    operation_timeout: Duration,
    rssi_timeout: Duration,
    mtu_timeout: Duration,
    quirk_reconnect_limit: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(15),
            operation_timeout: Duration::from_secs(5),
            rssi_timeout: Duration::from_secs(2),
            mtu_timeout: Duration::from_secs(5),
            quirk_reconnect_limit: Some(3),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Timeout of characteristic, descriptor and notification operations.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn rssi_timeout(mut self, timeout: Duration) -> Self {
        self.rssi_timeout = timeout;
        self
    }

    pub fn mtu_timeout(mut self, timeout: Duration) -> Self {
        self.mtu_timeout = timeout;
        self
    }

    /// How many times a link reporting GATT error 0x85 is reconnected before
    /// giving up. `None` retries forever.
    pub fn quirk_reconnect_limit(mut self, limit: Option<u32>) -> Self {
        self.quirk_reconnect_limit = limit;
        self
    }

    pub fn timeout_for(&self, kind: OperationKind) -> Duration {
        match kind {
            OperationKind::Connect => self.connect_timeout,
            OperationKind::Disconnect => self.disconnect_timeout,
            OperationKind::DiscoverServices => self.discovery_timeout,
            OperationKind::ReadRssi => self.rssi_timeout,
            OperationKind::RequestMtu => self.mtu_timeout,
            OperationKind::ReadCharacteristic
            | OperationKind::WriteCharacteristic
            | OperationKind::SetNotification
            | OperationKind::ReadDescriptor
            | OperationKind::WriteDescriptor => self.operation_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// The link was released without the platform confirming the disconnect.
    Undetermined,
}

struct LinkSlot {
    state: ConnectionState,
    gatt: Option<Arc<dyn GattLink>>,
    /// Bumped on every connect so events of a released link are ignored.
    generation: u64,
    active_job: Option<OperationKey>,
    /// Reason reported once the current link goes down.
    disconnect_error: Option<Error>,
    quirk_reconnects: u32,
}

struct Inner {
    identity: String,
    adapter: Arc<dyn PlatformAdapter>,
    watchdog: Watchdog,
    operations: OperationRegistry,
    config: ConnectionConfig,
    slot: Mutex<LinkSlot>,
    events: broadcast::Sender<SessionEvent>,
}

/// Owns the link to one peripheral and serializes every operation on it.
///
/// One job at a time: a request issued while another is outstanding fails
/// with `PreconditionFailed("session busy")`. Disconnect is the exception, it
/// cancels whatever is in flight.
#[derive(Clone)]
pub struct GattConnection {
    inner: Arc<Inner>,
}

impl GattConnection {
    pub fn new(
        identity: impl Into<String>,
        adapter: Arc<dyn PlatformAdapter>,
        watchdog: Watchdog,
        config: ConnectionConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity: identity.into(),
                adapter,
                watchdog,
                operations: OperationRegistry::new(),
                config,
                slot: Mutex::new(LinkSlot {
                    state: ConnectionState::Disconnected,
                    gatt: None,
                    generation: 0,
                    active_job: None,
                    disconnect_error: None,
                    quirk_reconnects: 0,
                }),
                events,
            }),
        }
    }

    #[inline]
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether an operation is currently outstanding.
    pub fn is_busy(&self) -> bool {
        self.inner.lock().active_job.is_some()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Open the link and wait until the platform reports it connected.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let key = OperationKey::link(OperationKind::Connect);
        let timer = key.timer_id(&inner.identity);

        let (receiver, issued) = {
            let mut slot = inner.lock();
            if slot.active_job.is_some() || inner.watchdog.is_active(&timer) {
                return Err(Error::busy());
            }
            if slot.gatt.is_some() {
                return Err(Error::already_connected());
            }

            slot.generation += 1;
            slot.state = ConnectionState::Connecting;
            slot.active_job = Some(key);
            slot.disconnect_error = None;
            slot.quirk_reconnects = 0;

            let (sender, receiver) = oneshot::channel();
            inner.operations.register(key, sender);
            inner.start_watchdog(key);

            log::info!("Connecting to {}", inner.identity);

            // Events only travel through the channel, so issuing under the lock is safe.
            let (sink, events) = EventSink::channel();
            let issued = match inner.adapter.connect(&inner.identity, sink) {
                Ok(gatt) => {
                    slot.gatt = Some(gatt);
                    tokio::spawn(listen(Arc::downgrade(inner), slot.generation, events));
                    Ok(())
                }
                Err(e) => {
                    slot.state = ConnectionState::Disconnected;
                    Err(e)
                }
            };
            (receiver, issued)
        };

        if let Err(e) = issued {
            log::warn!("Could not connect to {}: {}", inner.identity, e);
            inner.finish(key, Err(Error::operation_failed("connect", None).with_source(e)));
        }

        receiver.await.map_err(abandoned)?.map(|_| ())
    }

    /// Start disconnecting without waiting for it to finish.
    ///
    /// `error` becomes the reason reported by [`SessionEvent::Ended`]; none
    /// means an intentional disconnect. Returns false if there is no link.
    pub fn request_disconnect(&self, error: Option<Error>) -> bool {
        self.inner.begin_disconnect(error)
    }

    /// Disconnect and wait until the link has been released.
    pub async fn disconnect(&self, error: Option<Error>) -> Result<()> {
        let mut events = self.inner.events.subscribe();
        if !self.inner.begin_disconnect(error) {
            return Ok(());
        }

        loop {
            match events.recv().await {
                Ok(SessionEvent::Ended(_)) | Err(BroadcastRecvError::Closed) => return Ok(()),
                Ok(_) | Err(BroadcastRecvError::Lagged(_)) => {
                    if self.inner.lock().gatt.is_none() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Drop every pending completion unanswered and release the link.
    pub(crate) fn teardown(&self) {
        self.inner.operations.clear();
        self.inner.begin_disconnect(None);
    }

    pub async fn discover_services(&self) -> Result<Vec<Service>> {
        let key = OperationKey::link(OperationKind::DiscoverServices);
        match self.inner.execute(key, |gatt| gatt.discover_services()).await? {
            OperationOutput::Services(services) => Ok(services),
            other => Err(unexpected(key, other)),
        }
    }

    pub async fn read_characteristic(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        let key = OperationKey::characteristic(OperationKind::ReadCharacteristic, characteristic.uuid);
        match self
            .inner
            .execute(key, |gatt| gatt.read_characteristic(characteristic))
            .await?
        {
            OperationOutput::Value(value) => Ok(value),
            other => Err(unexpected(key, other)),
        }
    }

    pub async fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let key = OperationKey::characteristic(OperationKind::WriteCharacteristic, characteristic.uuid);
        self.inner
            .execute(key, |gatt| gatt.write_characteristic(characteristic, value, write_type))
            .await
            .map(|_| ())
    }

    pub async fn set_notification(&self, characteristic: &Characteristic, enabled: bool) -> Result<()> {
        let key = OperationKey::characteristic(OperationKind::SetNotification, characteristic.uuid);
        self.inner
            .execute(key, |gatt| gatt.set_notification(characteristic, enabled))
            .await
            .map(|_| ())
    }

    pub async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let key = OperationKey::descriptor(
            OperationKind::ReadDescriptor,
            descriptor.characteristic_uuid,
            descriptor.uuid,
        );
        match self
            .inner
            .execute(key, |gatt| gatt.read_descriptor(descriptor))
            .await?
        {
            OperationOutput::Value(value) => Ok(value),
            other => Err(unexpected(key, other)),
        }
    }

    pub async fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<()> {
        let key = OperationKey::descriptor(
            OperationKind::WriteDescriptor,
            descriptor.characteristic_uuid,
            descriptor.uuid,
        );
        self.inner
            .execute(key, |gatt| gatt.write_descriptor(descriptor, value))
            .await
            .map(|_| ())
    }

    /// Signal strength of the connected link.
    pub async fn read_rssi(&self) -> Result<i16> {
        let key = OperationKey::link(OperationKind::ReadRssi);
        match self.inner.execute(key, |gatt| gatt.read_rssi()).await? {
            OperationOutput::Rssi(rssi) => Ok(rssi),
            other => Err(unexpected(key, other)),
        }
    }

    /// Ask for a larger MTU. Returns the MTU the peripheral agreed on.
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        let key = OperationKey::link(OperationKind::RequestMtu);
        match self.inner.execute(key, |gatt| gatt.request_mtu(mtu)).await? {
            OperationOutput::Mtu(mtu) => Ok(mtu),
            other => Err(unexpected(key, other)),
        }
    }
}

fn unexpected(key: OperationKey, output: OperationOutput) -> Error {
    log::error!("{} completed with unexpected output {:?}", key, output);
    Error::operation_failed(key.kind.method(), None)
}

async fn listen(inner: Weak<Inner>, generation: u64, mut events: UnboundedReceiver<GattEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(generation, event);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, LinkSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timer_prefix(&self) -> String {
        format!("{}__", self.identity)
    }

    /// Register, arm the watchdog, issue. Completion comes from whichever of
    /// the synchronous failure, the platform event or the watchdog is first.
    async fn execute<F>(self: &Arc<Self>, key: OperationKey, issue: F) -> Result<OperationOutput>
    where
        F: FnOnce(&dyn GattLink) -> Result<(), PlatformError>,
    {
        let (gatt, receiver) = {
            let mut slot = self.lock();
            if slot.active_job.is_some() {
                return Err(Error::busy());
            }
            let gatt = match (&slot.gatt, slot.state) {
                (Some(gatt), ConnectionState::Connected) => gatt.clone(),
                _ => return Err(Error::not_connected()),
            };

            slot.active_job = Some(key);
            let (sender, receiver) = oneshot::channel();
            self.operations.register(key, sender);
            self.start_watchdog(key);

            (gatt, receiver)
        };

        log::debug!("{}: {} issued", self.identity, key);

        if let Err(e) = issue(gatt.as_ref()) {
            log::warn!("{}: {} could not be issued: {}", self.identity, key, e);
            self.finish(key, Err(Error::operation_failed(key.kind.method(), None).with_source(e)));
        }

        receiver.await.map_err(abandoned)?
    }

    fn start_watchdog(self: &Arc<Self>, key: OperationKey) {
        let inner = Arc::downgrade(self);
        self.watchdog.start(
            key.timer_id(&self.identity),
            self.config.timeout_for(key.kind),
            move || {
                if let Some(inner) = inner.upgrade() {
                    inner.on_timeout(key);
                }
            },
        );
    }

    fn on_timeout(self: &Arc<Self>, key: OperationKey) {
        let error = Error::timeout(key);

        match key.kind {
            OperationKind::Disconnect => self.end(error, false),
            kind if kind.is_passive() => {
                self.finish(key, Err(error));
            }
            _ => {
                if self.finish(key, Err(error.clone())) {
                    self.begin_disconnect(Some(error));
                }
            }
        }
    }

    /// Deliver the result of `key` if someone still waits for it.
    fn finish(&self, key: OperationKey, result: Result<OperationOutput>) -> bool {
        let completion = {
            let mut slot = self.lock();
            let completion = self.operations.take(&key);
            if completion.is_some() {
                self.watchdog.cancel(&key.timer_id(&self.identity));
                if slot.active_job == Some(key) {
                    slot.active_job = None;
                }
            }
            completion
        };

        match completion {
            Some(completion) => {
                match &result {
                    Ok(_) => log::debug!("{}: {} completed", self.identity, key),
                    Err(e) => log::debug!("{}: {} failed: {}", self.identity, key, e),
                }
                deliver(&key, completion, result);
                true
            }
            None => {
                log::trace!("{}: late result for {} dropped", self.identity, key);
                false
            }
        }
    }

    fn begin_disconnect(self: &Arc<Self>, error: Option<Error>) -> bool {
        let key = OperationKey::link(OperationKind::Disconnect);
        let timer = key.timer_id(&self.identity);

        let gatt = {
            let mut slot = self.lock();
            let Some(gatt) = slot.gatt.clone() else {
                return false;
            };
            if slot.disconnect_error.is_none() {
                slot.disconnect_error = Some(error.unwrap_or_else(Error::success));
            }
            if self.watchdog.is_active(&timer) {
                log::debug!("{}: already disconnecting", self.identity);
                return true;
            }
            slot.state = ConnectionState::Disconnecting;
            self.start_watchdog(key);
            gatt
        };

        log::info!("Disconnecting from {}", self.identity);

        if let Err(e) = gatt.disconnect() {
            log::warn!("{}: disconnect could not be issued: {}", self.identity, e);
            self.end(Error::operation_failed("disconnect", None).with_source(e), false);
        }
        true
    }

    /// Release the link and report the session end. Runs at most once per link.
    fn end(&self, fallback: Error, confirmed: bool) {
        let (gatt, error, pending) = {
            let mut slot = self.lock();
            let Some(gatt) = slot.gatt.take() else {
                return;
            };
            self.watchdog.cancel_prefixed(&self.timer_prefix());
            slot.state = if confirmed {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Undetermined
            };
            slot.active_job = None;
            let error = slot.disconnect_error.take().unwrap_or(fallback);
            (gatt, error, self.operations.drain())
        };

        gatt.close();

        let error = if error.is_success() {
            log::debug!("{}: link ended after a successful operation, not reporting an error", self.identity);
            None
        } else {
            Some(error)
        };

        let pending_error = error.clone().unwrap_or_else(|| Error::disconnected(None));
        for (key, completion) in pending {
            deliver(&key, completion, Err(pending_error.clone()));
        }

        match &error {
            Some(e) => log::info!("Disconnected from {}: {}", self.identity, e),
            None => log::info!("Disconnected from {}", self.identity),
        }
        self.events.send(SessionEvent::Ended(error)).ok();
    }

    fn handle_event(self: &Arc<Self>, generation: u64, event: GattEvent) {
        if self.lock().generation != generation {
            log::trace!("{}: event of a released link ignored: {:?}", self.identity, event);
            return;
        }

        log::trace!("{}: {:?}", self.identity, event);

        match event {
            GattEvent::ConnectionStateChanged { status, state } => {
                self.on_connection_state(status, state);
            }
            GattEvent::ServicesDiscovered { status } => {
                let services = self
                    .lock()
                    .gatt
                    .as_ref()
                    .map(|gatt| gatt.services())
                    .unwrap_or_default();
                self.complete(
                    OperationKey::link(OperationKind::DiscoverServices),
                    status,
                    OperationOutput::Services(services),
                );
            }
            GattEvent::CharacteristicRead {
                characteristic,
                value,
                status,
            } => self.complete(
                OperationKey::characteristic(OperationKind::ReadCharacteristic, characteristic),
                status,
                OperationOutput::Value(value),
            ),
            GattEvent::CharacteristicWritten {
                characteristic,
                status,
            } => self.complete(
                OperationKey::characteristic(OperationKind::WriteCharacteristic, characteristic),
                status,
                OperationOutput::Done,
            ),
            GattEvent::NotificationSet {
                characteristic,
                status,
                ..
            } => self.complete(
                OperationKey::characteristic(OperationKind::SetNotification, characteristic),
                status,
                OperationOutput::Done,
            ),
            GattEvent::DescriptorRead {
                characteristic,
                descriptor,
                value,
                status,
            } => self.complete(
                OperationKey::descriptor(OperationKind::ReadDescriptor, characteristic, descriptor),
                status,
                OperationOutput::Value(value),
            ),
            GattEvent::DescriptorWritten {
                characteristic,
                descriptor,
                status,
            } => self.complete(
                OperationKey::descriptor(OperationKind::WriteDescriptor, characteristic, descriptor),
                status,
                OperationOutput::Done,
            ),
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                self.events
                    .send(SessionEvent::Notification {
                        characteristic,
                        value,
                    })
                    .ok();
            }
            GattEvent::RssiRead { rssi, status } => self.complete(
                OperationKey::link(OperationKind::ReadRssi),
                status,
                OperationOutput::Rssi(rssi),
            ),
            GattEvent::MtuChanged { mtu, status } => self.complete(
                OperationKey::link(OperationKind::RequestMtu),
                status,
                OperationOutput::Mtu(mtu),
            ),
        }
    }

    fn complete(&self, key: OperationKey, status: GattStatus, output: OperationOutput) {
        let result = status.into_result(key.kind.method()).map(|_| output);
        self.finish(key, result);
    }

    fn on_connection_state(self: &Arc<Self>, status: GattStatus, state: LinkState) {
        if state == LinkState::Connected && status.is_success() {
            {
                let mut slot = self.lock();
                let connecting = slot.state == ConnectionState::Connecting
                    && self.operations.contains(&OperationKey::link(OperationKind::Connect));
                if slot.gatt.is_none() || !connecting {
                    log::trace!("{}: connected report outside of a connect ignored", self.identity);
                    return;
                }
                slot.state = ConnectionState::Connected;
                slot.disconnect_error = None;
                slot.quirk_reconnects = 0;
            }

            log::info!("Connected to {}", self.identity);
            self.finish(OperationKey::link(OperationKind::Connect), Ok(OperationOutput::Done));
            self.events.send(SessionEvent::Connected).ok();
            return;
        }

        if status == GattStatus::GATT_ERROR && self.reconnect_after_stack_error() {
            return;
        }

        match state {
            LinkState::Disconnected => {
                let was_connecting = self.lock().state == ConnectionState::Connecting;
                let error = if was_connecting {
                    Error::connection_failed(Some(status))
                } else if status.is_success() {
                    Error::disconnected(None)
                } else {
                    Error::disconnected(Some(status))
                };
                self.end(error, true);
            }
            LinkState::Disconnecting => {
                let mut slot = self.lock();
                if slot.state == ConnectionState::Connected {
                    slot.state = ConnectionState::Disconnecting;
                }
            }
            LinkState::Connecting => {}
            LinkState::Connected => {
                log::warn!("{}: connected with status {}, dropping the link", self.identity, status);
                self.begin_disconnect(Some(Error::connection_failed(Some(status))));
            }
        }
    }

    /// Reconnect the existing link object after the 0x85 stack error.
    ///
    /// Skipped when a disconnect was requested or the configured limit is
    /// reached. State is left untouched.
    fn reconnect_after_stack_error(&self) -> bool {
        let gatt = {
            let mut slot = self.lock();
            let Some(gatt) = slot.gatt.clone() else {
                return false;
            };
            if slot.disconnect_error.is_some() {
                return false;
            }
            if let Some(limit) = self.config.quirk_reconnect_limit {
                if slot.quirk_reconnects >= limit {
                    log::warn!(
                        "{}: GATT error {} persists after {} reconnects, giving up",
                        self.identity,
                        GattStatus::GATT_ERROR,
                        limit
                    );
                    return false;
                }
            }
            slot.quirk_reconnects += 1;
            gatt
        };

        log::warn!(
            "{}: GATT error {}, reconnecting the link",
            self.identity,
            GattStatus::GATT_ERROR
        );

        match gatt.reconnect() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}: reconnect could not be issued: {}", self.identity, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::CharacteristicProperties;

    /// Accepts every request and answers nothing on its own.
    #[derive(Default)]
    struct QuietLink {
        disconnects: AtomicUsize,
    }

    impl GattLink for QuietLink {
        fn reconnect(&self) -> Result<(), PlatformError> {
            Ok(())
        }

        fn disconnect(&self) -> Result<(), PlatformError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {}

        fn discover_services(&self) -> Result<(), PlatformError> {
            Ok(())
        }

        fn services(&self) -> Vec<Service> {
            Vec::new()
        }

        fn read_characteristic(&self, _: &Characteristic) -> Result<(), PlatformError> {
            Ok(())
        }

        fn write_characteristic(&self, _: &Characteristic, _: &[u8], _: WriteType) -> Result<(), PlatformError> {
            Ok(())
        }

        fn set_notification(&self, _: &Characteristic, _: bool) -> Result<(), PlatformError> {
            Ok(())
        }

        fn read_descriptor(&self, _: &Descriptor) -> Result<(), PlatformError> {
            Ok(())
        }

        fn write_descriptor(&self, _: &Descriptor, _: &[u8]) -> Result<(), PlatformError> {
            Ok(())
        }

        fn read_rssi(&self) -> Result<(), PlatformError> {
            Ok(())
        }

        fn request_mtu(&self, _: u16) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct QuietAdapter {
        link: Arc<QuietLink>,
        sink: Mutex<Option<EventSink>>,
    }

    impl QuietAdapter {
        async fn emit(&self, event: GattEvent) {
            loop {
                let sink = self.sink.lock().unwrap().clone();
                if let Some(sink) = sink {
                    sink.emit(event);
                    return;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    impl PlatformAdapter for QuietAdapter {
        fn connect(&self, _identity: &str, events: EventSink) -> Result<Arc<dyn GattLink>, PlatformError> {
            *self.sink.lock().unwrap() = Some(events);
            Ok(self.link.clone())
        }
    }

    fn battery_level() -> Characteristic {
        Characteristic {
            uuid: Uuid::from_u128(0x00002A19_0000_1000_8000_00805F9B34FB),
            service_uuid: Uuid::from_u128(0x0000180F_0000_1000_8000_00805F9B34FB),
            properties: CharacteristicProperties(CharacteristicProperties::READ),
            descriptors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn expiry_after_completion_keeps_the_link() {
        let adapter = Arc::new(QuietAdapter::default());
        let (events, _) = broadcast::channel(16);
        let connection = GattConnection::new(
            "AA:BB",
            adapter.clone(),
            Watchdog::new(),
            ConnectionConfig::default(),
            events,
        );

        let connecting = tokio::spawn({
            let connection = connection.clone();
            async move { connection.connect().await }
        });
        adapter
            .emit(GattEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                state: LinkState::Connected,
            })
            .await;
        connecting.await.unwrap().unwrap();

        // The timer was already claimed when the connect completed.
        connection.inner.on_timeout(OperationKey::link(OperationKind::Connect));
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(adapter.link.disconnects.load(Ordering::SeqCst), 0);

        let characteristic = battery_level();
        let reading = tokio::spawn({
            let connection = connection.clone();
            let characteristic = characteristic.clone();
            async move { connection.read_characteristic(&characteristic).await }
        });
        while !connection.is_busy() {
            tokio::task::yield_now().await;
        }
        adapter
            .emit(GattEvent::CharacteristicRead {
                characteristic: characteristic.uuid,
                value: vec![90],
                status: GattStatus::SUCCESS,
            })
            .await;
        assert_eq!(reading.await.unwrap().unwrap(), vec![90]);

        connection.inner.on_timeout(OperationKey::characteristic(
            OperationKind::ReadCharacteristic,
            characteristic.uuid,
        ));
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(adapter.link.disconnects.load(Ordering::SeqCst), 0);
        assert!(!connection.is_busy());
    }
}
