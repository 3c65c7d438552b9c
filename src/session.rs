use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use futures::{future, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::connection::{ConnectionConfig, ConnectionState, GattConnection};
use crate::discovery::{self, DiscoverySnapshot};
use crate::platform::PlatformAdapter;
use crate::watchdog::Watchdog;
use crate::{Characteristic, Descriptor, Error, Result, Service, WriteType};

/// Lifecycle and data events of a [`PeripheralSession`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The link is up. Discovery has not run yet.
    Connected,
    /// Connected and discovered, operations can be issued.
    Started,
    /// A notification or indication arrived.
    Notification { characteristic: Uuid, value: Vec<u8> },
    /// The session is over. `None` means it ended without error.
    Ended(Option<Error>),
}

/// Decides whether an operation error ends the whole session.
///
/// The operation still returns its error either way.
#[derive(Clone)]
pub struct ErrorHandler(Arc<dyn Fn(&Error) -> bool + Send + Sync>);

impl ErrorHandler {
    pub fn new(func: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(func))
    }

    /// End the session on any error.
    pub fn end_session() -> Self {
        Self::new(|_| true)
    }

    /// Never end the session, leave recovery to the caller.
    pub fn keep_session() -> Self {
        Self::new(|_| false)
    }

    pub fn should_end_session(&self, error: &Error) -> bool {
        (self.0)(error)
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::end_session()
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorHandler")
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    connection: ConnectionConfig,
    error_handler: ErrorHandler,
}

impl SessionConfig {
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Handler used by the operations that do not take one explicitly.
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }
}

/// Connection to one peripheral, addressed by characteristic uuid.
///
/// Uuids are resolved against the snapshot of the last discovery run.
#[derive(Clone)]
pub struct PeripheralSession {
    connection: GattConnection,
    snapshot: Arc<RwLock<DiscoverySnapshot>>,
    error_handler: ErrorHandler,
    events: broadcast::Sender<SessionEvent>,
}

impl PeripheralSession {
    pub fn new(
        identity: impl Into<String>,
        adapter: Arc<dyn PlatformAdapter>,
        watchdog: Watchdog,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let connection = GattConnection::new(
            identity,
            adapter,
            watchdog,
            config.connection,
            events.clone(),
        );

        Self {
            connection,
            snapshot: Arc::new(RwLock::new(DiscoverySnapshot::default())),
            error_handler: config.error_handler,
            events,
        }
    }

    #[inline]
    pub fn identity(&self) -> &str {
        self.connection.identity()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &GattConnection {
        &self.connection
    }

    /// Copy of the last discovery result.
    pub fn snapshot(&self) -> DiscoverySnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn services(&self) -> Vec<Service> {
        self.snapshot().services().to_vec()
    }

    /// Create a new stream that receives session events.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = SessionEvent> + Send>> {
        let receiver = self.events.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() }))
    }

    /// Connect and discover. Any failure ends the session.
    pub async fn start(&self) -> Result<()> {
        self.connection.connect().await?;

        if let Err(e) = self.discover().await {
            self.connection.request_disconnect(Some(e.clone()));
            return Err(e);
        }

        log::info!("Session with {} started", self.identity());
        self.events.send(SessionEvent::Started).ok();
        Ok(())
    }

    /// Run discovery again, replacing the current snapshot.
    pub async fn rediscover(&self) -> Result<()> {
        if let Err(e) = self.discover().await {
            self.connection.request_disconnect(Some(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    async fn discover(&self) -> Result<()> {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = DiscoverySnapshot::default();
        let snapshot = discovery::discover(&self.connection).await?;
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        Ok(())
    }

    /// End the session and wait for the link to be released.
    pub async fn end(&self, error: Option<Error>) -> Result<()> {
        self.connection.disconnect(error).await
    }

    pub async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.read_with(characteristic, &self.error_handler).await
    }

    pub async fn read_with(&self, characteristic: Uuid, on_error: &ErrorHandler) -> Result<Vec<u8>> {
        let result = match self.characteristic(characteristic) {
            Ok(characteristic) => self.connection.read_characteristic(&characteristic).await,
            Err(e) => Err(e),
        };
        self.handle(result, on_error)
    }

    pub async fn write(&self, data: &[u8], characteristic: Uuid, with_response: bool) -> Result<()> {
        self.write_with(data, characteristic, with_response, &self.error_handler)
            .await
    }

    pub async fn write_with(
        &self,
        data: &[u8],
        characteristic: Uuid,
        with_response: bool,
        on_error: &ErrorHandler,
    ) -> Result<()> {
        let result = match self.characteristic(characteristic) {
            Ok(characteristic) => {
                self.connection
                    .write_characteristic(&characteristic, data, WriteType::from_response(with_response))
                    .await
            }
            Err(e) => Err(e),
        };
        self.handle(result, on_error)
    }

    /// Enable notifications and stream the values of `characteristic`.
    ///
    /// The stream ends with the session.
    pub async fn start_listening(
        &self,
        characteristic: Uuid,
    ) -> Result<Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>> {
        self.start_listening_with(characteristic, &self.error_handler)
            .await
    }

    pub async fn start_listening_with(
        &self,
        characteristic: Uuid,
        on_error: &ErrorHandler,
    ) -> Result<Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>> {
        // Subscribe first so nothing sent right after enabling is missed.
        let receiver = self.events.subscribe();

        let result = match self.characteristic(characteristic) {
            Ok(found) => self.connection.set_notification(&found, true).await,
            Err(e) => Err(e),
        };
        self.handle(result, on_error)?;

        let stream = BroadcastStream::new(receiver)
            .take_while(|event| future::ready(!matches!(event, Ok(SessionEvent::Ended(_)))))
            .filter_map(move |event| async move {
                match event {
                    Ok(SessionEvent::Notification {
                        characteristic: uuid,
                        value,
                    }) if uuid == characteristic => Some(value),
                    _ => None,
                }
            });

        Ok(Box::pin(stream))
    }

    pub async fn stop_listening(&self, characteristic: Uuid) -> Result<()> {
        self.stop_listening_with(characteristic, &self.error_handler)
            .await
    }

    pub async fn stop_listening_with(&self, characteristic: Uuid, on_error: &ErrorHandler) -> Result<()> {
        let result = match self.characteristic(characteristic) {
            Ok(characteristic) => self.connection.set_notification(&characteristic, false).await,
            Err(e) => Err(e),
        };
        self.handle(result, on_error)
    }

    pub async fn read_descriptor(&self, characteristic: Uuid, descriptor: Uuid) -> Result<Vec<u8>> {
        self.read_descriptor_with(characteristic, descriptor, &self.error_handler)
            .await
    }

    pub async fn read_descriptor_with(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        on_error: &ErrorHandler,
    ) -> Result<Vec<u8>> {
        let result = match self.descriptor(characteristic, descriptor) {
            Ok(descriptor) => self.connection.read_descriptor(&descriptor).await,
            Err(e) => Err(e),
        };
        self.handle(result, on_error)
    }

    pub async fn write_descriptor(&self, data: &[u8], characteristic: Uuid, descriptor: Uuid) -> Result<()> {
        self.write_descriptor_with(data, characteristic, descriptor, &self.error_handler)
            .await
    }

    pub async fn write_descriptor_with(
        &self,
        data: &[u8],
        characteristic: Uuid,
        descriptor: Uuid,
        on_error: &ErrorHandler,
    ) -> Result<()> {
        let result = match self.descriptor(characteristic, descriptor) {
            Ok(descriptor) => self.connection.write_descriptor(&descriptor, data).await,
            Err(e) => Err(e),
        };
        self.handle(result, on_error)
    }

    /// Signal strength of the connected peripheral.
    pub async fn read_rssi(&self) -> Result<i16> {
        let result = self.connection.read_rssi().await;
        self.handle(result, &self.error_handler)
    }

    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        let result = self.connection.request_mtu(mtu).await;
        self.handle(result, &self.error_handler)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .characteristic(uuid)
            .cloned()
            .ok_or_else(|| Error::missing_characteristic(uuid))
    }

    fn descriptor(&self, characteristic: Uuid, uuid: Uuid) -> Result<Descriptor> {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        if snapshot.characteristic(characteristic).is_none() {
            return Err(Error::missing_characteristic(characteristic));
        }
        snapshot
            .descriptor(characteristic, uuid)
            .cloned()
            .ok_or_else(|| Error::missing_descriptor(uuid))
    }

    fn handle<T>(&self, result: Result<T>, on_error: &ErrorHandler) -> Result<T> {
        if let Err(e) = &result {
            if on_error.should_end_session(e) {
                log::debug!("{}: ending session after error: {}", self.identity(), e);
                self.connection.request_disconnect(Some(e.clone()));
            }
        }
        result
    }
}
