use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Low-level status code reported by the platform Bluetooth stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(0x02);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x03);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(0x05);
    pub const REQUEST_NOT_SUPPORTED: GattStatus = GattStatus(0x06);
    pub const CONNECTION_TIMEOUT: GattStatus = GattStatus(0x08);
    pub const INSUFFICIENT_ENCRYPTION: GattStatus = GattStatus(0x0f);
    pub const REMOTE_USER_TERMINATED: GattStatus = GattStatus(0x13);
    pub const BUSY: GattStatus = GattStatus(0x84);
    /// Generic stack error. Some stacks report it for a connection attempt that
    /// never got off the ground, and a reconnect on the same link usually clears it.
    pub const GATT_ERROR: GattStatus = GattStatus(0x85);
    pub const CONGESTED: GattStatus = GattStatus(0x8f);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    #[inline]
    pub fn is_success(self) -> bool {
        self == GattStatus::SUCCESS
    }

    /// Translate the status of a completed `method` into a result.
    pub fn into_result(self, method: &'static str) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::operation_failed(method, Some(self)))
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// Sentinel for "nothing went wrong". Used as the expected reason of an
    /// intentional disconnect and never surfaced to callers.
    #[error("success")]
    Success,
    #[error("operation timed out")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error("{method} failed")]
    OperationFailed {
        method: &'static str,
        status: Option<GattStatus>,
    },
    #[error("connection failed")]
    ConnectionFailed,
    #[error("disconnected")]
    Disconnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("missing required characteristic {0}")]
    MissingRequiredCharacteristic(Uuid),
    #[error("missing required descriptor {0}")]
    MissingRequiredDescriptor(Uuid),
    #[error("no services discovered")]
    NoServicesDiscovered,
}

/// Flat discriminant of [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    Timeout,
    NotConnected,
    OperationFailed,
    ConnectionFailed,
    Disconnected,
    AlreadyConnected,
    PreconditionFailed,
    MissingRequiredCharacteristic,
    MissingRequiredDescriptor,
    NoServicesDiscovered,
}

impl ErrorKind {
    pub fn code(&self) -> ErrorCode {
        match self {
            ErrorKind::Success => ErrorCode::Success,
            ErrorKind::Timeout => ErrorCode::Timeout,
            ErrorKind::NotConnected => ErrorCode::NotConnected,
            ErrorKind::OperationFailed { .. } => ErrorCode::OperationFailed,
            ErrorKind::ConnectionFailed => ErrorCode::ConnectionFailed,
            ErrorKind::Disconnected => ErrorCode::Disconnected,
            ErrorKind::AlreadyConnected => ErrorCode::AlreadyConnected,
            ErrorKind::PreconditionFailed(_) => ErrorCode::PreconditionFailed,
            ErrorKind::MissingRequiredCharacteristic(_) => ErrorCode::MissingRequiredCharacteristic,
            ErrorKind::MissingRequiredDescriptor(_) => ErrorCode::MissingRequiredDescriptor,
            ErrorKind::NoServicesDiscovered => ErrorCode::NoServicesDiscovered,
        }
    }
}

/// Error envelope delivered to every completion and to the session end event.
///
/// Immutable once built. Cloning is cheap, the underlying cause is shared.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    domain: &'static str,
    message: String,
    status: Option<GattStatus>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

pub(crate) const GATT_DOMAIN: &str = "gatt";
pub(crate) const SESSION_DOMAIN: &str = "session";
pub(crate) const SCAN_DOMAIN: &str = "scan";

impl Error {
    pub fn new(kind: ErrorKind, domain: &'static str) -> Self {
        let status = match &kind {
            ErrorKind::OperationFailed { status, .. } => *status,
            _ => None,
        };

        Self {
            message: kind.to_string(),
            kind,
            domain,
            status,
            source: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_status(mut self, status: GattStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn success() -> Self {
        Self::new(ErrorKind::Success, GATT_DOMAIN)
    }

    pub fn timeout(operation: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Timeout, GATT_DOMAIN)
            .with_message(format!("{} timed out", operation))
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorKind::NotConnected, GATT_DOMAIN)
    }

    pub fn operation_failed(method: &'static str, status: Option<GattStatus>) -> Self {
        let error = Self::new(ErrorKind::OperationFailed { method, status }, GATT_DOMAIN);
        match status {
            Some(status) => error.with_message(format!("{} failed with status {}", method, status)),
            None => error,
        }
    }

    pub fn connection_failed(status: Option<GattStatus>) -> Self {
        let error = Self::new(ErrorKind::ConnectionFailed, GATT_DOMAIN);
        match status {
            Some(status) => error
                .with_status(status)
                .with_message(format!("connection failed with status {}", status)),
            None => error,
        }
    }

    pub fn disconnected(status: Option<GattStatus>) -> Self {
        let error = Self::new(ErrorKind::Disconnected, GATT_DOMAIN);
        match status {
            Some(status) => error.with_status(status),
            None => error,
        }
    }

    pub fn already_connected() -> Self {
        Self::new(ErrorKind::AlreadyConnected, GATT_DOMAIN)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed(message.into()), SESSION_DOMAIN)
    }

    pub fn busy() -> Self {
        Self::precondition_failed("session busy")
    }

    pub fn missing_characteristic(uuid: Uuid) -> Self {
        Self::new(ErrorKind::MissingRequiredCharacteristic(uuid), SESSION_DOMAIN)
    }

    pub fn missing_descriptor(uuid: Uuid) -> Self {
        Self::new(ErrorKind::MissingRequiredDescriptor(uuid), SESSION_DOMAIN)
    }

    pub fn no_services() -> Self {
        Self::new(ErrorKind::NoServicesDiscovered, SESSION_DOMAIN)
    }

    #[inline]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[inline]
    pub fn code(&self) -> ErrorCode {
        self.kind.code()
    }

    #[inline]
    pub fn domain(&self) -> &'static str {
        self.domain
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Low-level status wrapped by this error, if any.
    #[inline]
    pub fn status(&self) -> Option<GattStatus> {
        self.status
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.code() == ErrorCode::Success
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Error");
        debug
            .field("kind", &self.kind)
            .field("domain", &self.domain)
            .field("message", &self.message);
        if let Some(status) = self.status {
            debug.field("status", &status);
        }
        if let Some(source) = &self.source {
            debug.field("source", source);
        }
        debug.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.domain, self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.domain == other.domain && self.status == other.status
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind, GATT_DOMAIN)
    }
}

impl From<btleplug::Error> for Error {
    fn from(error: btleplug::Error) -> Self {
        let kind = match &error {
            btleplug::Error::NotConnected => ErrorKind::NotConnected,
            btleplug::Error::TimedOut(_) => ErrorKind::Timeout,
            _ => ErrorKind::OperationFailed {
                method: "btleplug",
                status: None,
            },
        };

        Error::new(kind, SCAN_DOMAIN)
            .with_message(error.to_string())
            .with_source(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_status_translates_to_ok() {
        assert!(GattStatus::SUCCESS.into_result("readCharacteristic").is_ok());
    }

    #[test]
    fn failing_status_is_wrapped_in_operation_failed() {
        let error = GattStatus(0x02).into_result("readCharacteristic").unwrap_err();

        assert_eq!(error.code(), ErrorCode::OperationFailed);
        assert_eq!(error.status(), Some(GattStatus::READ_NOT_PERMITTED));
        assert_eq!(
            error.kind(),
            &ErrorKind::OperationFailed {
                method: "readCharacteristic",
                status: Some(GattStatus(0x02)),
            }
        );
        assert!(error.message().contains("0x02"));
    }

    #[test]
    fn source_is_kept_through_clones() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "adapter gone");
        let error = Error::connection_failed(None).with_source(io);
        let cloned = error.clone();

        let source = std::error::Error::source(&cloned).unwrap();
        assert_eq!(source.to_string(), "adapter gone");
    }

    #[test]
    fn display_names_domain() {
        let error = Error::busy();
        assert_eq!(error.to_string(), "[session] precondition failed: session busy");
    }
}
