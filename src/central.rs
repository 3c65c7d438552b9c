use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::platform::PlatformAdapter;
use crate::session::{PeripheralSession, SessionConfig};
use crate::watchdog::Watchdog;

/// Entry point for talking to peripherals.
///
/// Owns the platform adapter, one watchdog shared by every session and the
/// sessions themselves, one per peripheral identity.
pub struct Central {
    adapter: Arc<dyn PlatformAdapter>,
    watchdog: Watchdog,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, PeripheralSession>>,
}

impl Central {
    pub fn new(adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self::with_config(adapter, SessionConfig::default())
    }

    /// Sessions created by this central use `config`.
    pub fn with_config(adapter: Arc<dyn PlatformAdapter>, config: SessionConfig) -> Self {
        Self {
            adapter,
            watchdog: Watchdog::default(),
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Session for `identity`, created on first use.
    pub fn session(&self, identity: &str) -> PeripheralSession {
        self.lock()
            .entry(identity.to_string())
            .or_insert_with(|| {
                log::debug!("New session for {}", identity);
                PeripheralSession::new(
                    identity,
                    self.adapter.clone(),
                    self.watchdog.clone(),
                    self.config.clone(),
                )
            })
            .clone()
    }

    pub fn sessions(&self) -> Vec<PeripheralSession> {
        self.lock().values().cloned().collect()
    }

    /// Forget the session of `identity` and release its link.
    ///
    /// Operations still waiting on it are dropped unanswered and fail with
    /// `Disconnected`.
    pub fn discard(&self, identity: &str) -> bool {
        let Some(session) = self.lock().remove(identity) else {
            return false;
        };
        log::debug!("Discarding session for {}", identity);
        session.connection().teardown();
        true
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeripheralSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
