use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use stream_cancel::{Trigger, Tripwire};

struct ActiveTimer {
    generation: u64,
    /// Dropping the trigger resolves the timer task's tripwire.
    _trigger: Trigger,
}

#[derive(Default)]
struct Timers {
    active: Mutex<HashMap<String, ActiveTimer>>,
    generation: AtomicU64,
}

/// Named, cancellable one-shot timers.
///
/// Shared by every session of a [`Central`](crate::Central). Timer ids are
/// namespaced by peripheral identity so a whole peripheral can be cancelled
/// with [`Watchdog::cancel_prefixed`]. Requires a running tokio runtime.
#[derive(Clone, Default)]
pub struct Watchdog {
    timers: Arc<Timers>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a timer that runs `on_fire` after `timeout` unless cancelled first.
    ///
    /// Starting a timer with the id of an active one replaces it.
    pub fn start<F>(&self, id: impl Into<String>, timeout: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = id.into();
        let (trigger, tripwire) = Tripwire::new();
        let generation = self.timers.generation.fetch_add(1, Ordering::Relaxed);

        let previous = self.lock().insert(
            id.clone(),
            ActiveTimer {
                generation,
                _trigger: trigger,
            },
        );
        if previous.is_some() {
            log::trace!("Timer {} restarted", id);
        }

        log::trace!("Timer {} started ({:?})", id, timeout);

        let timers = Arc::downgrade(&self.timers);
        tokio::spawn(async move {
            tokio::select! {
                _ = tripwire => {}
                _ = tokio::time::sleep(timeout) => {
                    let Some(timers) = timers.upgrade() else {
                        return;
                    };
                    let fired = {
                        let mut active = timers.active.lock().unwrap_or_else(PoisonError::into_inner);
                        match active.get(&id) {
                            Some(timer) if timer.generation == generation => active.remove(&id),
                            _ => None,
                        }
                    };
                    // Dropped outside the lock; resolving our own tripwire is harmless now.
                    if fired.is_some() {
                        log::warn!("Timer {} fired after {:?}", id, timeout);
                        on_fire();
                    }
                }
            }
        });
    }

    /// Cancel a timer. Returns false if no timer with that id was active.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = self.lock().remove(id).is_some();
        if cancelled {
            log::trace!("Timer {} cancelled", id);
        }
        cancelled
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Cancel every active timer whose id starts with `prefix`.
    pub fn cancel_prefixed(&self, prefix: &str) -> usize {
        let cancelled = {
            let mut active = self.lock();
            let ids = active
                .keys()
                .filter(|id| id.starts_with(prefix))
                .cloned()
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| active.remove(&id).map(|timer| (id, timer)))
                .collect::<Vec<_>>()
        };

        for (id, _) in &cancelled {
            log::trace!("Timer {} cancelled", id);
        }
        cancelled.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveTimer>> {
        self.timers
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_timeout() {
        let watchdog = Watchdog::new();
        let (count, on_fire) = counter();

        watchdog.start("AA:BB__connect", Duration::from_millis(100), on_fire);
        assert!(watchdog.is_active("AA:BB__connect"));

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_active("AA:BB__connect"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let watchdog = Watchdog::new();
        let (count, on_fire) = counter();

        watchdog.start("AA:BB__connect", Duration::from_millis(100), on_fire);
        assert!(watchdog.cancel("AA:BB__connect"));
        assert!(!watchdog.cancel("AA:BB__connect"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_timer() {
        let watchdog = Watchdog::new();
        let (first, first_fire) = counter();
        let (second, second_fire) = counter();

        watchdog.start("AA:BB__discover_services", Duration::from_millis(100), first_fire);
        watchdog.start("AA:BB__discover_services", Duration::from_millis(300), second_fire);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert!(watchdog.is_active("AA:BB__discover_services"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prefix_cancel_leaves_other_peripherals_alone() {
        let watchdog = Watchdog::new();
        let (aa, aa_fire) = counter();
        let (cc, cc_fire) = counter();

        watchdog.start("AA:BB__connect", Duration::from_millis(100), aa_fire);
        watchdog.start("CC:DD__connect", Duration::from_millis(100), cc_fire);

        assert_eq!(watchdog.cancel_prefixed("AA:BB__"), 1);
        assert_eq!(watchdog.active_ids(), vec!["CC:DD__connect".to_string()]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(aa.load(Ordering::SeqCst), 0);
        assert_eq!(cc.load(Ordering::SeqCst), 1);
    }
}
