//! Connect/disconnect observer registry
//!
//! Callbacks are registered with a token and removed by that token. Firing
//! takes a snapshot of the callbacks first, so a listener may register or
//! remove listeners (including itself) without deadlocking. A panicking
//! listener is logged and skipped; the others still run.

use crate::core::errors::HutchError;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Token returned by listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Called after a session became healthy
pub type ConnectedListener = Arc<dyn Fn() + Send + Sync>;

/// Called once per lost session, with the triggering error if known
pub type DisconnectedListener = Arc<dyn Fn(Option<&HutchError>) + Send + Sync>;

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    connected: Mutex<Vec<(ListenerId, ConnectedListener)>>,
    disconnected: Mutex<Vec<(ListenerId, DisconnectedListener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_connected(&self, listener: ConnectedListener) -> ListenerId {
        let id = self.next_id();
        self.connected.lock().push((id, listener));
        id
    }

    pub fn add_disconnected(&self, listener: DisconnectedListener) -> ListenerId {
        let id = self.next_id();
        self.disconnected.lock().push((id, listener));
        id
    }

    /// Remove a listener of either kind; false if the token is unknown
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.connected.lock().retain(|(lid, _)| {
            let keep = *lid != id;
            removed |= !keep;
            keep
        });
        self.disconnected.lock().retain(|(lid, _)| {
            let keep = *lid != id;
            removed |= !keep;
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.connected.lock().len() + self.disconnected.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fire_connected(&self) {
        let listeners: Vec<ConnectedListener> =
            self.connected.lock().iter().map(|(_, l)| Arc::clone(l)).collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                error!("Connection listener panicked");
            }
        }
    }

    pub fn fire_disconnected(&self, err: Option<&HutchError>) {
        let listeners: Vec<DisconnectedListener> = self
            .disconnected
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(err))).is_err() {
                error!("Disconnection listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fire_and_remove() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let id = registry.add_connected(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        registry.fire_connected();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.fire_connected();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.add_disconnected(Arc::new(|_| panic!("listener bug")));
        let h = Arc::clone(&hits);
        registry.add_disconnected(Arc::new(move |err| {
            assert!(matches!(err, Some(HutchError::Connection(_))));
            h.fetch_add(1, Ordering::SeqCst);
        }));

        registry.fire_disconnected(Some(&HutchError::Connection("reset".into())));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_remove_itself() {
        let registry = Arc::new(ListenerRegistry::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let reg = Arc::clone(&registry);
        let s = Arc::clone(&slot);
        let id = registry.add_connected(Arc::new(move || {
            if let Some(id) = *s.lock() {
                reg.remove(id);
            }
        }));
        *slot.lock() = Some(id);

        registry.fire_connected();
        assert!(registry.is_empty());
    }
}
