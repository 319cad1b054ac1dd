use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;

use parking_lot::Mutex;

/// State one pooled socket shares with its leases and the connector.
///
/// A slot is busy from the first write of an exchange until its lease is
/// released. Eviction wakes the socket's parked reader with EOF, which makes
/// hyper drop the idle connection and with it the connection permit.
#[derive(Debug)]
pub struct ConnectionSlot {
    busy: AtomicBool,
    retiring: AtomicBool,
    evicted: AtomicBool,
    reader: Mutex<Option<Waker>>,
}

impl ConnectionSlot {
    /// A fresh connection is opened for an exchange, so it starts busy.
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            busy: AtomicBool::new(true),
            retiring: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            reader: Mutex::new(None),
        })
    }

    pub(super) fn mark_busy(&self) {
        self.busy.store(true, Ordering::Release);
    }

    /// The exchange on this connection is over; a retiring connection is
    /// closed now.
    pub fn mark_idle(&self) {
        self.busy.store(false, Ordering::Release);
        if self.retiring.load(Ordering::Acquire) {
            self.evict();
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Time-to-live reached: close at once when idle, else when released.
    pub(super) fn retire(&self) {
        self.retiring.store(true, Ordering::Release);
        if self.is_idle() {
            tracing::debug!("retiring connection past its time-to-live");
            self.evict();
        }
    }

    pub(super) fn park_reader(&self, waker: &Waker) {
        let mut reader = self.reader.lock();
        if !reader.as_ref().is_some_and(|w| w.will_wake(waker)) {
            *reader = Some(waker.clone());
        }
    }

    /// Returns `false` when the slot was already evicted.
    fn evict(&self) -> bool {
        if self.evicted.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(waker) = self.reader.lock().take() {
            waker.wake();
        }
        true
    }
}

/// Open connections of one pool, in the order they were opened.
#[derive(Debug, Default)]
pub(super) struct SlotRegistry {
    slots: Mutex<Vec<Weak<ConnectionSlot>>>,
}

impl SlotRegistry {
    pub(super) fn register(&self, slot: &Arc<ConnectionSlot>) {
        let mut slots = self.slots.lock();
        slots.retain(|s| s.strong_count() > 0);
        slots.push(Arc::downgrade(slot));
    }

    /// Close the longest-open idle connection. Returns `false` when every
    /// open connection is in use.
    pub(super) fn evict_idle(&self) -> bool {
        let mut slots = self.slots.lock();
        slots.retain(|s| s.strong_count() > 0);
        let evicted = slots
            .iter()
            .filter_map(Weak::upgrade)
            .find(|slot| slot.is_idle() && !slot.is_evicted())
            .is_some_and(|slot| slot.evict());
        if evicted {
            tracing::debug!("evicted idle connection to make room for another route");
        }
        evicted
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn busy_slots_are_never_evicted() {
        let registry = SlotRegistry::default();
        let slot = ConnectionSlot::new();
        registry.register(&slot);

        assert!(!registry.evict_idle());
        slot.mark_idle();
        assert!(registry.evict_idle());
        assert!(slot.is_evicted());
        assert!(!registry.evict_idle());
    }

    #[test]
    fn eviction_wakes_parked_reader() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let slot = ConnectionSlot::new();
        slot.park_reader(&waker);
        slot.mark_idle();

        assert!(slot.evict());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retiring_busy_slot_waits_for_release() {
        let slot = ConnectionSlot::new();
        slot.retire();
        assert!(!slot.is_evicted());
        slot.mark_idle();
        assert!(slot.is_evicted());
    }

    #[test]
    fn dropped_connections_leave_registry() {
        let registry = SlotRegistry::default();
        let slot = ConnectionSlot::new();
        slot.mark_idle();
        registry.register(&slot);
        drop(slot);
        assert!(!registry.evict_idle());
        assert!(registry.slots.lock().is_empty());
    }
}
