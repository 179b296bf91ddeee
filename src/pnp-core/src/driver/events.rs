// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Machine event notifications.
//!
//! Observers register with the emitter to learn about machine activity
//! (position reports arriving) and connection state changes without
//! polling the driver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Trait for components that want to observe the machine.
///
/// All methods have default no-op implementations, so listeners can
/// selectively override only the events they care about.
pub trait MachineListener: Send + Sync {
    /// Called whenever a position report has updated the axes.
    fn on_activity(&self) {}

    /// Called when the driver connects or disconnects.
    fn on_connection_change(&self, _connected: bool) {}
}

/// Manages registered listeners and dispatches events.
///
/// The listener list is behind a mutex so the emitter can be shared with
/// the background response reader.
#[derive(Default)]
pub struct MachineEventEmitter {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn MachineListener>)>>,
}

impl MachineEventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener to receive events.
    /// Returns an ID that can be used to unregister the listener.
    pub fn register(&self, listener: Arc<dyn MachineListener>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    /// Unregister a listener by its ID.
    pub fn unregister(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn notify_activity(&self) {
        for (_, listener) in self.listeners.lock().unwrap().iter() {
            listener.on_activity();
        }
    }

    pub fn notify_connection_change(&self, connected: bool) {
        for (_, listener) in self.listeners.lock().unwrap().iter() {
            listener.on_connection_change(connected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        activity: AtomicUsize,
        connects: AtomicUsize,
    }

    impl MachineListener for CountingListener {
        fn on_activity(&self) {
            self.activity.fetch_add(1, Ordering::Relaxed);
        }

        fn on_connection_change(&self, _connected: bool) {
            self.connects.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_register_and_notify() {
        let emitter = MachineEventEmitter::new();
        let listener = Arc::new(CountingListener::default());
        let id = emitter.register(listener.clone());
        assert_eq!(emitter.listener_count(), 1);

        emitter.notify_activity();
        emitter.notify_activity();
        emitter.notify_connection_change(true);
        assert_eq!(listener.activity.load(Ordering::Relaxed), 2);
        assert_eq!(listener.connects.load(Ordering::Relaxed), 1);

        emitter.unregister(id);
        assert_eq!(emitter.listener_count(), 0);
    }
}
