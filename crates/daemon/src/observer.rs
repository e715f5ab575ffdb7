// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// Tunnel state observer
// Mirrors backend up/down transitions into the published tunnel status

use std::sync::{Mutex, MutexGuard, PoisonError};

use dicyvpn_common::{InterfaceState, TunnelStatus};
use tokio::sync::watch;
use tracing::debug;

use crate::backend::TunnelStateListener;

/// One-shot callback run on the next down transition
pub type StopCallback = Box<dyn FnOnce() + Send + 'static>;

struct ObserverState {
    interface: InterfaceState,
    pending: Vec<StopCallback>,
}

/// Process-wide owner of the tunnel status and the pending-stop callbacks
///
/// The interface state and the callback list live behind one mutex, so a
/// callback is either run right away (interface already down) or queued and
/// drained exactly once. Callbacks always run with the lock released.
pub struct TunnelStateObserver {
    state: Mutex<ObserverState>,
    status_tx: watch::Sender<TunnelStatus>,
}

impl TunnelStateObserver {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(TunnelStatus::NotRunning);
        Self {
            state: Mutex::new(ObserverState {
                interface: InterfaceState::Down,
                pending: Vec::new(),
            }),
            status_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ObserverState> {
        // A panicking callback never runs under the lock, so the data is consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> TunnelStatus {
        *self.status_tx.borrow()
    }

    pub fn set_status(&self, status: TunnelStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!("Tunnel status: {} -> {}", previous, status);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.status_tx.subscribe()
    }

    pub fn interface_state(&self) -> InterfaceState {
        self.lock().interface
    }

    /// Run `callback` once the interface is down
    ///
    /// Runs it before returning when the interface is already down, otherwise
    /// queues it for the next down transition.
    pub fn wait_for_stopped<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.interface == InterfaceState::Down {
            drop(state);
            callback();
        } else {
            state.pending.push(Box::new(callback));
            debug!("Queued stop callback ({} pending)", state.pending.len());
        }
    }

    pub fn pending_callbacks(&self) -> usize {
        self.lock().pending.len()
    }
}

impl Default for TunnelStateObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelStateListener for TunnelStateObserver {
    /// Publish the status for `new_state`; a down transition drains the queue
    ///
    /// Callbacks drained by one transition run in registration order. One that
    /// is registered while the batch runs sees the interface down and runs
    /// immediately, ahead of the rest of the batch.
    fn on_state_change(&self, new_state: InterfaceState) {
        let drained = {
            let mut state = self.lock();
            state.interface = new_state;
            match new_state {
                InterfaceState::Up => {
                    self.set_status(TunnelStatus::Connected);
                    Vec::new()
                }
                InterfaceState::Down => {
                    self.set_status(TunnelStatus::NotRunning);
                    std::mem::take(&mut state.pending)
                }
            }
        };

        if !drained.is_empty() {
            debug!("Running {} stop callback(s)", drained.len());
        }
        for callback in drained {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_initial_state() {
        let observer = TunnelStateObserver::new();
        assert_eq!(observer.status(), TunnelStatus::NotRunning);
        assert_eq!(observer.interface_state(), InterfaceState::Down);
        assert_eq!(observer.pending_callbacks(), 0);
    }

    #[test]
    fn test_wait_while_down_fires_synchronously_once() {
        let observer = TunnelStateObserver::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        observer.wait_for_stopped(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(observer.pending_callbacks(), 0);

        // A later down transition must not fire it again
        observer.on_state_change(InterfaceState::Up);
        observer.on_state_change(InterfaceState::Down);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queued_callbacks_fire_in_order_on_down() {
        let observer = TunnelStateObserver::new();
        observer.on_state_change(InterfaceState::Up);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            observer.wait_for_stopped(move || order.lock().unwrap().push(i));
        }

        assert!(order.lock().unwrap().is_empty());
        assert_eq!(observer.pending_callbacks(), 3);

        observer.on_state_change(InterfaceState::Down);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(observer.pending_callbacks(), 0);

        observer.on_state_change(InterfaceState::Up);
        observer.on_state_change(InterfaceState::Down);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_up_does_not_drain() {
        let observer = TunnelStateObserver::new();
        observer.on_state_change(InterfaceState::Up);

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        observer.wait_for_stopped(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        observer.on_state_change(InterfaceState::Up);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(observer.pending_callbacks(), 1);
    }

    #[test]
    fn test_status_mirrors_interface() {
        let observer = TunnelStateObserver::new();
        let rx = observer.subscribe();

        observer.set_status(TunnelStatus::Connecting);
        observer.on_state_change(InterfaceState::Up);
        assert_eq!(observer.status(), TunnelStatus::Connected);
        assert_eq!(*rx.borrow(), TunnelStatus::Connected);

        observer.on_state_change(InterfaceState::Down);
        assert_eq!(observer.status(), TunnelStatus::NotRunning);
    }

    #[test]
    fn test_callback_registered_during_drain_runs_at_once() {
        let observer = Arc::new(TunnelStateObserver::new());
        observer.on_state_change(InterfaceState::Up);

        let order = Arc::new(Mutex::new(Vec::new()));
        let (inner, first) = (observer.clone(), order.clone());
        observer.wait_for_stopped(move || {
            first.lock().unwrap().push("first");
            let late = first.clone();
            inner.wait_for_stopped(move || late.lock().unwrap().push("late"));
        });
        let second = order.clone();
        observer.wait_for_stopped(move || second.lock().unwrap().push("second"));

        observer.on_state_change(InterfaceState::Down);
        assert_eq!(*order.lock().unwrap(), vec!["first", "late", "second"]);
        assert_eq!(observer.pending_callbacks(), 0);
    }

    #[test]
    fn test_callback_may_reenter_observer() {
        let observer = Arc::new(TunnelStateObserver::new());
        observer.on_state_change(InterfaceState::Up);

        let inner = observer.clone();
        observer.wait_for_stopped(move || inner.set_status(TunnelStatus::Connecting));

        observer.on_state_change(InterfaceState::Down);
        assert_eq!(observer.status(), TunnelStatus::Connecting);
    }
}
