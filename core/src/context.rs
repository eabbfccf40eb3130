//! Shared session context
//!
//! One `SessionContext` is created per session and handed (as an `Arc`) to
//! every component constructor. It owns the `SessionState`, applies events
//! under a short write lock, and fans applied events out to observers.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::radio::{AdapterState, PeripheralRecord};
use crate::state::{
    ConnectionHandle, DecodedReading, SessionEvent, SessionSnapshot, SessionState, SessionUpdate,
    Transition,
};

pub struct SessionContext {
    state: RwLock<SessionState>,
    updates: broadcast::Sender<SessionUpdate>,
    next_id: AtomicU64,
}

impl SessionContext {
    pub fn new(update_capacity: usize) -> Arc<Self> {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Arc::new(Self {
            state: RwLock::new(SessionState::new()),
            updates,
            next_id: AtomicU64::new(1),
        })
    }

    /// Apply an event and notify observers if it changed the state.
    ///
    /// The update is published under the write lock so observers see updates
    /// in the order events were applied, whichever thread applied them.
    pub fn dispatch(&self, event: SessionEvent) -> Transition {
        let transition = {
            let mut state = self.state.write();
            let transition = state.apply(&event);
            if transition.is_applied() {
                if let Some(update) = state.update_for(&event) {
                    // No receivers is fine
                    let _ = self.updates.send(update);
                }
            }
            transition
        };

        trace!("{:?} -> {:?}", event, transition);
        transition
    }

    /// Fresh id for scan sessions and subscriptions
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.state.read().adapter_state
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    pub fn is_scanning(&self) -> bool {
        self.state.read().active_scan.is_some()
    }

    pub fn discovered(&self) -> Vec<PeripheralRecord> {
        self.state.read().discovered.clone()
    }

    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.state.read().connection.clone()
    }

    pub fn reading(&self) -> DecodedReading {
        self.state.read().reading
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.read().snapshot()
    }
}
