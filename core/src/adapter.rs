//! Adapter state monitor
//!
//! Mirrors the platform adapter state into the session and gates every radio
//! operation on it. The session's `initialized` flag is derived here: it is
//! true only while the last state observed is `PoweredOn`.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::radio::{AdapterState, AdapterStateStream, RadioStack};
use crate::state::SessionEvent;

pub type StateListener = Arc<dyn Fn(AdapterState) + Send + Sync>;

type ListenerMap = RwLock<HashMap<u64, StateListener>>;

/// Keeps a state listener registered; dropping it unregisters the listener
pub struct AdapterSubscription {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl AdapterSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for AdapterSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.write().remove(&self.id);
        }
    }
}

pub struct AdapterMonitor {
    context: Arc<SessionContext>,
    radio: Arc<dyn RadioStack>,
    listeners: Arc<ListenerMap>,
    next_listener: AtomicU64,
    transitions: Mutex<Vec<mpsc::UnboundedSender<AdapterState>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl AdapterMonitor {
    pub fn new(context: Arc<SessionContext>, radio: Arc<dyn RadioStack>) -> Arc<Self> {
        Arc::new(Self {
            context,
            radio,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_listener: AtomicU64::new(1),
            transitions: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Read the adapter's current state and follow its transitions
    pub async fn start(self: &Arc<Self>) {
        if self.is_disposed() {
            warn!("Adapter monitor already disposed; not starting");
            return;
        }

        match self.radio.adapter_state().await {
            Ok(state) => self.apply(state),
            Err(e) => {
                warn!("Could not read adapter state: {}", e);
                self.apply(AdapterState::Unknown);
            }
        }

        let stream = match self.radio.subscribe_adapter_state().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Could not subscribe to adapter state: {}", e);
                return;
            }
        };

        let monitor = Arc::downgrade(self);
        let task = tokio::spawn(pump_states(monitor, stream));
        let previous = self.pump.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Adapter monitor started ({})", self.current_state());
    }

    pub fn current_state(&self) -> AdapterState {
        self.context.adapter_state()
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_initialized()
    }

    /// Register a listener for every transition. The listener is invoked
    /// immediately with the current state.
    pub fn on_state_change(
        &self,
        listener: impl Fn(AdapterState) + Send + Sync + 'static,
    ) -> AdapterSubscription {
        let listener: StateListener = Arc::new(listener);
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);

        if !self.is_disposed() {
            self.listeners.write().insert(id, listener.clone());
        }
        listener(self.current_state());

        AdapterSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Every applied transition from now on, in order and without
    /// coalescing. Ends when the monitor is disposed.
    pub fn transitions(&self) -> mpsc::UnboundedReceiver<AdapterState> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_disposed() {
            self.transitions.lock().push(tx);
        }
        rx
    }

    /// Apply one platform-reported state
    pub fn apply(&self, state: AdapterState) {
        if self.is_disposed() {
            return;
        }

        let transition = self.context.dispatch(SessionEvent::AdapterChanged(state));
        if !transition.is_applied() {
            return;
        }

        debug!("Adapter state -> {}", state);
        self.transitions
            .lock()
            .retain(|tx| tx.send(state).is_ok());

        let listeners: Vec<StateListener> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener(state);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop following the platform and drop all listeners. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
        }
        self.listeners.write().clear();
        self.transitions.lock().clear();
        debug!("Adapter monitor disposed");
    }
}

impl Drop for AdapterMonitor {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn pump_states(monitor: Weak<AdapterMonitor>, mut stream: AdapterStateStream) {
    while let Some(state) = stream.recv().await {
        match monitor.upgrade() {
            Some(monitor) => monitor.apply(state),
            None => break,
        }
    }
    debug!("Adapter state stream closed");
}
