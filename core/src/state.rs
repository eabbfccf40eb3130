//! Session state and its transition function
//!
//! Everything the radio reports and every command outcome is expressed as a
//! `SessionEvent`. `SessionState::apply` folds one event into the state and
//! reports whether anything changed. It performs no I/O, so a recorded event
//! sequence replays deterministically.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::radio::{AdapterState, PeripheralId, PeripheralRecord};

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Identifies one scan session; stale sessions' callbacks are ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanId(pub u64);

/// Identifies one characteristic subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

// ============================================================================
// READINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    Valid,
    Invalid,
}

/// Latest decoded heart rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedReading {
    pub value: u16,
    pub validity: Validity,
}

impl DecodedReading {
    pub fn valid(value: u16) -> Self {
        Self {
            value,
            validity: Validity::Valid,
        }
    }

    /// The "no valid reading" state: zero, explicitly marked invalid
    pub fn invalid() -> Self {
        Self {
            value: 0,
            validity: Validity::Invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    /// The rate in beats per minute, if valid
    pub fn bpm(&self) -> Option<u16> {
        self.is_valid().then_some(self.value)
    }
}

impl Default for DecodedReading {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Display for DecodedReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bpm() {
            Some(bpm) => write!(f, "{} bpm", bpm),
            None => write!(f, "--"),
        }
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

/// The single live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub peripheral: PeripheralRecord,
    /// Services found during discovery
    pub services: Vec<Uuid>,
    /// Unix seconds
    pub connected_at: u64,
}

impl ConnectionHandle {
    pub fn id(&self) -> &PeripheralId {
        &self.peripheral.id
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    AdapterChanged(AdapterState),
    ScanStarted(ScanId),
    PeripheralDiscovered {
        scan: ScanId,
        record: PeripheralRecord,
    },
    ScanStopped(ScanId),
    Connected(ConnectionHandle),
    /// Explicit disconnect or link loss
    Disconnected(PeripheralId),
    SubscriptionOpened {
        subscription: SubscriptionId,
        peripheral: PeripheralId,
    },
    ReadingDecoded {
        subscription: SubscriptionId,
        value: u16,
    },
    ReadingInvalid {
        subscription: SubscriptionId,
    },
}

/// Outcome of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        *self == Transition::Applied
    }
}

/// What observers of the session are told after an applied event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionUpdate {
    AdapterChanged(AdapterState),
    ScanStarted,
    PeripheralDiscovered(PeripheralRecord),
    ScanStopped,
    Connected(PeripheralRecord),
    Disconnected(PeripheralId),
    Reading(DecodedReading),
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub adapter_state: AdapterState,
    /// True only while the last observed adapter state is PoweredOn
    pub initialized: bool,
    /// First-seen order, unique by identity
    pub discovered: Vec<PeripheralRecord>,
    pub active_scan: Option<ScanId>,
    pub connection: Option<ConnectionHandle>,
    pub subscription: Option<SubscriptionId>,
    pub reading: DecodedReading,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &SessionEvent) -> Transition {
        match event {
            SessionEvent::AdapterChanged(state) => {
                let changed = self.adapter_state != *state;
                self.adapter_state = *state;
                self.initialized = state.is_powered_on();
                if changed {
                    Transition::Applied
                } else {
                    Transition::Ignored
                }
            }
            SessionEvent::ScanStarted(scan) => {
                self.active_scan = Some(*scan);
                self.discovered.clear();
                Transition::Applied
            }
            SessionEvent::PeripheralDiscovered { scan, record } => {
                if self.active_scan != Some(*scan) {
                    return Transition::Ignored;
                }
                if self.discovered.iter().any(|p| p.id == record.id) {
                    return Transition::Ignored;
                }
                self.discovered.push(record.clone());
                Transition::Applied
            }
            SessionEvent::ScanStopped(scan) => {
                if self.active_scan == Some(*scan) {
                    self.active_scan = None;
                    Transition::Applied
                } else {
                    Transition::Ignored
                }
            }
            SessionEvent::Connected(handle) => {
                self.connection = Some(handle.clone());
                self.subscription = None;
                self.reading = DecodedReading::invalid();
                Transition::Applied
            }
            SessionEvent::Disconnected(id) => {
                match &self.connection {
                    Some(handle) if handle.id() == id => {}
                    _ => return Transition::Ignored,
                }
                self.connection = None;
                self.subscription = None;
                self.reading = DecodedReading::invalid();
                Transition::Applied
            }
            SessionEvent::SubscriptionOpened {
                subscription,
                peripheral,
            } => {
                match &self.connection {
                    Some(handle) if handle.id() == peripheral => {}
                    _ => return Transition::Ignored,
                }
                self.subscription = Some(*subscription);
                self.reading = DecodedReading::invalid();
                Transition::Applied
            }
            SessionEvent::ReadingDecoded {
                subscription,
                value,
            } => {
                if self.subscription != Some(*subscription) {
                    return Transition::Ignored;
                }
                self.reading = DecodedReading::valid(*value);
                Transition::Applied
            }
            SessionEvent::ReadingInvalid { subscription } => {
                if self.subscription != Some(*subscription) {
                    return Transition::Ignored;
                }
                self.reading = DecodedReading::invalid();
                Transition::Applied
            }
        }
    }

    /// Observer-facing description of an event that was just applied
    pub fn update_for(&self, event: &SessionEvent) -> Option<SessionUpdate> {
        let update = match event {
            SessionEvent::AdapterChanged(state) => SessionUpdate::AdapterChanged(*state),
            SessionEvent::ScanStarted(_) => SessionUpdate::ScanStarted,
            SessionEvent::PeripheralDiscovered { record, .. } => {
                SessionUpdate::PeripheralDiscovered(record.clone())
            }
            SessionEvent::ScanStopped(_) => SessionUpdate::ScanStopped,
            SessionEvent::Connected(handle) => SessionUpdate::Connected(handle.peripheral.clone()),
            SessionEvent::Disconnected(id) => SessionUpdate::Disconnected(id.clone()),
            SessionEvent::SubscriptionOpened { .. } => return None,
            SessionEvent::ReadingDecoded { .. } | SessionEvent::ReadingInvalid { .. } => {
                SessionUpdate::Reading(self.reading)
            }
        };
        Some(update)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            adapter_state: self.adapter_state,
            initialized: self.initialized,
            scanning: self.active_scan.is_some(),
            discovered: self.discovered.clone(),
            connected: self.connection.as_ref().map(|c| c.peripheral.clone()),
            reading: self.reading,
        }
    }
}

/// Serializable view of everything the presentation layer can observe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub adapter_state: AdapterState,
    pub initialized: bool,
    pub scanning: bool,
    pub discovered: Vec<PeripheralRecord>,
    pub connected: Option<PeripheralRecord>,
    pub reading: DecodedReading,
}
