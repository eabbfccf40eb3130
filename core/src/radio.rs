//! Radio stack abstraction
//!
//! The session never talks to Bluetooth hardware directly. Platform code (or
//! the desktop CLI via btleplug) implements `RadioStack`, and every stream of
//! asynchronous radio events is surfaced as a tokio `mpsc` receiver so the
//! session can consume it from its own tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// GATT CONSTANTS
// ============================================================================

/// Heart Rate service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// RSSI value reported when the radio did not supply one
pub const RSSI_UNAVAILABLE: i16 = 127;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors reported by a radio stack implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("Bluetooth adapter not available")]
    AdapterNotAvailable,
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(PeripheralId),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("Scan error: {0}")]
    Scan(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

// ============================================================================
// ADAPTER STATE
// ============================================================================

/// Power/availability state of the local Bluetooth adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// All states, in declaration order
    pub const ALL: [AdapterState; 6] = [
        AdapterState::Unknown,
        AdapterState::Resetting,
        AdapterState::Unsupported,
        AdapterState::Unauthorized,
        AdapterState::PoweredOff,
        AdapterState::PoweredOn,
    ];

    /// Whether radio operations may run in this state
    pub fn is_powered_on(&self) -> bool {
        matches!(self, AdapterState::PoweredOn)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

// ============================================================================
// PERIPHERALS
// ============================================================================

/// Opaque, stable identity of a peripheral as reported by the radio
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A peripheral observed while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralRecord {
    /// Deduplication key
    pub id: PeripheralId,
    /// Advertised local name, if any
    pub display_name: Option<String>,
    /// RSSI in dBm at first sighting
    pub signal_strength: i16,
}

impl PeripheralRecord {
    pub fn new(id: impl Into<String>, display_name: Option<String>, signal_strength: i16) -> Self {
        Self {
            id: PeripheralId::new(id),
            display_name,
            signal_strength,
        }
    }

    /// Name to show to a user, falling back to the identity
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Scan filter; an empty service list observes every advertiser
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
}

// ============================================================================
// EVENT STREAMS
// ============================================================================

/// One discovery callback: a peripheral, or a per-advertisement error
pub type ScanResult = Result<PeripheralRecord, RadioError>;

/// One characteristic notification: the raw transport payload (possibly absent)
pub type NotificationResult = Result<Option<Vec<u8>>, RadioError>;

pub type AdapterStateStream = mpsc::Receiver<AdapterState>;
pub type ScanStream = mpsc::Receiver<ScanResult>;
pub type NotificationStreamRx = mpsc::Receiver<NotificationResult>;
pub type DisconnectStream = mpsc::Receiver<PeripheralId>;

// ============================================================================
// RADIO STACK TRAIT
// ============================================================================

/// Platform BLE central operations consumed by the session.
///
/// Implementers own the actual adapter. Streams end when the implementation
/// drops its sender; the session treats a closed stream as "no more events".
#[async_trait]
pub trait RadioStack: Send + Sync {
    /// Current adapter state
    async fn adapter_state(&self) -> Result<AdapterState, RadioError>;

    /// Stream of adapter state transitions in platform emission order
    async fn subscribe_adapter_state(&self) -> Result<AdapterStateStream, RadioError>;

    /// Begin broadcast discovery
    async fn start_scan(&self, filter: ScanFilter) -> Result<ScanStream, RadioError>;

    /// Stop broadcast discovery; must tolerate being called while idle
    async fn stop_scan(&self) -> Result<(), RadioError>;

    /// Open a connection to a peripheral
    async fn connect(&self, id: &PeripheralId) -> Result<(), RadioError>;

    /// Discover all services and characteristics; returns the service UUIDs
    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Uuid>, RadioError>;

    /// Cancel (or abandon) a connection
    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), RadioError>;

    /// Subscribe to value-change notifications of one characteristic
    async fn subscribe_characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStreamRx, RadioError>;

    /// Stream of peer-initiated or link-loss disconnects
    async fn subscribe_disconnects(&self) -> Result<DisconnectStream, RadioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gatt_constants_match_sig_assignments() {
        assert_eq!(
            HEART_RATE_SERVICE_UUID.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            HEART_RATE_MEASUREMENT_UUID.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_only_powered_on_allows_radio_operations() {
        for state in AdapterState::ALL {
            assert_eq!(state.is_powered_on(), state == AdapterState::PoweredOn);
        }
    }

    #[test]
    fn test_peripheral_label_falls_back_to_identity() {
        let named = PeripheralRecord::new("AA:BB", Some("Polar H10".to_string()), -60);
        let anonymous = PeripheralRecord::new("CC:DD", None, -80);

        assert_eq!(named.label(), "Polar H10");
        assert_eq!(anonymous.label(), "CC:DD");
    }
}
