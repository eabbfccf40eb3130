// hrlink core: BLE heart rate client session
//
// One session finds a heart rate strap, connects to it, and turns its
// measurement notifications into readings. Radio and permission access are
// collaborators behind traits so the same core runs over a platform bridge,
// btleplug, or the in-memory mock.

pub mod adapter;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod mock;
pub mod notify;
pub mod permission;
pub mod radio;
pub mod scan;
pub mod session;
pub mod state;

pub use adapter::{AdapterMonitor, AdapterSubscription};
pub use codec::{
    decode_heart_rate, DecodeError, HexDecoder, RawDecoder, TransportDecoder, TransportEncoding,
};
pub use config::{ConfigError, SessionConfig};
pub use connection::ConnectionManager;
pub use context::SessionContext;
pub use error::{ConnectStep, SessionError};
pub use notify::NotificationStream;
pub use permission::{
    CapabilityTier, PermissionGate, PermissionKind, PermissionStatus, PermissionStore, Platform,
};
pub use radio::{
    AdapterState, PeripheralId, PeripheralRecord, RadioError, RadioStack, ScanFilter,
    HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
};
pub use scan::{ScanRegistry, DEFAULT_SCAN_TIMEOUT};
pub use session::HeartRateSession;
pub use state::{ConnectionHandle, DecodedReading, SessionSnapshot, SessionUpdate, Validity};
