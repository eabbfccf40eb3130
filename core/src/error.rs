use std::fmt;
use thiserror::Error;

use crate::codec::DecodeError;
use crate::radio::{AdapterState, PeripheralId, RadioError};

/// Step of the connect sequence that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    Connect,
    DiscoverServices,
}

impl fmt::Display for ConnectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::DiscoverServices => write!(f, "service discovery"),
        }
    }
}

/// Session failure taxonomy.
///
/// These never cross the `HeartRateSession` boundary as `Err`: components
/// log them and surface the outcome as state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Bluetooth adapter unavailable (state: {0})")]
    AdapterUnavailable(AdapterState),

    #[error("Bluetooth permissions denied")]
    PermissionDenied,

    #[error("Scan callback error: {0}")]
    ScanCallback(RadioError),

    #[error("Connection to {peripheral} failed during {step}: {source}")]
    ConnectionFailure {
        peripheral: PeripheralId,
        step: ConnectStep,
        source: RadioError,
    },

    #[error("Decode failure: {0}")]
    DecodeFailure(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::AdapterUnavailable(AdapterState::PoweredOff);
        assert_eq!(
            err.to_string(),
            "Bluetooth adapter unavailable (state: PoweredOff)"
        );

        let err = SessionError::ConnectionFailure {
            peripheral: PeripheralId::from("AA:BB"),
            step: ConnectStep::DiscoverServices,
            source: RadioError::DiscoveryFailed("gatt 133".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Connection to AA:BB failed during service discovery: Service discovery failed: gatt 133"
        );

        let err: SessionError = DecodeError::MissingPayload.into();
        assert_eq!(
            err.to_string(),
            "Decode failure: Notification carried no payload"
        );
    }
}
