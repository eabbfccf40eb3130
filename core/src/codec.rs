//! Payload decoding
//!
//! Two layers: a `TransportDecoder` undoes whatever encoding the platform
//! bridge applied to characteristic values (raw bytes on desktop, hex text
//! from some mobile bridges), then `decode_heart_rate` interprets the Heart
//! Rate Measurement bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::radio::NotificationResult;

/// Bit 0 of the flags byte: value format (0 = UINT8, 1 = UINT16)
pub const HR_FORMAT_UINT16: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Notification carried no payload")]
    MissingPayload,
    #[error("Payload too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Invalid transport encoding: {0}")]
    InvalidEncoding(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

// ============================================================================
// TRANSPORT DECODERS
// ============================================================================

/// Turns a transport-encoded characteristic value into raw bytes
pub trait TransportDecoder: Send + Sync {
    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, DecodeError>;
}

/// Values already arrive as raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl TransportDecoder for RawDecoder {
    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, DecodeError> {
        Ok(encoded.to_vec())
    }
}

/// Values arrive as ASCII hex text
#[derive(Debug, Clone, Copy, Default)]
pub struct HexDecoder;

impl TransportDecoder for HexDecoder {
    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let text = std::str::from_utf8(encoded)
            .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;
        hex::decode(text.trim()).map_err(|e| DecodeError::InvalidEncoding(e.to_string()))
    }
}

/// Encoding used by the radio bridge for characteristic values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransportEncoding {
    #[default]
    Raw,
    Hex,
}

impl TransportEncoding {
    pub fn decoder(&self) -> Box<dyn TransportDecoder> {
        match self {
            TransportEncoding::Raw => Box::new(RawDecoder),
            TransportEncoding::Hex => Box::new(HexDecoder),
        }
    }
}

impl std::fmt::Display for TransportEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::Hex => write!(f, "hex"),
        }
    }
}

impl std::str::FromStr for TransportEncoding {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "hex" => Ok(Self::Hex),
            other => Err(DecodeError::InvalidEncoding(format!(
                "unknown transport encoding '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// HEART RATE MEASUREMENT
// ============================================================================

/// Decode a Heart Rate Measurement value.
///
/// With the format bit clear the rate is the UINT8 at byte 1. With it set the
/// rate is 16 bits wide, assembled high byte first from bytes 1 and 2.
pub fn decode_heart_rate(bytes: &[u8]) -> Result<u16, DecodeError> {
    if bytes.len() < 2 {
        return Err(DecodeError::TooShort {
            expected: 2,
            actual: bytes.len(),
        });
    }

    if bytes[0] & HR_FORMAT_UINT16 == 0 {
        return Ok(bytes[1] as u16);
    }

    if bytes.len() < 3 {
        return Err(DecodeError::TooShort {
            expected: 3,
            actual: bytes.len(),
        });
    }

    Ok(((bytes[1] as u16) << 8) | bytes[2] as u16)
}

/// Full pipeline for one notification: transport error, missing payload,
/// transport decoding, then measurement decoding.
pub fn decode_notification(
    decoder: &dyn TransportDecoder,
    notification: NotificationResult,
) -> Result<u16, DecodeError> {
    let payload = notification
        .map_err(|e| DecodeError::Transport(e.to_string()))?
        .ok_or(DecodeError::MissingPayload)?;
    let bytes = decoder.decode(&payload)?;
    decode_heart_rate(&bytes)
}
