//! Session configuration
//!
//! Values a host may tune before starting a session. Everything else about
//! the heart rate profile is fixed by the Bluetooth SIG and lives in
//! `radio.rs` as constants.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::codec::TransportEncoding;
use crate::permission::CapabilityTier;

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("Invalid scan timeout: must be > 0 seconds")]
    InvalidScanTimeout,

    #[error("Invalid update channel capacity: must be > 0")]
    InvalidChannelCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard deadline for a scan session
    pub scan_timeout_secs: u64,
    pub capability_tier: CapabilityTier,
    /// How the radio bridge hands over characteristic values
    pub transport_encoding: TransportEncoding,
    /// Buffer of the `SessionUpdate` broadcast; slow observers lag past it
    pub update_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 50,
            capability_tier: CapabilityTier::default(),
            transport_encoding: TransportEncoding::default(),
            update_channel_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_timeout_secs == 0 {
            return Err(ConfigError::InvalidScanTimeout);
        }
        if self.update_channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity);
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn with_scan_timeout(mut self, secs: u64) -> Result<Self, ConfigError> {
        self.scan_timeout_secs = secs;
        self.validate()?;
        Ok(self)
    }

    pub fn with_tier(mut self, tier: CapabilityTier) -> Self {
        self.capability_tier = tier;
        self
    }

    pub fn with_encoding(mut self, encoding: TransportEncoding) -> Self {
        self.transport_encoding = encoding;
        self
    }
}
