//! Runtime permission gate
//!
//! Platforms disagree on what a BLE central needs before it may scan:
//! - desktop and iOS: nothing at runtime (iOS prompts on first radio use)
//! - Android below API 31: a single location grant
//! - Android 31 and later: scan, connect and precise location, all of them
//!
//! Each tier is its own strategy so it can be tested in isolation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// First Android API level with the split Bluetooth permissions
pub const RUNTIME_PERMISSION_API_THRESHOLD: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionKind {
    /// Pre-31 location grant covering BLE scanning
    CoarseLocation,
    BluetoothScan,
    BluetoothConnect,
    FineLocation,
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CoarseLocation => write!(f, "CoarseLocation"),
            Self::BluetoothScan => write!(f, "BluetoothScan"),
            Self::BluetoothConnect => write!(f, "BluetoothConnect"),
            Self::FineLocation => write!(f, "FineLocation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

impl PermissionStatus {
    pub fn is_granted(&self) -> bool {
        *self == PermissionStatus::Granted
    }
}

/// Platform permission store; implementations may show a prompt
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn request(&self, kind: PermissionKind) -> PermissionStatus;
}

/// Host platform, as far as permissions are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    /// `api_level` is `None` when the OS did not report one
    Android { api_level: Option<u32> },
    Ios,
    Desktop,
}

/// Permission strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CapabilityTier {
    #[default]
    NoRuntimeGrant,
    /// Single location grant (Android < 31)
    LegacyRuntime,
    /// Scan + connect + precise location (Android >= 31)
    ModernRuntime,
}

impl CapabilityTier {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Android { api_level } => match api_level {
                Some(level) if level >= RUNTIME_PERMISSION_API_THRESHOLD => {
                    CapabilityTier::ModernRuntime
                }
                _ => CapabilityTier::LegacyRuntime,
            },
            Platform::Ios | Platform::Desktop => CapabilityTier::NoRuntimeGrant,
        }
    }

    pub fn required_permissions(&self) -> &'static [PermissionKind] {
        match self {
            CapabilityTier::NoRuntimeGrant => &[],
            CapabilityTier::LegacyRuntime => &[PermissionKind::CoarseLocation],
            CapabilityTier::ModernRuntime => &[
                PermissionKind::BluetoothScan,
                PermissionKind::BluetoothConnect,
                PermissionKind::FineLocation,
            ],
        }
    }
}

impl fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRuntimeGrant => write!(f, "none"),
            Self::LegacyRuntime => write!(f, "legacy"),
            Self::ModernRuntime => write!(f, "modern"),
        }
    }
}

impl std::str::FromStr for CapabilityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::NoRuntimeGrant),
            "legacy" => Ok(Self::LegacyRuntime),
            "modern" => Ok(Self::ModernRuntime),
            other => Err(format!("unknown capability tier '{}'", other)),
        }
    }
}

pub struct PermissionGate {
    tier: CapabilityTier,
    store: Option<Arc<dyn PermissionStore>>,
}

impl PermissionGate {
    pub fn new(tier: CapabilityTier, store: Arc<dyn PermissionStore>) -> Self {
        Self {
            tier,
            store: Some(store),
        }
    }

    /// Gate for platforms that never prompt at runtime
    pub fn unrestricted() -> Self {
        Self {
            tier: CapabilityTier::NoRuntimeGrant,
            store: None,
        }
    }

    /// Gate with no store to ask; any runtime tier resolves to denied
    pub fn without_store(tier: CapabilityTier) -> Self {
        Self { tier, store: None }
    }

    pub fn tier(&self) -> CapabilityTier {
        self.tier
    }

    /// Resolve the tier's permissions into a single verdict
    pub async fn request_permissions(&self) -> bool {
        let granted = match self.tier {
            CapabilityTier::NoRuntimeGrant => true,
            CapabilityTier::LegacyRuntime => self.request_legacy().await,
            CapabilityTier::ModernRuntime => self.request_modern().await,
        };

        if granted {
            debug!("Permissions granted (tier: {})", self.tier);
        } else {
            info!("Permissions denied (tier: {})", self.tier);
        }
        granted
    }

    async fn request_legacy(&self) -> bool {
        let Some(store) = &self.store else {
            warn!("No permission store for tier {}; treating as denied", self.tier);
            return false;
        };
        store
            .request(PermissionKind::CoarseLocation)
            .await
            .is_granted()
    }

    async fn request_modern(&self) -> bool {
        let Some(store) = &self.store else {
            warn!("No permission store for tier {}; treating as denied", self.tier);
            return false;
        };

        // Every permission is requested even after a denial so the platform
        // records each answer; only an all-granted outcome passes.
        let mut all_granted = true;
        for kind in self.tier.required_permissions() {
            let status = store.request(*kind).await;
            debug!("{} -> {:?}", kind, status);
            all_granted &= status.is_granted();
        }
        all_granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn modern_store(scan: bool, connect: bool, location: bool) -> MockPermissionStore {
        let status = |granted: bool| {
            if granted {
                PermissionStatus::Granted
            } else {
                PermissionStatus::Denied
            }
        };
        let mut store = MockPermissionStore::new();
        store
            .expect_request()
            .with(eq(PermissionKind::BluetoothScan))
            .times(1)
            .return_const(status(scan));
        store
            .expect_request()
            .with(eq(PermissionKind::BluetoothConnect))
            .times(1)
            .return_const(status(connect));
        store
            .expect_request()
            .with(eq(PermissionKind::FineLocation))
            .times(1)
            .return_const(status(location));
        store
    }

    #[test]
    fn test_tier_selection() {
        assert_eq!(
            CapabilityTier::for_platform(Platform::Desktop),
            CapabilityTier::NoRuntimeGrant
        );
        assert_eq!(
            CapabilityTier::for_platform(Platform::Ios),
            CapabilityTier::NoRuntimeGrant
        );
        assert_eq!(
            CapabilityTier::for_platform(Platform::Android { api_level: Some(30) }),
            CapabilityTier::LegacyRuntime
        );
        assert_eq!(
            CapabilityTier::for_platform(Platform::Android { api_level: Some(31) }),
            CapabilityTier::ModernRuntime
        );
        assert_eq!(
            CapabilityTier::for_platform(Platform::Android { api_level: None }),
            CapabilityTier::LegacyRuntime
        );
    }

    #[tokio::test]
    async fn test_no_runtime_grant_never_prompts() {
        let mut store = MockPermissionStore::new();
        store.expect_request().never();
        let gate = PermissionGate::new(CapabilityTier::NoRuntimeGrant, Arc::new(store));
        assert!(gate.request_permissions().await);
        assert!(PermissionGate::unrestricted().request_permissions().await);
    }

    #[tokio::test]
    async fn test_legacy_single_permission() {
        for (status, expected) in [
            (PermissionStatus::Granted, true),
            (PermissionStatus::Denied, false),
        ] {
            let mut store = MockPermissionStore::new();
            store
                .expect_request()
                .with(eq(PermissionKind::CoarseLocation))
                .times(1)
                .return_const(status);
            let gate = PermissionGate::new(CapabilityTier::LegacyRuntime, Arc::new(store));
            assert_eq!(gate.request_permissions().await, expected);
        }
    }

    #[tokio::test]
    async fn test_modern_requires_all_three() {
        let gate = PermissionGate::new(
            CapabilityTier::ModernRuntime,
            Arc::new(modern_store(true, true, true)),
        );
        assert!(gate.request_permissions().await);
    }

    #[tokio::test]
    async fn test_modern_two_of_three_is_denied() {
        for (scan, connect, location) in [
            (false, true, true),
            (true, false, true),
            (true, true, false),
        ] {
            let gate = PermissionGate::new(
                CapabilityTier::ModernRuntime,
                Arc::new(modern_store(scan, connect, location)),
            );
            assert!(!gate.request_permissions().await);
        }
    }

    #[test]
    fn test_modern_all_denied_blocking() {
        let gate = PermissionGate::new(
            CapabilityTier::ModernRuntime,
            Arc::new(modern_store(false, false, false)),
        );
        assert!(!tokio_test::block_on(gate.request_permissions()));
    }

    #[test]
    fn test_runtime_tier_without_store_is_denied() {
        let gate = PermissionGate::without_store(CapabilityTier::ModernRuntime);
        assert!(!tokio_test::block_on(gate.request_permissions()));
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("Modern".parse(), Ok(CapabilityTier::ModernRuntime));
        assert_eq!("none".parse(), Ok(CapabilityTier::NoRuntimeGrant));
        assert!("ultra".parse::<CapabilityTier>().is_err());
    }
}
