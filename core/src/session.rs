//! Heart rate session
//!
//! The one type a presentation layer talks to. It wires the components
//! together around a shared `SessionContext`, exposes the four operations
//! (permissions, scan, connect, disconnect) and read-only state, and owns
//! teardown.
//!
//! No operation returns an error: failures are logged by the component that
//! hit them and show up as state (still not scanning, still disconnected,
//! reading invalid).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterMonitor, AdapterSubscription};
use crate::config::{ConfigError, SessionConfig};
use crate::connection::ConnectionManager;
use crate::context::SessionContext;
use crate::notify::NotificationStream;
use crate::permission::{PermissionGate, PermissionStore};
use crate::radio::{AdapterState, PeripheralRecord, RadioStack};
use crate::scan::ScanRegistry;
use crate::state::{ConnectionHandle, DecodedReading, SessionSnapshot, SessionUpdate};

pub struct HeartRateSession {
    config: SessionConfig,
    context: Arc<SessionContext>,
    monitor: Arc<AdapterMonitor>,
    permissions: Arc<PermissionGate>,
    scanner: Arc<ScanRegistry>,
    connections: Arc<ConnectionManager>,
    guard: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl HeartRateSession {
    /// Build a session over a radio. `store` may be `None` on platforms whose
    /// tier never prompts.
    pub fn new(
        config: SessionConfig,
        radio: Arc<dyn RadioStack>,
        store: Option<Arc<dyn PermissionStore>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let context = SessionContext::new(config.update_channel_capacity);
        let permissions = Arc::new(match store {
            Some(store) => PermissionGate::new(config.capability_tier, store),
            None => {
                if !config.capability_tier.required_permissions().is_empty() {
                    warn!(
                        "Tier {} needs a permission store; scans will be refused",
                        config.capability_tier
                    );
                }
                PermissionGate::without_store(config.capability_tier)
            }
        });

        let monitor = AdapterMonitor::new(context.clone(), radio.clone());
        let scanner = Arc::new(ScanRegistry::new(
            context.clone(),
            radio.clone(),
            permissions.clone(),
            config.scan_timeout(),
        ));
        let stream = Arc::new(NotificationStream::new(
            context.clone(),
            radio.clone(),
            Arc::from(config.transport_encoding.decoder()),
        ));
        let connections = Arc::new(ConnectionManager::new(
            context.clone(),
            radio,
            scanner.clone(),
            stream,
        ));

        Ok(Self {
            config,
            context,
            monitor,
            permissions,
            scanner,
            connections,
            guard: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Start following the adapter and the link. Call once before using the
    /// operations; until then the session is uninitialized and every gated
    /// operation is a no-op.
    pub async fn start(&self) {
        if self.is_disposed() {
            warn!("Session disposed; not starting");
            return;
        }

        self.monitor.start().await;
        self.connections.watch_link_loss().await;

        let task = tokio::spawn(guard_adapter(
            self.monitor.transitions(),
            self.scanner.clone(),
            self.connections.clone(),
        ));
        let previous = self.guard.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(
            "Heart rate session started (adapter: {}, tier: {})",
            self.adapter_state(),
            self.permissions.tier()
        );
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn request_permissions(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        self.permissions.request_permissions().await
    }

    /// Start a scan, replacing any active one
    pub async fn scan_for_peripherals(&self) {
        if self.is_disposed() {
            return;
        }
        self.scanner.start().await;
    }

    pub async fn stop_scan(&self) {
        self.scanner.stop().await;
    }

    pub async fn connect_to_device(&self, peripheral: &PeripheralRecord) {
        if self.is_disposed() {
            return;
        }
        self.connections.connect(peripheral).await;
    }

    pub async fn disconnect_from_device(&self) {
        self.connections.disconnect().await;
    }

    // ------------------------------------------------------------------------
    // Observable state
    // ------------------------------------------------------------------------

    pub fn adapter_state(&self) -> AdapterState {
        self.context.adapter_state()
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_initialized()
    }

    pub fn is_scanning(&self) -> bool {
        self.context.is_scanning()
    }

    pub fn discovered_peripherals(&self) -> Vec<PeripheralRecord> {
        self.context.discovered()
    }

    pub fn connected_peripheral(&self) -> Option<ConnectionHandle> {
        self.context.connection()
    }

    pub fn current_reading(&self) -> DecodedReading {
        self.context.reading()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.context.snapshot()
    }

    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    /// Every applied state change, in order
    pub fn updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.context.subscribe()
    }

    pub fn on_adapter_state_change(
        &self,
        listener: impl Fn(AdapterState) + Send + Sync + 'static,
    ) -> AdapterSubscription {
        self.monitor.on_state_change(listener)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Release the adapter subscription, stop scanning and cancel the
    /// connection. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.monitor.dispose();
        let guard = self.guard.lock().take();
        if let Some(guard) = guard {
            guard.abort();
        }
        self.scanner.stop().await;
        self.connections.disconnect().await;
        self.connections.dispose();
        info!("Heart rate session disposed");
    }
}

impl Drop for HeartRateSession {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.get_mut().take() {
            guard.abort();
        }
    }
}

/// Stop radio work whenever the adapter leaves `PoweredOn`. Every transition
/// is seen, so an Off/On blip still releases the scan and the link.
async fn guard_adapter(
    mut states: mpsc::UnboundedReceiver<AdapterState>,
    scanner: Arc<ScanRegistry>,
    connections: Arc<ConnectionManager>,
) {
    while let Some(state) = states.recv().await {
        if state.is_powered_on() {
            continue;
        }

        debug!("Adapter left PoweredOn ({}); releasing radio", state);
        scanner.stop().await;
        connections.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRadio, RadioCall};
    use crate::permission::{CapabilityTier, MockPermissionStore, PermissionStatus};

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    async fn started(radio: Arc<MockRadio>) -> HeartRateSession {
        let session = HeartRateSession::new(SessionConfig::default(), radio, None).unwrap();
        session.start().await;
        session
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig {
            scan_timeout_secs: 0,
            ..Default::default()
        };
        let result = HeartRateSession::new(config, Arc::new(MockRadio::new()), None);
        assert!(matches!(result, Err(ConfigError::InvalidScanTimeout)));
    }

    #[tokio::test]
    async fn test_operations_before_start_are_noops() {
        let radio = Arc::new(MockRadio::powered_on());
        let session = HeartRateSession::new(SessionConfig::default(), radio.clone(), None).unwrap();

        session.scan_for_peripherals().await;
        session
            .connect_to_device(&PeripheralRecord::new("A", None, -40))
            .await;

        assert!(!session.is_initialized());
        assert!(!session.is_scanning());
        assert!(session.connected_peripheral().is_none());
        assert!(radio.calls().is_empty());
    }

    #[tokio::test]
    async fn test_modern_tier_partial_grant_blocks_scan() {
        let mut store = MockPermissionStore::new();
        store
            .expect_request()
            .times(3)
            .returning(|kind| match kind {
                crate::permission::PermissionKind::FineLocation => PermissionStatus::Denied,
                _ => PermissionStatus::Granted,
            });
        let radio = Arc::new(MockRadio::powered_on());
        let config = SessionConfig::default().with_tier(CapabilityTier::ModernRuntime);
        let session =
            HeartRateSession::new(config, radio.clone(), Some(Arc::new(store))).unwrap();
        session.start().await;

        session.scan_for_peripherals().await;

        assert!(!session.is_scanning());
        assert_eq!(radio.count(|c| matches!(c, RadioCall::StartScan(_))), 0);
    }

    #[tokio::test]
    async fn test_adapter_loss_releases_scan_and_link() {
        let radio = Arc::new(MockRadio::powered_on());
        let session = started(radio.clone()).await;

        session.scan_for_peripherals().await;
        assert!(session.is_scanning());
        session
            .connect_to_device(&PeripheralRecord::new("A", Some("HRM".into()), -40))
            .await;
        assert!(session.connected_peripheral().is_some());
        session.scan_for_peripherals().await;
        assert!(session.is_scanning());

        radio.set_adapter_state(AdapterState::PoweredOff);
        settle().await;

        assert!(!session.is_initialized());
        assert!(!session.is_scanning());
        assert!(session.connected_peripheral().is_none());
        assert!(!session.current_reading().is_valid());
    }

    #[tokio::test]
    async fn test_adapter_blip_still_releases_radio() {
        let radio = Arc::new(MockRadio::powered_on());
        let session = started(radio.clone()).await;
        let mut updates = session.updates();

        session
            .connect_to_device(&PeripheralRecord::new("A", Some("HRM".into()), -40))
            .await;
        session.scan_for_peripherals().await;
        radio.notify(Ok(Some(vec![0x00, 0x48])));
        settle().await;
        assert_eq!(session.current_reading().bpm(), Some(72));

        radio.set_adapter_state(AdapterState::PoweredOff);
        radio.set_adapter_state(AdapterState::PoweredOn);
        settle().await;

        let mut saw_off = false;
        while let Ok(update) = updates.try_recv() {
            saw_off |= update == SessionUpdate::AdapterChanged(AdapterState::PoweredOff);
        }
        assert!(saw_off);
        assert!(session.is_initialized());
        assert!(session.connected_peripheral().is_none());
        assert!(!session.is_scanning());
        assert!(!session.current_reading().is_valid());
        assert_eq!(
            radio.count(|c| *c == RadioCall::CancelConnection("A".into())),
            1
        );
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let radio = Arc::new(MockRadio::powered_on());
        let session = started(radio.clone()).await;
        session.scan_for_peripherals().await;
        session
            .connect_to_device(&PeripheralRecord::new("A", None, -40))
            .await;

        session.dispose().await;
        session.dispose().await;

        assert!(session.is_disposed());
        assert!(!session.is_scanning());
        assert!(session.connected_peripheral().is_none());
        assert_eq!(
            radio.count(|c| *c == RadioCall::CancelConnection("A".into())),
            1
        );

        // Later operations do nothing
        let before = radio.calls().len();
        session.scan_for_peripherals().await;
        session.disconnect_from_device().await;
        session.stop_scan().await;
        assert!(!session.request_permissions().await);
        assert_eq!(radio.calls().len(), before);
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let radio = Arc::new(MockRadio::powered_on());
        let session = started(radio).await;

        let json = session.snapshot_json().unwrap();
        let snapshot: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot.adapter_state, AdapterState::PoweredOn);
        assert!(snapshot.initialized);
        assert!(snapshot.connected.is_none());
    }
}
