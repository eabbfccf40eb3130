//! Connection manager
//!
//! Owns the single live connection. A connect runs four steps in order:
//! radio connect, service discovery, stop scanning, attach the heart rate
//! stream. Failures in the first two abort the sequence and are logged; the
//! caller observes them only as "still disconnected".

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::error::{ConnectStep, SessionError};
use crate::notify::NotificationStream;
use crate::radio::{DisconnectStream, PeripheralId, PeripheralRecord, RadioStack};
use crate::scan::ScanRegistry;
use crate::state::{ConnectionHandle, SessionEvent};

pub struct ConnectionManager {
    context: Arc<SessionContext>,
    radio: Arc<dyn RadioStack>,
    scanner: Arc<ScanRegistry>,
    stream: Arc<NotificationStream>,
    /// Serializes connect/disconnect/link-loss sequences
    sequence: Arc<tokio::sync::Mutex<()>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        context: Arc<SessionContext>,
        radio: Arc<dyn RadioStack>,
        scanner: Arc<ScanRegistry>,
        stream: Arc<NotificationStream>,
    ) -> Self {
        Self {
            context,
            radio,
            scanner,
            stream,
            sequence: Arc::new(tokio::sync::Mutex::new(())),
            watcher: Mutex::new(None),
        }
    }

    /// Follow peer-initiated disconnects reported by the radio
    pub async fn watch_link_loss(&self) {
        let losses = match self.radio.subscribe_disconnects().await {
            Ok(losses) => losses,
            Err(e) => {
                warn!("Could not subscribe to disconnect events: {}", e);
                return;
            }
        };

        let task = tokio::spawn(pump_link_loss(
            self.context.clone(),
            self.stream.clone(),
            self.sequence.clone(),
            losses,
        ));
        let previous = self.watcher.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn connected(&self) -> Option<ConnectionHandle> {
        self.context.connection()
    }

    /// Connect to a peripheral and start streaming from it.
    ///
    /// An existing connection is disconnected first. Every failure is logged
    /// and leaves the session disconnected, including a heart rate subscribe
    /// that fails after the link is up: a link with no stream is dropped.
    /// Retrying is up to the caller.
    pub async fn connect(&self, peripheral: &PeripheralRecord) {
        let _sequence = self.sequence.lock().await;

        if !self.context.is_initialized() {
            warn!(
                "Not connecting to {}: {}",
                peripheral.label(),
                SessionError::AdapterUnavailable(self.context.adapter_state())
            );
            return;
        }

        if let Some(existing) = self.context.connection() {
            info!(
                "Replacing connection to {} with {}",
                existing.peripheral.label(),
                peripheral.label()
            );
            self.teardown(&existing, true).await;
        }

        match self.establish(peripheral).await {
            Ok(handle) => {
                info!("Connected to {}", handle.peripheral.label());
                self.scanner.stop().await;
                if !self.stream.attach(Some(&handle)).await {
                    warn!(
                        "Dropping link to {}: heart rate stream unavailable",
                        handle.peripheral.label()
                    );
                    self.teardown(&handle, true).await;
                }
            }
            Err(e) => warn!("{}", e),
        }
    }

    async fn establish(&self, peripheral: &PeripheralRecord) -> Result<ConnectionHandle, SessionError> {
        let id = &peripheral.id;

        self.radio
            .connect(id)
            .await
            .map_err(|source| SessionError::ConnectionFailure {
                peripheral: id.clone(),
                step: ConnectStep::Connect,
                source,
            })?;

        let services = match self.radio.discover_services(id).await {
            Ok(services) => services,
            Err(source) => {
                self.abandon(id).await;
                return Err(SessionError::ConnectionFailure {
                    peripheral: id.clone(),
                    step: ConnectStep::DiscoverServices,
                    source,
                });
            }
        };

        // Adapter revoked while the radio was busy
        if !self.context.is_initialized() {
            self.abandon(id).await;
            return Err(SessionError::AdapterUnavailable(self.context.adapter_state()));
        }

        let handle = ConnectionHandle {
            peripheral: peripheral.clone(),
            services,
            connected_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        self.context.dispatch(SessionEvent::Connected(handle.clone()));
        Ok(handle)
    }

    async fn abandon(&self, id: &PeripheralId) {
        if let Err(e) = self.radio.cancel_connection(id).await {
            debug!("Cancelling half-open link to {} failed: {}", id, e);
        }
    }

    /// Disconnect the live connection, if any. Safe to call at any time.
    pub async fn disconnect(&self) {
        let _sequence = self.sequence.lock().await;

        let Some(handle) = self.context.connection() else {
            debug!("Disconnect requested with no live connection");
            return;
        };
        self.teardown(&handle, true).await;
        info!("Disconnected from {}", handle.peripheral.label());
    }

    async fn teardown(&self, handle: &ConnectionHandle, cancel_radio: bool) {
        self.stream.detach();
        if cancel_radio {
            if let Err(e) = self.radio.cancel_connection(handle.id()).await {
                warn!("Cancelling connection to {} failed: {}", handle.id(), e);
            }
        }
        self.context
            .dispatch(SessionEvent::Disconnected(handle.id().clone()));
    }

    /// Stop following link loss. Idempotent.
    pub fn dispose(&self) {
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

async fn pump_link_loss(
    context: Arc<SessionContext>,
    stream: Arc<NotificationStream>,
    sequence: Arc<tokio::sync::Mutex<()>>,
    mut losses: DisconnectStream,
) {
    while let Some(id) = losses.recv().await {
        let _sequence = sequence.lock().await;

        let current = context.connection();
        if current.as_ref().map(|c| c.id()) != Some(&id) {
            debug!("Ignoring link loss for {} (not the live connection)", id);
            continue;
        }

        stream.detach();
        context.dispatch(SessionEvent::Disconnected(id.clone()));
        warn!("Connection to {} lost", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawDecoder;
    use crate::mock::{MockRadio, RadioCall};
    use crate::permission::PermissionGate;
    use crate::radio::AdapterState;
    use crate::scan::DEFAULT_SCAN_TIMEOUT;
    use crate::state::DecodedReading;

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    struct Harness {
        radio: Arc<MockRadio>,
        context: Arc<SessionContext>,
        scanner: Arc<ScanRegistry>,
        stream: Arc<NotificationStream>,
        manager: ConnectionManager,
    }

    fn harness(state: AdapterState) -> Harness {
        let radio = Arc::new(MockRadio::powered_on());
        let context = SessionContext::new(64);
        context.dispatch(SessionEvent::AdapterChanged(state));
        let scanner = Arc::new(ScanRegistry::new(
            context.clone(),
            radio.clone(),
            Arc::new(PermissionGate::unrestricted()),
            DEFAULT_SCAN_TIMEOUT,
        ));
        let stream = Arc::new(NotificationStream::new(
            context.clone(),
            radio.clone(),
            Arc::new(RawDecoder),
        ));
        let manager =
            ConnectionManager::new(context.clone(), radio.clone(), scanner.clone(), stream.clone());
        Harness {
            radio,
            context,
            scanner,
            stream,
            manager,
        }
    }

    fn hrm(id: &str) -> PeripheralRecord {
        PeripheralRecord::new(id, Some(format!("HRM-{}", id)), -60)
    }

    fn subscribed(radio: &MockRadio) -> usize {
        radio.count(|c| matches!(c, RadioCall::SubscribeCharacteristic { .. }))
    }

    #[tokio::test]
    async fn test_connect_requires_initialized_adapter() {
        let h = harness(AdapterState::PoweredOff);

        h.manager.connect(&hrm("A")).await;

        assert!(h.manager.connected().is_none());
        assert!(h.radio.calls().is_empty());
    }

    #[tokio::test]
    async fn test_connect_runs_all_steps() {
        let h = harness(AdapterState::PoweredOn);
        h.scanner.start().await;
        assert!(h.scanner.is_scanning());

        h.manager.connect(&hrm("A")).await;

        let connected = h.manager.connected().expect("connected");
        assert_eq!(connected.id().as_str(), "A");
        assert!(!h.scanner.is_scanning());
        assert!(h.stream.is_attached());

        let calls = h.radio.calls();
        let pos = |call: &RadioCall| calls.iter().position(|c| c == call).expect("call made");
        let connect = pos(&RadioCall::Connect("A".into()));
        let discover = pos(&RadioCall::DiscoverServices("A".into()));
        let stop = pos(&RadioCall::StopScan);
        assert!(connect < discover && discover < stop);
        assert_eq!(subscribed(&h.radio), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let h = harness(AdapterState::PoweredOn);
        h.radio.fail_connect(true);

        h.manager.connect(&hrm("A")).await;

        assert!(h.manager.connected().is_none());
        assert_eq!(h.radio.count(|c| matches!(c, RadioCall::DiscoverServices(_))), 0);
        assert_eq!(subscribed(&h.radio), 0);
    }

    #[tokio::test]
    async fn test_discovery_failure_does_not_attach() {
        let h = harness(AdapterState::PoweredOn);
        h.scanner.start().await;
        h.radio.fail_discovery(true);

        h.manager.connect(&hrm("A")).await;

        assert!(h.manager.connected().is_none());
        assert!(!h.stream.is_attached());
        assert_eq!(subscribed(&h.radio), 0);
        // half-open link released, scan left alone
        assert_eq!(
            h.radio.count(|c| *c == RadioCall::CancelConnection("A".into())),
            1
        );
        assert!(h.scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_subscribe_failure_drops_link() {
        let h = harness(AdapterState::PoweredOn);
        h.radio.fail_subscribe(true);

        h.manager.connect(&hrm("A")).await;

        assert!(h.manager.connected().is_none());
        assert!(!h.stream.is_attached());
        assert_eq!(subscribed(&h.radio), 1);
        assert_eq!(
            h.radio.count(|c| *c == RadioCall::CancelConnection("A".into())),
            1
        );

        // The caller may simply try again
        h.radio.fail_subscribe(false);
        h.manager.connect(&hrm("A")).await;
        assert!(h.stream.is_attached());
    }

    #[tokio::test]
    async fn test_disconnect_resets_reading() {
        let h = harness(AdapterState::PoweredOn);
        h.radio.retain_streams(true);
        h.manager.connect(&hrm("A")).await;
        assert!(h.radio.notify(Ok(Some(vec![0x00, 0x5A]))));
        settle().await;
        assert_eq!(h.context.reading().bpm(), Some(90));

        h.manager.disconnect().await;

        assert!(h.manager.connected().is_none());
        assert_eq!(h.context.reading(), DecodedReading::invalid());
        assert!(!h.stream.is_attached());
        assert_eq!(
            h.radio.count(|c| *c == RadioCall::CancelConnection("A".into())),
            1
        );

        // The radio still holds its sender; only our side let go
        assert!(!h.radio.notify(Ok(Some(vec![0x00, 0x5B]))));
        settle().await;
        assert_eq!(h.context.reading(), DecodedReading::invalid());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let h = harness(AdapterState::PoweredOn);
        h.manager.disconnect().await;
        h.manager.disconnect().await;
        assert!(h.radio.calls().is_empty());
    }

    #[tokio::test]
    async fn test_connect_while_connected_replaces_after_disconnect() {
        let h = harness(AdapterState::PoweredOn);
        h.manager.connect(&hrm("A")).await;

        h.manager.connect(&hrm("B")).await;

        assert_eq!(h.manager.connected().map(|c| c.peripheral.id), Some("B".into()));
        let calls = h.radio.calls();
        let cancel_a = calls
            .iter()
            .position(|c| *c == RadioCall::CancelConnection("A".into()))
            .expect("old link cancelled");
        let connect_b = calls
            .iter()
            .position(|c| *c == RadioCall::Connect("B".into()))
            .expect("new link opened");
        assert!(cancel_a < connect_b);
    }

    #[tokio::test]
    async fn test_link_loss_clears_connection() {
        let h = harness(AdapterState::PoweredOn);
        h.manager.watch_link_loss().await;
        h.manager.connect(&hrm("A")).await;
        h.radio.notify(Ok(Some(vec![0x00, 0x46])));
        settle().await;

        h.radio.drop_link(&"A".into());
        settle().await;

        assert!(h.manager.connected().is_none());
        assert!(!h.stream.is_attached());
        assert_eq!(h.context.reading(), DecodedReading::invalid());
        assert_eq!(
            h.radio.count(|c| matches!(c, RadioCall::CancelConnection(_))),
            0
        );
    }
}
