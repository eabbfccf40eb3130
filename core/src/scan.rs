//! Scan session registry
//!
//! Owns the single scan session: gated start, first-seen deduplication of
//! advertisers, and a hard deadline after which the scan is force-stopped
//! whether or not anyone calls `stop()`.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::error::SessionError;
use crate::permission::PermissionGate;
use crate::radio::{PeripheralRecord, RadioStack, ScanFilter, ScanStream};
use crate::state::{ScanId, SessionEvent};

/// Default scan deadline
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(50);

struct ScanSession {
    id: ScanId,
    task: JoinHandle<()>,
}

pub struct ScanRegistry {
    context: Arc<SessionContext>,
    radio: Arc<dyn RadioStack>,
    permissions: Arc<PermissionGate>,
    timeout: Duration,
    active: Mutex<Option<ScanSession>>,
}

impl ScanRegistry {
    pub fn new(
        context: Arc<SessionContext>,
        radio: Arc<dyn RadioStack>,
        permissions: Arc<PermissionGate>,
        timeout: Duration,
    ) -> Self {
        Self {
            context,
            radio,
            permissions,
            timeout,
            active: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn check_adapter(&self) -> Result<(), SessionError> {
        let state = self.context.adapter_state();
        if !self.context.is_initialized() || !state.is_powered_on() {
            return Err(SessionError::AdapterUnavailable(state));
        }
        Ok(())
    }

    async fn check_preconditions(&self) -> Result<(), SessionError> {
        self.check_adapter()?;
        if !self.permissions.request_permissions().await {
            return Err(SessionError::PermissionDenied);
        }
        // The adapter may have gone away while a permission prompt was up
        self.check_adapter()
    }

    /// Start a scan session, replacing any active one.
    ///
    /// Returns once discovery is running; results stream in from a background
    /// task. Unmet preconditions make this a logged no-op.
    pub async fn start(&self) {
        if let Err(e) = self.check_preconditions().await {
            warn!("Scan not started: {}", e);
            return;
        }

        self.stop().await;

        let events = match self.radio.start_scan(ScanFilter::default()).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Radio refused to start scanning: {}", e);
                return;
            }
        };

        let id = ScanId(self.context.next_id());
        self.context.dispatch(SessionEvent::ScanStarted(id));

        let task = tokio::spawn(run_scan(
            self.context.clone(),
            self.radio.clone(),
            id,
            events,
            self.timeout,
        ));

        let replaced = self.active.lock().replace(ScanSession { id, task });
        if let Some(replaced) = replaced {
            replaced.task.abort();
        }
        info!("Scan {} started (deadline {:?})", id.0, self.timeout);
    }

    /// Stop the active scan. Safe to call at any time.
    pub async fn stop(&self) {
        let session = self.active.lock().take();
        let Some(session) = session else {
            return;
        };

        session.task.abort();
        let transition = self.context.dispatch(SessionEvent::ScanStopped(session.id));
        if transition.is_applied() {
            if let Err(e) = self.radio.stop_scan().await {
                warn!("Failed to stop scan {}: {}", session.id.0, e);
            }
            info!("Scan {} stopped", session.id.0);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.context.is_scanning()
    }

    pub fn discovered(&self) -> Vec<PeripheralRecord> {
        self.context.discovered()
    }
}

impl Drop for ScanRegistry {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().take() {
            session.task.abort();
        }
    }
}

async fn run_scan(
    context: Arc<SessionContext>,
    radio: Arc<dyn RadioStack>,
    id: ScanId,
    mut events: ScanStream,
    timeout: Duration,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Scan {} reached its {:?} deadline", id.0, timeout);
                break;
            }
            event = events.recv() => match event {
                Some(Ok(record)) => {
                    let label = record.label().to_string();
                    if context
                        .dispatch(SessionEvent::PeripheralDiscovered { scan: id, record })
                        .is_applied()
                    {
                        debug!("Discovered {}", label);
                    }
                }
                Some(Err(e)) => {
                    warn!("{}", SessionError::ScanCallback(e));
                }
                None => {
                    debug!("Scan {} stream closed by radio", id.0);
                    break;
                }
            }
        }
    }

    // Release the radio before marking the session stopped
    drop(events);
    if context.dispatch(SessionEvent::ScanStopped(id)).is_applied() {
        if let Err(e) = radio.stop_scan().await {
            warn!("Failed to stop scan {}: {}", id.0, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRadio, RadioCall};
    use crate::radio::AdapterState;

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn registry(radio: Arc<MockRadio>, state: AdapterState) -> (Arc<SessionContext>, ScanRegistry) {
        let context = SessionContext::new(64);
        context.dispatch(SessionEvent::AdapterChanged(state));
        let registry = ScanRegistry::new(
            context.clone(),
            radio,
            Arc::new(PermissionGate::unrestricted()),
            DEFAULT_SCAN_TIMEOUT,
        );
        (context, registry)
    }

    fn hrm(id: &str) -> PeripheralRecord {
        PeripheralRecord::new(id, Some("HRM".to_string()), -55)
    }

    #[tokio::test]
    async fn test_start_is_noop_unless_powered_on() {
        for state in AdapterState::ALL {
            if state.is_powered_on() {
                continue;
            }
            let radio = Arc::new(MockRadio::new());
            radio.set_adapter_state(state);
            let (context, registry) = registry(radio.clone(), state);

            let before = context.read(|s| s.clone());
            registry.start().await;

            assert_eq!(context.read(|s| s.clone()), before, "state {:?}", state);
            assert_eq!(radio.count(|c| matches!(c, RadioCall::StartScan(_))), 0);
            assert!(!registry.is_scanning());
        }
    }

    #[tokio::test]
    async fn test_scan_uses_no_service_filter() {
        let radio = Arc::new(MockRadio::powered_on());
        let (_context, registry) = registry(radio.clone(), AdapterState::PoweredOn);

        registry.start().await;

        assert!(registry.is_scanning());
        assert_eq!(
            radio.count(|c| *c == RadioCall::StartScan(ScanFilter::default())),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicates_and_errors_do_not_disturb_scan() {
        let radio = Arc::new(MockRadio::powered_on());
        let (_context, registry) = registry(radio.clone(), AdapterState::PoweredOn);
        registry.start().await;

        radio.advertise(hrm("A"));
        radio.scan_error("malformed advertisement");
        radio.advertise(PeripheralRecord::new("A", None, -90));
        radio.advertise(hrm("B"));
        settle().await;

        let found = registry.discovered();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id.as_str(), "A");
        assert_eq!(found[0].display_name.as_deref(), Some("HRM"));
        assert_eq!(found[1].id.as_str(), "B");
        assert!(registry.is_scanning());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let radio = Arc::new(MockRadio::powered_on());
        let (_context, registry) = registry(radio.clone(), AdapterState::PoweredOn);

        registry.stop().await;
        registry.start().await;
        registry.stop().await;
        registry.stop().await;

        assert!(!registry.is_scanning());
        assert_eq!(radio.count(|c| *c == RadioCall::StopScan), 1);
    }

    #[tokio::test]
    async fn test_restart_replaces_session_and_clears_set() {
        let radio = Arc::new(MockRadio::powered_on());
        let (_context, registry) = registry(radio.clone(), AdapterState::PoweredOn);

        registry.start().await;
        radio.advertise(hrm("A"));
        settle().await;
        assert_eq!(registry.discovered().len(), 1);

        registry.start().await;
        assert!(registry.discovered().is_empty());
        assert!(registry.is_scanning());

        radio.advertise(hrm("B"));
        settle().await;
        let found = registry.discovered();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "B");
    }

    #[tokio::test]
    async fn test_advertisements_after_stop_are_ignored() {
        let radio = Arc::new(MockRadio::powered_on());
        radio.retain_streams(true);
        let (context, registry) = registry(radio.clone(), AdapterState::PoweredOn);
        registry.start().await;
        assert!(radio.advertise(hrm("A")));
        settle().await;

        // Session ends while the scan task is still draining the radio stream
        let id = context.read(|s| s.active_scan).expect("scan active");
        assert!(context.dispatch(SessionEvent::ScanStopped(id)).is_applied());

        assert!(radio.advertise(hrm("B")));
        settle().await;

        let found = registry.discovered();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "A");
        assert!(!registry.is_scanning());
    }

    #[tokio::test]
    async fn test_radio_closing_stream_ends_session() {
        let radio = Arc::new(MockRadio::powered_on());
        let (_context, registry) = registry(radio.clone(), AdapterState::PoweredOn);
        registry.start().await;

        // Radio side goes away
        radio.stop_scan().await.unwrap();
        settle().await;

        assert!(!registry.is_scanning());
    }
}
