//! In-memory radio for tests and demos
//!
//! `MockRadio` records every call it receives and lets a test play the part
//! of the hardware: flip the adapter state, advertise peripherals, push
//! notifications and drop links.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::radio::{
    AdapterState, AdapterStateStream, DisconnectStream, NotificationResult, NotificationStreamRx,
    PeripheralId, PeripheralRecord, RadioError, RadioStack, ScanFilter, ScanResult, ScanStream,
    HEART_RATE_SERVICE_UUID,
};

const CHANNEL_CAPACITY: usize = 64;

/// A call made against the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    AdapterState,
    SubscribeAdapterState,
    StartScan(ScanFilter),
    StopScan,
    Connect(PeripheralId),
    DiscoverServices(PeripheralId),
    CancelConnection(PeripheralId),
    SubscribeCharacteristic {
        peripheral: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    },
    SubscribeDisconnects,
}

#[derive(Default)]
struct MockRadioInner {
    adapter_state: AdapterState,
    adapter_listeners: Vec<mpsc::Sender<AdapterState>>,
    scan_tx: Option<mpsc::Sender<ScanResult>>,
    notify_tx: Option<mpsc::Sender<NotificationResult>>,
    disconnect_tx: Vec<mpsc::Sender<PeripheralId>>,
    fail_connect: bool,
    fail_discovery: bool,
    fail_subscribe: bool,
    retain_streams: bool,
    calls: Vec<RadioCall>,
}

#[derive(Default)]
pub struct MockRadio {
    inner: Mutex<MockRadioInner>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn powered_on() -> Self {
        let radio = Self::new();
        radio.inner.lock().adapter_state = AdapterState::PoweredOn;
        radio
    }

    /// Change the adapter state and notify subscribers
    pub fn set_adapter_state(&self, state: AdapterState) {
        let mut inner = self.inner.lock();
        inner.adapter_state = state;
        inner
            .adapter_listeners
            .retain(|tx| tx.try_send(state).is_ok());
    }

    /// Deliver an advertisement to the active scan. Returns false if no scan
    /// stream is listening.
    pub fn advertise(&self, record: PeripheralRecord) -> bool {
        self.push_scan(Ok(record))
    }

    /// Deliver a per-advertisement error to the active scan
    pub fn scan_error(&self, message: &str) -> bool {
        self.push_scan(Err(RadioError::Scan(message.to_string())))
    }

    fn push_scan(&self, result: ScanResult) -> bool {
        let inner = self.inner.lock();
        match &inner.scan_tx {
            Some(tx) => tx.try_send(result).is_ok(),
            None => false,
        }
    }

    /// Push a notification on the active characteristic subscription
    pub fn notify(&self, notification: NotificationResult) -> bool {
        let inner = self.inner.lock();
        match &inner.notify_tx {
            Some(tx) => tx.try_send(notification).is_ok(),
            None => false,
        }
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_link(&self, id: &PeripheralId) {
        let mut inner = self.inner.lock();
        inner.notify_tx = None;
        inner
            .disconnect_tx
            .retain(|tx| tx.try_send(id.clone()).is_ok());
    }

    pub fn fail_connect(&self, fail: bool) {
        self.inner.lock().fail_connect = fail;
    }

    pub fn fail_discovery(&self, fail: bool) {
        self.inner.lock().fail_discovery = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.inner.lock().fail_subscribe = fail;
    }

    /// Keep scan and notification senders open after `stop_scan` and
    /// `cancel_connection`, the way a platform stack can deliver a few late
    /// callbacks after it was told to stop. Deliveries then succeed as long as
    /// the receiving side is still alive.
    pub fn retain_streams(&self, retain: bool) {
        self.inner.lock().retain_streams = retain;
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.inner.lock().calls.clone()
    }

    /// Number of recorded calls matching a predicate
    pub fn count(&self, pred: impl Fn(&RadioCall) -> bool) -> usize {
        self.inner.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner
            .lock()
            .scan_tx
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    fn record(&self, call: RadioCall) {
        self.inner.lock().calls.push(call);
    }
}

#[async_trait]
impl RadioStack for MockRadio {
    async fn adapter_state(&self) -> Result<AdapterState, RadioError> {
        self.record(RadioCall::AdapterState);
        Ok(self.inner.lock().adapter_state)
    }

    async fn subscribe_adapter_state(&self) -> Result<AdapterStateStream, RadioError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut inner = self.inner.lock();
        inner.calls.push(RadioCall::SubscribeAdapterState);
        inner.adapter_listeners.push(tx);
        Ok(rx)
    }

    async fn start_scan(&self, filter: ScanFilter) -> Result<ScanStream, RadioError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut inner = self.inner.lock();
        inner.calls.push(RadioCall::StartScan(filter));
        if !inner.adapter_state.is_powered_on() {
            return Err(RadioError::AdapterNotAvailable);
        }
        inner.scan_tx = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RadioCall::StopScan);
        if !inner.retain_streams {
            inner.scan_tx = None;
        }
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), RadioError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RadioCall::Connect(id.clone()));
        if inner.fail_connect {
            return Err(RadioError::ConnectionFailed("peripheral did not respond".into()));
        }
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Uuid>, RadioError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RadioCall::DiscoverServices(id.clone()));
        if inner.fail_discovery {
            return Err(RadioError::DiscoveryFailed("GATT error 133".into()));
        }
        Ok(vec![HEART_RATE_SERVICE_UUID])
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), RadioError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RadioCall::CancelConnection(id.clone()));
        if !inner.retain_streams {
            inner.notify_tx = None;
        }
        Ok(())
    }

    async fn subscribe_characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStreamRx, RadioError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RadioCall::SubscribeCharacteristic {
            peripheral: id.clone(),
            service,
            characteristic,
        });
        if inner.fail_subscribe {
            return Err(RadioError::CharacteristicNotFound(characteristic));
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        inner.notify_tx = Some(tx);
        Ok(rx)
    }

    async fn subscribe_disconnects(&self) -> Result<DisconnectStream, RadioError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut inner = self.inner.lock();
        inner.calls.push(RadioCall::SubscribeDisconnects);
        inner.disconnect_tx.push(tx);
        Ok(rx)
    }
}
