// btleplug-backed radio for desktop hosts
//
// Desktop stacks have no adapter-state callback, so state is polled. Scan
// results, disconnects and notifications come from btleplug streams and are
// forwarded onto the channels the core expects.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter as BtScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use hrlink_core::radio::{
    AdapterStateStream, DisconnectStream, NotificationStreamRx, ScanStream, RSSI_UNAVAILABLE,
};
use hrlink_core::{AdapterState, PeripheralId, PeripheralRecord, RadioError, RadioStack, ScanFilter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const STATE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const CHANNEL_CAPACITY: usize = 64;

fn transport(e: btleplug::Error) -> RadioError {
    RadioError::Transport(e.to_string())
}

fn map_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        #[allow(unreachable_patterns)]
        _ => AdapterState::Unknown,
    }
}

pub struct BtleplugRadio {
    adapter: Adapter,
    /// Peripherals seen during scans, by the id handed to the core
    peripherals: Arc<Mutex<HashMap<PeripheralId, Peripheral>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugRadio {
    /// Open the first adapter the platform reports
    pub async fn first_adapter() -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;

        if let Ok(info) = adapter.adapter_info().await {
            debug!("Using adapter {}", info);
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
        })
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, RadioError> {
        self.peripherals
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| RadioError::UnknownPeripheral(id.clone()))
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl RadioStack for BtleplugRadio {
    async fn adapter_state(&self) -> Result<AdapterState, RadioError> {
        self.adapter
            .adapter_state()
            .await
            .map(map_state)
            .map_err(transport)
    }

    async fn subscribe_adapter_state(&self) -> Result<AdapterStateStream, RadioError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let adapter = self.adapter.clone();

        tokio::spawn(async move {
            let mut last = None;
            let mut ticker = tokio::time::interval(STATE_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let state = match adapter.adapter_state().await {
                    Ok(state) => map_state(state),
                    Err(e) => {
                        debug!("Adapter state poll failed: {}", e);
                        AdapterState::Unknown
                    }
                };
                if last == Some(state) {
                    continue;
                }
                last = Some(state);
                if tx.send(state).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn start_scan(&self, filter: ScanFilter) -> Result<ScanStream, RadioError> {
        let mut events = self.adapter.events().await.map_err(transport)?;
        self.adapter
            .start_scan(BtScanFilter {
                services: filter.services,
            })
            .await
            .map_err(|e| RadioError::Scan(e.to_string()))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::DeviceDiscovered(id) = event else {
                    continue;
                };

                let result = match adapter.peripheral(&id).await {
                    Ok(peripheral) => match peripheral.properties().await {
                        Ok(properties) => {
                            let properties = properties.unwrap_or_default();
                            let record = PeripheralRecord::new(
                                id.to_string(),
                                properties.local_name,
                                properties.rssi.unwrap_or(RSSI_UNAVAILABLE),
                            );
                            peripherals.lock().insert(record.id.clone(), peripheral);
                            Ok(record)
                        }
                        Err(e) => Err(RadioError::Scan(e.to_string())),
                    },
                    Err(e) => Err(RadioError::Scan(e.to_string())),
                };

                if tx.send(result).await.is_err() {
                    break;
                }
            }
        });

        let previous = self.scan_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        let task = self.scan_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.adapter.stop_scan().await.map_err(transport)
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), RadioError> {
        self.peripheral(id)?
            .connect()
            .await
            .map_err(|e| RadioError::ConnectionFailed(e.to_string()))
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Uuid>, RadioError> {
        let peripheral = self.peripheral(id)?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| RadioError::DiscoveryFailed(e.to_string()))?;
        Ok(peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), RadioError> {
        self.peripheral(id)?.disconnect().await.map_err(transport)
    }

    async fn subscribe_characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStreamRx, RadioError> {
        let peripheral = self.peripheral(id)?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(RadioError::CharacteristicNotFound(characteristic))?;

        peripheral.subscribe(&target).await.map_err(transport)?;
        let mut notifications = peripheral.notifications().await.map_err(transport)?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if tx.send(Ok(Some(notification.value))).await.is_err() {
                    break;
                }
            }
            debug!("Notification stream for {} ended", characteristic);
        });

        Ok(rx)
    }

    async fn subscribe_disconnects(&self) -> Result<DisconnectStream, RadioError> {
        let mut events = self.adapter.events().await.map_err(transport)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if tx.send(PeripheralId::new(id.to_string())).await.is_err() {
                        break;
                    }
                }
            }
            warn!("Adapter event stream closed; link loss is no longer tracked");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state(CentralState::PoweredOn), AdapterState::PoweredOn);
        assert_eq!(map_state(CentralState::PoweredOff), AdapterState::PoweredOff);
        assert_eq!(map_state(CentralState::Unknown), AdapterState::Unknown);
    }
}
