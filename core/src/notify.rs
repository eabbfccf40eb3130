//! Heart rate notification stream
//!
//! Subscribes to the Heart Rate Measurement characteristic of the connected
//! peripheral and turns every notification into either a valid reading or an
//! explicit "no valid reading".

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{decode_notification, TransportDecoder};
use crate::context::SessionContext;
use crate::error::SessionError;
use crate::radio::{
    NotificationStreamRx, PeripheralId, RadioStack, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID,
};
use crate::state::{ConnectionHandle, SessionEvent, SubscriptionId};

/// Live subscription; its pump task dies with it
pub struct SubscriptionHandle {
    id: SubscriptionId,
    peripheral: PeripheralId,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct NotificationStream {
    context: Arc<SessionContext>,
    radio: Arc<dyn RadioStack>,
    decoder: Arc<dyn TransportDecoder>,
    active: Mutex<Option<SubscriptionHandle>>,
}

impl NotificationStream {
    pub fn new(
        context: Arc<SessionContext>,
        radio: Arc<dyn RadioStack>,
        decoder: Arc<dyn TransportDecoder>,
    ) -> Self {
        Self {
            context,
            radio,
            decoder,
            active: Mutex::new(None),
        }
    }

    /// Start streaming heart rate from a connected peripheral. Returns
    /// whether a subscription is now live.
    pub async fn attach(&self, connection: Option<&ConnectionHandle>) -> bool {
        let Some(connection) = connection else {
            warn!("Notification stream: no connected peripheral to attach to");
            return false;
        };
        let peripheral = connection.id().clone();

        self.detach();

        let values = match self
            .radio
            .subscribe_characteristic(
                &peripheral,
                HEART_RATE_SERVICE_UUID,
                HEART_RATE_MEASUREMENT_UUID,
            )
            .await
        {
            Ok(values) => values,
            Err(e) => {
                warn!("Could not subscribe to heart rate on {}: {}", peripheral, e);
                return false;
            }
        };

        let id = SubscriptionId(self.context.next_id());
        let opened = self.context.dispatch(SessionEvent::SubscriptionOpened {
            subscription: id,
            peripheral: peripheral.clone(),
        });
        if !opened.is_applied() {
            warn!("{} disconnected before its subscription opened", peripheral);
            return false;
        }

        let task = tokio::spawn(pump_notifications(
            self.context.clone(),
            self.decoder.clone(),
            id,
            values,
        ));

        // Replacing drops (and aborts) any handle a concurrent attach left
        let _previous = self.active.lock().replace(SubscriptionHandle {
            id,
            peripheral: peripheral.clone(),
            task,
        });
        info!("Streaming heart rate from {}", peripheral);
        true
    }

    /// Drop the live subscription, if any
    pub fn detach(&self) {
        let handle = self.active.lock().take();
        if let Some(handle) = handle {
            debug!("Detached heart rate stream from {}", handle.peripheral);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.active.lock().is_some()
    }
}

async fn pump_notifications(
    context: Arc<SessionContext>,
    decoder: Arc<dyn TransportDecoder>,
    subscription: SubscriptionId,
    mut values: NotificationStreamRx,
) {
    while let Some(notification) = values.recv().await {
        let event = match decode_notification(decoder.as_ref(), notification) {
            Ok(value) => SessionEvent::ReadingDecoded {
                subscription,
                value,
            },
            Err(e) => {
                debug!("{}", SessionError::DecodeFailure(e));
                SessionEvent::ReadingInvalid { subscription }
            }
        };

        // Readings are only ignored once this subscription is no longer current
        if !context.dispatch(event).is_applied() {
            debug!("Subscription {} superseded; ending pump", subscription.0);
            break;
        }
    }
}
