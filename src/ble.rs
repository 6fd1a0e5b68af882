use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType},
    platform::{Adapter, Peripheral},
};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;

/// Receives the payload of every notification on a subscribed characteristic
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Invoked once when the link drops, voluntarily or not
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Something that can open a GATT link to one particular device
#[async_trait]
pub trait GattClient: Send + Sync {
    /// Device address, for identification and logs
    fn address(&self) -> String;

    /// Name from the advertisement, if any
    async fn advertised_name(&self) -> Option<String>;

    /// Signal strength of the last advertisement, in dBm
    async fn rssi(&self) -> Option<i16>;

    /// Establish the link and discover its characteristics
    ///
    /// `on_disconnect` fires when the link goes down for any reason.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the link cannot be established.
    async fn connect(
        &self,
        name: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<Arc<dyn GattConnection>, TransportError>;
}

/// An established GATT link
#[async_trait]
pub trait GattConnection: Send + Sync {
    /// Check if the link is still up
    async fn is_connected(&self) -> bool;

    /// Check if the peripheral exposes `uuid`
    fn has_characteristic(&self, uuid: Uuid) -> bool;

    /// Read a characteristic value
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the characteristic is missing or the read fails.
    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError>;

    /// Write a characteristic value
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the characteristic is missing or the write fails.
    async fn write(&self, uuid: Uuid, data: &[u8], with_response: bool)
        -> Result<(), TransportError>;

    /// Enable notifications on `uuid` and route them to `handler`
    ///
    /// With `frame_len` set, notifications of any other length are dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if notifications cannot be enabled.
    async fn subscribe(
        &self,
        uuid: Uuid,
        handler: NotificationHandler,
        frame_len: Option<usize>,
    ) -> Result<(), TransportError>;

    /// Stop notifications on `uuid`
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the request fails.
    async fn unsubscribe(&self, uuid: Uuid) -> Result<(), TransportError>;

    /// Tear the link down
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the stack refuses the disconnect.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

type HandlerTable = Arc<Mutex<HashMap<Uuid, (NotificationHandler, Option<usize>)>>>;

/// Route one notification to its handler, applying the length filter
fn dispatch(handlers: &HandlerTable, uuid: Uuid, value: &[u8]) {
    let Some((handler, frame_len)) = handlers.lock().get(&uuid).cloned() else {
        return;
    };

    match frame_len {
        Some(expected) if expected != value.len() => {
            warn!(
                "Dropping {}-byte notification on {}, expected {} bytes",
                value.len(),
                uuid,
                expected
            );
        }
        _ => handler(value),
    }
}

/// [`GattClient`] backed by a btleplug peripheral
pub struct BtleplugClient {
    adapter: Adapter,
    peripheral: Peripheral,
}

impl BtleplugClient {
    /// Wrap a peripheral found on `adapter`
    #[must_use]
    pub const fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        Self {
            adapter,
            peripheral,
        }
    }
}

#[async_trait]
impl GattClient for BtleplugClient {
    fn address(&self) -> String {
        self.peripheral.address().to_string()
    }

    async fn advertised_name(&self) -> Option<String> {
        self.peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|properties| properties.local_name)
    }

    async fn rssi(&self) -> Option<i16> {
        self.peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|properties| properties.rssi)
    }

    async fn connect(
        &self,
        name: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<Arc<dyn GattConnection>, TransportError> {
        info!("{}: Connecting to {}", name, self.peripheral.address());

        if !self.peripheral.is_connected().await? {
            self.peripheral.connect().await?;
        }
        self.peripheral.discover_services().await?;

        let characteristics: HashMap<Uuid, Characteristic> = self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        debug!("{}: Discovered {} characteristics", name, characteristics.len());

        let handlers: HandlerTable = Arc::new(Mutex::new(HashMap::new()));

        let mut notifications = self.peripheral.notifications().await?;
        let pump = tokio::spawn({
            let handlers = Arc::clone(&handlers);
            async move {
                while let Some(notification) = notifications.next().await {
                    dispatch(&handlers, notification.uuid, &notification.value);
                }
            }
        });

        let mut events = self.adapter.events().await?;
        let peripheral_id = self.peripheral.id();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        on_disconnect();
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(BtleplugConnection {
            peripheral: self.peripheral.clone(),
            characteristics,
            handlers,
            tasks: vec![pump, watcher],
        }))
    }
}

/// A connected btleplug peripheral
struct BtleplugConnection {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    handlers: HandlerTable,
    tasks: Vec<JoinHandle<()>>,
}

impl BtleplugConnection {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl GattConnection for BtleplugConnection {
    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.contains_key(&uuid)
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(uuid)?;
        Ok(self.peripheral.read(characteristic).await?)
    }

    async fn write(
        &self,
        uuid: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(uuid)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(characteristic, data, write_type)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        uuid: Uuid,
        handler: NotificationHandler,
        frame_len: Option<usize>,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(uuid)?;
        self.handlers.lock().insert(uuid, (handler, frame_len));

        if let Err(e) = self.peripheral.subscribe(characteristic).await {
            self.handlers.lock().remove(&uuid);
            return Err(e.into());
        }
        Ok(())
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<(), TransportError> {
        let characteristic = self.characteristic(uuid)?;
        self.handlers.lock().remove(&uuid);
        self.peripheral.unsubscribe(characteristic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.handlers.lock().clear();
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BtleplugConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(count: &Arc<AtomicUsize>) -> NotificationHandler {
        let count = Arc::clone(count);
        Arc::new(move |_: &[u8]| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_dispatch_applies_length_filter() {
        let uuid = crate::GEN3_STATUS_UUID;
        let count = Arc::new(AtomicUsize::new(0));
        let handlers: HandlerTable = Arc::new(Mutex::new(HashMap::new()));
        handlers
            .lock()
            .insert(uuid, (counting_handler(&count), Some(20)));

        dispatch(&handlers, uuid, &[0; 20]);
        dispatch(&handlers, uuid, &[0; 11]);
        dispatch(&handlers, uuid, &[0; 21]);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_ignores_unknown_characteristic() {
        let count = Arc::new(AtomicUsize::new(0));
        let handlers: HandlerTable = Arc::new(Mutex::new(HashMap::new()));
        handlers
            .lock()
            .insert(crate::GEN2_STATUS_UUID, (counting_handler(&count), None));

        dispatch(&handlers, crate::GEN3_STATUS_UUID, &[0; 20]);
        dispatch(&handlers, crate::GEN2_STATUS_UUID, &[0; 3]);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
