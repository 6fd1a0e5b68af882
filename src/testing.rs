//! Scripted in-memory GATT transport for session and device tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use uuid::Uuid;

use crate::{
    biodata::{BioDataRequest, RECORD_LEN},
    ble::{DisconnectCallback, GattClient, GattConnection, NotificationHandler},
    error::TransportError,
    protocol::Opcode,
    types::ProtocolGeneration,
    GEN2_COMMAND_UUID, GEN2_STATUS_UUID, GEN3_BIODATA_FULL_UUID, GEN3_COMMAND_UUID,
    GEN3_NAME_UUID, GEN3_STATUS_UUID,
};

/// Produces a notification in answer to a command write
pub type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct Device {
    link_up: AtomicBool,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_subscribes: AtomicUsize,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    reads: Mutex<HashMap<Uuid, Vec<u8>>>,
    read_counts: Mutex<HashMap<Uuid, usize>>,
    bio: Mutex<HashMap<u8, Vec<u8>>>,
    handlers: Mutex<HashMap<Uuid, (NotificationHandler, Option<usize>)>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    initial_frame: Mutex<Option<Vec<u8>>>,
    responder: Mutex<Option<Responder>>,
}

/// A fake BedJet reachable through the [`GattClient`] seam
pub struct ScriptedClient {
    generation: ProtocolGeneration,
    connect_delay: Duration,
    rssi: Option<i16>,
    device: Arc<Device>,
}

impl ScriptedClient {
    fn new(generation: ProtocolGeneration) -> Self {
        Self {
            generation,
            connect_delay: Duration::ZERO,
            rssi: None,
            device: Arc::new(Device::default()),
        }
    }

    /// A BedJet 3
    pub fn gen3() -> Self {
        Self::new(ProtocolGeneration::Gen3)
    }

    /// A BedJet V2
    pub fn gen2() -> Self {
        Self::new(ProtocolGeneration::Gen2)
    }

    /// Delay every connect by `delay`
    pub const fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Advertise with this signal strength
    pub const fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Fail the first `count` connects with a transient error
    pub fn failing_connects(self, count: usize) -> Self {
        self.device.failing_connects.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the first `count` subscriptions
    pub fn failing_subscribes(self, count: usize) -> Self {
        self.device.failing_subscribes.store(count, Ordering::SeqCst);
        self
    }

    /// Serve `data` for reads of `uuid`
    pub fn with_read(self, uuid: Uuid, data: Vec<u8>) -> Self {
        self.device.reads.lock().insert(uuid, data);
        self
    }

    /// Answer bio-data requests of kind `request` with these records
    pub fn with_bio(self, request: BioDataRequest, records: &[&[u8]]) -> Self {
        let mut body = Vec::new();
        for record in records {
            let mut padded = record.to_vec();
            if padded.len() < RECORD_LEN {
                padded.resize(RECORD_LEN, 0);
            }
            body.extend(padded);
        }
        self.device.bio.lock().insert(request as u8, body);
        self
    }

    /// Push `frame` as soon as notifications are enabled
    pub fn with_initial_frame(self, frame: Vec<u8>) -> Self {
        *self.device.initial_frame.lock() = Some(frame);
        self
    }

    /// Answer command writes with a notification
    pub fn with_responder(self, responder: Responder) -> Self {
        *self.device.responder.lock() = Some(responder);
        self
    }

    /// Physical connect attempts so far
    pub fn connect_count(&self) -> usize {
        self.device.connects.load(Ordering::SeqCst)
    }

    /// Reads performed on `uuid`
    pub fn reads_of(&self, uuid: Uuid) -> usize {
        self.device
            .read_counts
            .lock()
            .get(&uuid)
            .copied()
            .unwrap_or(0)
    }

    /// Payloads written to the command characteristic
    pub fn command_writes(&self) -> Vec<Vec<u8>> {
        let command_uuid = self.generation.profile().command_uuid;
        self.device
            .writes
            .lock()
            .iter()
            .filter(|(uuid, _)| *uuid == command_uuid)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Check if the fake link is up
    pub fn is_link_up(&self) -> bool {
        self.device.link_up.load(Ordering::SeqCst)
    }

    /// Deliver a status notification
    pub fn notify(&self, data: &[u8]) {
        self.device
            .notify(self.generation.profile().status_uuid, data);
    }

    /// Simulate the device going out of range
    pub fn drop_link(&self) {
        self.device.link_up.store(false, Ordering::SeqCst);
        self.device.handlers.lock().clear();
        let callback = self.device.on_disconnect.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Device {
    fn notify(&self, uuid: Uuid, data: &[u8]) {
        let entry = self.handlers.lock().get(&uuid).cloned();
        if let Some((handler, frame_len)) = entry {
            if frame_len.is_none_or(|len| len == data.len()) {
                handler(data);
            }
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl GattClient for ScriptedClient {
    fn address(&self) -> String {
        "AA:BB:CC:DD:EE:FF".to_string()
    }

    async fn advertised_name(&self) -> Option<String> {
        None
    }

    async fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    async fn connect(
        &self,
        _name: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<Arc<dyn GattConnection>, TransportError> {
        self.device.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        if Device::take_failure(&self.device.failing_connects) {
            return Err(TransportError::Link("device not responding".to_string()));
        }

        self.device.link_up.store(true, Ordering::SeqCst);
        *self.device.on_disconnect.lock() = Some(on_disconnect);

        Ok(Arc::new(ScriptedConnection {
            generation: self.generation,
            device: Arc::clone(&self.device),
        }))
    }
}

struct ScriptedConnection {
    generation: ProtocolGeneration,
    device: Arc<Device>,
}

impl ScriptedConnection {
    fn check_link(&self) -> Result<(), TransportError> {
        if self.device.link_up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl GattConnection for ScriptedConnection {
    async fn is_connected(&self) -> bool {
        self.device.link_up.load(Ordering::SeqCst)
    }

    fn has_characteristic(&self, uuid: Uuid) -> bool {
        match self.generation {
            ProtocolGeneration::Gen3 => [
                GEN3_STATUS_UUID,
                GEN3_NAME_UUID,
                GEN3_COMMAND_UUID,
                GEN3_BIODATA_FULL_UUID,
            ]
            .contains(&uuid),
            ProtocolGeneration::Gen2 => [GEN2_STATUS_UUID, GEN2_COMMAND_UUID].contains(&uuid),
        }
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        self.check_link()?;
        *self.device.read_counts.lock().entry(uuid).or_default() += 1;
        self.device
            .reads
            .lock()
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    async fn write(
        &self,
        uuid: Uuid,
        data: &[u8],
        _with_response: bool,
    ) -> Result<(), TransportError> {
        self.check_link()?;
        self.device.writes.lock().push((uuid, data.to_vec()));

        if uuid == GEN3_COMMAND_UUID && data.first() == Some(&(Opcode::GetBio as u8)) {
            if let &[_, request, tag, ..] = data {
                let body = self.device.bio.lock().get(&request).cloned();
                let mut reads = self.device.reads.lock();
                match body {
                    Some(body) => {
                        let mut response = vec![request, tag];
                        response.extend(body);
                        reads.insert(GEN3_BIODATA_FULL_UUID, response);
                    }
                    None => {
                        reads.remove(&GEN3_BIODATA_FULL_UUID);
                    }
                }
            }
            return Ok(());
        }

        let responder = self.device.responder.lock().clone();
        if let Some(frame) = responder.and_then(|respond| respond(data)) {
            self.device
                .notify(self.generation.profile().status_uuid, &frame);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        uuid: Uuid,
        handler: NotificationHandler,
        frame_len: Option<usize>,
    ) -> Result<(), TransportError> {
        self.check_link()?;
        if Device::take_failure(&self.device.failing_subscribes) {
            return Err(TransportError::Link("CCCD write failed".to_string()));
        }

        self.device
            .handlers
            .lock()
            .insert(uuid, (handler, frame_len));

        let initial = self.device.initial_frame.lock().clone();
        if let Some(frame) = initial {
            self.device.notify(uuid, &frame);
        }
        Ok(())
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<(), TransportError> {
        self.device.handlers.lock().remove(&uuid);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.device.handlers.lock().clear();
        self.device.link_up.store(false, Ordering::SeqCst);
        let callback = self.device.on_disconnect.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }
}
