//! BLE session lifecycle.
//!
//! A [`Session`] owns the link to one device. It serializes connection
//! attempts, detects the protocol generation, subscribes to status
//! notifications, runs the bootstrap reads and drops the link after a period
//! of inactivity. Transport errors are translated into [`BedjetError`] here and
//! never travel further up.

use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{sleep, sleep_until, timeout, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    biodata::{self, BioData, BioDataRequest},
    ble::{DisconnectCallback, GattClient, GattConnection, NotificationHandler},
    error::{BedjetError, Result, TransportError},
    protocol::{self, Command},
    types::{ConnectionParams, ProtocolGeneration, SessionPhase},
    GEN2_STATUS_UUID, GEN3_BIODATA_FULL_UUID, GEN3_COMMAND_UUID, GEN3_NAME_UUID,
};

/// Firmware placeholder for V2 devices, which do not report a version
pub const GEN2_FIRMWARE_PLACEHOLDER: &str = "V2";

/// Receives every status notification together with the link's generation
pub type FrameHandler = Arc<dyn Fn(ProtocolGeneration, &[u8]) + Send + Sync>;

/// Device identity learned while bootstrapping a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Name configured on the device
    pub name: Option<String>,
    /// Main processor firmware version
    pub firmware_version: Option<String>,
}

#[derive(Clone)]
struct Link {
    connection: Arc<dyn GattConnection>,
    generation: ProtocolGeneration,
    epoch: u64,
}

struct Inner {
    client: Arc<dyn GattClient>,
    params: ConnectionParams,
    on_frame: FrameHandler,
    connect_lock: tokio::sync::Mutex<()>,
    link: RwLock<Option<Link>>,
    phase: Mutex<SessionPhase>,
    epoch: AtomicU64,
    expected_disconnect: AtomicBool,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    last_activity: Mutex<Instant>,
    identity: Mutex<Identity>,
}

impl Inner {
    fn label(&self) -> String {
        self.identity
            .lock()
            .name
            .clone()
            .unwrap_or_else(|| self.client.address())
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock() = phase;
    }

    fn link_lost(&self, epoch: u64) {
        let label = self.label();
        let current = {
            let mut link = self.link.write();
            if link.as_ref().is_some_and(|l| l.epoch == epoch) {
                link.take()
            } else {
                None
            }
        };

        if self.expected_disconnect.load(Ordering::SeqCst) {
            debug!("{}: Disconnected from device", label);
            return;
        }

        if current.is_some() {
            if let Some(timer) = self.idle_timer.lock().take() {
                timer.abort();
            }
            self.set_phase(SessionPhase::Disconnected);
            warn!("{}: Device unexpectedly disconnected", label);
        }
    }
}

fn translate(error: TransportError) -> BedjetError {
    match error {
        TransportError::NotConnected => BedjetError::Disconnected,
        other => BedjetError::Communication(other.to_string()),
    }
}

/// Connection manager for a single device
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a disconnected session
    ///
    /// `on_frame` receives every status notification once the link is up.
    #[must_use]
    pub fn new(client: Arc<dyn GattClient>, params: ConnectionParams, on_frame: FrameHandler) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                params,
                on_frame,
                connect_lock: tokio::sync::Mutex::new(()),
                link: RwLock::new(None),
                phase: Mutex::new(SessionPhase::Disconnected),
                epoch: AtomicU64::new(0),
                expected_disconnect: AtomicBool::new(false),
                idle_timer: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
                identity: Mutex::new(Identity::default()),
            }),
        }
    }

    /// Transport client this session connects through
    #[must_use]
    pub fn client(&self) -> &Arc<dyn GattClient> {
        &self.inner.client
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.lock()
    }

    /// Generation of the live link, if any
    #[must_use]
    pub fn generation(&self) -> Option<ProtocolGeneration> {
        self.inner.link.read().as_ref().map(|link| link.generation)
    }

    /// Check if a link is established
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.link.read().is_some()
    }

    /// Identity cached from bootstrap reads
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.inner.identity.lock().clone()
    }

    fn current_link(&self) -> Option<Link> {
        self.inner.link.read().clone()
    }

    /// Generation of the cached link if it is still up; drops a dead link
    async fn live_generation(&self) -> Option<ProtocolGeneration> {
        let link = self.current_link()?;
        if link.connection.is_connected().await {
            return Some(link.generation);
        }

        let mut current = self.inner.link.write();
        if current.as_ref().is_some_and(|l| l.epoch == link.epoch) {
            *current = None;
            drop(current);
            self.inner.set_phase(SessionPhase::Disconnected);
        }
        None
    }

    /// Make sure the link is up and ready, connecting if needed
    ///
    /// Concurrent callers share one connection attempt: whoever arrives while
    /// a connect is in flight waits for its outcome instead of starting another.
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::ConnectionFailed`] if the link cannot be
    /// established or notifications cannot be enabled.
    pub async fn ensure_connected(&self) -> Result<ProtocolGeneration> {
        if let Some(generation) = self.live_generation().await {
            self.inner.touch();
            return Ok(generation);
        }

        if self.inner.connect_lock.try_lock().is_err() {
            debug!(
                "{}: Connection already in progress, waiting for it to complete",
                self.inner.label()
            );
        }
        let _guard = self.inner.connect_lock.lock().await;

        if let Some(generation) = self.live_generation().await {
            self.inner.touch();
            return Ok(generation);
        }

        self.establish().await.inspect_err(|e| {
            error!("{}: Failed to connect: {}", self.inner.label(), e);
        })
    }

    async fn establish(&self) -> Result<ProtocolGeneration> {
        self.inner.set_phase(SessionPhase::Connecting);
        self.inner.expected_disconnect.store(false, Ordering::SeqCst);
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let connection = match self.connect_with_retry(epoch).await {
            Ok(connection) => connection,
            Err(e) => {
                self.inner.set_phase(SessionPhase::Disconnected);
                return Err(e);
            }
        };

        match self.negotiate(&connection, epoch).await {
            Ok(generation) => Ok(generation),
            Err(e) => {
                self.inner.expected_disconnect.store(true, Ordering::SeqCst);
                if let Err(disconnect_error) = connection.disconnect().await {
                    debug!(
                        "{}: Failed to drop half-open link: {}",
                        self.inner.label(),
                        disconnect_error
                    );
                }
                self.inner.set_phase(SessionPhase::Disconnected);
                Err(e)
            }
        }
    }

    fn disconnect_callback(&self, epoch: u64) -> DisconnectCallback {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.link_lost(epoch);
            }
        })
    }

    async fn connect_with_retry(&self, epoch: u64) -> Result<Arc<dyn GattConnection>> {
        let params = &self.inner.params;
        let attempts = params.connect_attempts.max(1);
        let label = self.inner.label();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("{}: Connecting (attempt {}/{})", label, attempt, attempts);

            let result = timeout(
                Duration::from_millis(params.connect_timeout_ms),
                self.inner
                    .client
                    .connect(&label, self.disconnect_callback(epoch)),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout {
                    timeout_ms: params.connect_timeout_ms,
                })
            });

            match result {
                Ok(connection) => return Ok(connection),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "{}: Connect attempt {}/{} failed: {}",
                        label, attempt, attempts, e
                    );
                    sleep(Duration::from_millis(params.retry_delay_ms)).await;
                }
                Err(e) => {
                    return Err(BedjetError::ConnectionFailed(format!(
                        "{e} (after {attempt} attempt(s))"
                    )));
                }
            }
        }
    }

    async fn negotiate(
        &self,
        connection: &Arc<dyn GattConnection>,
        epoch: u64,
    ) -> Result<ProtocolGeneration> {
        self.inner.set_phase(SessionPhase::Negotiating);

        let generation = if connection.has_characteristic(GEN2_STATUS_UUID) {
            ProtocolGeneration::Gen2
        } else {
            ProtocolGeneration::Gen3
        };
        info!("{}: Detected {}", self.inner.label(), generation);

        if generation == ProtocolGeneration::Gen2 {
            sleep(Duration::from_millis(self.inner.params.gen2_warmup_ms)).await;
            let wake = protocol::encode(generation, &Command::Status, false)?;
            debug!("{}: Sending wake-up packet {:02X?}", self.inner.label(), &wake[..]);
            connection
                .write(generation.profile().command_uuid, &wake, false)
                .await
                .map_err(|e| BedjetError::ConnectionFailed(format!("Wake-up failed: {e}")))?;
        }

        self.subscribe_with_retry(connection.as_ref(), generation)
            .await?;
        self.inner.set_phase(SessionPhase::Subscribed);

        self.bootstrap(connection.as_ref(), generation).await;

        *self.inner.link.write() = Some(Link {
            connection: Arc::clone(connection),
            generation,
            epoch,
        });
        self.inner.touch();
        self.start_idle_timer(epoch);
        self.inner.set_phase(SessionPhase::Ready);
        info!("{}: Connected to {}", self.inner.label(), generation);

        Ok(generation)
    }

    async fn subscribe_with_retry(
        &self,
        connection: &dyn GattConnection,
        generation: ProtocolGeneration,
    ) -> Result<()> {
        let profile = generation.profile();
        let inner = Arc::downgrade(&self.inner);
        let handler: NotificationHandler = Arc::new(move |data: &[u8]| {
            if let Some(inner) = inner.upgrade() {
                inner.touch();
                (inner.on_frame)(generation, data);
            }
        });

        let attempts = self.inner.params.subscribe_attempts.max(1);
        let mut backoff = Duration::from_millis(self.inner.params.subscribe_backoff_ms);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match connection
                .subscribe(profile.status_uuid, Arc::clone(&handler), Some(profile.frame_len))
                .await
            {
                Ok(()) => {
                    debug!("{}: Subscribed to notifications", self.inner.label());
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "{}: Subscribe attempt {}/{} failed: {}",
                        self.inner.label(),
                        attempt,
                        attempts,
                        e
                    );
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    return Err(BedjetError::ConnectionFailed(format!(
                        "Failed to subscribe to notifications: {e}"
                    )));
                }
            }
        }
    }

    /// Fill in the identity cache; failures are logged and left unset
    async fn bootstrap(&self, connection: &dyn GattConnection, generation: ProtocolGeneration) {
        if generation == ProtocolGeneration::Gen2 {
            let advertised = self.inner.client.advertised_name().await;
            let mut identity = self.inner.identity.lock();
            if identity.name.is_none() {
                identity.name =
                    Some(advertised.unwrap_or_else(|| generation.model_name().to_string()));
            }
            identity
                .firmware_version
                .get_or_insert_with(|| GEN2_FIRMWARE_PLACEHOLDER.to_string());
            return;
        }

        let identity = self.identity();

        if identity.name.is_none() {
            debug!("{}: Reading device name", self.inner.label());
            match connection.read(GEN3_NAME_UUID).await {
                Ok(data) => {
                    let name = String::from_utf8_lossy(&data)
                        .trim_end_matches('\0')
                        .to_string();
                    if !name.is_empty() {
                        debug!("{}: Actual device name is {}", self.inner.label(), name);
                        self.inner.identity.lock().name = Some(name);
                    }
                }
                Err(e) => warn!("{}: Failed to read device name: {}", self.inner.label(), e),
            }
        }

        if identity.firmware_version.is_none() {
            let attempts = 2;
            match self
                .bio_exchange(connection, BioDataRequest::FirmwareVersions, attempts)
                .await
            {
                Ok(BioData::FirmwareVersions(versions)) => {
                    self.inner.identity.lock().firmware_version =
                        versions.into_iter().flatten().next();
                }
                Ok(_) => {}
                Err(e) => warn!("{}: Failed to read firmware: {}", self.inner.label(), e),
            }
        }
    }

    async fn bio_exchange(
        &self,
        connection: &dyn GattConnection,
        request: BioDataRequest,
        attempts: u8,
    ) -> Result<BioData> {
        let label = self.inner.label();
        let mut last_error = BedjetError::Communication(format!("No {request} response"));

        for tag in 0..attempts.max(1) {
            debug!("{}: Read {} (tag {})", label, request, tag);
            let command =
                protocol::encode(ProtocolGeneration::Gen3, &Command::GetBio { request, tag }, false)?;

            let response = match connection
                .write(GEN3_COMMAND_UUID, &command, false)
                .await
            {
                Ok(()) => connection.read(GEN3_BIODATA_FULL_UUID).await,
                Err(e) => Err(e),
            };

            match response
                .map_err(translate)
                .and_then(|data| biodata::parse_response(&data))
            {
                Ok(bio) if bio.request() == request => {
                    debug!("{}: {} received: {:?}", label, request, bio);
                    return Ok(bio);
                }
                Ok(other) => {
                    debug!("{}: Expected {}, received {}", label, request, other.request());
                    last_error = BedjetError::MalformedFrame(format!(
                        "Expected {request}, received {}",
                        other.request()
                    ));
                }
                Err(e) => {
                    debug!("{}: {} attempt {} failed: {}", label, request, tag + 1, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Issue a bio-data request and read the response
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::Disconnected`] without a live link, or the last
    /// failure once `attempts` are exhausted.
    pub async fn read_bio_data(&self, request: BioDataRequest, attempts: u8) -> Result<BioData> {
        let link = self.current_link().ok_or(BedjetError::Disconnected)?;
        if link.generation != ProtocolGeneration::Gen3 {
            return Err(BedjetError::Unsupported {
                operation: "read_bio_data",
                generation: link.generation,
            });
        }
        self.inner.touch();
        self.bio_exchange(link.connection.as_ref(), request, attempts)
            .await
    }

    /// Write an encoded command to the command characteristic
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::Disconnected`] without a live link, or
    /// [`BedjetError::Communication`] if the write fails.
    pub async fn write_command(&self, data: &[u8]) -> Result<()> {
        let link = self.current_link().ok_or(BedjetError::Disconnected)?;
        self.inner.touch();

        debug!("{}: Sending command {:02X?}", self.inner.label(), data);
        link.connection
            .write(link.generation.profile().command_uuid, data, false)
            .await
            .map_err(translate)
    }

    /// Read a characteristic on the live link
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::Disconnected`] without a live link, or
    /// [`BedjetError::Communication`] if the read fails.
    pub async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let link = self.current_link().ok_or(BedjetError::Disconnected)?;
        self.inner.touch();

        let data = link.connection.read(uuid).await.map_err(translate)?;
        debug!("{}: Read {}: {:02X?}", self.inner.label(), uuid, data);
        Ok(data)
    }

    fn start_idle_timer(&self, epoch: u64) {
        let idle = Duration::from_millis(self.inner.params.idle_disconnect_ms);
        let inner = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            loop {
                let deadline = match inner.upgrade() {
                    Some(inner) => *inner.last_activity.lock() + idle,
                    None => return,
                };
                sleep_until(deadline).await;

                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if (Session { inner }).idle_disconnect(epoch, idle).await {
                    return;
                }
            }
        });

        if let Some(previous) = self.inner.idle_timer.lock().replace(task) {
            previous.abort();
        }
    }

    /// Drop the link if it is still the one the timer was started for and has
    /// stayed idle; returns false when activity pushed the deadline out
    async fn idle_disconnect(&self, epoch: u64, idle: Duration) -> bool {
        let _guard = self.inner.connect_lock.lock().await;

        let current = self.inner.link.read().as_ref().map(|link| link.epoch);
        if current != Some(epoch) {
            return true;
        }
        let idle_for = self.inner.last_activity.lock().elapsed();
        if idle_for < idle {
            return false;
        }

        debug!(
            "{}: Disconnecting after {}ms without activity",
            self.inner.label(),
            idle.as_millis()
        );
        // This task is the timer; detach it instead of aborting itself
        drop(self.inner.idle_timer.lock().take());
        self.teardown().await;
        true
    }

    /// Voluntarily close the link
    pub async fn disconnect(&self) {
        let _guard = self.inner.connect_lock.lock().await;
        if let Some(timer) = self.inner.idle_timer.lock().take() {
            timer.abort();
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        let Some(link) = self.inner.link.write().take() else {
            self.inner.set_phase(SessionPhase::Disconnected);
            return;
        };

        self.inner.set_phase(SessionPhase::Disconnecting);
        self.inner.expected_disconnect.store(true, Ordering::SeqCst);
        let label = self.inner.label();

        if link.connection.is_connected().await {
            let status_uuid = link.generation.profile().status_uuid;
            if let Err(e) = link.connection.unsubscribe(status_uuid).await {
                debug!("{}: Failed to stop notifications: {}", label, e);
            }
            if let Err(e) = link.connection.disconnect().await {
                warn!("{}: Failed to disconnect: {}", label, e);
            }
        }

        self.inner.set_phase(SessionPhase::Disconnected);
        info!("{}: Disconnected", label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_err, assert_ok};

    fn fast_params() -> ConnectionParams {
        ConnectionParams {
            connect_timeout_ms: 500,
            retry_delay_ms: 5,
            subscribe_backoff_ms: 5,
            gen2_warmup_ms: 0,
            ..ConnectionParams::default()
        }
    }

    fn session_for(client: &Arc<ScriptedClient>, params: ConnectionParams) -> (Session, Arc<AtomicUsize>) {
        let frames = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&frames);
        let session = Session::new(
            Arc::clone(client) as Arc<dyn GattClient>,
            params,
            Arc::new(move |_, _: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (session, frames)
    }

    #[tokio::test]
    async fn test_gen3_connect_bootstraps_identity() {
        let client = Arc::new(
            ScriptedClient::gen3()
                .with_read(GEN3_NAME_UUID, b"Bedroom\0".to_vec())
                .with_bio(BioDataRequest::FirmwareVersions, &[b"20231010".as_slice(), b"1.4"]),
        );
        let (session, _) = session_for(&client, fast_params());

        let generation = assert_ok!(session.ensure_connected().await);
        assert_eq!(generation, ProtocolGeneration::Gen3);
        assert_eq!(session.phase(), SessionPhase::Ready);

        let identity = session.identity();
        assert_eq!(identity.name.as_deref(), Some("Bedroom"));
        assert_eq!(identity.firmware_version.as_deref(), Some("20231010"));

        // Cached identity is not read again on reconnect
        session.disconnect().await;
        assert_ok!(session.ensure_connected().await);
        assert_eq!(client.connect_count(), 2);
        assert_eq!(client.reads_of(GEN3_NAME_UUID), 1);
    }

    #[tokio::test]
    async fn test_gen2_connect_sends_wake_packet() {
        let client = Arc::new(ScriptedClient::gen2());
        let (session, _) = session_for(&client, fast_params());

        let generation = assert_ok!(session.ensure_connected().await);
        assert_eq!(generation, ProtocolGeneration::Gen2);
        assert_eq!(client.command_writes(), vec![vec![0x58, 0x06, 0xA1]]);

        let identity = session.identity();
        assert_eq!(identity.name.as_deref(), Some("BedJet V2"));
        assert_eq!(
            identity.firmware_version.as_deref(),
            Some(GEN2_FIRMWARE_PLACEHOLDER)
        );
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let client = Arc::new(ScriptedClient::gen3().with_connect_delay(Duration::from_millis(50)));
        let (session, _) = session_for(&client, fast_params());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.ensure_connected().await })
            })
            .collect();

        for task in tasks {
            assert_ok!(task.await.unwrap());
        }
        assert_eq!(client.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_connect_failures_are_retried() {
        let client = Arc::new(ScriptedClient::gen3().failing_connects(2));
        let (session, _) = session_for(&client, fast_params());

        assert_ok!(session.ensure_connected().await);
        assert_eq!(client.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_attempts() {
        let client = Arc::new(ScriptedClient::gen3().failing_connects(5));
        let (session, _) = session_for(&client, fast_params());

        let error = assert_err!(session.ensure_connected().await);
        assert!(matches!(error, BedjetError::ConnectionFailed(_)));
        assert_eq!(client.connect_count(), 3);
        assert_eq!(session.phase(), SessionPhase::Disconnected);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_connect_timeout_is_retried_then_fails() {
        let client = Arc::new(ScriptedClient::gen3().with_connect_delay(Duration::from_millis(200)));
        let params = ConnectionParams {
            connect_timeout_ms: 20,
            ..fast_params()
        };
        let (session, _) = session_for(&client, params);

        let error = assert_err!(session.ensure_connected().await);
        assert!(matches!(error, BedjetError::ConnectionFailed(ref reason) if reason.contains("timed out")));
        assert_eq!(client.connect_count(), 3);
        assert_eq!(session.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_retries_then_fails() {
        let client = Arc::new(ScriptedClient::gen3().failing_subscribes(2));
        let (session, _) = session_for(&client, fast_params());
        assert_ok!(session.ensure_connected().await);

        let client = Arc::new(ScriptedClient::gen3().failing_subscribes(3));
        let (session, _) = session_for(&client, fast_params());
        let error = assert_err!(session.ensure_connected().await);
        assert!(matches!(error, BedjetError::ConnectionFailed(_)));
        assert!(!client.is_link_up());
    }

    #[tokio::test]
    async fn test_notifications_reach_frame_handler() {
        let client = Arc::new(ScriptedClient::gen3());
        let (session, frames) = session_for(&client, fast_params());
        assert_ok!(session.ensure_connected().await);

        client.notify(&[0u8; 20]);
        client.notify(&[0u8; 11]);
        assert_eq!(frames.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unexpected_link_loss_forces_reconnect() {
        let client = Arc::new(ScriptedClient::gen3());
        let (session, _) = session_for(&client, fast_params());
        assert_ok!(session.ensure_connected().await);

        client.drop_link();
        assert!(!session.is_connected());
        assert_eq!(session.phase(), SessionPhase::Disconnected);

        let error = assert_err!(session.write_command(&[0x06]).await);
        assert!(matches!(error, BedjetError::Disconnected));

        assert_ok!(session.ensure_connected().await);
        assert_eq!(client.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_idle_timer_disconnects() {
        let params = ConnectionParams {
            idle_disconnect_ms: 40,
            ..fast_params()
        };
        let client = Arc::new(ScriptedClient::gen3());
        let (session, _) = session_for(&client, params);
        assert_ok!(session.ensure_connected().await);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(session.phase(), SessionPhase::Disconnected);
        assert!(!client.is_link_up());
    }

    #[tokio::test]
    async fn test_activity_postpones_idle_disconnect() {
        let params = ConnectionParams {
            idle_disconnect_ms: 150,
            ..fast_params()
        };
        let client = Arc::new(ScriptedClient::gen3());
        let (session, _) = session_for(&client, params);
        assert_ok!(session.ensure_connected().await);

        for _ in 0..5 {
            sleep(Duration::from_millis(50)).await;
            assert_ok!(session.write_command(&[0x06]).await);
        }
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_voluntary_disconnect() {
        let client = Arc::new(ScriptedClient::gen3());
        let (session, _) = session_for(&client, fast_params());
        assert_ok!(session.ensure_connected().await);

        session.disconnect().await;
        assert_eq!(session.phase(), SessionPhase::Disconnected);
        assert!(!client.is_link_up());
        assert!(session.generation().is_none());
    }

    #[tokio::test]
    async fn test_bio_data_read() {
        let client = Arc::new(
            ScriptedClient::gen3().with_bio(BioDataRequest::MemoryNames, &[b"Nap".as_slice(), &[1u8], &[0u8]]),
        );
        let (session, _) = session_for(&client, fast_params());
        assert_ok!(session.ensure_connected().await);

        let names = assert_ok!(session.read_bio_data(BioDataRequest::MemoryNames, 2).await);
        assert_eq!(
            names,
            BioData::MemoryNames(vec![Some("Nap".to_string()), None, Some("Default".to_string())])
        );

        let missing = session.read_bio_data(BioDataRequest::BiorhythmNames, 2).await;
        assert!(missing.is_err());
    }
}
