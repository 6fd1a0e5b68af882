use parking_lot::{Mutex, RwLock};
use std::{
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::{
    ble::GattClient,
    biodata::{BioData, BioDataRequest},
    callbacks::{CallbackRegistry, Subscription},
    error::{BedjetError, Result},
    limiter::{EndTimeLimiter, TemperatureLimiter},
    protocol::{self, Button, Command, DeviceSetting, GEN3_FRAME_LEN},
    session::Session,
    types::{
        BedjetNotification, ConnectionParams, DeviceState, DiagnosticFields, NamedPresets,
        OperatingMode, ProtocolGeneration, SessionPhase, TimeoutConfig,
    },
    GEN3_STATUS_UUID,
};

/// Highest temperature the one-byte half-degree encoding can carry
const MAX_ENCODABLE_TEMPERATURE: f32 = 63.5;

/// Settings reported by the device, from V2 frames or the BedJet 3 status read
#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    beeps_muted: Option<bool>,
    leds_enabled: Option<bool>,
}

/// State shared between the façade and the notification path
struct DeviceShared {
    address: String,
    label: RwLock<String>,
    timeouts: TimeoutConfig,
    state: RwLock<Arc<DeviceState>>,
    last_notification: Mutex<Option<Instant>>,
    diagnostics: RwLock<Option<DiagnosticFields>>,
    presets: RwLock<NamedPresets>,
    flags: Mutex<Flags>,
    shutdown_reason: Mutex<Option<u8>>,
    temperature_limiter: Mutex<TemperatureLimiter>,
    end_time_limiter: Mutex<EndTimeLimiter>,
    callbacks: CallbackRegistry,
}

impl DeviceShared {
    fn label(&self) -> String {
        self.label.read().clone()
    }

    fn state(&self) -> Arc<DeviceState> {
        Arc::clone(&self.state.read())
    }

    /// Decode a notification, stabilize it, publish the new snapshot
    fn handle_frame(&self, generation: ProtocolGeneration, data: &[u8]) {
        let previous = self.state();
        let frame = match protocol::decode_notification(generation, data, &previous) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: Dropping notification {:02X?}: {}", self.label(), data, e);
                return;
            }
        };

        let mut state = frame.state;
        state.current_temperature = self
            .temperature_limiter
            .lock()
            .update(state.current_temperature, std::time::Instant::now());
        self.end_time_limiter
            .lock()
            .update(state.runtime_remaining, SystemTime::now());

        {
            let mut flags = self.flags.lock();
            if frame.beeps_muted.is_some() {
                flags.beeps_muted = frame.beeps_muted;
            }
            if frame.leds_enabled.is_some() {
                flags.leds_enabled = frame.leds_enabled;
            }
        }

        if let Some(reason) = frame.shutdown_reason {
            *self.shutdown_reason.lock() = Some(reason);
            if let Some(diagnostics) = self.diagnostics.write().as_mut() {
                diagnostics.shutdown_reason = reason;
            }
        }

        let state = Arc::new(state);
        *self.state.write() = Arc::clone(&state);
        *self.last_notification.lock() = Some(Instant::now());

        debug!("{}: Notification decoded: {:?}", self.label(), state);
        self.callbacks.fire(&state);
    }
}

/// Poll `predicate` every `interval` until it holds or `limit` runs out
///
/// Returns whether the predicate was satisfied. Nothing is left running on
/// either outcome.
async fn poll_until(interval: Duration, limit: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    timeout(limit, async {
        while !predicate() {
            sleep(interval).await;
        }
    })
    .await
    .is_ok()
}

/// Main interface for driving a BedJet
///
/// `BedJet` hides the protocol generation behind one command surface and one
/// immutable [`DeviceState`] snapshot. Connections are made on demand: the
/// first [`update`](Self::update) or command connects, and the link is dropped
/// again after a period of inactivity.
///
/// # Examples
///
/// ```no_run
/// use bedjet_ble::{BedJet, BtleplugClient, ConnectionParams, OperatingMode, TimeoutConfig};
/// use btleplug::api::{Central, Manager as _};
/// use btleplug::platform::Manager;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = Manager::new().await?;
///     let adapter = manager.adapters().await?.remove(0);
///     let peripheral = adapter.peripherals().await?.remove(0);
///
///     let bedjet = BedJet::new(
///         Arc::new(BtleplugClient::new(adapter, peripheral)),
///         "Bedroom",
///         ConnectionParams::default(),
///         TimeoutConfig::default(),
///     );
///
///     let _subscription = bedjet.register_callback(|state| {
///         println!("{} at {:.1}°C", state.operating_mode, state.current_temperature);
///     });
///
///     bedjet.update().await?;
///     bedjet.set_operating_mode(OperatingMode::Cool).await?;
///     bedjet.set_fan_speed(40).await?;
///     Ok(())
/// }
/// ```
pub struct BedJet {
    shared: Arc<DeviceShared>,
    session: Session,
    advertised_name: Option<String>,
    operation_lock: tokio::sync::Mutex<()>,
}

impl BedJet {
    /// Create a driver for the device behind `client`
    ///
    /// No I/O happens until [`update`](Self::update) or a command is issued.
    /// `advertised_name` is used until the device reports its own name.
    pub fn new(
        client: Arc<dyn GattClient>,
        advertised_name: impl Into<String>,
        params: ConnectionParams,
        timeouts: TimeoutConfig,
    ) -> Self {
        let advertised_name = Some(advertised_name.into()).filter(|name| !name.is_empty());
        let address = client.address();

        let shared = Arc::new(DeviceShared {
            label: RwLock::new(advertised_name.clone().unwrap_or_else(|| address.clone())),
            address,
            timeouts,
            state: RwLock::new(Arc::new(DeviceState::default())),
            last_notification: Mutex::new(None),
            diagnostics: RwLock::new(None),
            presets: RwLock::new(NamedPresets::default()),
            flags: Mutex::new(Flags::default()),
            shutdown_reason: Mutex::new(None),
            temperature_limiter: Mutex::new(TemperatureLimiter::default()),
            end_time_limiter: Mutex::new(EndTimeLimiter::default()),
            callbacks: CallbackRegistry::new(),
        });

        let weak: Weak<DeviceShared> = Arc::downgrade(&shared);
        let session = Session::new(
            client,
            params,
            Arc::new(move |generation, data: &[u8]| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_frame(generation, data);
                }
            }),
        );

        Self {
            shared,
            session,
            advertised_name,
            operation_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Connect if needed, refresh auxiliary data and wait for a first reading
    ///
    /// On a BedJet 3 this reads the memory and biorhythm preset names (once)
    /// and the status characteristic. A V2 only streams notifications. The
    /// call then waits a few seconds for a non-zero temperature; a device that
    /// is still warming up is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::ConnectionFailed`] if the device cannot be reached.
    pub async fn update(&self) -> Result<()> {
        debug!("{}: Updating", self.shared.label());
        let generation = self.session.ensure_connected().await?;
        self.refresh_label();

        if generation == ProtocolGeneration::Gen3 {
            let _guard = self.operation_lock.lock().await;
            self.read_memory_names().await;
            self.read_biorhythm_names().await;
            self.read_device_status().await;
        }

        let interval = Duration::from_millis(self.shared.timeouts.confirm_poll_interval_ms);
        let limit = Duration::from_millis(self.shared.timeouts.first_reading_timeout_ms);
        let warmed_up = poll_until(interval, limit, || {
            self.shared.state().current_temperature != 0.0
        })
        .await;
        if !warmed_up {
            debug!("{}: No temperature reading yet", self.shared.label());
        }

        Ok(())
    }

    /// Disconnect from the device
    pub async fn stop(&self) {
        debug!("{}: Stop", self.shared.label());
        self.session.disconnect().await;
    }

    /// Set the target temperature in Celsius
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::InvalidParameters`] for a value the wire format
    /// cannot carry, or a connection error.
    pub async fn set_temperature(&self, celsius: f32) -> Result<()> {
        if !celsius.is_finite() || !(0.0..=MAX_ENCODABLE_TEMPERATURE).contains(&celsius) {
            return Err(BedjetError::InvalidParameters(format!(
                "Temperature {celsius} out of range 0-{MAX_ENCODABLE_TEMPERATURE}"
            )));
        }

        self.send(Command::SetTemperature { celsius }, None).await?;
        Ok(())
    }

    /// Set the fan speed in percent
    ///
    /// The value is rounded to the nearest step of 5. On a V2 the call waits
    /// briefly for the device to report the new speed.
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::InvalidParameters`] outside 5-100, or a
    /// connection error.
    pub async fn set_fan_speed(&self, percent: u8) -> Result<()> {
        if !(5..=100).contains(&percent) {
            return Err(BedjetError::InvalidParameters(format!(
                "Fan speed {percent}% out of range 5-100"
            )));
        }
        let percent = ((percent + 2) / 5 * 5).clamp(5, 100);

        let generation = self.send(Command::SetFan { percent }, None).await?;
        if generation == ProtocolGeneration::Gen2 {
            self.confirm("fan speed", |state| state.fan_speed == percent)
                .await;
        }
        Ok(())
    }

    /// Switch the operating mode
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::InvalidParameters`] for [`OperatingMode::Wait`],
    /// which only biorhythm programs enter, [`BedjetError::Unsupported`] for a
    /// mode the device generation lacks, or a connection error.
    pub async fn set_operating_mode(&self, mode: OperatingMode) -> Result<()> {
        let button = Button::for_mode(mode).ok_or_else(|| {
            BedjetError::InvalidParameters(format!("{mode} cannot be selected directly"))
        })?;

        let generation = self
            .send(Command::Button(button), None)
            .await
            .map_err(|e| match e {
                BedjetError::Unsupported { generation, .. } => BedjetError::Unsupported {
                    operation: "set_operating_mode",
                    generation,
                },
                other => other,
            })?;

        if generation == ProtocolGeneration::Gen2 {
            self.confirm("operating mode", |state| state.operating_mode == mode)
                .await;
        }
        Ok(())
    }

    /// Set the remaining runtime; minutes of 60 or more carry into hours
    ///
    /// A V2 derives its runtime itself, so the call does nothing there.
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::InvalidParameters`] if the total does not fit
    /// the wire format, or a connection error.
    pub async fn set_runtime_remaining(&self, hours: u8, minutes: u32) -> Result<()> {
        let total_hours = u32::from(hours) + minutes / 60;
        let hours = u8::try_from(total_hours).map_err(|_| {
            BedjetError::InvalidParameters(format!("Runtime of {total_hours} hours too long"))
        })?;
        let minutes = u8::try_from(minutes % 60).unwrap_or_default();

        let generation = self.session.ensure_connected().await?;
        if generation == ProtocolGeneration::Gen2 {
            debug!(
                "{}: Runtime is not settable on {}",
                self.shared.label(),
                generation
            );
            return Ok(());
        }

        self.send(Command::SetRuntime { hours, minutes }, None)
            .await?;
        Ok(())
    }

    /// Set the device clock
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::InvalidParameters`] for an hour above 23 or a
    /// minute above 59, before any I/O happens.
    pub async fn set_clock(&self, hour: u8, minute: u8) -> Result<()> {
        if hour > 23 || minute > 59 {
            return Err(BedjetError::InvalidParameters(format!(
                "Invalid clock time {hour:02}:{minute:02}"
            )));
        }

        self.send(Command::SetClock { hour, minute }, None).await?;
        Ok(())
    }

    /// Mute or unmute the button beeps
    ///
    /// A V2 has no dedicated setting: the mute flag rides on the fan command,
    /// which is re-sent with the current fan speed. Until a V2 has reported a
    /// fan speed nothing is sent and the next temperature or fan command
    /// carries the flag instead.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the command cannot be delivered.
    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        let generation = self.session.ensure_connected().await?;

        match generation {
            ProtocolGeneration::Gen3 => {
                let command = Command::SetSetting {
                    setting: DeviceSetting::BeepsMuted,
                    enabled: muted,
                };
                self.send(command, None).await?;
                self.refresh_status().await;
            }
            ProtocolGeneration::Gen2 => {
                let percent = self.shared.state().fan_speed;
                if percent == 0 {
                    debug!(
                        "{}: Fan speed not reported yet, mute applies with the next command",
                        self.shared.label()
                    );
                } else {
                    self.send(Command::SetFan { percent }, Some(muted)).await?;
                }
            }
        }

        // Later V2 commands carry this flag; the device echo may lag behind
        self.shared.flags.lock().beeps_muted = Some(muted);
        Ok(())
    }

    /// Turn the status LEDs on or off
    ///
    /// # Errors
    ///
    /// Returns a connection error if the command cannot be delivered.
    pub async fn set_led(&self, enabled: bool) -> Result<()> {
        let command = Command::SetSetting {
            setting: DeviceSetting::Leds,
            enabled,
        };
        if self.send(command, None).await? == ProtocolGeneration::Gen3 {
            self.refresh_status().await;
        }
        Ok(())
    }

    /// Press a remote button
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::Unsupported`] if the generation has no such
    /// button, or a connection error.
    pub async fn press_button(&self, button: Button) -> Result<()> {
        self.send(Command::Button(button), None).await?;
        Ok(())
    }

    /// Run memory preset `slot` (1-3)
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::InvalidParameters`] for any other slot, or a
    /// connection error.
    pub async fn activate_memory(&self, slot: u8) -> Result<()> {
        let button = match slot {
            1 => Button::Memory1,
            2 => Button::Memory2,
            3 => Button::Memory3,
            _ => {
                return Err(BedjetError::InvalidParameters(format!(
                    "Memory slot {slot} out of range 1-3"
                )))
            }
        };
        self.press_button(button).await
    }

    /// Start biorhythm program `slot` (1-3)
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::InvalidParameters`] for any other slot,
    /// [`BedjetError::Unsupported`] on a V2, or a connection error.
    pub async fn activate_biorhythm(&self, slot: u8) -> Result<()> {
        let button = match slot {
            1 => Button::Biorhythm1,
            2 => Button::Biorhythm2,
            3 => Button::Biorhythm3,
            _ => {
                return Err(BedjetError::InvalidParameters(format!(
                    "Biorhythm slot {slot} out of range 1-3"
                )))
            }
        };
        self.press_button(button).await
    }

    /// Clear the pending on-device notification
    ///
    /// # Errors
    ///
    /// Returns [`BedjetError::Unsupported`] on a V2, or a connection error.
    pub async fn acknowledge_notification(&self) -> Result<()> {
        self.press_button(Button::NotifyAck).await?;
        self.refresh_status().await;
        Ok(())
    }

    /// Register a state-change callback
    ///
    /// The callback runs on every decoded notification with the new snapshot.
    pub fn register_callback<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DeviceState) + Send + Sync + 'static,
    {
        self.shared.callbacks.register(Arc::new(callback))
    }

    /// Current state snapshot
    #[must_use]
    pub fn state(&self) -> Arc<DeviceState> {
        self.shared.state()
    }

    /// Check if no notification arrived recently
    #[must_use]
    pub fn is_data_stale(&self) -> bool {
        let stale_after = Duration::from_millis(self.shared.timeouts.stale_after_ms);
        self.shared
            .last_notification
            .lock()
            .is_none_or(|at| at.elapsed() > stale_after)
    }

    /// Device address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Signal strength of the last advertisement, in dBm
    pub async fn rssi(&self) -> Option<i16> {
        self.session.client().rssi().await
    }

    /// Device name: the configured name, else the advertised one, else the address
    #[must_use]
    pub fn name(&self) -> String {
        self.session
            .identity()
            .name
            .or_else(|| self.advertised_name.clone())
            .unwrap_or_else(|| self.shared.address.clone())
    }

    /// Main firmware version
    #[must_use]
    pub fn firmware_version(&self) -> Option<String> {
        self.session.identity().firmware_version
    }

    /// Generation of the live connection
    #[must_use]
    pub fn generation(&self) -> Option<ProtocolGeneration> {
        self.session.generation()
    }

    /// Model name of the live connection
    #[must_use]
    pub fn model_name(&self) -> Option<&'static str> {
        self.generation().map(ProtocolGeneration::model_name)
    }

    /// Check if the device is a V2
    #[must_use]
    pub fn is_v2(&self) -> bool {
        self.generation() == Some(ProtocolGeneration::Gen2)
    }

    /// Session lifecycle phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    fn memory_label(&self, slot: usize) -> Option<String> {
        self.shared
            .presets
            .read()
            .memory_name(slot)
            .map(|name| format!("M{slot}: {name}"))
    }

    fn biorhythm_label(&self, slot: usize) -> Option<String> {
        self.shared
            .presets
            .read()
            .biorhythm_name(slot)
            .map(str::to_string)
    }

    /// Label of memory preset 1
    #[must_use]
    pub fn m1_name(&self) -> Option<String> {
        self.memory_label(1)
    }

    /// Label of memory preset 2
    #[must_use]
    pub fn m2_name(&self) -> Option<String> {
        self.memory_label(2)
    }

    /// Label of memory preset 3
    #[must_use]
    pub fn m3_name(&self) -> Option<String> {
        self.memory_label(3)
    }

    /// Name of biorhythm program 1
    #[must_use]
    pub fn biorhythm1_name(&self) -> Option<String> {
        self.biorhythm_label(1)
    }

    /// Name of biorhythm program 2
    #[must_use]
    pub fn biorhythm2_name(&self) -> Option<String> {
        self.biorhythm_label(2)
    }

    /// Name of biorhythm program 3
    #[must_use]
    pub fn biorhythm3_name(&self) -> Option<String> {
        self.biorhythm_label(3)
    }

    /// All preset names read so far
    #[must_use]
    pub fn presets(&self) -> NamedPresets {
        self.shared.presets.read().clone()
    }

    /// Secondary status of a BedJet 3; `None` on a V2 or before the first read
    #[must_use]
    pub fn diagnostics(&self) -> Option<DiagnosticFields> {
        *self.shared.diagnostics.read()
    }

    /// Whether button beeps are muted, once known
    #[must_use]
    pub fn beeps_muted(&self) -> Option<bool> {
        self.shared.flags.lock().beeps_muted
    }

    /// Whether the status LEDs are on, once known
    #[must_use]
    pub fn led_enabled(&self) -> Option<bool> {
        self.shared.flags.lock().leds_enabled
    }

    /// Pending on-device notification (BedJet 3 only)
    #[must_use]
    pub fn notification(&self) -> Option<BedjetNotification> {
        self.diagnostics().map(|d| d.notification)
    }

    /// Reason for the last shutdown (BedJet 3 only)
    #[must_use]
    pub fn shutdown_reason(&self) -> Option<u8> {
        *self.shared.shutdown_reason.lock()
    }

    /// Stabilized wall-clock end of the current run
    #[must_use]
    pub fn end_time(&self) -> Option<SystemTime> {
        self.shared.end_time_limiter.lock().end_time()
    }

    fn refresh_label(&self) {
        *self.shared.label.write() = self.name();
    }

    /// Encode and write a command, connecting first if needed
    ///
    /// `muted` overrides the mute flag V2 commands carry.
    async fn send(&self, command: Command, muted: Option<bool>) -> Result<ProtocolGeneration> {
        let _guard = self.operation_lock.lock().await;
        let generation = self.session.ensure_connected().await?;

        let muted = muted.or_else(|| self.beeps_muted()).unwrap_or(false);
        let data = protocol::encode(generation, &command, muted)?;
        debug!("{}: {} {:02X?}", self.shared.label(), command.name(), &data[..]);
        self.session.write_command(&data).await?;
        Ok(generation)
    }

    /// Wait for a V2 to report the requested change; gives up quietly
    async fn confirm(&self, what: &str, predicate: impl Fn(&DeviceState) -> bool) {
        let interval = Duration::from_millis(self.shared.timeouts.confirm_poll_interval_ms);
        let limit = Duration::from_millis(self.shared.timeouts.confirm_timeout_ms);

        if !poll_until(interval, limit, || predicate(self.shared.state().as_ref())).await {
            debug!(
                "{}: {} change not confirmed within {}ms",
                self.shared.label(),
                what,
                limit.as_millis()
            );
        }
    }

    async fn refresh_status(&self) {
        let _guard = self.operation_lock.lock().await;
        self.read_device_status().await;
    }

    async fn read_device_status(&self) {
        let label = self.shared.label();
        debug!("{}: Read device status", label);

        let data = match self.session.read_characteristic(GEN3_STATUS_UUID).await {
            Ok(data) => data,
            Err(e) => {
                warn!("{}: Failed to read device status: {}", label, e);
                return;
            }
        };
        if data.len() == GEN3_FRAME_LEN {
            debug!("{}: Status read returned a notification frame", label);
            return;
        }

        match protocol::decode_status(&data) {
            Ok(mut status) => {
                status.shutdown_reason = self.shutdown_reason().unwrap_or_default();
                {
                    let mut flags = self.shared.flags.lock();
                    flags.beeps_muted = Some(status.beeps_muted);
                    flags.leds_enabled = Some(status.leds_enabled);
                }
                if *self.shared.diagnostics.read() != Some(status) {
                    debug!("{}: Device status updated: {:?}", label, status);
                }
                *self.shared.diagnostics.write() = Some(status);
            }
            Err(e) => warn!("{}: Invalid device status {:02X?}: {}", label, data, e),
        }
    }

    async fn read_names<F>(&self, request: BioDataRequest, is_loaded: F) -> Option<Vec<Option<String>>>
    where
        F: Fn(&NamedPresets) -> bool,
    {
        let loaded = is_loaded(&*self.shared.presets.read());
        if loaded {
            return None;
        }

        let attempts = self.shared.timeouts.bio_read_attempts;
        match self.session.read_bio_data(request, attempts).await {
            Ok(BioData::MemoryNames(names) | BioData::BiorhythmNames(names)) => Some(names),
            Ok(other) => {
                debug!("{}: Unexpected {} response", self.shared.label(), other.request());
                None
            }
            Err(e) => {
                warn!("{}: Failed to read {}: {}", self.shared.label(), request, e);
                None
            }
        }
    }

    async fn read_memory_names(&self) {
        if let Some(names) = self
            .read_names(BioDataRequest::MemoryNames, |p| p.memory.is_some())
            .await
        {
            info!("{}: Memory presets {:?}", self.shared.label(), names);
            self.shared.presets.write().memory = Some(names);
        }
    }

    async fn read_biorhythm_names(&self) {
        if let Some(names) = self
            .read_names(BioDataRequest::BiorhythmNames, |p| p.biorhythm.is_some())
            .await
        {
            info!("{}: Biorhythm programs {:?}", self.shared.label(), names);
            self.shared.presets.write().biorhythm = Some(names);
        }
    }
}
