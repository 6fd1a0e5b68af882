use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::error::BedjetError;

/// Operating mode reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatingMode {
    /// Off
    Standby = 0,
    /// Heat, limited to 4 hours
    Heat = 1,
    /// High heat, limited time
    Turbo = 2,
    /// Heat, limited to 10 hours
    ExtendedHeat = 3,
    /// Fan only
    Cool = 4,
    /// High speed, no heat
    Dry = 5,
    /// A pause step inside a biorhythm program
    Wait = 6,
}

impl TryFrom<u8> for OperatingMode {
    type Error = BedjetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Standby),
            1 => Ok(Self::Heat),
            2 => Ok(Self::Turbo),
            3 => Ok(Self::ExtendedHeat),
            4 => Ok(Self::Cool),
            5 => Ok(Self::Dry),
            6 => Ok(Self::Wait),
            _ => Err(BedjetError::MalformedFrame(format!(
                "Unknown operating mode: {value:02X}"
            ))),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standby => write!(f, "Standby"),
            Self::Heat => write!(f, "Heat"),
            Self::Turbo => write!(f, "Turbo"),
            Self::ExtendedHeat => write!(f, "Extended Heat"),
            Self::Cool => write!(f, "Cool"),
            Self::Dry => write!(f, "Dry"),
            Self::Wait => write!(f, "Wait"),
        }
    }
}

/// Hardware/firmware family of the connected device
///
/// Selected once per connection by looking for the ISSC status characteristic,
/// which only the older generation exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolGeneration {
    /// BedJet 3: raw commands, 20-byte notifications
    Gen3,
    /// BedJet V2 on the ISSC radio: wrapped commands, 14-byte notifications
    Gen2,
}

impl ProtocolGeneration {
    /// Marketing model name for this generation
    #[must_use]
    pub const fn model_name(self) -> &'static str {
        match self {
            Self::Gen3 => "BedJet 3",
            Self::Gen2 => "BedJet V2",
        }
    }
}

impl fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.model_name())
    }
}

/// Pending on-device notification, as shown on the remote's display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BedjetNotification {
    /// Nothing pending
    None = 0,
    /// Air filter should be checked
    CleanFilter = 1,
    /// A newer firmware is available
    UpdateAvailable = 2,
    /// Firmware update server unreachable
    UpdateFailed = 3,
    /// Biorhythm refused because the clock is not set
    BioFailClockNotSet = 4,
    /// Biorhythm refused because a step would run too long from now
    BioFailTooLong = 5,
}

impl TryFrom<u8> for BedjetNotification {
    type Error = BedjetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::CleanFilter),
            2 => Ok(Self::UpdateAvailable),
            3 => Ok(Self::UpdateFailed),
            4 => Ok(Self::BioFailClockNotSet),
            5 => Ok(Self::BioFailTooLong),
            _ => Err(BedjetError::MalformedFrame(format!(
                "Unknown notification code: {value:02X}"
            ))),
        }
    }
}

impl fmt::Display for BedjetNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::CleanFilter => write!(f, "Clean filter"),
            Self::UpdateAvailable => write!(f, "Firmware update available"),
            Self::UpdateFailed => write!(f, "Firmware update failed"),
            Self::BioFailClockNotSet => write!(f, "Biorhythm failed: clock not set"),
            Self::BioFailTooLong => write!(f, "Biorhythm failed: sequence too long"),
        }
    }
}

/// Immutable snapshot of the device state
///
/// A new snapshot replaces the previous one on every decoded notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Current air temperature (Celsius), jitter-limited
    pub current_temperature: f32,
    /// Target temperature (Celsius)
    pub target_temperature: f32,
    /// Operating mode
    pub operating_mode: OperatingMode,
    /// Time left in the current run
    pub runtime_remaining: Duration,
    /// Longest run allowed in the current mode
    pub maximum_runtime: Duration,
    /// Time left in turbo
    pub turbo_time: Duration,
    /// Fan speed in percent, multiple of 5
    pub fan_speed: u8,
    /// Lowest settable temperature (Celsius)
    pub minimum_temperature: f32,
    /// Highest settable temperature (Celsius)
    pub maximum_temperature: f32,
    /// Ambient temperature (Celsius), 0 when the device has no ambient sensor
    pub ambient_temperature: f32,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            current_temperature: 0.0,
            target_temperature: 0.0,
            operating_mode: OperatingMode::Standby,
            runtime_remaining: Duration::ZERO,
            maximum_runtime: Duration::ZERO,
            turbo_time: Duration::ZERO,
            fan_speed: 0,
            minimum_temperature: 0.0,
            maximum_temperature: 0.0,
            ambient_temperature: 0.0,
        }
    }
}

/// Secondary status decoded from the BedJet 3 status characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticFields {
    /// Beeps are muted
    pub beeps_muted: bool,
    /// Status LEDs are on
    pub leds_enabled: bool,
    /// Dual-zone installation
    pub dual_zone: bool,
    /// Temperature units have been configured
    pub units_setup: bool,
    /// Last connection test passed
    pub connection_test_passed: bool,
    /// Current step of a running biorhythm program
    pub bio_sequence_step: u8,
    /// Pending device notification
    pub notification: BedjetNotification,
    /// Reason for the last shutdown, from the streaming notification
    pub shutdown_reason: u8,
    /// Firmware update phase
    pub update_phase: u8,
}

/// Names of the stored memory and biorhythm presets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPresets {
    /// Memory slot names M1..M3, `None` until read
    pub memory: Option<Vec<Option<String>>>,
    /// Biorhythm slot names 1..3, `None` until read
    pub biorhythm: Option<Vec<Option<String>>>,
}

impl NamedPresets {
    /// Name of memory slot `slot` (1-based)
    #[must_use]
    pub fn memory_name(&self, slot: usize) -> Option<&str> {
        slot_name(self.memory.as_deref(), slot)
    }

    /// Name of biorhythm slot `slot` (1-based)
    #[must_use]
    pub fn biorhythm_name(&self, slot: usize) -> Option<&str> {
        slot_name(self.biorhythm.as_deref(), slot)
    }
}

fn slot_name(names: Option<&[Option<String>]>, slot: usize) -> Option<&str> {
    names?
        .get(slot.checked_sub(1)?)?
        .as_deref()
        .filter(|name| !name.is_empty())
}

/// Phase of the BLE session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// No link
    Disconnected,
    /// Link being established
    Connecting,
    /// Detecting the protocol generation
    Negotiating,
    /// Notifications enabled, bootstrap reads pending
    Subscribed,
    /// Fully usable
    Ready,
    /// Voluntary teardown in progress
    Disconnecting,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Negotiating => write!(f, "Negotiating"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Timeout for a single link establishment in milliseconds
    pub connect_timeout_ms: u64,
    /// Link establishment attempts before giving up
    pub connect_attempts: u32,
    /// Delay between link establishment attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Notification subscription attempts before giving up
    pub subscribe_attempts: u32,
    /// Initial backoff between subscription attempts in milliseconds, doubled each retry
    pub subscribe_backoff_ms: u64,
    /// Settle time after connecting to a V2 before it accepts writes
    pub gen2_warmup_ms: u64,
    /// Idle time after which the link is dropped, in milliseconds
    pub idle_disconnect_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            connect_attempts: 3,
            retry_delay_ms: 250,
            subscribe_attempts: 3,
            subscribe_backoff_ms: 200,
            gen2_warmup_ms: 1_000,
            idle_disconnect_ms: 120_000,
        }
    }
}

/// Timing of command confirmation and state freshness
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Interval between confirmation checks in milliseconds
    pub confirm_poll_interval_ms: u64,
    /// Overall confirmation budget in milliseconds
    pub confirm_timeout_ms: u64,
    /// How long `update()` waits for a first temperature reading
    pub first_reading_timeout_ms: u64,
    /// Age after which the state is reported stale
    pub stale_after_ms: u64,
    /// Attempts per bio-data request
    pub bio_read_attempts: u8,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            confirm_poll_interval_ms: 100,
            confirm_timeout_ms: 1_000,
            first_reading_timeout_ms: 5_000,
            stale_after_ms: 60_000,
            bio_read_attempts: 2,
        }
    }
}
