#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # bedjet-ble
//!
//! A Rust driver for BedJet climate-comfort appliances over Bluetooth Low Energy.
//!
//! Two incompatible device generations are supported behind one API:
//!
//! - **BedJet 3**: raw commands and self-describing 20-byte status notifications,
//!   plus bio-data reads for the device name, preset names and firmware versions.
//! - **BedJet V2** (ISSC radio): checksummed commands and 14-byte notifications
//!   whose mode and fan speed are inferred from observed byte ranges.
//!
//! The generation is detected once per connection by looking for the V2 status
//! characteristic. Everything above the wire codec works on a single
//! [`DeviceState`] snapshot regardless of generation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bedjet_ble::{BedJet, BtleplugClient, ConnectionParams, OperatingMode, TimeoutConfig};
//! use btleplug::api::{Central, Manager as _};
//! use btleplug::platform::Manager;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Manager::new().await?;
//!     let adapter = manager.adapters().await?.remove(0);
//!     let peripheral = adapter.peripherals().await?.remove(0);
//!
//!     let client = Arc::new(BtleplugClient::new(adapter, peripheral));
//!     let bedjet = BedJet::new(
//!         client,
//!         "BEDJET_V3",
//!         ConnectionParams::default(),
//!         TimeoutConfig::default(),
//!     );
//!
//!     bedjet.update().await?;
//!     bedjet.set_operating_mode(OperatingMode::Heat).await?;
//!     bedjet.set_temperature(33.5).await?;
//!
//!     println!("{:?}", bedjet.state());
//!     bedjet.stop().await;
//!     Ok(())
//! }
//! ```

/// Bio-data records: device name, preset names, firmware versions
pub mod biodata;
/// GATT transport abstraction and the btleplug backend
pub mod ble;
/// State-change callback registry
pub mod callbacks;
/// Main device control interface
pub mod device;
/// Error types and handling
pub mod error;
/// Jitter suppression for temperatures and end times
pub mod limiter;
/// Wire codec for both device generations
pub mod protocol;
/// Maximum-runtime table for BedJet V2
pub mod runtime;
/// BLE session lifecycle
pub mod session;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the main types for convenient usage
pub use ble::{BtleplugClient, GattClient, GattConnection};
pub use callbacks::Subscription;
pub use device::BedJet;
pub use error::{BedjetError, Result, TransportError};
pub use protocol::Button;
pub use types::{
    BedjetNotification, ConnectionParams, DeviceState, DiagnosticFields, NamedPresets,
    OperatingMode, ProtocolGeneration, SessionPhase, TimeoutConfig,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// BedJet 3 primary service
pub const GEN3_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1000_bed0_0080_aa55_4265_644a_6574);

/// BedJet 3 status characteristic
///
/// Notifies 20-byte state frames; a plain read returns the 11-byte secondary
/// status (flags, notification code, bio-sequence step).
pub const GEN3_STATUS_UUID: Uuid = Uuid::from_u128(0x0000_2000_bed0_0080_aa55_4265_644a_6574);

/// BedJet 3 device name characteristic
pub const GEN3_NAME_UUID: Uuid = Uuid::from_u128(0x0000_2001_bed0_0080_aa55_4265_644a_6574);

/// BedJet 3 command characteristic
pub const GEN3_COMMAND_UUID: Uuid = Uuid::from_u128(0x0000_2004_bed0_0080_aa55_4265_644a_6574);

/// BedJet 3 full bio-data characteristic, read after a `GET_BIO` request
pub const GEN3_BIODATA_FULL_UUID: Uuid =
    Uuid::from_u128(0x0000_2006_bed0_0080_aa55_4265_644a_6574);

/// BedJet V2 (ISSC) service
pub const GEN2_SERVICE_UUID: Uuid = Uuid::from_u128(0x4953_5343_fe7d_4ae5_8fa9_9faf_d205_e455);

/// BedJet V2 status characteristic
///
/// Only V2 devices expose it, so its presence selects the protocol generation.
pub const GEN2_STATUS_UUID: Uuid = Uuid::from_u128(0x4953_5343_1e4d_4bd9_ba61_23c6_4724_9616);

/// BedJet V2 command characteristic
pub const GEN2_COMMAND_UUID: Uuid = Uuid::from_u128(0x4953_5343_8841_43f4_a8d4_ecbe_3472_9bb3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_strings() {
        assert_eq!(
            GEN3_SERVICE_UUID.to_string(),
            "00001000-bed0-0080-aa55-4265644a6574"
        );
        assert_eq!(
            GEN3_BIODATA_FULL_UUID.to_string(),
            "00002006-bed0-0080-aa55-4265644a6574"
        );
        assert_eq!(
            GEN2_STATUS_UUID.to_string(),
            "49535343-1e4d-4bd9-ba61-23c647249616"
        );
        assert_eq!(
            GEN2_COMMAND_UUID.to_string(),
            "49535343-8841-43f4-a8d4-ecbe34729bb3"
        );
    }
}
