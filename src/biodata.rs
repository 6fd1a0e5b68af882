//! Bio-data records: device name, preset names and firmware versions.
//!
//! These are fetched by writing a `GET_BIO` request to the command
//! characteristic and then reading the full bio-data characteristic. The
//! response starts with the request type and the echoed tag, followed by
//! fixed 16-byte text records.

use std::fmt;

use crate::error::{BedjetError, Result};

/// Length of one text record
pub const RECORD_LEN: usize = 16;

/// Bytes before the first record: request type and tag
const HEADER_LEN: usize = 2;

/// Name used by the device for presets that still have their factory name
pub const DEFAULT_NAME: &str = "Default";

/// Kind of bio-data requested from a BedJet 3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BioDataRequest {
    /// Configured device name
    DeviceName = 0,
    /// Memory preset names M1..M3
    MemoryNames = 1,
    /// Biorhythm program names
    BiorhythmNames = 4,
    /// Firmware versions of the device's processors
    FirmwareVersions = 32,
}

impl BioDataRequest {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::DeviceName),
            1 => Some(Self::MemoryNames),
            4 => Some(Self::BiorhythmNames),
            32 => Some(Self::FirmwareVersions),
            _ => None,
        }
    }
}

impl fmt::Display for BioDataRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceName => write!(f, "device name"),
            Self::MemoryNames => write!(f, "memory names"),
            Self::BiorhythmNames => write!(f, "biorhythm names"),
            Self::FirmwareVersions => write!(f, "firmware versions"),
        }
    }
}

/// Parsed bio-data response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BioData {
    /// Device name
    DeviceName(Option<String>),
    /// Memory preset names, one per slot
    MemoryNames(Vec<Option<String>>),
    /// Biorhythm program names, one per slot
    BiorhythmNames(Vec<Option<String>>),
    /// Firmware versions, main processor first
    FirmwareVersions(Vec<Option<String>>),
}

impl BioData {
    /// Request this response answers
    #[must_use]
    pub const fn request(&self) -> BioDataRequest {
        match self {
            Self::DeviceName(_) => BioDataRequest::DeviceName,
            Self::MemoryNames(_) => BioDataRequest::MemoryNames,
            Self::BiorhythmNames(_) => BioDataRequest::BiorhythmNames,
            Self::FirmwareVersions(_) => BioDataRequest::FirmwareVersions,
        }
    }
}

/// Decode a single text record
///
/// A leading `0` marks a factory-named slot, a leading `1` an empty slot.
/// Anything else is text up to the first null byte.
#[must_use]
pub fn parse_text(record: &[u8]) -> Option<String> {
    match record.first()? {
        0 => Some(DEFAULT_NAME.to_string()),
        1 => None,
        _ => {
            let end = record.iter().position(|&b| b == 0).unwrap_or(record.len());
            Some(String::from_utf8_lossy(&record[..end]).into_owned())
        }
    }
}

/// Decode consecutive fixed-length records; a short trailing record is kept
#[must_use]
pub fn parse_records(data: &[u8]) -> Vec<Option<String>> {
    data.chunks(RECORD_LEN).map(parse_text).collect()
}

/// Parse a full bio-data characteristic read
///
/// # Errors
///
/// Returns [`BedjetError::MalformedFrame`] if the response is shorter than its
/// header or carries an unknown request type.
pub fn parse_response(data: &[u8]) -> Result<BioData> {
    if data.len() < HEADER_LEN {
        return Err(BedjetError::MalformedFrame(format!(
            "Bio-data response too short: {} bytes",
            data.len()
        )));
    }

    let request = BioDataRequest::from_u8(data[0]).ok_or_else(|| {
        BedjetError::MalformedFrame(format!("Unknown bio-data type: {:02X}", data[0]))
    })?;
    let body = &data[HEADER_LEN..];

    Ok(match request {
        BioDataRequest::DeviceName => BioData::DeviceName(parse_text(body)),
        BioDataRequest::MemoryNames => BioData::MemoryNames(parse_records(body)),
        BioDataRequest::BiorhythmNames => BioData::BiorhythmNames(parse_records(body)),
        BioDataRequest::FirmwareVersions => BioData::FirmwareVersions(parse_records(body)),
    })
}
