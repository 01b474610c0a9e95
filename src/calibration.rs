//! Factory calibration storage.
//!
//! The board EEPROM carries a small JSON blob written at final test. A board
//! that never saw final test (or whose blob is damaged) still has to open,
//! so any parse problem degrades to identity calibration with one warning.

use serde::Deserialize;

use crate::api::NUM_CHANNELS;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FactoryData {
    pub serial: String,
    pub calibration_date: String,
    pub slopes: [f64; NUM_CHANNELS],
    pub offsets: [f64; NUM_CHANNELS],
}

impl Default for FactoryData {
    fn default() -> FactoryData {
        FactoryData {
            serial: "00000000".to_string(),
            calibration_date: "1970-01-01".to_string(),
            slopes: [1.0; NUM_CHANNELS],
            offsets: [0.0; NUM_CHANNELS],
        }
    }
}

// mirror of the blob's shape; every field optional so that a malformed
// document parses as far as it can before validation decides
#[derive(Deserialize)]
struct RawBlob {
    serial: Option<String>,
    calibration: Option<RawCalibration>,
}

#[derive(Deserialize)]
struct RawCalibration {
    date: Option<String>,
    slopes: Option<Vec<f64>>,
    offsets: Option<Vec<f64>>,
}

impl FactoryData {
    /// Parse the EEPROM blob, falling back to defaults on any shortfall.
    pub(crate) fn from_blob(blob: &[u8]) -> FactoryData {
        match FactoryData::try_parse(blob) {
            Some(data) => data,
            None => {
                log::warn!("factory calibration blob unusable, using defaults");
                FactoryData::default()
            }
        }
    }

    fn try_parse(blob: &[u8]) -> Option<FactoryData> {
        let raw: RawBlob = serde_json::from_slice(blob).ok()?;
        let serial = raw.serial?;
        let cal = raw.calibration?;
        let date = cal.date?;
        let slopes = cal.slopes?;
        let offsets = cal.offsets?;
        if slopes.len() != NUM_CHANNELS || offsets.len() != NUM_CHANNELS {
            return None;
        }
        let mut data = FactoryData {
            serial,
            calibration_date: date,
            ..FactoryData::default()
        };
        data.slopes.copy_from_slice(&slopes);
        data.offsets.copy_from_slice(&offsets);
        Some(data)
    }
}
