//! Battery status decoding
//!
//! The pairing service reports battery state as a semicolon-delimited
//! status string. Only the first field, the charge percentage, is
//! interpreted; the remaining fields are kept verbatim.
//!
//! SPDX-License-Identifier: GPL-3.0

use thiserror::Error;

/// Field separator in the remote battery status string
const STATUS_SEPARATOR: char = ';';

/// Decoded battery status string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryStatus {
    /// Battery percentage (0-100 as reported, not clamped)
    pub percentage: i32,
    /// Fields after the percentage, untouched
    pub extra: Vec<String>,
}

/// Battery status decoding error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatteryError {
    #[error("empty battery status")]
    Empty,
    #[error("invalid battery percentage {field:?}")]
    InvalidPercentage { field: String },
}

impl BatteryStatus {
    /// Parse a status string such as `"77;1;0"`
    pub fn parse(status: &str) -> Result<Self, BatteryError> {
        let mut fields = status.split(STATUS_SEPARATOR);

        let first = fields.next().map(str::trim).unwrap_or_default();
        if first.is_empty() {
            return Err(BatteryError::Empty);
        }

        let percentage = first
            .parse::<i32>()
            .map_err(|_| BatteryError::InvalidPercentage {
                field: first.to_string(),
            })?;

        Ok(Self {
            percentage,
            extra: fields.map(str::to_string).collect(),
        })
    }
}

/// Extract the charge percentage from a remote status string
pub fn parse_battery_percentage(status: &str) -> Result<i32, BatteryError> {
    BatteryStatus::parse(status).map(|s| s.percentage)
}
