//! Shared data model for padlink
//!
//! Controller tokens, platform device ids, and the enumerated property
//! values reported by the accessory pairing service.

use serde::Serialize;
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Durable identity of a physical controller, issued by the pairing service
///
/// Survives device id churn. Only the remote service creates or retires
/// tokens (via its added/removed notifications).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ControllerToken(String);

impl ControllerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ControllerToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for ControllerToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl AsRef<str> for ControllerToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControllerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform input device id
///
/// Not stable: the platform may reassign it, and the pairing service reports
/// a negative value while no id is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(i32);

impl DeviceId {
    /// Sentinel reported when no device id is assigned
    pub const UNASSIGNED: DeviceId = DeviceId(-1);

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i32 {
        self.0
    }

    /// Whether this is a real (non-negative) device id
    pub const fn is_assigned(self) -> bool {
        self.0 >= 0
    }
}

impl From<i32> for DeviceId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by the remote service when a listener is registered
///
/// Zero means "not registered".
pub type ListenerId = i32;

// ============================================================================
// Change notifications
// ============================================================================

/// Property named by a remote device-changed notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    BatteryPercentage,
    ChargingState,
    ConnectionState,
    ConnectionType,
    DeviceId,
    Nickname,
    HeadsetPresence,
}

impl ChangeType {
    /// Decode a remote change code; unrecognized codes yield `None`
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            2 => Some(ChangeType::BatteryPercentage),
            3 => Some(ChangeType::ChargingState),
            4 => Some(ChangeType::ConnectionState),
            5 => Some(ChangeType::ConnectionType),
            7 => Some(ChangeType::DeviceId),
            8 => Some(ChangeType::Nickname),
            11 => Some(ChangeType::HeadsetPresence),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ChangeType::BatteryPercentage => 2,
            ChangeType::ChargingState => 3,
            ChangeType::ConnectionState => 4,
            ChangeType::ConnectionType => 5,
            ChangeType::DeviceId => 7,
            ChangeType::Nickname => 8,
            ChangeType::HeadsetPresence => 11,
        }
    }
}

// ============================================================================
// Property values
// ============================================================================

/// Kind of accessory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Unknown,
    Controller,
    Remote,
}

impl Category {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Category::Controller,
            2 => Category::Remote,
            _ => Category::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargingState {
    #[default]
    Unknown,
    NotCharging,
    Charging,
}

impl ChargingState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ChargingState::NotCharging,
            2 => ChargingState::Charging,
            _ => ChargingState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Unknown,
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ConnectionState::Disconnected,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Unknown,
        }
    }
}

/// Physical link between the accessory and the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Unknown,
    Wired,
    Wireless,
    Both,
}

impl ConnectionType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ConnectionType::Wired,
            2 => ConnectionType::Wireless,
            3 => ConnectionType::Both,
            _ => ConnectionType::Unknown,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Unknown => write!(f, "unknown"),
            Category::Controller => write!(f, "controller"),
            Category::Remote => write!(f, "remote"),
        }
    }
}

impl fmt::Display for ChargingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargingState::Unknown => write!(f, "unknown"),
            ChargingState::NotCharging => write!(f, "not charging"),
            ChargingState::Charging => write!(f, "charging"),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unknown => write!(f, "unknown"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Unknown => write!(f, "unknown"),
            ConnectionType::Wired => write!(f, "wired"),
            ConnectionType::Wireless => write!(f, "wireless"),
            ConnectionType::Both => write!(f, "wired+wireless"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_assignment() {
        assert!(DeviceId::new(0).is_assigned());
        assert!(DeviceId::new(12).is_assigned());
        assert!(!DeviceId::new(-1).is_assigned());
        assert!(!DeviceId::UNASSIGNED.is_assigned());
    }

    #[test]
    fn test_change_type_codes() {
        for code in [2, 3, 4, 5, 7, 8, 11] {
            let change = ChangeType::from_code(code).unwrap();
            assert_eq!(change.code(), code);
        }
        assert_eq!(ChangeType::from_code(7), Some(ChangeType::DeviceId));
    }

    #[test]
    fn test_unrecognized_change_codes() {
        for code in [-1, 0, 1, 6, 9, 10, 12, 99] {
            assert_eq!(ChangeType::from_code(code), None);
        }
    }

    #[test]
    fn test_raw_enum_decoding() {
        assert_eq!(Category::from_raw(1), Category::Controller);
        assert_eq!(Category::from_raw(2), Category::Remote);
        assert_eq!(Category::from_raw(0), Category::Unknown);

        assert_eq!(ChargingState::from_raw(1), ChargingState::NotCharging);
        assert_eq!(ChargingState::from_raw(2), ChargingState::Charging);
        assert_eq!(ChargingState::from_raw(3), ChargingState::Unknown);

        assert_eq!(ConnectionState::from_raw(1), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::from_raw(2), ConnectionState::Connected);
        assert_eq!(ConnectionState::from_raw(-5), ConnectionState::Unknown);

        assert_eq!(ConnectionType::from_raw(1), ConnectionType::Wired);
        assert_eq!(ConnectionType::from_raw(2), ConnectionType::Wireless);
        assert_eq!(ConnectionType::from_raw(3), ConnectionType::Both);
        assert_eq!(ConnectionType::from_raw(4), ConnectionType::Unknown);
    }

    #[test]
    fn test_defaults_are_unknown() {
        assert_eq!(Category::default(), Category::Unknown);
        assert_eq!(ChargingState::default(), ChargingState::Unknown);
        assert_eq!(ConnectionState::default(), ConnectionState::Unknown);
        assert_eq!(ConnectionType::default(), ConnectionType::Unknown);
    }

    #[test]
    fn test_token_display() {
        let token = ControllerToken::from("pad-1");
        assert_eq!(token.to_string(), "pad-1");
        assert_eq!(token.as_str(), "pad-1");
    }
}
