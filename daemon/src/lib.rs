//! padlink Library
//!
//! Client for the accessory pairing service: keeps controller tokens and
//! platform input device ids reconciled, keeps rumble alive across the
//! service's per-call cap, and manages the service binding.

pub mod battery;
pub mod config;
pub mod dbus;
pub mod listener;
pub mod mapping;
pub mod reconciler;
pub mod rumble;
pub mod service;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

/// Re-export commonly used types
pub use battery::{parse_battery_percentage, BatteryError, BatteryStatus};
pub use config::{BusKind, Config, ConfigError};
pub use dbus::{DbusBinder, DbusControllerService, DBUS_INTERFACE, DEFAULT_SERVICE_NAME, DEFAULT_SERVICE_PATH};
pub use listener::{ChannelListener, DeviceEvent, DeviceListener, NoopListener};
pub use mapping::DeviceMap;
pub use rumble::{RumbleScheduler, DEFAULT_KEEPALIVE_MS};
pub use service::{BindError, ControllerListener, ControllerService, ServiceBinder, ServiceError};
pub use session::{AccessoryManager, ServiceConnection, SessionState};
pub use types::{
    Category, ChangeType, ChargingState, ConnectionState, ConnectionType, ControllerToken,
    DeviceId, ListenerId,
};
