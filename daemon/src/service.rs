//! Remote accessory service contract
//!
//! The pairing service is only reachable through inter-process calls. The
//! core talks to it through [`ControllerService`], one method per remote
//! operation; the transport adapter (see [`crate::dbus`]) owns all wire
//! encoding and decoding.
//!
//! Every call may fail with a [`ServiceError`]. Callers in the core log the
//! failure and fall back to a sentinel, they never propagate it further.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::battery::BatteryError;
use crate::session::ServiceConnection;
use crate::types::{
    Category, ChargingState, ConnectionState, ConnectionType, ControllerToken, DeviceId,
    ListenerId,
};

// ============================================================================
// Error Types
// ============================================================================

/// Remote call or transport failure
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error("D-Bus daemon error: {0}")]
    Fdo(#[from] zbus::fdo::Error),

    #[error("Malformed reply: {0}")]
    Protocol(String),

    #[error("Service not connected")]
    NotConnected,
}

impl From<BatteryError> for ServiceError {
    fn from(err: BatteryError) -> Self {
        ServiceError::Protocol(err.to_string())
    }
}

/// Bind request failure
#[derive(Debug, Error)]
pub enum BindError {
    /// Caller is not allowed to bind to the service
    #[error("Permission denied binding to {service}")]
    PermissionDenied { service: String },

    #[error("Bind failed: {0}")]
    Transport(#[from] ServiceError),
}

// ============================================================================
// Remote → core callbacks
// ============================================================================

/// Receiver of the remote service's device notifications
///
/// The transport delivers notifications one at a time, in arrival order, from
/// its own delivery task. Implementations may block on outbound remote calls.
#[async_trait]
pub trait ControllerListener: Send + Sync {
    async fn on_device_added(&self, token: ControllerToken);

    /// `change_type` is the raw remote change code
    async fn on_device_changed(&self, token: ControllerToken, change_type: i32);

    async fn on_device_removed(&self, token: ControllerToken);
}

// ============================================================================
// Core → remote calls
// ============================================================================

/// One method per remote accessory service operation
#[async_trait]
pub trait ControllerService: Send + Sync {
    async fn register_listener(
        &self,
        listener: Arc<dyn ControllerListener>,
    ) -> Result<ListenerId, ServiceError>;

    async fn unregister_listener(&self, listener_id: ListenerId) -> Result<bool, ServiceError>;

    /// Current device id; negative while none is assigned
    async fn input_device_id(&self, token: &ControllerToken) -> Result<DeviceId, ServiceError>;

    /// Single rumble command; the remote caps its effect at about one second
    async fn rumble(
        &self,
        token: &ControllerToken,
        low_motor: i32,
        high_motor: i32,
    ) -> Result<bool, ServiceError>;

    /// Rumble with an explicit duration, capped remotely at about 1.5 seconds
    async fn rumble_with_duration(
        &self,
        token: &ControllerToken,
        low_motor: i32,
        high_motor: i32,
        duration: Duration,
    ) -> Result<bool, ServiceError>;

    async fn category(&self, token: &ControllerToken) -> Result<Category, ServiceError>;

    async fn nickname(&self, token: &ControllerToken) -> Result<String, ServiceError>;

    async fn battery_percentage(&self, token: &ControllerToken) -> Result<i32, ServiceError>;

    async fn charging_state(&self, token: &ControllerToken)
        -> Result<ChargingState, ServiceError>;

    async fn connection_state(
        &self,
        token: &ControllerToken,
    ) -> Result<ConnectionState, ServiceError>;

    async fn connection_type(&self, token: &ControllerToken)
        -> Result<ConnectionType, ServiceError>;

    async fn identify(&self, token: &ControllerToken) -> Result<bool, ServiceError>;

    async fn has_headset(&self, token: &ControllerToken) -> Result<bool, ServiceError>;
}

// ============================================================================
// Service binding
// ============================================================================

/// Platform side of connecting to the remote service
///
/// `bind` only *requests* a connection. Once the remote side is reachable the
/// binder reports it through [`ServiceConnection::connected`], and reports a
/// lost service through [`ServiceConnection::disconnected`].
#[async_trait]
pub trait ServiceBinder: Send + Sync {
    /// Returns `Ok(false)` if the bind request was rejected
    async fn bind(&self, connection: ServiceConnection) -> Result<bool, BindError>;

    /// Release the binding; must be safe to call after a rejected bind
    async fn unbind(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_error_maps_to_protocol() {
        let err: ServiceError = BatteryError::Empty.into();
        assert!(matches!(err, ServiceError::Protocol(_)));
    }

    #[test]
    fn test_bind_error_display() {
        let err = BindError::PermissionDenied {
            service: "io.padlink.Accessory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Permission denied binding to io.padlink.Accessory"
        );
        let err: BindError = ServiceError::NotConnected.into();
        assert_eq!(err.to_string(), "Bind failed: Service not connected");
    }
}
