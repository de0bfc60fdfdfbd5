//! Normalized device events for consumers
//!
//! The reconciler turns remote notifications (keyed by controller token)
//! into [`DeviceEvent`]s keyed by platform device id and hands them to a
//! [`DeviceListener`]. With no listener installed the [`NoopListener`] sink
//! swallows them.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::{ChargingState, ConnectionState, ConnectionType, DeviceId};

/// Device lifecycle or property change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    Added {
        device_id: DeviceId,
    },
    Removed {
        device_id: DeviceId,
    },
    InputDeviceIdChanged {
        old_device_id: DeviceId,
        new_device_id: DeviceId,
    },
    BatteryPercentageChanged {
        device_id: DeviceId,
        percentage: i32,
    },
    ChargingStateChanged {
        device_id: DeviceId,
        state: ChargingState,
    },
    ConnectionStateChanged {
        device_id: DeviceId,
        state: ConnectionState,
    },
    ConnectionTypeChanged {
        device_id: DeviceId,
        connection_type: ConnectionType,
    },
    NicknameChanged {
        device_id: DeviceId,
        nickname: String,
    },
    HeadsetPresenceChanged {
        device_id: DeviceId,
        present: bool,
    },
}

impl DeviceEvent {
    /// Device the event refers to (the new id for id changes)
    pub fn device_id(&self) -> DeviceId {
        match self {
            DeviceEvent::Added { device_id }
            | DeviceEvent::Removed { device_id }
            | DeviceEvent::BatteryPercentageChanged { device_id, .. }
            | DeviceEvent::ChargingStateChanged { device_id, .. }
            | DeviceEvent::ConnectionStateChanged { device_id, .. }
            | DeviceEvent::ConnectionTypeChanged { device_id, .. }
            | DeviceEvent::NicknameChanged { device_id, .. }
            | DeviceEvent::HeadsetPresenceChanged { device_id, .. } => *device_id,
            DeviceEvent::InputDeviceIdChanged { new_device_id, .. } => *new_device_id,
        }
    }
}

/// Consumer sink for normalized device events
///
/// Called from the remote delivery task; implementations should return
/// quickly.
pub trait DeviceListener: Send + Sync {
    fn on_event(&self, event: DeviceEvent);
}

/// Sink used while no consumer listener is installed
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl DeviceListener for NoopListener {
    fn on_event(&self, _event: DeviceEvent) {}
}

impl<F> DeviceListener for F
where
    F: Fn(DeviceEvent) + Send + Sync,
{
    fn on_event(&self, event: DeviceEvent) {
        self(event)
    }
}

/// Forwards events into a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self { tx }
    }

    /// Create a listener together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DeviceListener for ChannelListener {
    fn on_event(&self, event: DeviceEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Device event receiver dropped");
        }
    }
}
