//! Device identity reconciliation
//!
//! Maintains the controller token ↔ device id mapping from the remote
//! service's added/changed/removed notifications and raises normalized
//! [`DeviceEvent`]s for the consumer.
//!
//! Notifications arrive ordered per token but interleaved across tokens,
//! from the transport's delivery task, while arbitrary tasks perform
//! lookups. See [`DeviceMap`] for the consistency window this implies.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::listener::{DeviceEvent, DeviceListener, NoopListener};
use crate::mapping::DeviceMap;
use crate::rumble::RumbleScheduler;
use crate::service::{ControllerService, ServiceError};
use crate::types::{ChangeType, ControllerToken, DeviceId};

pub struct Reconciler {
    map: DeviceMap,
    rumble: Arc<RumbleScheduler>,
    sink: RwLock<Arc<dyn DeviceListener>>,
    /// Bumped by `clear()`; map writes and events happen under the read side
    epoch: RwLock<u64>,
}

impl Reconciler {
    pub fn new(rumble: Arc<RumbleScheduler>) -> Self {
        Self {
            map: DeviceMap::new(),
            rumble,
            sink: RwLock::new(Arc::new(NoopListener)),
            epoch: RwLock::new(0),
        }
    }

    /// Install the consumer sink; `None` restores the no-op sink
    pub fn set_listener(&self, listener: Option<Arc<dyn DeviceListener>>) {
        let listener = listener.unwrap_or_else(|| Arc::new(NoopListener));
        match self.sink.write() {
            Ok(mut sink) => *sink = listener,
            Err(poisoned) => *poisoned.into_inner() = listener,
        }
    }

    fn emit(&self, event: DeviceEvent) {
        let sink = match self.sink.read() {
            Ok(sink) => Arc::clone(&sink),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        };
        debug!(?event, "Emitting device event");
        sink.on_event(event);
    }

    fn epoch_read(&self) -> RwLockReadGuard<'_, u64> {
        match self.epoch.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn epoch_write(&self) -> RwLockWriteGuard<'_, u64> {
        match self.epoch.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current clear generation; pass it to the `handle_*` methods
    pub fn epoch(&self) -> u64 {
        *self.epoch_read()
    }

    /// Run `apply` only if no `clear()` happened since `epoch` was taken
    ///
    /// `clear()` waits for a running `apply`, so nothing it writes survives
    /// a clear that follows.
    fn commit<R>(&self, epoch: u64, apply: impl FnOnce() -> R) -> Option<R> {
        let current = self.epoch_read();
        if *current != epoch {
            debug!(epoch, current = *current, "Dropping notification from before the last clear");
            return None;
        }
        Some(apply())
    }

    pub fn map(&self) -> &DeviceMap {
        &self.map
    }

    pub fn token_for(&self, device_id: DeviceId) -> Option<ControllerToken> {
        self.map.token(device_id)
    }

    /// Drop every mapping (session stop or service loss)
    ///
    /// Handlers still waiting on the remote will not write or emit afterwards.
    pub fn clear(&self) {
        let mut epoch = self.epoch_write();
        *epoch = epoch.wrapping_add(1);
        self.map.clear();
    }

    // ========================================================================
    // Notification handlers
    // ========================================================================

    pub async fn device_added(&self, service: &dyn ControllerService, token: &ControllerToken) {
        let epoch = self.epoch();
        self.handle_added(epoch, service, token).await
    }

    pub async fn device_changed(
        &self,
        service: &dyn ControllerService,
        token: &ControllerToken,
        change_type: i32,
    ) {
        let epoch = self.epoch();
        self.handle_changed(epoch, service, token, change_type).await
    }

    pub async fn device_removed(&self, token: &ControllerToken) {
        let epoch = self.epoch();
        self.handle_removed(epoch, token)
    }

    /// A controller appeared; it is only tracked once it has a device id
    pub async fn handle_added(
        &self,
        epoch: u64,
        service: &dyn ControllerService,
        token: &ControllerToken,
    ) {
        let device_id = match service.input_device_id(token).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, token = %token, "Failed to query device id for added controller");
                return;
            }
        };

        // Completed later by a device-id-changed notification
        if !device_id.is_assigned() {
            debug!(token = %token, "Controller added without a device id yet");
            return;
        }

        self.commit(epoch, || {
            self.map.insert(token, device_id);
            info!(token = %token, device_id = %device_id, "Controller added");
            self.emit(DeviceEvent::Added { device_id });
        });
    }

    pub async fn handle_changed(
        &self,
        epoch: u64,
        service: &dyn ControllerService,
        token: &ControllerToken,
        change_type: i32,
    ) {
        let change = ChangeType::from_code(change_type);

        let Some(device_id) = self.map.device_id(token) else {
            // Only an id assignment makes an unknown controller interesting
            if change == Some(ChangeType::DeviceId) {
                match service.input_device_id(token).await {
                    Ok(id) if id.is_assigned() => self.handle_added(epoch, service, token).await,
                    Ok(_) => debug!(token = %token, "Untracked controller still has no device id"),
                    Err(e) => warn!(error = %e, token = %token, "Failed to query device id"),
                }
            } else {
                debug!(token = %token, change_type, "Ignoring change for untracked controller");
            }
            return;
        };

        let Some(change) = change else {
            debug!(token = %token, change_type, "Ignoring unrecognized change type");
            return;
        };

        if let Err(e) = self.apply_change(epoch, service, token, device_id, change).await {
            warn!(
                error = %e,
                token = %token,
                device_id = %device_id,
                change_type,
                "Failed to query changed controller property"
            );
        }
    }

    /// Every change re-reads the device id first; property events still carry
    /// the id the token was mapped to when the notification arrived.
    async fn apply_change(
        &self,
        epoch: u64,
        service: &dyn ControllerService,
        token: &ControllerToken,
        device_id: DeviceId,
        change: ChangeType,
    ) -> Result<(), ServiceError> {
        let new_id = service.input_device_id(token).await?;

        let event = match change {
            ChangeType::DeviceId => {
                if !new_id.is_assigned() {
                    // Losing the id is a removal, not an id change
                    self.handle_removed(epoch, token);
                    return Ok(());
                }
                if new_id == device_id {
                    debug!(token = %token, device_id = %device_id, "Device id unchanged");
                    return Ok(());
                }

                self.commit(epoch, || {
                    self.map.move_device(token, device_id, new_id);
                    info!(token = %token, old = %device_id, new = %new_id, "Device id changed");
                    self.emit(DeviceEvent::InputDeviceIdChanged {
                        old_device_id: device_id,
                        new_device_id: new_id,
                    });
                });
                return Ok(());
            }
            ChangeType::BatteryPercentage => DeviceEvent::BatteryPercentageChanged {
                device_id,
                percentage: service.battery_percentage(token).await?,
            },
            ChangeType::ChargingState => DeviceEvent::ChargingStateChanged {
                device_id,
                state: service.charging_state(token).await?,
            },
            ChangeType::ConnectionState => DeviceEvent::ConnectionStateChanged {
                device_id,
                state: service.connection_state(token).await?,
            },
            ChangeType::ConnectionType => DeviceEvent::ConnectionTypeChanged {
                device_id,
                connection_type: service.connection_type(token).await?,
            },
            ChangeType::Nickname => DeviceEvent::NicknameChanged {
                device_id,
                nickname: service.nickname(token).await?,
            },
            ChangeType::HeadsetPresence => DeviceEvent::HeadsetPresenceChanged {
                device_id,
                present: service.has_headset(token).await?,
            },
        };

        self.commit(epoch, || self.emit(event));
        Ok(())
    }

    pub fn handle_removed(&self, epoch: u64, token: &ControllerToken) {
        if self.rumble.cancel(token) {
            debug!(token = %token, "Cancelled rumble keep-alive for removed controller");
        }

        self.commit(epoch, || {
            if let Some(device_id) = self.map.remove_token(token) {
                info!(token = %token, device_id = %device_id, "Controller removed");
                self.emit(DeviceEvent::Removed { device_id });
            }
        });
    }
}
