//! Session controller and consumer facade
//!
//! [`AccessoryManager`] owns the connection lifecycle with the remote
//! accessory service:
//!
//! ```text
//! Disconnected --start()--> Connecting --connected()--> Connected
//!       ^                        |                          |
//!       +------ stop() / rejected bind / disconnected() ----+
//! ```
//!
//! It also exposes the device-id based query and command surface consumers
//! use. Every query maps the device id to a controller token first; an
//! unrecognized device or a failed remote call yields the sentinel value
//! (`Unknown`, `-1`, `false`, `None`).

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::listener::DeviceListener;
use crate::reconciler::Reconciler;
use crate::rumble::RumbleScheduler;
use crate::service::{BindError, ControllerListener, ControllerService, ServiceBinder, ServiceError};
use crate::types::{
    Category, ChargingState, ConnectionState, ConnectionType, ControllerToken, DeviceId,
    ListenerId,
};

/// Lifecycle of the binding to the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Default)]
struct Session {
    state: SessionState,
    /// Bumped on every start/stop so callbacks from an older binding are ignored
    epoch: u64,
    bound: bool,
    service: Option<Arc<dyn ControllerService>>,
    listener_id: ListenerId,
}

struct ManagerInner {
    binder: Arc<dyn ServiceBinder>,
    session: Mutex<Session>,
    reconciler: Reconciler,
    rumble: Arc<RumbleScheduler>,
}

impl ManagerInner {
    fn session(&self) -> MutexGuard<'_, Session> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Session lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Remote handle if `epoch` is still the live, connected binding
    fn live_service(&self, epoch: u64) -> Option<Arc<dyn ControllerService>> {
        let session = self.session();
        if session.epoch != epoch || session.state != SessionState::Connected {
            return None;
        }
        session.service.clone()
    }

    async fn on_connected(self: Arc<Self>, epoch: u64, service: Arc<dyn ControllerService>) {
        {
            let mut session = self.session();
            if session.epoch != epoch {
                debug!(epoch, "Ignoring connection for a superseded binding");
                return;
            }
            session.service = Some(Arc::clone(&service));
            session.state = SessionState::Connected;
        }
        info!("Accessory service connected");

        let callbacks: Arc<dyn ControllerListener> = Arc::new(SessionCallbacks {
            inner: Arc::downgrade(&self),
            epoch,
        });

        let listener_id = match service.register_listener(callbacks).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "Failed to register device listener");
                return;
            }
        };

        let still_live = {
            let mut session = self.session();
            let live = session.epoch == epoch && session.state == SessionState::Connected;
            if live {
                session.listener_id = listener_id;
            }
            live
        };

        if still_live {
            info!(listener_id, "Device listener registered");
        } else {
            // stop() ran while the registration was in flight
            debug!(listener_id, "Dropping listener registered for a stopped session");
            if let Err(e) = service.unregister_listener(listener_id).await {
                warn!(error = %e, listener_id, "Failed to unregister stale listener");
            }
        }
    }

    async fn on_disconnected(&self, epoch: u64) {
        {
            let mut session = self.session();
            if session.epoch != epoch || session.service.is_none() {
                return;
            }
            session.service = None;
            session.listener_id = 0;
            session.state = SessionState::Disconnected;
        }
        warn!("Accessory service disconnected, call start() to reconnect");

        self.reconciler.clear();
        let cancelled = self.rumble.cancel_all();
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "Cancelled rumble keep-alives");
        }
    }
}

/// Binding callbacks handed to the [`ServiceBinder`]
///
/// Cheap to clone. Holds only a weak reference to the manager, and belongs to
/// one `start()` call: once the session is stopped or restarted, its
/// callbacks do nothing.
#[derive(Clone)]
pub struct ServiceConnection {
    inner: Weak<ManagerInner>,
    epoch: u64,
}

impl ServiceConnection {
    /// The remote service is reachable through `service`
    pub async fn connected(&self, service: Arc<dyn ControllerService>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_connected(self.epoch, service).await;
        }
    }

    /// The remote service went away
    pub async fn disconnected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_disconnected(self.epoch).await;
        }
    }
}

/// Device notifications from the remote, routed into the reconciler
struct SessionCallbacks {
    inner: Weak<ManagerInner>,
    epoch: u64,
}

/// A notification accepted for the live session
struct Live {
    inner: Arc<ManagerInner>,
    service: Arc<dyn ControllerService>,
    /// Reconciler generation; a stop or disconnect after this point voids the
    /// handler's writes
    epoch: u64,
}

impl SessionCallbacks {
    fn live(&self) -> Option<Live> {
        let inner = self.inner.upgrade()?;
        // Read before the session check: stop() bumps the session epoch first
        // and clears the reconciler second
        let epoch = inner.reconciler.epoch();
        let service = inner.live_service(self.epoch)?;
        Some(Live {
            inner,
            service,
            epoch,
        })
    }
}

#[async_trait]
impl ControllerListener for SessionCallbacks {
    async fn on_device_added(&self, token: ControllerToken) {
        match self.live() {
            Some(live) => {
                live.inner
                    .reconciler
                    .handle_added(live.epoch, live.service.as_ref(), &token)
                    .await
            }
            None => debug!(token = %token, "Dropping device-added for inactive session"),
        }
    }

    async fn on_device_changed(&self, token: ControllerToken, change_type: i32) {
        match self.live() {
            Some(live) => {
                live.inner
                    .reconciler
                    .handle_changed(live.epoch, live.service.as_ref(), &token, change_type)
                    .await
            }
            None => debug!(token = %token, change_type, "Dropping device-changed for inactive session"),
        }
    }

    async fn on_device_removed(&self, token: ControllerToken) {
        match self.live() {
            Some(live) => live.inner.reconciler.handle_removed(live.epoch, &token),
            None => debug!(token = %token, "Dropping device-removed for inactive session"),
        }
    }
}

/// Client-side manager for accessory pairing service controllers
#[derive(Clone)]
pub struct AccessoryManager {
    inner: Arc<ManagerInner>,
}

impl AccessoryManager {
    /// Create a manager using the default 500 ms rumble keep-alive
    pub fn new(binder: Arc<dyn ServiceBinder>) -> Self {
        Self::with_rumble_scheduler(binder, RumbleScheduler::default())
    }

    pub fn with_rumble_scheduler(binder: Arc<dyn ServiceBinder>, rumble: RumbleScheduler) -> Self {
        let rumble = Arc::new(rumble);
        Self {
            inner: Arc::new(ManagerInner {
                binder,
                session: Mutex::new(Session::default()),
                reconciler: Reconciler::new(Arc::clone(&rumble)),
                rumble,
            }),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Request a binding to the remote service
    ///
    /// Returns true once the request is accepted; the connection itself
    /// completes asynchronously. A rejected or forbidden bind returns false
    /// after releasing the binding again. Calling it while connecting or
    /// connected keeps the current binding and returns true.
    pub async fn start(&self) -> bool {
        let (connection, stale_binding) = {
            let mut session = self.inner.session();
            if session.state != SessionState::Disconnected {
                debug!(state = ?session.state, "Session already started");
                return true;
            }
            session.epoch += 1;
            session.state = SessionState::Connecting;
            let connection = ServiceConnection {
                inner: Arc::downgrade(&self.inner),
                epoch: session.epoch,
            };
            // Left behind by a remote disconnect
            (connection, std::mem::take(&mut session.bound))
        };
        let epoch = connection.epoch;

        if stale_binding {
            debug!("Releasing binding from the lost connection");
            self.inner.binder.unbind().await;
        }

        let result = self.inner.binder.bind(connection).await;
        let accepted = match result {
            Ok(true) => true,
            Ok(false) => {
                warn!("Bind request rejected by accessory service");
                false
            }
            Err(BindError::PermissionDenied { service }) => {
                error!(service = %service, "Not permitted to bind to accessory service");
                false
            }
            Err(e) => {
                error!(error = %e, "Failed to bind to accessory service");
                false
            }
        };

        if accepted {
            let mut session = self.inner.session();
            if session.epoch == epoch {
                session.bound = true;
            }
            info!("Bind request accepted");
            return true;
        }

        // The binding must be released even when it was never established
        self.inner.binder.unbind().await;
        let mut session = self.inner.session();
        if session.epoch == epoch && session.state == SessionState::Connecting {
            session.state = SessionState::Disconnected;
        }
        false
    }

    /// Tear the session down; safe to call in any state
    pub async fn stop(&self) {
        let (service, listener_id, bound) = {
            let mut session = self.inner.session();
            session.epoch += 1;
            session.state = SessionState::Disconnected;
            (
                session.service.take(),
                std::mem::take(&mut session.listener_id),
                std::mem::take(&mut session.bound),
            )
        };

        self.inner.reconciler.clear();
        self.inner.rumble.stop_all(service.as_deref()).await;

        if listener_id != 0 {
            if let Some(service) = &service {
                match service.unregister_listener(listener_id).await {
                    Ok(true) => debug!(listener_id, "Device listener unregistered"),
                    Ok(false) => warn!(listener_id, "Service did not know our listener"),
                    Err(e) => warn!(error = %e, listener_id, "Failed to unregister device listener"),
                }
            }
        }

        if bound || service.is_some() {
            self.inner.binder.unbind().await;
            info!("Accessory service unbound");
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.session().state
    }

    /// Listener id of the current registration (0 when not registered)
    pub fn listener_id(&self) -> ListenerId {
        self.inner.session().listener_id
    }

    /// Install the consumer event sink; `None` discards events
    pub fn set_device_listener(&self, listener: Option<Arc<dyn DeviceListener>>) {
        self.inner.reconciler.set_listener(listener);
    }

    // ========================================================================
    // Device queries and commands
    // ========================================================================

    pub fn is_recognized_device(&self, device_id: DeviceId) -> bool {
        self.inner.reconciler.map().contains_device(device_id)
    }

    /// Currently mapped device ids
    pub fn recognized_devices(&self) -> Vec<DeviceId> {
        self.inner.reconciler.map().device_ids()
    }

    fn resolve(&self, device_id: DeviceId) -> Option<(Arc<dyn ControllerService>, ControllerToken)> {
        let token = self.inner.reconciler.token_for(device_id)?;
        let service = self.inner.session().service.clone()?;
        Some((service, token))
    }

    async fn with_device<T, F, Fut>(&self, device_id: DeviceId, what: &str, fallback: T, call: F) -> T
    where
        F: FnOnce(Arc<dyn ControllerService>, ControllerToken) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let Some((service, token)) = self.resolve(device_id) else {
            debug!(device_id = %device_id, what, "Unrecognized device");
            return fallback;
        };

        match call(service, token).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, device_id = %device_id, what, "Remote call failed");
                fallback
            }
        }
    }

    pub async fn category(&self, device_id: DeviceId) -> Category {
        self.with_device(device_id, "category", Category::Unknown, |svc, token| async move {
            svc.category(&token).await
        })
        .await
    }

    /// Battery percentage, or -1
    pub async fn battery_percentage(&self, device_id: DeviceId) -> i32 {
        self.with_device(device_id, "battery", -1, |svc, token| async move {
            svc.battery_percentage(&token).await
        })
        .await
    }

    pub async fn charging_state(&self, device_id: DeviceId) -> ChargingState {
        self.with_device(
            device_id,
            "charging_state",
            ChargingState::Unknown,
            |svc, token| async move { svc.charging_state(&token).await },
        )
        .await
    }

    pub async fn connection_state(&self, device_id: DeviceId) -> ConnectionState {
        self.with_device(
            device_id,
            "connection_state",
            ConnectionState::Unknown,
            |svc, token| async move { svc.connection_state(&token).await },
        )
        .await
    }

    pub async fn connection_type(&self, device_id: DeviceId) -> ConnectionType {
        self.with_device(
            device_id,
            "connection_type",
            ConnectionType::Unknown,
            |svc, token| async move { svc.connection_type(&token).await },
        )
        .await
    }

    pub async fn nickname(&self, device_id: DeviceId) -> Option<String> {
        self.with_device(device_id, "nickname", None, |svc, token| async move {
            svc.nickname(&token).await.map(Some)
        })
        .await
    }

    /// Ask the controller to identify itself (e.g. blink or buzz)
    pub async fn identify(&self, device_id: DeviceId) -> bool {
        self.with_device(device_id, "identify", false, |svc, token| async move {
            svc.identify(&token).await
        })
        .await
    }

    pub async fn has_headset(&self, device_id: DeviceId) -> bool {
        self.with_device(device_id, "has_headset", false, |svc, token| async move {
            svc.has_headset(&token).await
        })
        .await
    }

    /// Rumble until told otherwise; `0, 0` stops
    ///
    /// Motor intensities are conventionally 0-65535 and passed through as-is.
    pub async fn rumble(&self, device_id: DeviceId, low_motor: i32, high_motor: i32) -> bool {
        let Some((service, token)) = self.resolve(device_id) else {
            debug!(device_id = %device_id, "Rumble for unrecognized device");
            return false;
        };
        self.inner
            .rumble
            .rumble(service, &token, low_motor, high_motor)
            .await
    }

    /// One-shot rumble with an explicit duration (capped remotely)
    ///
    /// Replaces any ongoing keep-alive rumble for the device.
    pub async fn rumble_with_duration(
        &self,
        device_id: DeviceId,
        low_motor: i32,
        high_motor: i32,
        duration: Duration,
    ) -> bool {
        if let Some(token) = self.inner.reconciler.token_for(device_id) {
            self.inner.rumble.cancel(&token);
        }
        self.with_device(device_id, "rumble_with_duration", false, |svc, token| async move {
            svc.rumble_with_duration(&token, low_motor, high_motor, duration)
                .await
        })
        .await
    }

    /// Number of devices with an active rumble keep-alive
    pub fn active_rumbles(&self) -> usize {
        self.inner.rumble.active_count()
    }
}
