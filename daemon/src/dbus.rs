//! D-Bus transport for the accessory pairing service
//!
//! Client side of the `io.padlink.Accessory1` interface exported by the
//! pairing service.
//!
//! ## Interface: io.padlink.Accessory1
//!
//! ### Methods:
//! - `RegisterListener() -> i` / `UnregisterListener(i) -> b`
//! - `GetInputDeviceId(s) -> i` - negative while no id is assigned
//! - `Rumble(s, i, i) -> b` - single command, capped at about one second
//! - `RumbleWithDuration(s, i, i, x) -> b` - duration in ms, capped at 1.5 s
//! - `GetCategory`, `GetChargingState`, `GetConnectionState`,
//!   `GetConnectionType` `(s) -> i` - raw enum codes
//! - `GetNickname(s) -> s`, `GetBatteryStatus(s) -> s` (`"<percent>;..."`)
//! - `Identify(s) -> b`, `HasHeadset(s) -> b`
//!
//! ### Signals:
//! - `DeviceAdded(token: s)`
//! - `DeviceChanged(token: s, change_type: i)`
//! - `DeviceRemoved(token: s)`

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use zbus::names::{BusName, WellKnownName};
use zbus::{fdo, proxy, Connection};

use crate::battery::parse_battery_percentage;
use crate::config::{BusKind, ServiceConfig};
use crate::service::{BindError, ControllerListener, ControllerService, ServiceBinder, ServiceError};
use crate::session::ServiceConnection;
use crate::types::{
    Category, ChargingState, ConnectionState, ConnectionType, ControllerToken, DeviceId,
    ListenerId,
};

/// D-Bus interface name
pub const DBUS_INTERFACE: &str = "io.padlink.Accessory1";

/// Default bus name of the pairing service
pub const DEFAULT_SERVICE_NAME: &str = "io.padlink.Accessory";

/// Default object path of the accessory interface
pub const DEFAULT_SERVICE_PATH: &str = "/io/padlink/Accessory";

#[proxy(
    interface = "io.padlink.Accessory1",
    default_service = "io.padlink.Accessory",
    default_path = "/io/padlink/Accessory"
)]
pub trait Accessory {
    fn register_listener(&self) -> zbus::Result<i32>;

    fn unregister_listener(&self, listener_id: i32) -> zbus::Result<bool>;

    fn get_input_device_id(&self, token: &str) -> zbus::Result<i32>;

    fn rumble(&self, token: &str, low_motor: i32, high_motor: i32) -> zbus::Result<bool>;

    fn rumble_with_duration(
        &self,
        token: &str,
        low_motor: i32,
        high_motor: i32,
        duration_ms: i64,
    ) -> zbus::Result<bool>;

    fn get_category(&self, token: &str) -> zbus::Result<i32>;

    fn get_nickname(&self, token: &str) -> zbus::Result<String>;

    fn get_battery_status(&self, token: &str) -> zbus::Result<String>;

    fn get_charging_state(&self, token: &str) -> zbus::Result<i32>;

    fn get_connection_state(&self, token: &str) -> zbus::Result<i32>;

    fn get_connection_type(&self, token: &str) -> zbus::Result<i32>;

    fn identify(&self, token: &str) -> zbus::Result<bool>;

    fn has_headset(&self, token: &str) -> zbus::Result<bool>;

    #[zbus(signal)]
    fn device_added(&self, token: String) -> zbus::Result<()>;

    #[zbus(signal)]
    fn device_changed(&self, token: String, change_type: i32) -> zbus::Result<()>;

    #[zbus(signal)]
    fn device_removed(&self, token: String) -> zbus::Result<()>;
}

// ============================================================================
// Signal decoding
// ============================================================================

/// Device notification decoded from a signal message
#[derive(Debug, Clone, PartialEq, Eq)]
enum RemoteSignal {
    Added(ControllerToken),
    Changed(ControllerToken, i32),
    Removed(ControllerToken),
}

impl RemoteSignal {
    fn from_message(msg: &zbus::Message) -> Option<Self> {
        let header = msg.header();
        let member = header.member()?;
        let body = msg.body();

        let decoded = match member.as_str() {
            "DeviceAdded" => body
                .deserialize::<(String,)>()
                .map(|(token,)| RemoteSignal::Added(token.into())),
            "DeviceChanged" => body
                .deserialize::<(String, i32)>()
                .map(|(token, change)| RemoteSignal::Changed(token.into(), change)),
            "DeviceRemoved" => body
                .deserialize::<(String,)>()
                .map(|(token,)| RemoteSignal::Removed(token.into())),
            _ => return None,
        };

        match decoded {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(error = %e, member = %member, "Malformed device signal");
                None
            }
        }
    }

    async fn deliver(self, listener: &dyn ControllerListener) {
        match self {
            RemoteSignal::Added(token) => listener.on_device_added(token).await,
            RemoteSignal::Changed(token, change) => listener.on_device_changed(token, change).await,
            RemoteSignal::Removed(token) => listener.on_device_removed(token).await,
        }
    }
}

fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ============================================================================
// Remote service
// ============================================================================

/// [`ControllerService`] backed by the pairing service's D-Bus interface
///
/// Each registered listener gets one forwarding task that receives every
/// accessory signal through a single subscription, so notifications reach
/// the listener in the order the bus delivered them.
pub struct DbusControllerService {
    proxy: AccessoryProxy<'static>,
    forwarders: Mutex<HashMap<ListenerId, JoinHandle<()>>>,
}

impl DbusControllerService {
    pub fn new(proxy: AccessoryProxy<'static>) -> Self {
        Self {
            proxy,
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    fn forwarders(&self) -> MutexGuard<'_, HashMap<ListenerId, JoinHandle<()>>> {
        match self.forwarders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Forwarder table lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Drop for DbusControllerService {
    fn drop(&mut self) {
        for (_, handle) in self.forwarders().drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ControllerService for DbusControllerService {
    async fn register_listener(
        &self,
        listener: Arc<dyn ControllerListener>,
    ) -> Result<ListenerId, ServiceError> {
        // Subscribe before registering so no notification slips through
        let signals = self.proxy.inner().receive_all_signals().await?;
        let listener_id = self.proxy.register_listener().await?;

        let handle = tokio::spawn(async move {
            tokio::pin!(signals);
            while let Some(msg) = signals.next().await {
                if let Some(signal) = RemoteSignal::from_message(&msg) {
                    tracing::trace!(?signal, "Delivering device signal");
                    signal.deliver(listener.as_ref()).await;
                }
            }
            tracing::debug!(listener_id, "Device signal stream ended");
        });

        if let Some(previous) = self.forwarders().insert(listener_id, handle) {
            previous.abort();
        }
        tracing::debug!(listener_id, "Forwarding device signals");
        Ok(listener_id)
    }

    async fn unregister_listener(&self, listener_id: ListenerId) -> Result<bool, ServiceError> {
        if let Some(handle) = self.forwarders().remove(&listener_id) {
            handle.abort();
        }
        Ok(self.proxy.unregister_listener(listener_id).await?)
    }

    async fn input_device_id(&self, token: &ControllerToken) -> Result<DeviceId, ServiceError> {
        let raw = self.proxy.get_input_device_id(token.as_str()).await?;
        Ok(DeviceId::new(raw))
    }

    async fn rumble(
        &self,
        token: &ControllerToken,
        low_motor: i32,
        high_motor: i32,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .proxy
            .rumble(token.as_str(), low_motor, high_motor)
            .await?)
    }

    async fn rumble_with_duration(
        &self,
        token: &ControllerToken,
        low_motor: i32,
        high_motor: i32,
        duration: Duration,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .proxy
            .rumble_with_duration(
                token.as_str(),
                low_motor,
                high_motor,
                duration_to_millis(duration),
            )
            .await?)
    }

    async fn category(&self, token: &ControllerToken) -> Result<Category, ServiceError> {
        let raw = self.proxy.get_category(token.as_str()).await?;
        Ok(Category::from_raw(raw))
    }

    async fn nickname(&self, token: &ControllerToken) -> Result<String, ServiceError> {
        Ok(self.proxy.get_nickname(token.as_str()).await?)
    }

    async fn battery_percentage(&self, token: &ControllerToken) -> Result<i32, ServiceError> {
        let status = self.proxy.get_battery_status(token.as_str()).await?;
        Ok(parse_battery_percentage(&status)?)
    }

    async fn charging_state(
        &self,
        token: &ControllerToken,
    ) -> Result<ChargingState, ServiceError> {
        let raw = self.proxy.get_charging_state(token.as_str()).await?;
        Ok(ChargingState::from_raw(raw))
    }

    async fn connection_state(
        &self,
        token: &ControllerToken,
    ) -> Result<ConnectionState, ServiceError> {
        let raw = self.proxy.get_connection_state(token.as_str()).await?;
        Ok(ConnectionState::from_raw(raw))
    }

    async fn connection_type(
        &self,
        token: &ControllerToken,
    ) -> Result<ConnectionType, ServiceError> {
        let raw = self.proxy.get_connection_type(token.as_str()).await?;
        Ok(ConnectionType::from_raw(raw))
    }

    async fn identify(&self, token: &ControllerToken) -> Result<bool, ServiceError> {
        Ok(self.proxy.identify(token.as_str()).await?)
    }

    async fn has_headset(&self, token: &ControllerToken) -> Result<bool, ServiceError> {
        Ok(self.proxy.has_headset(token.as_str()).await?)
    }
}

// ============================================================================
// Binder
// ============================================================================

/// Fold a bus daemon error into a bind outcome
///
/// Unknown or unactivatable services reject the bind; access denial is a
/// permission error.
fn bind_outcome(err: fdo::Error, service: &str) -> Result<bool, BindError> {
    match err {
        fdo::Error::AccessDenied(_) => Err(BindError::PermissionDenied {
            service: service.to_string(),
        }),
        fdo::Error::ServiceUnknown(msg) | fdo::Error::SpawnServiceNotFound(msg) => {
            tracing::warn!(service, reason = %msg, "Accessory service not available");
            Ok(false)
        }
        other => Err(BindError::Transport(other.into())),
    }
}

/// Binds to the pairing service over the session or system bus
///
/// After an accepted bind a watcher task reports the connection, then
/// reports a disconnect once when the service's bus name loses its owner.
pub struct DbusBinder {
    config: ServiceConfig,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl DbusBinder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            watcher: Mutex::new(None),
        }
    }

    fn watcher(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.watcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn open_bus(&self) -> zbus::Result<Connection> {
        match self.config.bus {
            BusKind::Session => Connection::session().await,
            BusKind::System => Connection::system().await,
        }
    }

    /// Make sure the service name has an owner, activating it if needed
    async fn ensure_running(
        &self,
        bus: &Connection,
        name: &WellKnownName<'static>,
    ) -> Result<bool, BindError> {
        let service = self.config.name.as_str();
        let daemon = match fdo::DBusProxy::new(bus).await {
            Ok(daemon) => daemon,
            Err(e) => return Err(BindError::Transport(e.into())),
        };

        match daemon.name_has_owner(BusName::from(name.clone())).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => return bind_outcome(e, service),
        }

        tracing::info!(service, "Accessory service not running, requesting activation");
        match daemon.start_service_by_name(name.clone(), 0).await {
            Ok(reply) => {
                tracing::debug!(service, ?reply, "Service activation requested");
                Ok(true)
            }
            Err(e) => bind_outcome(e, service),
        }
    }

    async fn build_proxy(&self, bus: &Connection) -> zbus::Result<AccessoryProxy<'static>> {
        AccessoryProxy::builder(bus)
            .destination(self.config.name.clone())?
            .path(self.config.path.clone())?
            .cache_properties(zbus::proxy::CacheProperties::No)
            .build()
            .await
    }
}

#[async_trait]
impl ServiceBinder for DbusBinder {
    async fn bind(&self, connection: ServiceConnection) -> Result<bool, BindError> {
        let name = WellKnownName::try_from(self.config.name.clone())
            .map_err(|e| ServiceError::Protocol(format!("invalid service name: {}", e)))?;

        let bus = self.open_bus().await.map_err(ServiceError::from)?;
        tracing::debug!(bus = ?self.config.bus, service = %name, "Connected to message bus");

        if !self.ensure_running(&bus, &name).await? {
            return Ok(false);
        }

        let proxy = self.build_proxy(&bus).await.map_err(ServiceError::from)?;
        let owner_changes = proxy
            .inner()
            .receive_owner_changed()
            .await
            .map_err(ServiceError::from)?;

        let service = Arc::new(DbusControllerService::new(proxy));
        let handle = tokio::spawn(async move {
            connection.connected(service).await;

            tokio::pin!(owner_changes);
            while let Some(owner) = owner_changes.next().await {
                if owner.is_none() {
                    break;
                }
                tracing::debug!(?owner, "Accessory service owner changed");
            }
            connection.disconnected().await;
        });

        if let Some(previous) = self.watcher().replace(handle) {
            previous.abort();
        }
        Ok(true)
    }

    async fn unbind(&self) {
        if let Some(handle) = self.watcher().take() {
            handle.abort();
            tracing::debug!("Stopped accessory service watcher");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(member: &str) -> zbus::message::Builder<'static> {
        zbus::Message::signal(DEFAULT_SERVICE_PATH, DBUS_INTERFACE, member.to_string()).unwrap()
    }

    #[test]
    fn test_dbus_constants() {
        assert_eq!(DBUS_INTERFACE, "io.padlink.Accessory1");
        assert_eq!(DEFAULT_SERVICE_PATH, "/io/padlink/Accessory");
        assert_eq!(DEFAULT_SERVICE_NAME, "io.padlink.Accessory");
    }

    #[test]
    fn test_decode_device_signals() {
        let msg = signal("DeviceAdded").build(&("pad-1",)).unwrap();
        assert_eq!(
            RemoteSignal::from_message(&msg),
            Some(RemoteSignal::Added("pad-1".into()))
        );

        let msg = signal("DeviceChanged").build(&("pad-1", 7i32)).unwrap();
        assert_eq!(
            RemoteSignal::from_message(&msg),
            Some(RemoteSignal::Changed("pad-1".into(), 7))
        );

        let msg = signal("DeviceRemoved").build(&("pad-1",)).unwrap();
        assert_eq!(
            RemoteSignal::from_message(&msg),
            Some(RemoteSignal::Removed("pad-1".into()))
        );
    }

    #[test]
    fn test_decode_ignores_unknown_and_malformed() {
        let msg = signal("SomethingElse").build(&("pad-1",)).unwrap();
        assert_eq!(RemoteSignal::from_message(&msg), None);

        // DeviceChanged without its change code
        let msg = signal("DeviceChanged").build(&("pad-1",)).unwrap();
        assert_eq!(RemoteSignal::from_message(&msg), None);
    }

    #[test]
    fn test_bind_outcome() {
        let denied = bind_outcome(fdo::Error::AccessDenied("nope".into()), "svc");
        assert!(matches!(denied, Err(BindError::PermissionDenied { service }) if service == "svc"));

        let unknown = bind_outcome(fdo::Error::ServiceUnknown("gone".into()), "svc");
        assert!(matches!(unknown, Ok(false)));

        let other = bind_outcome(fdo::Error::Failed("boom".into()), "svc");
        assert!(matches!(other, Err(BindError::Transport(_))));
    }

    #[test]
    fn test_duration_to_millis() {
        assert_eq!(duration_to_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_to_millis(Duration::MAX), i64::MAX);
    }
}
