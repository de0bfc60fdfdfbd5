//! Test utilities
//!
//! In-memory stand-ins for the remote accessory service and the platform
//! binder, scriptable from tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::listener::{DeviceEvent, DeviceListener};
use crate::service::{
    BindError, ControllerListener, ControllerService, ServiceBinder, ServiceError,
};
use crate::session::ServiceConnection;
use crate::types::{
    Category, ChargingState, ConnectionState, ConnectionType, ControllerToken, DeviceId,
    ListenerId,
};

#[derive(Default)]
struct FakeState {
    device_ids: HashMap<String, i32>,
    battery: HashMap<String, i32>,
    charging: HashMap<String, ChargingState>,
    connection_state: HashMap<String, ConnectionState>,
    connection_type: HashMap<String, ConnectionType>,
    category: HashMap<String, Category>,
    nicknames: HashMap<String, String>,
    headset: HashMap<String, bool>,
    rumble_log: Vec<(String, i32, i32)>,
    timed_rumble_log: Vec<(String, i32, i32, Duration)>,
    identify_log: Vec<String>,
    fail_rumble_from: Option<usize>,
    reject_rumble: bool,
    fail_queries: bool,
    fail_device_id_queries: bool,
    fail_register: bool,
    held: HashSet<&'static str>,
    waiting: usize,
    listeners: HashMap<ListenerId, Arc<dyn ControllerListener>>,
    next_listener_id: ListenerId,
    unregistered: Vec<ListenerId>,
}

/// Scriptable in-memory accessory service
pub struct FakeControllerService {
    state: Mutex<FakeState>,
    /// `true` while held calls may proceed
    gate: watch::Sender<bool>,
}

impl Default for FakeControllerService {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeControllerService {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(FakeState::default()),
            gate,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_device_id(&self, token: &str, id: i32) {
        self.state().device_ids.insert(token.to_string(), id);
    }

    pub fn set_battery(&self, token: &str, percentage: i32) {
        self.state().battery.insert(token.to_string(), percentage);
    }

    pub fn set_charging(&self, token: &str, state: ChargingState) {
        self.state().charging.insert(token.to_string(), state);
    }

    pub fn set_connection_state(&self, token: &str, state: ConnectionState) {
        self.state().connection_state.insert(token.to_string(), state);
    }

    pub fn set_connection_type(&self, token: &str, connection_type: ConnectionType) {
        self.state()
            .connection_type
            .insert(token.to_string(), connection_type);
    }

    pub fn set_category(&self, token: &str, category: Category) {
        self.state().category.insert(token.to_string(), category);
    }

    pub fn set_nickname(&self, token: &str, nickname: &str) {
        self.state()
            .nicknames
            .insert(token.to_string(), nickname.to_string());
    }

    pub fn set_headset(&self, token: &str, present: bool) {
        self.state().headset.insert(token.to_string(), present);
    }

    /// Make the n-th (1-based) and every later rumble call fail
    pub fn fail_rumble_from_call(&self, call: usize) {
        self.state().fail_rumble_from = Some(call);
    }

    /// Make rumble calls return `false` instead of failing
    pub fn reject_rumble(&self, reject: bool) {
        self.state().reject_rumble = reject;
    }

    /// Make every property query (and device id lookup) fail
    pub fn fail_queries(&self, fail: bool) {
        self.state().fail_queries = fail;
    }

    /// Make only device id lookups fail
    pub fn fail_device_id_queries(&self, fail: bool) {
        self.state().fail_device_id_queries = fail;
    }

    /// Block calls of `op` ("input_device_id", "battery", "rumble") until
    /// [`release`](Self::release)
    pub fn hold(&self, op: &'static str) {
        self.state().held.insert(op);
        self.gate.send_replace(false);
    }

    /// Let every held call continue
    pub fn release(&self) {
        self.state().held.clear();
        self.gate.send_replace(true);
    }

    /// Wait until `count` calls are parked on the gate
    pub async fn wait_for_held(&self, count: usize) {
        while self.state().waiting < count {
            tokio::task::yield_now().await;
        }
    }

    async fn pass(&self, op: &'static str) {
        {
            let mut state = self.state();
            if !state.held.contains(op) {
                return;
            }
            state.waiting += 1;
        }
        let mut open = self.gate.subscribe();
        let _ = open.wait_for(|open| *open).await;
        self.state().waiting -= 1;
    }

    pub fn fail_register(&self, fail: bool) {
        self.state().fail_register = fail;
    }

    pub fn rumble_log(&self) -> Vec<(String, i32, i32)> {
        self.state().rumble_log.clone()
    }

    pub fn rumble_calls(&self, token: &str) -> usize {
        self.state()
            .rumble_log
            .iter()
            .filter(|(t, _, _)| t == token)
            .count()
    }

    pub fn timed_rumble_log(&self) -> Vec<(String, i32, i32, Duration)> {
        self.state().timed_rumble_log.clone()
    }

    pub fn identify_log(&self) -> Vec<String> {
        self.state().identify_log.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    pub fn unregistered(&self) -> Vec<ListenerId> {
        self.state().unregistered.clone()
    }

    /// Snapshot of the currently registered listeners
    pub fn listeners(&self) -> Vec<Arc<dyn ControllerListener>> {
        self.state().listeners.values().cloned().collect()
    }

    /// Push a device-added notification to every registered listener
    pub async fn push_added(&self, token: &str) {
        for listener in self.listeners() {
            listener.on_device_added(ControllerToken::from(token)).await;
        }
    }

    pub async fn push_changed(&self, token: &str, change_type: i32) {
        for listener in self.listeners() {
            listener
                .on_device_changed(ControllerToken::from(token), change_type)
                .await;
        }
    }

    pub async fn push_removed(&self, token: &str) {
        for listener in self.listeners() {
            listener.on_device_removed(ControllerToken::from(token)).await;
        }
    }

    fn query<T: Clone + Default>(
        &self,
        pick: impl FnOnce(&FakeState) -> Option<T>,
    ) -> Result<T, ServiceError> {
        let state = self.state();
        if state.fail_queries {
            return Err(ServiceError::Protocol("scripted failure".to_string()));
        }
        Ok(pick(&state).unwrap_or_default())
    }
}

#[async_trait]
impl ControllerService for FakeControllerService {
    async fn register_listener(
        &self,
        listener: Arc<dyn ControllerListener>,
    ) -> Result<ListenerId, ServiceError> {
        let mut state = self.state();
        if state.fail_register {
            return Err(ServiceError::NotConnected);
        }
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        state.listeners.insert(id, listener);
        Ok(id)
    }

    async fn unregister_listener(&self, listener_id: ListenerId) -> Result<bool, ServiceError> {
        let mut state = self.state();
        state.unregistered.push(listener_id);
        Ok(state.listeners.remove(&listener_id).is_some())
    }

    async fn input_device_id(&self, token: &ControllerToken) -> Result<DeviceId, ServiceError> {
        self.pass("input_device_id").await;
        let state = self.state();
        if state.fail_queries || state.fail_device_id_queries {
            return Err(ServiceError::Protocol("scripted failure".to_string()));
        }
        Ok(DeviceId::new(
            state.device_ids.get(token.as_str()).copied().unwrap_or(-1),
        ))
    }

    async fn rumble(
        &self,
        token: &ControllerToken,
        low_motor: i32,
        high_motor: i32,
    ) -> Result<bool, ServiceError> {
        self.pass("rumble").await;
        let mut state = self.state();
        state
            .rumble_log
            .push((token.to_string(), low_motor, high_motor));
        let call = state.rumble_log.len();
        if matches!(state.fail_rumble_from, Some(from) if call >= from) {
            return Err(ServiceError::Protocol("scripted rumble failure".to_string()));
        }
        Ok(!state.reject_rumble)
    }

    async fn rumble_with_duration(
        &self,
        token: &ControllerToken,
        low_motor: i32,
        high_motor: i32,
        duration: Duration,
    ) -> Result<bool, ServiceError> {
        self.state()
            .timed_rumble_log
            .push((token.to_string(), low_motor, high_motor, duration));
        Ok(true)
    }

    async fn category(&self, token: &ControllerToken) -> Result<Category, ServiceError> {
        self.query(|s| s.category.get(token.as_str()).copied())
    }

    async fn nickname(&self, token: &ControllerToken) -> Result<String, ServiceError> {
        self.query(|s| s.nicknames.get(token.as_str()).cloned())
    }

    async fn battery_percentage(&self, token: &ControllerToken) -> Result<i32, ServiceError> {
        self.pass("battery").await;
        self.query(|s| s.battery.get(token.as_str()).copied())
    }

    async fn charging_state(
        &self,
        token: &ControllerToken,
    ) -> Result<ChargingState, ServiceError> {
        self.query(|s| s.charging.get(token.as_str()).copied())
    }

    async fn connection_state(
        &self,
        token: &ControllerToken,
    ) -> Result<ConnectionState, ServiceError> {
        self.query(|s| s.connection_state.get(token.as_str()).copied())
    }

    async fn connection_type(
        &self,
        token: &ControllerToken,
    ) -> Result<ConnectionType, ServiceError> {
        self.query(|s| s.connection_type.get(token.as_str()).copied())
    }

    async fn identify(&self, token: &ControllerToken) -> Result<bool, ServiceError> {
        let mut state = self.state();
        if state.fail_queries {
            return Err(ServiceError::Protocol("scripted failure".to_string()));
        }
        state.identify_log.push(token.to_string());
        Ok(true)
    }

    async fn has_headset(&self, token: &ControllerToken) -> Result<bool, ServiceError> {
        self.query(|s| s.headset.get(token.as_str()).copied())
    }
}

// ============================================================================
// Binder
// ============================================================================

/// How [`FakeBinder::bind`] answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Accept,
    Reject,
    PermissionDenied,
}

struct BinderState {
    outcome: BindOutcome,
    connection: Option<ServiceConnection>,
    binds: usize,
    unbinds: usize,
}

/// Binder that hands out a [`FakeControllerService`] when told to
pub struct FakeBinder {
    state: Mutex<BinderState>,
}

impl FakeBinder {
    pub fn new(outcome: BindOutcome) -> Self {
        Self {
            state: Mutex::new(BinderState {
                outcome,
                connection: None,
                binds: 0,
                unbinds: 0,
            }),
        }
    }

    pub fn set_outcome(&self, outcome: BindOutcome) {
        self.state.lock().unwrap().outcome = outcome;
    }

    pub fn binds(&self) -> usize {
        self.state.lock().unwrap().binds
    }

    pub fn unbinds(&self) -> usize {
        self.state.lock().unwrap().unbinds
    }

    fn connection(&self) -> ServiceConnection {
        self.state
            .lock()
            .unwrap()
            .connection
            .clone()
            .expect("bind() has not been called")
    }

    /// Complete the pending binding with `service`
    pub async fn connect(&self, service: Arc<FakeControllerService>) {
        self.connection().connected(service).await;
    }

    /// Report the remote service as gone
    pub async fn disconnect(&self) {
        self.connection().disconnected().await;
    }
}

#[async_trait]
impl ServiceBinder for FakeBinder {
    async fn bind(&self, connection: ServiceConnection) -> Result<bool, BindError> {
        let mut state = self.state.lock().unwrap();
        state.binds += 1;
        state.connection = Some(connection);
        match state.outcome {
            BindOutcome::Accept => Ok(true),
            BindOutcome::Reject => Ok(false),
            BindOutcome::PermissionDenied => Err(BindError::PermissionDenied {
                service: "fake".to_string(),
            }),
        }
    }

    async fn unbind(&self) {
        self.state.lock().unwrap().unbinds += 1;
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Listener that records every event it sees
#[derive(Default, Clone)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<DeviceEvent>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<DeviceEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl DeviceListener for RecordingListener {
    fn on_event(&self, event: DeviceEvent) {
        self.events.lock().unwrap().push(event);
    }
}
