//! C5: the device object.
//!
//! One per logical device (including the synthetic "system device"). Owns
//! its normalised catalog and arbitrates subscription lifecycle with the
//! controller. Holds a `Weak` back-reference to its controller — a
//! lookup relation for sending, never an ownership edge (see
//! `DESIGN.md`: back references / cyclic event wiring).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use roomctl_api::Deferred;

use crate::controller::ControllerInner;
use crate::driver::NormalizedDriver;
use crate::error::CoreError;
use crate::events::{EventBus, NamedEvent};
use crate::model::{CommandRecord, NormalizedValue, StateRecord};
use crate::protocol::{self, MacroAction};

/// Emitted per-device whenever an inbound state change is applied.
#[derive(Debug, Clone, Serialize)]
pub struct StateChangedEvent {
    pub id: String,
    pub key: String,
    pub name: String,
    pub value: String,
    pub normalized_value: NormalizedValue,
}

impl NamedEvent for StateChangedEvent {
    fn event_name(&self) -> &'static str {
        "STATE_CHANGED"
    }

    fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

struct PendingWait {
    expected: HashSet<String>,
    observed: HashMap<String, String>,
    completion: Deferred<HashMap<String, String>>,
}

/// Device identity + metadata as reported during enumeration.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub driver_id: Option<String>,
    pub driver_version: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub is_system_device: bool,
}

struct DeviceState {
    info: Mutex<DeviceInfo>,
    driver_error: Mutex<Option<String>>,
    states_by_id: DashMap<String, StateRecord>,
    states_by_name: DashMap<String, String>,
    commands_by_id: DashMap<String, CommandRecord>,
    commands_by_name: DashMap<String, String>,
    watch_requested: AtomicBool,
    controller: Weak<ControllerInner>,
    events: EventBus<StateChangedEvent>,
    states_ready: Deferred<()>,
    pending: Mutex<Vec<PendingWait>>,
}

/// A logical device exposed by the controller.
#[derive(Clone)]
pub struct Device {
    inner: std::sync::Arc<DeviceState>,
}

impl Device {
    pub(crate) fn new(info: DeviceInfo, controller: Weak<ControllerInner>) -> Self {
        Self {
            inner: std::sync::Arc::new(DeviceState {
                info: Mutex::new(info),
                driver_error: Mutex::new(None),
                states_by_id: DashMap::new(),
                states_by_name: DashMap::new(),
                commands_by_id: DashMap::new(),
                commands_by_name: DashMap::new(),
                watch_requested: AtomicBool::new(false),
                controller,
                events: EventBus::new(),
                states_ready: Deferred::new(),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> String {
        self.inner.info.lock().unwrap_or_else(|e| e.into_inner()).id.clone()
    }

    #[must_use]
    pub fn is_system_device(&self) -> bool {
        self.inner
            .info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_system_device
    }

    #[must_use]
    pub fn info(&self) -> DeviceInfo {
        self.inner.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Refresh identity metadata on re-enumeration (e.g. after a
    /// `system_state_message` sync cycle). Never replaces the device
    /// itself, preserving subscriptions and catalog identity.
    pub(crate) fn update_info(&self, info: DeviceInfo) {
        *self.inner.info.lock().unwrap_or_else(|e| e.into_inner()) = info;
    }

    /// Apply a freshly normalised driver to this device's catalog,
    /// flattening every category into one flat by-id/by-name index.
    pub(crate) fn apply_driver(&self, driver: &NormalizedDriver) {
        self.inner.states_by_id.clear();
        self.inner.states_by_name.clear();
        self.inner.commands_by_id.clear();
        self.inner.commands_by_name.clear();
        *self.inner.driver_error.lock().unwrap_or_else(|e| e.into_inner()) = None;

        for category in driver.values() {
            for (id, state) in &category.states {
                self.inner.states_by_name.insert(state.name.clone(), id.clone());
                self.inner.states_by_id.insert(id.clone(), state.clone());
            }
            for command in &category.commands {
                self.inner
                    .commands_by_name
                    .insert(command.name.clone(), command.id.clone());
                self.inner.commands_by_id.insert(command.id.clone(), command.clone());
            }
        }
    }

    /// Record a driver-fetch failure. The device stays usable for
    /// metadata only; this never fails the overall enumeration.
    pub(crate) fn set_driver_error(&self, message: String) {
        *self.inner.driver_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }

    #[must_use]
    pub fn driver_error(&self) -> Option<String> {
        self.inner.driver_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn resolve_state_id(&self, key_or_name: &str) -> Option<String> {
        if self.inner.states_by_id.contains_key(key_or_name) {
            return Some(key_or_name.to_owned());
        }
        self.inner.states_by_name.get(key_or_name).map(|r| r.value().clone())
    }

    fn resolve_command_id(&self, key_or_name: &str) -> Option<String> {
        if self.inner.commands_by_id.contains_key(key_or_name) {
            return Some(key_or_name.to_owned());
        }
        self.inner.commands_by_name.get(key_or_name).map(|r| r.value().clone())
    }

    /// Subscribe to `STATE_CHANGED`. Arms the watch on first subscriber;
    /// dropping the returned guard unwatches once the last subscriber
    /// goes away.
    #[must_use]
    pub fn subscribe_state_changed(&self) -> StateChangeSubscription {
        self.ensure_watch();
        StateChangeSubscription {
            receiver: self.inner.events.subscribe(),
            device: self.clone(),
        }
    }

    fn ensure_watch(&self) {
        if self
            .inner
            .watch_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.send_raw(protocol::watch_states(&self.id(), true));
        }
    }

    fn ensure_unwatch(&self) {
        if self
            .inner
            .watch_requested
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.send_raw(protocol::watch_states(&self.id(), false));
        }
    }

    /// Whether this device currently has an armed subscription — used by
    /// the controller's watchdog to decide whether an expired deadline
    /// should trigger a restart.
    pub(crate) fn is_watching(&self) -> bool {
        self.inner.watch_requested.load(Ordering::SeqCst)
    }

    /// Re-send the watch message after a reconnect, bypassing the
    /// idempotency flag transition check because the flag is already set
    /// and we are intentionally re-arming, not issuing a fresh watch.
    pub(crate) fn rearm_subscription_if_watching(&self) {
        if self.inner.watch_requested.load(Ordering::SeqCst) {
            self.send_raw(protocol::watch_states(&self.id(), true));
        }
    }

    fn send_raw(&self, message: serde_json::Value) {
        if let Some(controller) = self.inner.controller.upgrade() {
            controller.send_channel_message(message);
        } else {
            warn!(device_id = %self.id(), "device outlived its controller");
        }
    }

    /// `getStates()` — on first call, triggers subscription and blocks
    /// until at least one inbound state change has been applied.
    pub async fn get_states(&self) -> HashMap<String, StateRecord> {
        self.ensure_watch();
        self.inner.states_ready.wait().await;
        self.inner
            .states_by_id
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// `getCustomStates()` — empty if this is not the system device.
    pub async fn get_custom_states(&self) -> HashMap<String, StateRecord> {
        if !self.is_system_device() {
            return HashMap::new();
        }
        self.get_states()
            .await
            .into_iter()
            .filter(|(_, state)| state.is_custom_state)
            .collect()
    }

    pub async fn get_state(&self, key_or_name: &str) -> Option<StateRecord> {
        self.ensure_watch();
        self.inner.states_ready.wait().await;
        let id = self.resolve_state_id(key_or_name)?;
        self.inner.states_by_id.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn get_commands(&self) -> Vec<CommandRecord> {
        self.inner
            .commands_by_id
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    #[must_use]
    pub fn get_command(&self, key_or_name: &str) -> Option<CommandRecord> {
        let id = self.resolve_command_id(key_or_name)?;
        self.inner.commands_by_id.get(&id).map(|r| r.value().clone())
    }

    /// Build and send a macro for `command`, resolving once every
    /// dynamic-parameter state id it references has been observed in a
    /// subsequent inbound state-change message.
    pub async fn send_command(
        &self,
        key_or_name: &str,
        params: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, CoreError> {
        let command_id = self
            .resolve_command_id(key_or_name)
            .ok_or_else(|| CoreError::InvalidCommand(key_or_name.to_owned()))?;
        let command = self
            .inner
            .commands_by_id
            .get(&command_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CoreError::InvalidCommand(key_or_name.to_owned()))?;

        let mut parameters = HashMap::new();
        for (name, value) in params {
            parameters.insert(name.to_uppercase(), value.clone());
        }

        let expected = command.dynamic_state_ids().into_iter().collect::<HashSet<_>>();
        let completion = self.register_wait(expected.clone());

        let action = MacroAction {
            command_id: command.id.clone(),
            category_id: command.category.clone(),
            capability_id: command.capability.clone(),
            device_id: self.id(),
            device_driver_id: self.info().driver_id.unwrap_or_default(),
            parameters,
        };
        self.send_raw(protocol::send_macro(&action));

        if expected.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(completion.wait().await)
    }

    /// `setCustomState` — only valid on the system device, and only for
    /// a key that resolves to a state flagged custom.
    pub async fn set_custom_state(
        &self,
        key_or_name: &str,
        value: &str,
    ) -> Result<StateRecord, CoreError> {
        if !self.is_system_device() {
            return Err(CoreError::NotSystemDevice);
        }
        let state_id = self
            .resolve_state_id(key_or_name)
            .ok_or_else(|| CoreError::InvalidState(key_or_name.to_owned()))?;
        let (category, capability) = {
            let state = self
                .inner
                .states_by_id
                .get(&state_id)
                .ok_or_else(|| CoreError::InvalidState(key_or_name.to_owned()))?;
            if !state.is_custom_state {
                return Err(CoreError::InvalidState(key_or_name.to_owned()));
            }
            (state.category.clone(), state.category.clone())
        };

        let mut expected = HashSet::new();
        expected.insert(state_id.clone());
        let completion = self.register_wait(expected);

        let mut parameters = HashMap::new();
        parameters.insert("New_Value".to_owned(), value.to_owned());
        let action = MacroAction {
            command_id: state_id.clone(),
            category_id: category,
            capability_id: capability,
            device_id: self.id(),
            device_driver_id: self.info().driver_id.unwrap_or_default(),
            parameters,
        };
        self.send_raw(protocol::send_macro(&action));

        completion.wait().await;
        self.inner
            .states_by_id
            .get(&state_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CoreError::InvalidState(key_or_name.to_owned()))
    }

    fn register_wait(&self, expected: HashSet<String>) -> Deferred<HashMap<String, String>> {
        let completion = Deferred::new();
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(PendingWait {
            expected,
            observed: HashMap::new(),
            completion: completion.clone(),
        });
        completion
    }

    /// Route an inbound batch of state changes for this device. Called
    /// exclusively by the controller dispatcher — never by public API.
    pub(crate) fn process_state_changes(&self, changes: &[protocol::StateChangeEntry]) {
        let mut observed_now = HashMap::new();
        for change in changes {
            let Some(mut record) = self.inner.states_by_id.get_mut(&change.state_id) else {
                warn!(state_id = %change.state_id, device_id = %self.id(), "state change for unknown state id");
                continue;
            };
            record.apply_value(change.state_value.clone());
            let event = StateChangedEvent {
                id: record.id.clone(),
                key: change.state_key.clone(),
                name: record.name.clone(),
                value: record.value.clone(),
                normalized_value: record.normalized_value.clone(),
            };
            drop(record);
            self.inner.events.emit(event);
            observed_now.insert(change.state_id.clone(), change.state_value.clone());
        }

        self.inner.states_ready.resolve(());
        if observed_now.is_empty() {
            return;
        }

        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut remaining = Vec::with_capacity(pending.len());
        for mut wait in pending.drain(..) {
            for (id, value) in &observed_now {
                if wait.expected.contains(id) {
                    wait.observed.insert(id.clone(), value.clone());
                }
            }
            if wait.expected.iter().all(|id| wait.observed.contains_key(id)) {
                wait.completion.resolve(wait.observed.clone());
            } else {
                remaining.push(wait);
            }
        }
        *pending = remaining;
    }
}

/// Guard returned by [`Device::subscribe_state_changed`]. Sends an
/// unwatch message once the last subscriber is dropped.
pub struct StateChangeSubscription {
    pub receiver: tokio::sync::broadcast::Receiver<StateChangedEvent>,
    device: Device,
}

impl Drop for StateChangeSubscription {
    fn drop(&mut self) {
        // `self.receiver` is still alive here — fields drop only after this
        // method returns — so the subscriber being torn down is still
        // counted. `<= 1` treats it as the last listener, not `== 0`.
        if self.device.inner.events.listener_count() <= 1 {
            self.device.ensure_unwatch();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::driver::{normalise, DriverDescriptor};

    fn test_device() -> Device {
        Device::new(
            DeviceInfo {
                id: "dev-1".to_owned(),
                name: "Main Display".to_owned(),
                description: None,
                driver_id: Some("driver-1".to_owned()),
                driver_version: Some("1".to_owned()),
                created: None,
                is_system_device: true,
            },
            Weak::new(),
        )
    }

    fn load_driver(device: &Device) {
        let descriptor: DriverDescriptor = serde_json::from_value(serde_json::json!({
            "categories": [{
                "name": "Power",
                "reference_id": "cat-power",
                "states": [{
                    "reference_id": "SYSTEM_STATE",
                    "name": "System State",
                    "type": "string",
                    "value": "OFF",
                    "is_custom_state": true
                }],
                "capabilities": [{
                    "reference_id": "cap-power",
                    "commands": [{
                        "name": "SET_SYSTEM_USE",
                        "codes": [{
                            "id": "cmd-set-system-use",
                            "state_references": [{"name": "state", "state_id": "SYSTEM_STATE"}],
                            "parameters": []
                        }]
                    }]
                }]
            }]
        }))
        .unwrap();
        device.apply_driver(&normalise(&descriptor));
    }

    #[test]
    fn command_lookup_by_id_and_name() {
        let device = test_device();
        load_driver(&device);
        assert!(device.get_command("cmd-set-system-use").is_some());
        assert!(device.get_command("SET_SYSTEM_USE").is_some());
        assert!(device.get_command("missing").is_none());
    }

    #[tokio::test]
    async fn send_command_resolves_after_matching_state_change() {
        let device = test_device();
        load_driver(&device);

        let device_clone = device.clone();
        let handle = tokio::spawn(async move {
            device_clone
                .send_command("SET_SYSTEM_USE", &HashMap::new())
                .await
        });

        tokio::task::yield_now().await;
        device.process_state_changes(&[protocol::StateChangeEntry {
            state_id: "SYSTEM_STATE".to_owned(),
            state_key: "system_state".to_owned(),
            state_name: "System State".to_owned(),
            state_value: "ON".to_owned(),
        }]);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.get("SYSTEM_STATE"), Some(&"ON".to_owned()));
    }

    #[tokio::test]
    async fn set_custom_state_rejects_non_system_device() {
        let device = Device::new(
            DeviceInfo {
                id: "dev-2".to_owned(),
                name: "Satellite".to_owned(),
                description: None,
                driver_id: None,
                driver_version: None,
                created: None,
                is_system_device: false,
            },
            Weak::new(),
        );
        let result = device.set_custom_state("ANY", "1").await;
        assert!(matches!(result, Err(CoreError::NotSystemDevice)));
    }

    #[tokio::test]
    async fn set_custom_state_rejects_non_custom_state() {
        let device = test_device();
        let descriptor: DriverDescriptor = serde_json::from_value(serde_json::json!({
            "categories": [{
                "name": "Power",
                "reference_id": "cat-power",
                "states": [{
                    "reference_id": "NOT_CUSTOM",
                    "name": "Not Custom",
                    "type": "string",
                    "value": "OFF"
                }],
                "capabilities": []
            }]
        }))
        .unwrap();
        device.apply_driver(&normalise(&descriptor));
        let result = device.set_custom_state("NOT_CUSTOM", "x").await;
        assert!(matches!(result, Err(CoreError::InvalidState(_))));
    }
}
