//! C6: the controller client — the connection state machine.
//!
//! Ties the REST and message-channel transports together with the
//! handshake sequence (provisioning → express mode → authorization),
//! device enumeration, the reconnect loop, and the watchdog. Mirrors the
//! teacher's `Controller`/`ControllerInner` split: `Controller` is a
//! cheap `Arc` handle, `ControllerInner` owns every piece of mutable
//! cross-task state behind `Mutex`/`watch`/`broadcast`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use roomctl_api::channel::{ChannelEvent, MessageChannel};
use roomctl_api::rest::{RequestOptions, RestClient, RestClientConfig, RetryPolicy};
use roomctl_api::Deferred;

use crate::config::{ClientOptions, PinSource, CONNECTION_TIMEOUT, WATCHDOG_DEADLINE};
use crate::device::{Device, DeviceInfo};
use crate::driver::{self, DriverDescriptor};
use crate::error::CoreError;
use crate::events::{EventBus, NamedEvent};
use crate::protocol::{self, AuthorizedPayload, BrainStatusPayload, ExpressModePayload, InboundEnvelope, StateChangePayload, SystemStatePayload};

/// Second-tick state id watched by the watchdog on the system device.
const SECOND_STATE_ID: &str = "SECOND_STATE";

/// The connection lifecycle. Initial `Connecting`; terminal
/// `Disconnected` after an explicit disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Failure,
    Disconnected,
    Reconnecting,
    Authorizing,
    Unauthorized,
    Active,
    Synchronizing,
}

impl ConnectionState {
    /// Human-readable string used verbatim in `CONNECTION_STATUS_CHANGED`
    /// payloads.
    #[must_use]
    pub fn status_string(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting ...",
            Self::Failure => "Connection Failure",
            Self::Disconnected => "Brain disconnected",
            Self::Reconnecting => "Reconnecting to brain ...",
            Self::Authorizing => "Authorizing ...",
            Self::Unauthorized => "Unauthorized Connection",
            Self::Active => "Connection Active",
            Self::Synchronizing => "Synchronizing ...",
        }
    }
}

/// Controller-level events (C8/C9). Stable names match §6 of the
/// interface description.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    WsConnected,
    WsClosed,
    BrainEvent(Value),
    ExpressMode { enabled: bool },
    PinRequired,
    Authorized,
    StatusMessage(Value),
    WsMessage(Value),
    ColorMessage(Value),
    HandsetMessage(Value),
    ConnectionStatusChanged(&'static str),
}

impl NamedEvent for ControllerEvent {
    fn event_name(&self) -> &'static str {
        match self {
            Self::WsConnected => "WS_CONNECTED",
            Self::WsClosed => "WS_CLOSED",
            Self::BrainEvent(_) => "BRAIN_EVENT",
            Self::ExpressMode { .. } => "EXPRESS_MODE",
            Self::PinRequired => "PIN_REQUIRED",
            Self::Authorized => "AUTHORIZED",
            Self::StatusMessage(_) => "STATUS_MESSAGE",
            Self::WsMessage(_) => "WS_MESSAGE",
            Self::ColorMessage(_) => "COLOR_MESSAGE",
            Self::HandsetMessage(_) => "HANDSET_MESSAGE",
            Self::ConnectionStatusChanged(_) => "CONNECTION_STATUS_CHANGED",
        }
    }

    fn to_payload(&self) -> Value {
        match self {
            Self::WsConnected | Self::WsClosed | Self::PinRequired | Self::Authorized => {
                serde_json::json!({})
            }
            Self::ExpressMode { enabled } => serde_json::json!({ "enabled": enabled }),
            Self::BrainEvent(v) | Self::StatusMessage(v) | Self::WsMessage(v) | Self::ColorMessage(v) | Self::HandsetMessage(v) => {
                v.clone()
            }
            Self::ConnectionStatusChanged(status) => serde_json::json!({ "status": status }),
        }
    }
}

/// Named deferred completions for one connection attempt's handshake.
/// Discarded and re-created on every fresh `connect`/reconnect.
struct HandshakeSlots {
    express_mode: Deferred<bool>,
    login_needed: Deferred<bool>,
    auth: Deferred<()>,
}

impl HandshakeSlots {
    fn new() -> Self {
        Self {
            express_mode: Deferred::new(),
            login_needed: Deferred::new(),
            auth: Deferred::new(),
        }
    }
}

pub(crate) struct ControllerInner {
    endpoint: String,
    options: ClientOptions,
    state: watch::Sender<ConnectionState>,
    events: EventBus<ControllerEvent>,
    devices: DashMap<String, Device>,
    system_device_id: Mutex<Option<String>>,
    handshake: Mutex<HandshakeSlots>,
    channel: Mutex<Option<MessageChannel>>,
    rest: RestClient,
    session_token: Mutex<Option<String>>,
    manually_disconnected: AtomicBool,
    devices_enumerated: AtomicBool,
    enumeration_lock: tokio::sync::Mutex<()>,
    reconnect_generation: Mutex<u64>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    watchdog_tick: watch::Sender<()>,
    watchdog_started: AtomicBool,
}

impl ControllerInner {
    /// Send a frame over the open message channel. Fails with
    /// [`CoreError::ClientNotInitialized`] if no channel has been opened
    /// yet (never connected, or disconnected since).
    pub(crate) fn send_channel_message(&self, message: Value) -> Result<(), CoreError> {
        let channel = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        match channel.as_ref() {
            Some(channel) => {
                if let Err(err) = channel.send(message.to_string()) {
                    warn!(error = %err, "failed to send message over channel");
                }
                Ok(())
            }
            None => Err(CoreError::ClientNotInitialized),
        }
    }
}

/// The controller client. Cheap to clone; every clone shares the same
/// connection.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, options: ClientOptions) -> Self {
        let endpoint = endpoint.into();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (watchdog_tick, _) = watch::channel(());
        let rest_config = RestClientConfig {
            base_url: format!("http://{endpoint}/api/v1"),
            bearer_token: None,
            default_timeout: options.http_request_timeout(),
        };
        Self {
            inner: Arc::new(ControllerInner {
                endpoint,
                options,
                state,
                events: EventBus::new(),
                devices: DashMap::new(),
                system_device_id: Mutex::new(None),
                handshake: Mutex::new(HandshakeSlots::new()),
                channel: Mutex::new(None),
                rest: RestClient::new(rest_config),
                session_token: Mutex::new(None),
                manually_disconnected: AtomicBool::new(false),
                devices_enumerated: AtomicBool::new(false),
                enumeration_lock: tokio::sync::Mutex::new(()),
                reconnect_generation: Mutex::new(0),
                task_handles: Mutex::new(Vec::new()),
                watchdog_tick,
                watchdog_started: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Whether `self` and `other` share the same underlying connection —
    /// used by the registry's identity invariant.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> &EventBus<ControllerEvent> {
        &self.inner.events
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            self.inner
                .events
                .emit(ControllerEvent::ConnectionStatusChanged(next.status_string()));
        }
    }

    /// Connect to the controller: REST bootstrap, open the message
    /// channel, run the handshake sequence, spawn the dispatcher.
    pub async fn connect(&self) -> ConnectionState {
        self.inner.manually_disconnected.store(false, Ordering::SeqCst);
        *self.inner.handshake.lock().unwrap_or_else(|e| e.into_inner()) = HandshakeSlots::new();
        self.set_state(ConnectionState::Connecting);

        let bootstrap: Result<Value, _> = self
            .inner
            .rest
            .get("general", RequestOptions::default().with_retry(RetryPolicy::enabled()))
            .await;
        if let Err(err) = bootstrap {
            warn!(error = %err, "controller-info bootstrap failed");
            self.set_state(ConnectionState::Failure);
            return self.connection_state();
        }

        self.open_channel();

        if self
            .inner
            .watchdog_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let controller = self.clone();
            let handle = tokio::spawn(async move {
                controller.run_watchdog().await;
            });
            self.inner
                .task_handles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
        }

        if self.inner.options.is_remote_auth() {
            let outcome = tokio::time::timeout(CONNECTION_TIMEOUT, self.wait_for_auth()).await;
            if outcome.is_err() {
                warn!("remote authorization timed out");
                self.set_state(ConnectionState::Failure);
            }
        }

        self.connection_state()
    }

    async fn wait_for_auth(&self) {
        let auth_deferred = self
            .inner
            .handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .auth
            .clone();
        auth_deferred.wait().await;
    }

    fn open_channel(&self) {
        let url = url::Url::parse(&format!("ws://{}/client", self.inner.endpoint))
            .expect("endpoint produces a valid ws url");
        let channel = MessageChannel::connect(url);
        let mut receiver = channel.subscribe();
        *self.inner.channel.lock().unwrap_or_else(|e| e.into_inner()) = Some(channel);

        let controller = self.clone();
        let handle = tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                match event {
                    ChannelEvent::Open => controller.on_channel_open(),
                    ChannelEvent::Message(text) => controller.on_channel_message(&text),
                    ChannelEvent::Error(message) => warn!(%message, "message channel error"),
                    ChannelEvent::Close => {
                        controller.on_channel_close();
                        break;
                    }
                }
            }
        });
        self.inner
            .task_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    fn on_channel_open(&self) {
        self.inner.events.emit(ControllerEvent::WsConnected);
        if self.inner.options.is_remote_auth() {
            if let Some(payload) = self.inner.options.remote_authorization.clone() {
                let _ = self.inner.send_channel_message(payload);
            }
        } else {
            let _ = self.inner.send_channel_message(protocol::get_brain_stat());
        }
    }

    fn on_channel_close(&self) {
        self.inner.events.emit(ControllerEvent::WsClosed);
        if self.inner.manually_disconnected.load(Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let generation = {
            let mut gen_lock = self
                .inner
                .reconnect_generation
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *gen_lock += 1;
            *gen_lock
        };
        let controller = self.clone();
        let wait = self.inner.options.reconnect_wait_time();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let current = *controller
                .inner
                .reconnect_generation
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if current != generation {
                // a newer reconnect was scheduled; this one is stale.
                return;
            }
            if controller.inner.manually_disconnected.load(Ordering::SeqCst) {
                return;
            }
            controller.set_state(ConnectionState::Connecting);
            controller.open_channel();
        });
    }

    fn on_channel_message(&self, text: &str) {
        self.inner.events.emit(ControllerEvent::WsMessage(Value::String(text.to_owned())));
        let envelope: InboundEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "could not parse inbound message");
                return;
            }
        };

        match envelope.kind.as_str() {
            protocol::inbound::BRAIN_STATUS => self.handle_brain_status(envelope.payload),
            protocol::inbound::BRAIN_STATUS_COLOR => {
                self.inner.events.emit(ControllerEvent::ColorMessage(envelope.payload));
            }
            protocol::inbound::EXPRESS_MODE_FLAG => self.handle_express_mode(envelope.payload),
            protocol::inbound::UNAUTHORIZED => self.handle_unauthorized(),
            protocol::inbound::AUTHORIZED => self.handle_authorized(envelope.payload),
            protocol::inbound::STATE_CHANGE => self.handle_state_change(envelope.payload),
            protocol::inbound::SYSTEM_STATE => self.handle_system_state(envelope.payload),
            other if other.starts_with(protocol::inbound::HANDSET_PREFIX) => {
                self.inner.events.emit(ControllerEvent::HandsetMessage(envelope.payload));
            }
            _ => {
                self.inner.events.emit(ControllerEvent::BrainEvent(envelope.payload));
            }
        }
    }

    fn handle_brain_status(&self, payload: Value) {
        self.inner.events.emit(ControllerEvent::StatusMessage(payload.clone()));
        let Ok(status) = serde_json::from_value::<BrainStatusPayload>(payload) else {
            // Left as no-op pass-through + the generic event already emitted above.
            return;
        };
        if !status.provisioned {
            warn!(error = %CoreError::NotProvisioned, "controller reported unprovisioned after bootstrap");
            self.set_state(ConnectionState::Failure);
            return;
        }
        if !self.inner.options.is_remote_auth() {
            let _ = self.inner.send_channel_message(protocol::get_express_mode_flag());
        }
        // Left as no-op pass-through for the remoteAuthorization branch
        // (open question) beyond the generic event already emitted.
    }

    fn handle_express_mode(&self, payload: Value) {
        let Ok(flag) = serde_json::from_value::<ExpressModePayload>(payload) else {
            return;
        };
        self.inner.events.emit(ControllerEvent::ExpressMode { enabled: flag.enabled });
        let handshake = self.inner.handshake.lock().unwrap_or_else(|e| e.into_inner());
        handshake.express_mode.resolve(flag.enabled);
        drop(handshake);

        if flag.enabled {
            self.set_state(ConnectionState::Authorizing);
            let _ = self.inner.send_channel_message(protocol::passcode_auth(""));
        }
    }

    fn handle_unauthorized(&self) {
        self.set_state(ConnectionState::Unauthorized);
        let handshake = self.inner.handshake.lock().unwrap_or_else(|e| e.into_inner());
        handshake.login_needed.resolve(true);
        drop(handshake);

        // A configured PIN is only ever tried after the controller rejects
        // the empty-passcode attempt — never sent up front. With no PIN
        // configured, the caller has to observe `PinRequired` and supply
        // one through `submit_pin`.
        match self.inner.options.pin.clone() {
            Some(PinSource::Literal(secret)) => {
                let _ = self.submit_pin(secret.expose_secret());
            }
            Some(PinSource::Supplier(supplier)) => {
                let controller = self.clone();
                tokio::spawn(async move {
                    let pin = (supplier)().await;
                    let _ = controller.submit_pin(&pin);
                });
            }
            None => {
                self.inner.events.emit(ControllerEvent::PinRequired);
            }
        }
    }

    fn handle_authorized(&self, payload: Value) {
        if let Ok(auth) = serde_json::from_value::<AuthorizedPayload>(payload) {
            *self.inner.session_token.lock().unwrap_or_else(|e| e.into_inner()) = Some(auth.token);
        }
        self.set_state(ConnectionState::Active);
        self.inner.events.emit(ControllerEvent::Authorized);
        let handshake = self.inner.handshake.lock().unwrap_or_else(|e| e.into_inner());
        handshake.auth.resolve(());
        drop(handshake);
        self.rearm_device_subscriptions();
    }

    fn handle_state_change(&self, payload: Value) {
        let Ok(change) = serde_json::from_value::<StateChangePayload>(payload) else {
            return;
        };
        let is_system_device = self
            .inner
            .system_device_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            == Some(change.device_id.as_str());
        if is_system_device && change.changes.iter().any(|c| c.state_id == SECOND_STATE_ID) {
            let _ = self.inner.watchdog_tick.send(());
        }
        if let Some(device) = self.inner.devices.get(&change.device_id) {
            device.process_state_changes(&change.changes);
        } else {
            warn!(device_id = %change.device_id, "state change for unknown device");
        }
    }

    fn handle_system_state(&self, payload: Value) {
        let Ok(system_state) = serde_json::from_value::<SystemStatePayload>(payload) else {
            return;
        };
        match system_state.state.as_str() {
            "brain_sync" | "space_sync" | "parse_space" | "upgrading" | "resources_sync" | "activating" | "initializing" => {
                self.set_state(ConnectionState::Synchronizing);
            }
            "active_online" | "active_offline" => {
                let was_enumerated = self.inner.devices_enumerated.load(Ordering::SeqCst);
                self.set_state(ConnectionState::Active);
                if was_enumerated {
                    let controller = self.clone();
                    tokio::spawn(async move {
                        let _ = controller.enumerate_devices().await;
                    });
                }
            }
            "inactive" | "error" => self.set_state(ConnectionState::Failure),
            _ => {}
        }
    }

    fn rearm_device_subscriptions(&self) {
        for entry in &self.inner.devices {
            entry.value().rearm_subscription_if_watching();
        }
    }

    /// Submit a PIN after an `UNAUTHORIZED` transition. Fails with
    /// [`CoreError::ClientNotInitialized`] if the message channel was
    /// never opened (no prior `connect`, or disconnected since).
    pub fn submit_pin(&self, pin: &str) -> Result<(), CoreError> {
        self.set_state(ConnectionState::Authorizing);
        self.inner.send_channel_message(protocol::passcode_auth(pin))
    }

    /// Assign `handset_id` as the active handset for `device_id`.
    /// Fire-and-forget — the controller acknowledges over the routed
    /// `handset_*` message path, not a direct reply.
    pub fn set_handset(&self, device_id: &str, handset_id: &str) -> Result<(), CoreError> {
        self.inner.send_channel_message(protocol::set_handset(device_id, handset_id))
    }

    /// Send a UI action to the controller. Fire-and-forget, like
    /// [`Self::set_handset`].
    pub fn send_action(&self, action: Value) -> Result<(), CoreError> {
        self.inner.send_channel_message(protocol::send_action(&action))
    }

    /// Request the full handset list; the response arrives as a routed
    /// `handset_*` message (`ControllerEvent::HandsetMessage`).
    pub fn query_handsets(&self) -> Result<(), CoreError> {
        self.inner.send_channel_message(protocol::query_handsets())
    }

    /// Request one handset's layout; like [`Self::query_handsets`], the
    /// response arrives as a routed `handset_*` message.
    pub fn get_handset_layout(&self, handset_id: &str) -> Result<(), CoreError> {
        self.inner.send_channel_message(protocol::get_handset_layout(handset_id))
    }

    /// Lazily enumerate devices: REST GET `devices`, then per device
    /// REST GET `device-drivers/{driverId}?version=…`. Single-flighted —
    /// concurrent callers share one in-flight enumeration.
    pub async fn enumerate_devices(&self) -> Result<(), CoreError> {
        let _guard = self.inner.enumeration_lock.lock().await;

        #[derive(serde::Deserialize)]
        struct RawDevice {
            id: String,
            name: String,
            #[serde(default)]
            description: Option<String>,
            #[serde(default)]
            driver_id: Option<String>,
            #[serde(default)]
            driver_version: Option<String>,
            #[serde(default)]
            is_system_device: bool,
        }

        let raw_devices: Vec<RawDevice> = self
            .inner
            .rest
            .get("devices", RequestOptions::default())
            .await?;

        for raw in raw_devices {
            let info = DeviceInfo {
                id: raw.id.clone(),
                name: raw.name,
                description: raw.description,
                driver_id: raw.driver_id.clone(),
                driver_version: raw.driver_version.clone(),
                created: None,
                is_system_device: raw.is_system_device,
            };
            if info.is_system_device {
                *self.inner.system_device_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(info.id.clone());
            }

            let device = self
                .inner
                .devices
                .entry(raw.id.clone())
                .and_modify(|existing| existing.update_info(info.clone()))
                .or_insert_with(|| Device::new(info, Arc::downgrade(&self.inner)))
                .value()
                .clone();

            if let Some(driver_id) = raw.driver_id {
                let path = format!("device-drivers/{driver_id}");
                let version = raw.driver_version.unwrap_or_default();
                let opts = RequestOptions::default().with_query(serde_json::json!({ "version": version }));
                match self.inner.rest.get::<DriverDescriptor>(&path, opts).await {
                    Ok(descriptor) => device.apply_driver(&driver::normalise(&descriptor)),
                    Err(err) => {
                        warn!(device_id = %raw.id, error = %err, "driver fetch failed");
                        device.set_driver_error(err.to_string());
                    }
                }
            }
        }

        self.inner.devices_enumerated.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Device access (§4.6 "Device enumeration"): lazily enumerates on
    /// first call.
    pub async fn get_devices(&self) -> Result<Vec<Device>, CoreError> {
        if !self.inner.devices_enumerated.load(Ordering::SeqCst) {
            self.enumerate_devices().await?;
        }
        Ok(self.inner.devices.iter().map(|entry| entry.value().clone()).collect())
    }

    pub async fn get_device(&self, id: &str) -> Result<Option<Device>, CoreError> {
        if !self.inner.devices_enumerated.load(Ordering::SeqCst) {
            self.enumerate_devices().await?;
        }
        Ok(self.inner.devices.get(id).map(|entry| entry.value().clone()))
    }

    pub async fn get_system_device(&self) -> Result<Option<Device>, CoreError> {
        if !self.inner.devices_enumerated.load(Ordering::SeqCst) {
            self.enumerate_devices().await?;
        }
        let id = self
            .inner
            .system_device_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Ok(id.and_then(|id| self.inner.devices.get(&id).map(|entry| entry.value().clone())))
    }

    /// Reset the deadline on every system-device tick; on expiry, POST
    /// `restart` iff at least one device currently has an armed
    /// subscription. Spawned once per `Controller`, from the first
    /// `connect`.
    pub async fn run_watchdog(&self) {
        let mut ticks = self.inner.watchdog_tick.subscribe();
        loop {
            let deadline = tokio::time::sleep(WATCHDOG_DEADLINE);
            tokio::select! {
                _ = ticks.changed() => continue,
                () = deadline => {
                    if !self.any_device_subscribed() {
                        continue;
                    }
                    warn!("watchdog deadline exceeded, restarting controller pipeline");
                    let _: Result<Value, _> = self
                        .inner
                        .rest
                        .post("restart", &Value::Null, RequestOptions::default())
                        .await;
                }
            }
        }
    }

    fn any_device_subscribed(&self) -> bool {
        self.inner.devices.iter().any(|entry| entry.value().is_watching())
    }

    /// Explicit disconnect: close the channel, clear the device map, and
    /// mark this as intentional so the close handler does not reconnect.
    pub fn disconnect(&self) {
        self.inner.manually_disconnected.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        if let Some(mut channel) = self.inner.channel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            channel.close();
        }
        self.inner.devices.clear();
        self.inner.devices_enumerated.store(false, Ordering::SeqCst);
        *self.inner.system_device_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
        for handle in self.inner.task_handles.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            handle.abort();
        }
        self.inner.watchdog_started.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;

    fn controller() -> Controller {
        Controller::new("controller-test:8000", ClientOptions::default())
    }

    #[test]
    fn status_strings_match_every_variant() {
        assert_eq!(ConnectionState::Connecting.status_string(), "Connecting ...");
        assert_eq!(ConnectionState::Failure.status_string(), "Connection Failure");
        assert_eq!(ConnectionState::Disconnected.status_string(), "Brain disconnected");
        assert_eq!(ConnectionState::Reconnecting.status_string(), "Reconnecting to brain ...");
        assert_eq!(ConnectionState::Authorizing.status_string(), "Authorizing ...");
        assert_eq!(ConnectionState::Unauthorized.status_string(), "Unauthorized Connection");
        assert_eq!(ConnectionState::Active.status_string(), "Connection Active");
        assert_eq!(ConnectionState::Synchronizing.status_string(), "Synchronizing ...");
    }

    #[test]
    fn set_state_is_a_no_op_when_unchanged() {
        let controller = controller();
        let mut events = controller.events().subscribe();
        controller.set_state(ConnectionState::Connecting);
        assert!(events.try_recv().is_err());
        controller.set_state(ConnectionState::Active);
        assert!(matches!(events.try_recv(), Ok(ControllerEvent::ConnectionStatusChanged("Connection Active"))));
    }

    #[test]
    fn unauthorized_message_transitions_and_resolves_login_needed() {
        let controller = controller();
        controller.handle_unauthorized();
        assert_eq!(controller.connection_state(), ConnectionState::Unauthorized);
        let handshake = controller.inner.handshake.lock().unwrap();
        assert!(handshake.login_needed.is_settled());
    }

    #[test]
    fn express_mode_enabled_moves_to_authorizing() {
        let controller = controller();
        controller.handle_express_mode(serde_json::json!({ "enabled": true }));
        assert_eq!(controller.connection_state(), ConnectionState::Authorizing);
    }

    #[test]
    fn express_mode_disabled_stays_put() {
        let controller = controller();
        controller.handle_express_mode(serde_json::json!({ "enabled": false }));
        assert_eq!(controller.connection_state(), ConnectionState::Connecting);
        let handshake = controller.inner.handshake.lock().unwrap();
        assert!(handshake.express_mode.is_settled());
    }

    #[test]
    fn authorized_message_moves_to_active_and_stores_token() {
        let controller = controller();
        controller.handle_authorized(serde_json::json!({
            "brain_id": "b-1",
            "session_id": "s-1",
            "token": "tok-123",
        }));
        assert_eq!(controller.connection_state(), ConnectionState::Active);
        assert_eq!(
            controller.inner.session_token.lock().unwrap().as_deref(),
            Some("tok-123")
        );
    }

    #[test]
    fn system_state_sync_states_map_to_synchronizing() {
        let controller = controller();
        controller.handle_system_state(serde_json::json!({ "state": "brain_sync" }));
        assert_eq!(controller.connection_state(), ConnectionState::Synchronizing);
    }

    #[test]
    fn system_state_error_maps_to_failure() {
        let controller = controller();
        controller.handle_system_state(serde_json::json!({ "state": "error" }));
        assert_eq!(controller.connection_state(), ConnectionState::Failure);
    }

    #[test]
    fn registry_ptr_eq_distinguishes_separate_controllers() {
        let a = controller();
        let b = controller();
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&a.clone()));
    }
}
