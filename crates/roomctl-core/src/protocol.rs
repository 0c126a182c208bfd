//! Wire shapes for the message channel (C3's payloads) and the stable
//! `type` tags the controller dispatcher (C6) switches on.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub mod inbound {
    pub const BRAIN_STATUS: &str = "brain_status_message";
    pub const BRAIN_STATUS_COLOR: &str = "brain_status_color_msg";
    pub const EXPRESS_MODE_FLAG: &str = "express_mode_flag_msg";
    pub const UNAUTHORIZED: &str = "unauthorized_message";
    pub const AUTHORIZED: &str = "authorized_message";
    pub const STATE_CHANGE: &str = "state_change_message";
    pub const SYSTEM_STATE: &str = "system_state_message";
    pub const HANDSET_PREFIX: &str = "handset_";
}

pub mod outbound {
    pub const PASSCODE_AUTH: &str = "passcode_auth_msg";
    pub const GET_BRAIN_STAT: &str = "get_brain_stat_message";
    pub const GET_EXPRESS_MODE_FLAG: &str = "get_express_mode_flag_msg";
    pub const SET_HANDSET: &str = "set_handset_message";
    pub const UI_ACTION: &str = "ui_message";
    pub const WATCH_STATES: &str = "watch_states_message";
    pub const SEND_MACRO: &str = "send_macro_message";
    pub const WS_WRAPPER: &str = "ws_message_wrapper";
}

/// The only thing every inbound frame is guaranteed to have.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrainStatusPayload {
    #[serde(default)]
    pub provisioned: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpressModePayload {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizedPayload {
    pub brain_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemStatePayload {
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateChangeEntry {
    pub state_id: String,
    pub state_key: String,
    pub state_name: String,
    pub state_value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateChangePayload {
    pub device_id: String,
    #[serde(default)]
    pub changes: Vec<StateChangeEntry>,
}

/// One action inside a `send_macro_message`.
#[derive(Debug, Clone, Serialize)]
pub struct MacroAction {
    pub command_id: String,
    pub category_id: String,
    pub capability_id: String,
    pub device_id: String,
    pub device_driver_id: String,
    pub parameters: std::collections::HashMap<String, String>,
}

pub fn passcode_auth(passcode: &str) -> Value {
    json!({ "type": outbound::PASSCODE_AUTH, "passcode": passcode })
}

pub fn get_brain_stat() -> Value {
    json!({ "type": outbound::GET_BRAIN_STAT })
}

pub fn get_express_mode_flag() -> Value {
    json!({ "type": outbound::GET_EXPRESS_MODE_FLAG })
}

/// `watched_states` is always sent empty, per an explicit open question:
/// the server reportedly ignores it, but the field is preserved on the
/// wire for compatibility with older controllers.
pub fn watch_states(device_id: &str, subscribe: bool) -> Value {
    json!({
        "type": outbound::WATCH_STATES,
        "device_id": device_id,
        "subscribe": subscribe,
        "watched_states": Vec::<String>::new(),
    })
}

pub fn send_macro(action: &MacroAction) -> Value {
    json!({ "type": outbound::SEND_MACRO, "actions": [action] })
}

pub fn rest_over_channel(method: &str, path: &str, body: Option<&Value>) -> Value {
    json!({
        "type": outbound::WS_WRAPPER,
        "method": method,
        "path": path,
        "body": body,
    })
}

/// Assign `handset_id` as the active handset for `device_id`.
pub fn set_handset(device_id: &str, handset_id: &str) -> Value {
    json!({ "type": outbound::SET_HANDSET, "device_id": device_id, "handset_id": handset_id })
}

/// Send a free-form UI action; `action`'s shape is defined by the handset
/// layout the caller is driving, not by this crate.
pub fn send_action(action: &Value) -> Value {
    json!({ "type": outbound::UI_ACTION, "action": action })
}

/// Bus-wrapped REST-over-channel GET for the handset list.
pub fn query_handsets() -> Value {
    rest_over_channel("GET", "handsets", None)
}

/// Bus-wrapped REST-over-channel GET for one handset's layout.
pub fn get_handset_layout(handset_id: &str) -> Value {
    rest_over_channel("GET", &format!("handsets/{handset_id}/layout"), None)
}
