//! Data model shared between the driver normaliser (C4) and the device
//! object (C5): state records, command records, and the normalised value
//! coercion rule ("coerce exactly when `type="number"`, leave everything
//! else as a string").

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A value as delivered on the wire (always a string) alongside its
/// type-coerced form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NormalizedValue {
    Number(f64),
    Text(String),
}

impl NormalizedValue {
    /// Coerce a wire string into a normalised value per the state's
    /// declared `value_type`. Only `"number"` is special-cased; every
    /// other type is passed through untouched.
    #[must_use]
    pub fn coerce(value_type: &str, raw: &str) -> Self {
        if value_type == "number" {
            if let Ok(n) = raw.parse::<f64>() {
                return Self::Number(n);
            }
        }
        Self::Text(raw.to_owned())
    }
}

/// A named, typed observable value on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub value: String,
    pub normalized_value: NormalizedValue,
    pub category: String,
    #[serde(default)]
    pub is_custom_state: bool,
    #[serde(default)]
    pub custom_data: Option<Value>,
}

impl StateRecord {
    /// Apply an inbound wire value, recomputing the normalised form.
    pub fn apply_value(&mut self, raw_value: String) {
        self.normalized_value = NormalizedValue::coerce(&self.value_type, &raw_value);
        self.value = raw_value;
    }
}

/// One parameter of a command: either dynamic (points at a state, so
/// setting it implicitly changes that state) or static (carries its own
/// type/constraints).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamRecord {
    #[serde(default)]
    pub state_id: Option<String>,
    #[serde(default)]
    pub constraints: Option<Value>,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
}

impl ParamRecord {
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.state_id.is_some()
    }
}

/// An invocable action on a device. Emitted once per driver "code";
/// `id` is the code's own stable reference id, used verbatim as
/// `command_id` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: String,
    pub name: String,
    pub category: String,
    pub capability: String,
    pub params: HashMap<String, ParamRecord>,
    pub states: HashMap<String, StateRecord>,
}

impl CommandRecord {
    /// The state ids this command's dynamic parameters reference —
    /// the set `sendCommand` must observe changed before it resolves.
    #[must_use]
    pub fn dynamic_state_ids(&self) -> Vec<String> {
        self.params
            .values()
            .filter_map(|p| p.state_id.clone())
            .collect()
    }
}
