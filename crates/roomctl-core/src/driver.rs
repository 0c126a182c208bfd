//! C4: the driver normaliser.
//!
//! Pure data transformation, no I/O: takes the raw descriptor a
//! controller hands back from `device-drivers/{driverId}` and flattens
//! it into a per-category catalog of states and commands keyed by
//! stable reference id. Enumeration order follows input order;
//! duplicate reference ids overwrite — last write wins.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::model::{CommandRecord, NormalizedValue, ParamRecord, StateRecord};

/// Raw driver descriptor as delivered by the controller.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverDescriptor {
    pub categories: Vec<CategoryInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryInput {
    pub name: String,
    pub reference_id: String,
    #[serde(default)]
    pub capabilities: Vec<CapabilityInput>,
    #[serde(default)]
    pub states: Vec<StateInput>,
    #[serde(default)]
    pub macros: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateInput {
    pub reference_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub is_custom_state: bool,
    #[serde(default)]
    pub custom_data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityInput {
    pub reference_id: String,
    #[serde(default)]
    pub commands: Vec<CommandInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandInput {
    pub name: String,
    #[serde(default)]
    pub codes: Vec<CodeInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeInput {
    pub id: String,
    #[serde(default)]
    pub state_references: Vec<StateReferenceInput>,
    #[serde(default)]
    pub parameters: Vec<ParameterInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateReferenceInput {
    pub name: String,
    pub state_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterInput {
    pub name: String,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub constraints: Option<Value>,
}

/// One category's flattened catalog.
#[derive(Debug, Clone)]
pub struct NormalizedCategory {
    pub name: String,
    pub ref_id: String,
    pub states: HashMap<String, StateRecord>,
    pub commands: Vec<CommandRecord>,
}

/// The full normalised driver: category reference id → catalog.
pub type NormalizedDriver = HashMap<String, NormalizedCategory>;

/// Normalise a driver descriptor into a per-category catalog.
///
/// Parameter extraction rule: for each code, `state_references` become
/// dynamic parameters (name plus a pointer to the state record);
/// declared `parameters` become static parameters (name plus constraints
/// and primitive type). A command record is emitted once per code.
#[must_use]
pub fn normalise(descriptor: &DriverDescriptor) -> NormalizedDriver {
    let mut out: NormalizedDriver = HashMap::new();

    for category in &descriptor.categories {
        let mut states = HashMap::new();
        for state in &category.states {
            states.insert(
                state.reference_id.clone(),
                StateRecord {
                    id: state.reference_id.clone(),
                    name: state.name.clone(),
                    value_type: state.value_type.clone(),
                    normalized_value: NormalizedValue::coerce(&state.value_type, &state.value),
                    value: state.value.clone(),
                    category: category.reference_id.clone(),
                    is_custom_state: state.is_custom_state,
                    custom_data: state.custom_data.clone(),
                },
            );
        }

        let mut commands = Vec::new();
        for capability in &category.capabilities {
            for command in &capability.commands {
                for code in &command.codes {
                    let mut params = HashMap::new();
                    for state_ref in &code.state_references {
                        params.insert(
                            state_ref.name.clone(),
                            ParamRecord {
                                state_id: Some(state_ref.state_id.clone()),
                                constraints: None,
                                value_type: None,
                            },
                        );
                    }
                    for param in &code.parameters {
                        params.insert(
                            param.name.clone(),
                            ParamRecord {
                                state_id: None,
                                constraints: param.constraints.clone(),
                                value_type: param.value_type.clone(),
                            },
                        );
                    }

                    let command_states: HashMap<String, StateRecord> = code
                        .state_references
                        .iter()
                        .filter_map(|r| states.get(&r.state_id).map(|s| (r.state_id.clone(), s.clone())))
                        .collect();

                    commands.push(CommandRecord {
                        id: code.id.clone(),
                        name: command.name.clone(),
                        category: category.reference_id.clone(),
                        capability: capability.reference_id.clone(),
                        params,
                        states: command_states,
                    });
                }
            }
        }

        out.insert(
            category.reference_id.clone(),
            NormalizedCategory {
                name: category.name.clone(),
                ref_id: category.reference_id.clone(),
                states,
                commands,
            },
        );
    }

    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_descriptor() -> DriverDescriptor {
        serde_json::from_value(serde_json::json!({
            "categories": [{
                "name": "Power",
                "reference_id": "cat-power",
                "states": [{
                    "reference_id": "SYSTEM_STATE",
                    "name": "System State",
                    "type": "string",
                    "value": "OFF"
                }, {
                    "reference_id": "VOLUME",
                    "name": "Volume",
                    "type": "number",
                    "value": "10"
                }],
                "capabilities": [{
                    "reference_id": "cap-power",
                    "commands": [{
                        "name": "SET_SYSTEM_USE",
                        "codes": [{
                            "id": "cmd-set-system-use",
                            "state_references": [{"name": "state", "state_id": "SYSTEM_STATE"}],
                            "parameters": [{"name": "force", "type": "boolean"}]
                        }]
                    }]
                }]
            }]
        }))
        .expect("fixture deserializes")
    }

    #[test]
    fn normalise_flattens_states_by_reference_id() {
        let normalized = normalise(&sample_descriptor());
        let category = normalized.get("cat-power").unwrap();
        assert_eq!(category.states.len(), 2);
        let volume = category.states.get("VOLUME").unwrap();
        assert_eq!(volume.normalized_value, NormalizedValue::Number(10.0));
    }

    #[test]
    fn normalise_emits_one_command_per_code() {
        let normalized = normalise(&sample_descriptor());
        let category = normalized.get("cat-power").unwrap();
        assert_eq!(category.commands.len(), 1);
        let command = &category.commands[0];
        assert_eq!(command.id, "cmd-set-system-use");
        assert_eq!(command.dynamic_state_ids(), vec!["SYSTEM_STATE".to_owned()]);
        assert!(!command.params.get("force").unwrap().is_dynamic());
    }

    #[test]
    fn duplicate_reference_ids_overwrite_last_write_wins() {
        let descriptor: DriverDescriptor = serde_json::from_value(serde_json::json!({
            "categories": [
                {"name": "First", "reference_id": "cat-a", "states": [], "capabilities": []},
                {"name": "Second", "reference_id": "cat-a", "states": [], "capabilities": []}
            ]
        }))
        .unwrap();
        let normalized = normalise(&descriptor);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized.get("cat-a").unwrap().name, "Second");
    }
}
