//! Step Functions conversion.

use tracing::debug;

use crate::convert::{Context, Pass};
use crate::error::SamaraError;
use crate::refs::join_payload_to_sub;
use crate::template::{Template, properties, resource_type};
use crate::value::{Intrinsic, Map, Value};

const PROPERTY_RENAMES: [(&str, &str); 6] = [
    ("LoggingConfiguration", "Logging"),
    ("StateMachineName", "Name"),
    ("StateMachineType", "Type"),
    ("RoleArn", "Role"),
    ("DefinitionS3Location", "DefinitionUri"),
    ("TracingConfiguration", "Tracing"),
];

/// `AWS::StepFunctions::StateMachine` → `AWS::Serverless::StateMachine`.
///
/// A JSON `DefinitionString` is promoted to a structured `Definition` map
/// first; a definition that cannot be parsed exactly (it interpolates
/// references we would have to guess at) leaves the resource untouched.
pub(crate) struct StateMachines;

impl Pass for StateMachines {
    fn name(&self) -> &'static str {
        "state-machines"
    }

    fn run(&self, template: &mut Template, _cx: &mut Context) -> Result<bool, SamaraError> {
        let Some(resources) = template.resources_mut() else {
            return Ok(false);
        };
        let mut changed = false;
        for (logical_id, resource) in resources.iter_mut() {
            if resource_type(resource) != Some("AWS::StepFunctions::StateMachine") {
                continue;
            }
            let Some(props) = properties(resource) else {
                continue;
            };

            let parsed_definition = if props.contains_key("Definition") {
                None
            } else if let Some(definition_string) = props.get("DefinitionString") {
                match parse_definition_string(definition_string) {
                    Some(definition) => Some(definition),
                    None => continue,
                }
            } else {
                None
            };

            let remapped = remap_properties(props, parsed_definition);
            let resource = resource.as_map_mut().expect("resource is a map");
            resource.insert(
                "Type".into(),
                Value::string("AWS::Serverless::StateMachine"),
            );
            resource.insert("Properties".into(), Value::Map(remapped));
            debug!(%logical_id, "converted state machine");
            changed = true;
        }
        Ok(changed)
    }
}

/// Parse a `DefinitionString` into a definition tree. Handles literal JSON
/// strings and `Fn::Join`s whose fragments are all literals; anything with
/// embedded references is left alone.
fn parse_definition_string(value: &Value) -> Option<Value> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::Join(payload) => literal_join(payload)?,
            _ => return None,
        },
        Value::Map(map) if map.len() == 1 => literal_join(map.get("Fn::Join")?)?,
        _ => return None,
    };
    let json: serde_json::Value = serde_json::from_str(&text).ok()?;
    Some(Value::from_json(json))
}

fn literal_join(payload: &Value) -> Option<String> {
    let rendered = join_payload_to_sub(payload)?;
    // ${...} tokens mean the definition interpolates references; converting
    // that faithfully is the front end's problem, not ours.
    (!rendered.contains("${")).then_some(rendered)
}

fn remap_properties(props: &Map, parsed_definition: Option<Value>) -> Map {
    let mut remapped = Map::new();
    for (key, value) in props {
        if key == "DefinitionString" {
            if let Some(definition) = &parsed_definition {
                remapped.insert("Definition".into(), definition.clone());
            }
            continue;
        }
        let new_key = PROPERTY_RENAMES
            .iter()
            .find(|(old, _)| old == key)
            .map(|(_, new)| (*new).to_owned())
            .unwrap_or_else(|| key.clone());
        remapped.insert(new_key, value.clone());
    }
    remapped
}
