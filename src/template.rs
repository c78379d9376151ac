//! Template root and resource accessors.

use crate::value::{Map, Value};

/// The SAM transform every converted template must declare.
pub const SAM_TRANSFORM: &str = "AWS::Serverless-2016-10-31";

/// A CloudFormation template owned exclusively by one conversion run.
///
/// Passes mutate the tree in place; there is no defensive copying and no
/// aliasing of subtrees across passes. Anything the engine does not
/// recognize stays exactly where it was, so unconverted resources round-trip
/// losslessly.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    root: Map,
}

impl Template {
    pub fn new(root: Map) -> Self {
        Self { root }
    }

    /// Build a template from plain JSON; `None` unless the root is an object.
    pub fn from_json(json: serde_json::Value) -> Option<Self> {
        match Value::from_json(json) {
            Value::Map(root) => Some(Self { root }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        Value::Map(self.root.clone()).to_json()
    }

    pub fn root(&self) -> &Map {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Map {
        &mut self.root
    }

    pub fn resources(&self) -> Option<&Map> {
        self.root.get("Resources").and_then(Value::as_map)
    }

    pub fn resources_mut(&mut self) -> Option<&mut Map> {
        self.root.get_mut("Resources").and_then(Value::as_map_mut)
    }

    pub fn resource(&self, logical_id: &str) -> Option<&Value> {
        self.resources().and_then(|map| map.get(logical_id))
    }

    pub fn resource_mut(&mut self, logical_id: &str) -> Option<&mut Value> {
        self.resources_mut().and_then(|map| map.get_mut(logical_id))
    }

    /// Declare the SAM transform, preserving any transform already present.
    pub fn ensure_sam_transform(&mut self) {
        match self.root.get("Transform").cloned() {
            None => {
                self.root
                    .insert("Transform".into(), Value::string(SAM_TRANSFORM));
            }
            Some(Value::List(mut entries)) => {
                let present = entries
                    .iter()
                    .any(|entry| entry.as_str() == Some(SAM_TRANSFORM));
                if !present {
                    entries.push(Value::string(SAM_TRANSFORM));
                    self.root.insert("Transform".into(), Value::List(entries));
                }
            }
            Some(Value::String(existing)) => {
                if existing != SAM_TRANSFORM {
                    self.root.insert(
                        "Transform".into(),
                        Value::List(vec![Value::String(existing), Value::string(SAM_TRANSFORM)]),
                    );
                }
            }
            Some(_) => {}
        }
    }
}

/// The `Type` of a resource node.
pub fn resource_type(resource: &Value) -> Option<&str> {
    resource.get("Type").and_then(Value::as_str)
}

pub fn properties(resource: &Value) -> Option<&Map> {
    resource.get("Properties").and_then(Value::as_map)
}

pub fn properties_mut(resource: &mut Value) -> Option<&mut Map> {
    resource.get_mut("Properties").and_then(Value::as_map_mut)
}

/// `Properties` of a resource, created empty when absent.
pub fn ensure_properties(resource: &mut Value) -> Option<&mut Map> {
    let map = resource.as_map_mut()?;
    if !matches!(map.get("Properties"), Some(Value::Map(_))) {
        map.insert("Properties".into(), Value::Map(Map::new()));
    }
    map.get_mut("Properties").and_then(Value::as_map_mut)
}

pub fn metadata(resource: &Value) -> Option<&Map> {
    resource.get("Metadata").and_then(Value::as_map)
}

/// Strip a logical id from a resource's `DependsOn`, dropping the key when
/// it empties out. Handles both the string and the list form.
pub(crate) fn prune_depends_on(resource: &mut Value, logical_id: &str) {
    let Some(map) = resource.as_map_mut() else {
        return;
    };
    let emptied = match map.get_mut("DependsOn") {
        Some(Value::String(entry)) => entry == logical_id,
        Some(Value::List(entries)) => {
            entries.retain(|entry| entry.as_str() != Some(logical_id));
            entries.is_empty()
        }
        _ => false,
    };
    if emptied {
        map.shift_remove("DependsOn");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_promotion() {
        let mut template = Template::from_json(serde_json::json!({})).unwrap();
        template.ensure_sam_transform();
        assert_eq!(
            template.root().get("Transform").unwrap().as_str(),
            Some(SAM_TRANSFORM)
        );

        let mut template =
            Template::from_json(serde_json::json!({ "Transform": "My::Macro" })).unwrap();
        template.ensure_sam_transform();
        assert_eq!(
            template.to_json()["Transform"],
            serde_json::json!(["My::Macro", SAM_TRANSFORM])
        );

        // Idempotent on list form.
        template.ensure_sam_transform();
        assert_eq!(
            template.to_json()["Transform"],
            serde_json::json!(["My::Macro", SAM_TRANSFORM])
        );
    }

    #[test]
    fn depends_on_pruning() {
        let mut resource = Value::from_json(serde_json::json!({
            "Type": "AWS::SQS::Queue",
            "DependsOn": ["A", "B"],
        }));
        prune_depends_on(&mut resource, "A");
        assert_eq!(resource.to_json()["DependsOn"], serde_json::json!(["B"]));
        prune_depends_on(&mut resource, "B");
        assert!(resource.get("DependsOn").is_none());

        let mut resource = Value::from_json(serde_json::json!({ "DependsOn": "A" }));
        prune_depends_on(&mut resource, "A");
        assert!(resource.get("DependsOn").is_none());
    }
}
