//! Graph-level utilities shared by the conversion passes: safe resource
//! removal, the API Gateway resource-path cache and unique-name allocation.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::refs::extract_logical_id;
use crate::template::{Template, properties, prune_depends_on, resource_type};
use crate::value::{Intrinsic, Map, Value};

/// Delete the given logical ids from `Resources` and strip them from every
/// remaining resource's `DependsOn`. Ids already absent are ignored, so the
/// call is idempotent.
pub fn remove_resources(template: &mut Template, logical_ids: &[String]) {
    if logical_ids.is_empty() {
        return;
    }
    let Some(resources) = template.resources_mut() else {
        return;
    };
    for logical_id in logical_ids {
        if resources.shift_remove(logical_id).is_some() {
            debug!(%logical_id, "removed resource");
        }
    }
    for resource in resources.values_mut() {
        for logical_id in logical_ids {
            prune_depends_on(resource, logical_id);
        }
    }
}

/// Resolve the absolute request path of every `AWS::ApiGateway::Resource`
/// by walking `ParentId` chains up to the `RootResourceId` sentinel.
///
/// Results are memoized per logical id. A resource whose chain leaves the
/// template, lacks a `PathPart`, or loops back on itself resolves to
/// nothing and is simply absent from the returned cache.
pub fn api_resource_paths(resources: &Map) -> HashMap<String, String> {
    let mut cache = HashMap::new();
    for logical_id in resources.keys() {
        let mut visiting = HashSet::new();
        resolve_path(logical_id, resources, &mut cache, &mut visiting);
    }
    cache
}

fn resolve_path(
    logical_id: &str,
    resources: &Map,
    cache: &mut HashMap<String, String>,
    visiting: &mut HashSet<String>,
) -> Option<String> {
    if let Some(path) = cache.get(logical_id) {
        return Some(path.clone());
    }
    // Cyclic ParentId chains are invalid input; fail safe by yielding no path.
    if !visiting.insert(logical_id.to_owned()) {
        debug!(%logical_id, "ParentId cycle detected, skipping path resolution");
        return None;
    }
    let resource = resources.get(logical_id)?;
    if resource_type(resource) != Some("AWS::ApiGateway::Resource") {
        return None;
    }
    let props = properties(resource)?;
    let parent = props.get("ParentId");
    let parent_path = match parent.and_then(root_resource_sentinel) {
        Some(path) => path.to_owned(),
        None => {
            let parent_id = parent.and_then(extract_logical_id)?.to_owned();
            resolve_path(&parent_id, resources, cache, visiting)?
        }
    };
    let path_part = props.get("PathPart")?.as_str()?;
    let path = join_paths(Some(&parent_path), path_part);
    cache.insert(logical_id.to_owned(), path.clone());
    Some(path)
}

/// `"/"` when the value is a `GetAtt` ending in `RootResourceId`.
pub(crate) fn root_resource_sentinel(value: &Value) -> Option<&'static str> {
    let payload = match value {
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::GetAtt(payload) => payload,
            _ => return None,
        },
        Value::Map(map) => map.get("Fn::GetAtt")?,
        _ => return None,
    };
    let is_root = match payload {
        Value::List(items) => items.get(1).and_then(Value::as_str) == Some("RootResourceId"),
        Value::String(s) => s.ends_with(".RootResourceId"),
        _ => false,
    };
    is_root.then_some("/")
}

/// Resolve an `AWS::ApiGateway::Method` `ResourceId` to an absolute path,
/// treating the root sentinel as `"/"` and falling back to the path cache.
pub fn resolve_method_path(resource_id: &Value, paths: &HashMap<String, String>) -> Option<String> {
    if let Some(root) = root_resource_sentinel(resource_id) {
        return Some(root.to_owned());
    }
    let target = extract_logical_id(resource_id)?;
    paths.get(target).cloned()
}

pub(crate) fn join_paths(parent: Option<&str>, child: &str) -> String {
    let parent = match parent {
        Some(p) if !p.is_empty() => p,
        _ => "/",
    };
    if parent == "/" {
        return if child.is_empty() {
            "/".to_owned()
        } else {
            format!("/{child}")
        };
    }
    if child.is_empty() {
        return parent.to_owned();
    }
    format!("{}/{child}", parent.trim_end_matches('/'))
}

/// First unused name among `base`, `base2`, `base3`, ...
pub fn unique_name(taken: impl Fn(&str) -> bool, base: &str) -> String {
    if !taken(base) {
        return base.to_owned();
    }
    let mut idx = 2usize;
    loop {
        let candidate = format!("{base}{idx}");
        if !taken(&candidate) {
            return candidate;
        }
        idx += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(json: serde_json::Value) -> Map {
        match Value::from_json(json) {
            Value::Map(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn removal_prunes_depends_on() {
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "Gone": { "Type": "AWS::IAM::Role" },
                "KeptList": { "Type": "AWS::SQS::Queue", "DependsOn": ["Gone", "Other"] },
                "KeptStr": { "Type": "AWS::SQS::Queue", "DependsOn": "Gone" },
            }
        }))
        .unwrap();
        remove_resources(&mut template, &["Gone".into()]);
        remove_resources(&mut template, &["Gone".into()]); // idempotent
        let json = template.to_json();
        assert!(json["Resources"].get("Gone").is_none());
        assert_eq!(
            json["Resources"]["KeptList"]["DependsOn"],
            serde_json::json!(["Other"])
        );
        assert!(json["Resources"]["KeptStr"].get("DependsOn").is_none());
    }

    #[test]
    fn path_cache_walks_parent_chain() {
        let map = resources(serde_json::json!({
            "Api": { "Type": "AWS::ApiGateway::RestApi" },
            "Items": {
                "Type": "AWS::ApiGateway::Resource",
                "Properties": {
                    "ParentId": { "Fn::GetAtt": ["Api", "RootResourceId"] },
                    "PathPart": "items",
                },
            },
            "Item": {
                "Type": "AWS::ApiGateway::Resource",
                "Properties": {
                    "ParentId": { "Ref": "Items" },
                    "PathPart": "{id}",
                },
            },
        }));
        let cache = api_resource_paths(&map);
        assert_eq!(cache.get("Items").map(String::as_str), Some("/items"));
        assert_eq!(cache.get("Item").map(String::as_str), Some("/items/{id}"));
    }

    #[test]
    fn path_cache_survives_parent_cycles() {
        let map = resources(serde_json::json!({
            "A": {
                "Type": "AWS::ApiGateway::Resource",
                "Properties": { "ParentId": { "Ref": "B" }, "PathPart": "a" },
            },
            "B": {
                "Type": "AWS::ApiGateway::Resource",
                "Properties": { "ParentId": { "Ref": "A" }, "PathPart": "b" },
            },
        }));
        let cache = api_resource_paths(&map);
        assert!(cache.is_empty());
    }

    #[test]
    fn unique_names_count_up() {
        let taken = ["Item", "Item2"];
        let name = unique_name(|candidate| taken.contains(&candidate), "Item");
        assert_eq!(name, "Item3");
        let name = unique_name(|candidate| taken.contains(&candidate), "Fresh");
        assert_eq!(name, "Fresh");
    }
}
