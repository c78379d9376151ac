//! Resource-shape optimizations that run after the core conversions:
//! simple DynamoDB tables, Lambda layers and `Globals.Function` hoisting.

use tracing::debug;

use crate::convert::{Context, Pass};
use crate::error::SamaraError;
use crate::stage::{LocalAsset, format_code_uri};
use crate::template::{Template, metadata, properties, resource_type};
use crate::value::{Map, Value};

/// `AWS::DynamoDB::Table` → `AWS::Serverless::SimpleTable`, only for tables
/// SimpleTable can express exactly: provisioned billing, a single HASH key,
/// and nothing outside the allow-list.
pub(crate) struct SimpleTables;

const SIMPLE_TABLE_ALLOWED: [&str; 8] = [
    "AttributeDefinitions",
    "KeySchema",
    "ProvisionedThroughput",
    "TableName",
    "Tags",
    "PointInTimeRecoverySpecification",
    "SSESpecification",
    "BillingMode",
];

impl Pass for SimpleTables {
    fn name(&self) -> &'static str {
        "simple-tables"
    }

    fn run(&self, template: &mut Template, _cx: &mut Context) -> Result<bool, SamaraError> {
        let Some(resources) = template.resources_mut() else {
            return Ok(false);
        };
        let mut changed = false;
        for (logical_id, resource) in resources.iter_mut() {
            if resource_type(resource) != Some("AWS::DynamoDB::Table") {
                continue;
            }
            let Some(props) = properties(resource) else {
                continue;
            };
            let Some(new_props) = convert_simple_table_props(props) else {
                continue;
            };
            let resource = resource.as_map_mut().expect("resource is a map");
            resource.insert("Type".into(), Value::string("AWS::Serverless::SimpleTable"));
            resource.insert("Properties".into(), Value::Map(new_props));
            debug!(%logical_id, "converted table to SimpleTable");
            changed = true;
        }
        Ok(changed)
    }
}

fn convert_simple_table_props(props: &Map) -> Option<Map> {
    let on_demand = props
        .get("BillingMode")
        .and_then(Value::as_str)
        .is_some_and(|mode| mode.eq_ignore_ascii_case("PAY_PER_REQUEST"));
    let provisioned = props.get("ProvisionedThroughput")?;
    if on_demand {
        return None;
    }
    if props
        .keys()
        .any(|key| !SIMPLE_TABLE_ALLOWED.contains(&key.as_str()))
    {
        return None;
    }

    let key_schema = props.get("KeySchema").and_then(Value::as_list)?;
    let [hash_entry] = key_schema else {
        return None;
    };
    if hash_entry.get("KeyType").and_then(Value::as_str) != Some("HASH") {
        return None;
    }
    let hash_name = hash_entry.get("AttributeName").and_then(Value::as_str)?;

    let attr_type = props
        .get("AttributeDefinitions")
        .and_then(Value::as_list)
        .unwrap_or(&[])
        .iter()
        .find(|entry| entry.get("AttributeName").and_then(Value::as_str) == Some(hash_name))
        .and_then(|entry| entry.get("AttributeType"))
        .and_then(Value::as_str)?;
    let sam_type = match attr_type {
        "S" => "String",
        "N" => "Number",
        "B" => "Binary",
        _ => return None,
    };

    let mut primary_key = Map::new();
    primary_key.insert("Name".into(), Value::string(hash_name));
    primary_key.insert("Type".into(), Value::string(sam_type));

    let mut new_props = Map::new();
    new_props.insert("PrimaryKey".into(), Value::Map(primary_key));
    let has_capacity = provisioned
        .as_map()
        .is_some_and(|throughput| {
            throughput.contains_key("ReadCapacityUnits")
                || throughput.contains_key("WriteCapacityUnits")
        });
    if has_capacity {
        new_props.insert("ProvisionedThroughput".into(), provisioned.clone());
    }
    for key in [
        "TableName",
        "Tags",
        "PointInTimeRecoverySpecification",
        "SSESpecification",
    ] {
        if let Some(value) = props.get(key) {
            new_props.insert(key.to_owned(), value.clone());
        }
    }
    Some(new_props)
}

/// `AWS::Lambda::LayerVersion` → `AWS::Serverless::LayerVersion`, resolving
/// `Content` through the same local-asset → S3 order as function code.
pub(crate) struct Layers;

impl Pass for Layers {
    fn name(&self) -> &'static str {
        "lambda-layers"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        let Some(resources) = template.resources() else {
            return Ok(false);
        };
        let layer_ids: Vec<String> = resources
            .iter()
            .filter(|(_, resource)| {
                resource_type(resource) == Some("AWS::Lambda::LayerVersion")
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut changed = false;
        for logical_id in layer_ids {
            let Some(resource) = template.resource(&logical_id) else {
                continue;
            };
            let Some(props) = properties(resource).cloned() else {
                continue;
            };
            let md = metadata(resource).cloned();
            let Some(content) = props.get("Content").and_then(Value::as_map).cloned() else {
                continue;
            };
            let Some(content_uri) = resolve_layer_content(&logical_id, &content, md.as_ref(), cx)
            else {
                continue;
            };

            let mut new_props = Map::new();
            new_props.insert("ContentUri".into(), content_uri);
            for key in [
                "Description",
                "LayerName",
                "CompatibleRuntimes",
                "LicenseInfo",
                "RetentionPolicy",
                "CompatibleArchitectures",
            ] {
                if let Some(value) = props.get(key) {
                    new_props.insert(key.to_owned(), value.clone());
                }
            }
            let resource = template
                .resource_mut(&logical_id)
                .and_then(Value::as_map_mut)
                .expect("listed above");
            resource.insert("Type".into(), Value::string("AWS::Serverless::LayerVersion"));
            resource.insert("Properties".into(), Value::Map(new_props));
            debug!(%logical_id, "converted layer version");
            changed = true;
        }
        Ok(changed)
    }
}

fn resolve_layer_content(
    logical_id: &str,
    content: &Map,
    md: Option<&Map>,
    cx: &mut Context,
) -> Option<Value> {
    let relative_to = cx.options.relative_to.as_deref();

    let asset_path = md.and_then(|md| md.get("aws:asset:path")).and_then(Value::as_str);
    let asset_property = md
        .and_then(|md| md.get("aws:asset:property"))
        .and_then(Value::as_str);
    if let Some(path) = asset_path
        && asset_property.is_none_or(|prop| prop == "Content")
        && let Some(stager) = cx.stager.as_deref_mut()
        && let Some(LocalAsset::Present(found)) = stager.find_asset(path)
        && let Ok(staged) = stager.stage_local_path(logical_id, &found)
    {
        return Some(Value::string(format_code_uri(&staged, relative_to)));
    }

    let bucket = content.get("S3Bucket")?;
    let key = content.get("S3Key")?;
    let version = content.get("S3ObjectVersion");
    let version_str = version.and_then(Value::as_str);

    if let Some(stager) = cx.stager.as_deref_mut() {
        let resolved_bucket = stager
            .resolve_string(bucket)
            .or_else(|| bucket.as_str().map(str::to_owned));
        let resolved_key = stager
            .resolve_string(key)
            .or_else(|| key.as_str().map(str::to_owned));
        if let (Some(bucket), Some(key)) = (resolved_bucket, resolved_key) {
            // Staging failures fall back to the plain S3 object form.
            if let Ok(staged) = stager.stage_s3_code(logical_id, &bucket, &key, version_str) {
                return Some(Value::string(format_code_uri(&staged, relative_to)));
            }
        }
    }

    let mut uri = Map::new();
    uri.insert("Bucket".into(), bucket.clone());
    uri.insert("Key".into(), key.clone());
    if let Some(version) = version {
        uri.insert("Version".into(), version.clone());
    }
    Some(Value::Map(uri))
}

/// Hoist `Runtime`/`MemorySize`/`Timeout` and environment variables shared
/// by every converted function into `Globals.Function`.
pub(crate) struct FunctionGlobals;

impl Pass for FunctionGlobals {
    fn name(&self) -> &'static str {
        "function-globals"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        if !cx.options.hoist_globals {
            return Ok(false);
        }
        Ok(apply_function_globals(template))
    }
}

pub(crate) fn apply_function_globals(template: &mut Template) -> bool {
    let Some(resources) = template.resources() else {
        return false;
    };
    let function_ids: Vec<String> = resources
        .iter()
        .filter(|(_, resource)| {
            resource_type(resource) == Some("AWS::Serverless::Function")
                && properties(resource).is_some()
        })
        .map(|(id, _)| id.clone())
        .collect();
    if function_ids.len() < 2 {
        return false;
    }

    let mut hoisted = Map::new();
    for prop in ["Runtime", "MemorySize", "Timeout"] {
        if let Some(common) = shared_property(template, &function_ids, prop) {
            hoisted.insert(prop.to_owned(), common);
        }
    }
    let shared_env = shared_environment_variables(template, &function_ids);

    if hoisted.is_empty() && shared_env.is_none() {
        return false;
    }

    for function_id in &function_ids {
        let Some(props) = template
            .resource_mut(function_id)
            .and_then(crate::template::properties_mut)
        else {
            continue;
        };
        for prop in hoisted.keys() {
            props.shift_remove(prop);
        }
        if let Some(shared) = &shared_env {
            if let Some(env) = props.get_mut("Environment").and_then(Value::as_map_mut) {
                if let Some(vars) = env.get_mut("Variables").and_then(Value::as_map_mut) {
                    for key in shared.keys() {
                        vars.shift_remove(key);
                    }
                    if vars.is_empty() {
                        env.shift_remove("Variables");
                    }
                }
                if env.is_empty() {
                    props.shift_remove("Environment");
                }
            }
        }
    }

    let mut function_globals = hoisted;
    if let Some(shared) = shared_env {
        let mut env = Map::new();
        env.insert("Variables".into(), Value::Map(shared));
        function_globals.insert("Environment".into(), Value::Map(env));
    }

    let root = template.root_mut();
    if !matches!(root.get("Globals"), Some(Value::Map(_))) {
        root.insert("Globals".into(), Value::Map(Map::new()));
    }
    let globals = root
        .get_mut("Globals")
        .and_then(Value::as_map_mut)
        .expect("ensured above");
    if !matches!(globals.get("Function"), Some(Value::Map(_))) {
        globals.insert("Function".into(), Value::Map(Map::new()));
    }
    if let Some(existing) = globals.get_mut("Function").and_then(Value::as_map_mut) {
        existing.extend(function_globals);
    }
    debug!("hoisted shared function properties into Globals");
    true
}

fn shared_property(template: &Template, function_ids: &[String], prop: &str) -> Option<Value> {
    let mut shared: Option<&Value> = None;
    for function_id in function_ids {
        let value = template
            .resource(function_id)
            .and_then(properties)
            .and_then(|props| props.get(prop))?;
        match shared {
            None => shared = Some(value),
            Some(existing) if existing != value => return None,
            Some(_) => {}
        }
    }
    shared.cloned()
}

/// Variables present with identical values in every function. Any function
/// without an environment block disqualifies hoisting entirely.
fn shared_environment_variables(template: &Template, function_ids: &[String]) -> Option<Map> {
    let mut shared: Option<Map> = None;
    for function_id in function_ids {
        let variables = template
            .resource(function_id)
            .and_then(properties)
            .and_then(|props| props.get("Environment"))
            .and_then(|env| env.get("Variables"))
            .and_then(Value::as_map)?;
        match &mut shared {
            None => shared = Some(variables.clone()),
            Some(existing) => {
                existing.retain(|key, value| variables.get(key) == Some(value));
                if existing.is_empty() {
                    return None;
                }
            }
        }
    }
    shared.filter(|map| !map.is_empty())
}

/// Strip CDK bookkeeping that survives conversion: `aws:cdk:path` metadata
/// keys everywhere and the `BootstrapVersion` parameter.
pub fn strip_cdk_metadata(template: &mut Template) {
    let mut root = Value::Map(std::mem::take(template.root_mut()));
    strip_path_metadata(&mut root);
    *template.root_mut() = match root {
        Value::Map(map) => map,
        _ => unreachable!("root stays a map"),
    };

    let root = template.root_mut();
    if let Some(parameters) = root.get_mut("Parameters").and_then(Value::as_map_mut) {
        parameters.shift_remove("BootstrapVersion");
        if parameters.is_empty() {
            root.shift_remove("Parameters");
        }
    }
}

fn strip_path_metadata(node: &mut Value) {
    match node {
        Value::Map(map) => {
            let mut drop_metadata = false;
            if let Some(metadata) = map.get_mut("Metadata").and_then(Value::as_map_mut) {
                metadata.shift_remove("aws:cdk:path");
                drop_metadata = metadata.is_empty();
            }
            if drop_metadata {
                map.shift_remove("Metadata");
            }
            for value in map.values_mut() {
                strip_path_metadata(value);
            }
        }
        Value::List(items) => {
            for item in items {
                strip_path_metadata(item);
            }
        }
        Value::Intrinsic(tag) => strip_path_metadata(tag.payload_mut()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::testutil::samify_json;

    #[test]
    fn provisioned_single_hash_table_converts() {
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "Items": {
                    "Type": "AWS::DynamoDB::Table",
                    "Properties": {
                        "AttributeDefinitions": [{ "AttributeName": "pk", "AttributeType": "S" }],
                        "KeySchema": [{ "AttributeName": "pk", "KeyType": "HASH" }],
                        "ProvisionedThroughput": { "ReadCapacityUnits": 5, "WriteCapacityUnits": 5 },
                        "TableName": "items",
                    },
                },
            }
        }));
        let json = template.to_json();
        let table = &json["Resources"]["Items"];
        assert_eq!(table["Type"], "AWS::Serverless::SimpleTable");
        assert_eq!(
            table["Properties"]["PrimaryKey"],
            serde_json::json!({ "Name": "pk", "Type": "String" })
        );
        assert_eq!(table["Properties"]["TableName"], "items");
        assert!(table["Properties"].get("KeySchema").is_none());
    }

    #[test]
    fn on_demand_table_is_skipped() {
        let (template, changed) = samify_json(serde_json::json!({
            "Resources": {
                "Items": {
                    "Type": "AWS::DynamoDB::Table",
                    "Properties": {
                        "AttributeDefinitions": [{ "AttributeName": "pk", "AttributeType": "S" }],
                        "KeySchema": [{ "AttributeName": "pk", "KeyType": "HASH" }],
                        "BillingMode": "PAY_PER_REQUEST",
                    },
                },
            }
        }));
        assert!(!changed);
        assert_eq!(
            template.to_json()["Resources"]["Items"]["Type"],
            "AWS::DynamoDB::Table"
        );
    }

    #[test]
    fn table_with_extra_properties_is_skipped() {
        let (_, changed) = samify_json(serde_json::json!({
            "Resources": {
                "Items": {
                    "Type": "AWS::DynamoDB::Table",
                    "Properties": {
                        "AttributeDefinitions": [{ "AttributeName": "pk", "AttributeType": "S" }],
                        "KeySchema": [{ "AttributeName": "pk", "KeyType": "HASH" }],
                        "ProvisionedThroughput": { "ReadCapacityUnits": 5, "WriteCapacityUnits": 5 },
                        "StreamSpecification": { "StreamViewType": "NEW_IMAGE" },
                    },
                },
            }
        }));
        assert!(!changed);
    }

    #[test]
    fn layer_with_s3_content_converts() {
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "Deps": {
                    "Type": "AWS::Lambda::LayerVersion",
                    "Properties": {
                        "Content": { "S3Bucket": "layers", "S3Key": "deps.zip" },
                        "CompatibleRuntimes": ["python3.12"],
                        "LayerName": "deps",
                    },
                },
            }
        }));
        let json = template.to_json();
        let layer = &json["Resources"]["Deps"];
        assert_eq!(layer["Type"], "AWS::Serverless::LayerVersion");
        assert_eq!(
            layer["Properties"]["ContentUri"],
            serde_json::json!({ "Bucket": "layers", "Key": "deps.zip" })
        );
        assert_eq!(layer["Properties"]["LayerName"], "deps");
    }

    #[test]
    fn layer_without_content_is_skipped() {
        let (_, changed) = samify_json(serde_json::json!({
            "Resources": {
                "Deps": {
                    "Type": "AWS::Lambda::LayerVersion",
                    "Properties": { "LayerName": "deps" },
                },
            }
        }));
        assert!(!changed);
    }

    #[test]
    fn shared_function_properties_hoist_into_globals() {
        let function = |bucket: &str| {
            serde_json::json!({
                "Type": "AWS::Lambda::Function",
                "Properties": {
                    "Runtime": "python3.12",
                    "MemorySize": 256,
                    "Code": { "ZipFile": "x" },
                    "Environment": {
                        "Variables": { "STAGE": "prod", "BUCKET": bucket },
                    },
                },
            })
        };
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "First": function("a"),
                "Second": function("b"),
            }
        }));
        let json = template.to_json();
        assert_eq!(json["Globals"]["Function"]["Runtime"], "python3.12");
        assert_eq!(json["Globals"]["Function"]["MemorySize"], 256);
        assert_eq!(
            json["Globals"]["Function"]["Environment"]["Variables"],
            serde_json::json!({ "STAGE": "prod" })
        );
        for id in ["First", "Second"] {
            let props = &json["Resources"][id]["Properties"];
            assert!(props.get("Runtime").is_none());
            assert!(props.get("MemorySize").is_none());
            assert!(props["Environment"]["Variables"].get("STAGE").is_none());
            assert!(props["Environment"]["Variables"].get("BUCKET").is_some());
        }
    }

    #[test]
    fn single_function_gets_no_globals() {
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "Only": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": { "Runtime": "python3.12", "Code": { "ZipFile": "x" } },
                },
            }
        }));
        assert!(template.to_json().get("Globals").is_none());
    }

    #[test]
    fn strip_cdk_metadata_removes_paths_and_bootstrap() {
        let mut template = Template::from_json(serde_json::json!({
            "Parameters": { "BootstrapVersion": { "Type": "AWS::SSM::Parameter::Value<String>" } },
            "Resources": {
                "Fn": {
                    "Type": "AWS::Serverless::Function",
                    "Metadata": { "aws:cdk:path": "Stack/Fn/Resource" },
                    "Properties": { "InlineCode": "x" },
                },
            },
        }))
        .unwrap();
        strip_cdk_metadata(&mut template);
        let json = template.to_json();
        assert!(json.get("Parameters").is_none());
        assert!(json["Resources"]["Fn"].get("Metadata").is_none());
    }
}
