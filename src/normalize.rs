//! The CDK identity normalizer.
//!
//! CDK synthesis mangles construct names into logical ids like
//! `MyBucketF68F3FF0` and litters the template with metadata resources and
//! asset parameters. This module strips that noise and derives stable,
//! human-readable logical ids, resolving collisions deterministically and
//! applying the whole rename map atomically so no reference is ever left
//! dangling.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::refs::{RenameMap, rewrite_references};
use crate::template::Template;
use crate::value::{Intrinsic, Map, Value};

static HASH_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-F0-9]{8}$").expect("hash suffix pattern"));

/// Known CDK synthesis suffixes, collapsed to their intent. First match wins.
static SEMANTIC_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(.+)ServiceRole([A-F0-9]{8})?$", "${1}Role"),
        (r"(.+)ServiceRoleDefaultPolicy([A-F0-9]{8})?$", "${1}Policy"),
        (r"(.+)DefaultPolicy([A-F0-9]{8})?$", "${1}Policy"),
        (r"(.+)LogGroup([A-F0-9]{8})?$", "${1}Logs"),
        (
            r"CustomResourceProviderframework([A-F0-9]{8})?$",
            "CustomResourceProvider",
        ),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("semantic pattern"),
            replacement,
        )
    })
    .collect()
});

static GENERATED_SIMPLIFICATIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(.*Subnet\d+)Subnet$",
        r"(.*RouteTable\d+)RouteTable$",
        r"(.*Route\d+)Route$",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("simplification pattern"))
    .collect()
});

pub fn is_cdk_hash(name: &str) -> bool {
    HASH_SUFFIX.is_match(name)
}

pub fn strip_hash_suffix(name: &str) -> &str {
    if is_cdk_hash(name) {
        &name[..name.len() - 8]
    } else {
        name
    }
}

/// How colliding derived names are disambiguated. The lexicographically
/// first original id always keeps the bare base name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionStrategy {
    /// `Item`, `Item2`, `Item3`, ...
    #[default]
    Numbered,
    /// `Item`, `Item<4-hex digest of the original id>`, ...
    ShortHash,
}

/// Preset defaults. `Readable` renames aggressively; `Deployable` leaves
/// logical ids alone, since renaming a deployed stack's ids forces resource
/// replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeMode {
    Readable,
    Deployable,
}

/// Construct information supplied by an external CDK metadata source
/// (`manifest.json` / `tree.json`). Loading those files is the host's job.
#[derive(Debug, Clone)]
pub struct ConstructInfo {
    pub construct_name: String,
    pub is_generated: bool,
    pub resource_type: Option<String>,
}

/// Optional collaborator resolving logical ids to construct names. When
/// absent, or when it has no answer, naming falls back to the pattern
/// heuristics over `aws:cdk:path` metadata.
pub trait MetadataLookup {
    fn construct_info(&self, logical_id: &str) -> Option<ConstructInfo>;
}

pub struct Normalizer {
    strip_hashes: bool,
    semantic_naming: bool,
    remove_cdk_metadata: bool,
    keep_path_metadata: bool,
    strip_asset_metadata: bool,
    collision_strategy: CollisionStrategy,
    rename_logical_ids: bool,
    lookup: Option<Box<dyn MetadataLookup>>,
}

impl Normalizer {
    pub fn new(mode: NormalizeMode) -> Self {
        let readable = mode == NormalizeMode::Readable;
        Self {
            strip_hashes: true,
            semantic_naming: true,
            remove_cdk_metadata: readable,
            keep_path_metadata: true,
            strip_asset_metadata: readable,
            collision_strategy: CollisionStrategy::Numbered,
            rename_logical_ids: readable,
            lookup: None,
        }
    }

    pub fn readable() -> Self {
        Self::new(NormalizeMode::Readable)
    }

    pub fn deployable() -> Self {
        Self::new(NormalizeMode::Deployable)
    }

    pub fn strip_hashes(mut self, enabled: bool) -> Self {
        self.strip_hashes = enabled;
        self
    }

    pub fn semantic_naming(mut self, enabled: bool) -> Self {
        self.semantic_naming = enabled;
        self
    }

    pub fn remove_cdk_metadata(mut self, enabled: bool) -> Self {
        self.remove_cdk_metadata = enabled;
        self
    }

    pub fn keep_path_metadata(mut self, enabled: bool) -> Self {
        self.keep_path_metadata = enabled;
        self
    }

    pub fn strip_asset_metadata(mut self, enabled: bool) -> Self {
        self.strip_asset_metadata = enabled;
        self
    }

    pub fn collision_strategy(mut self, strategy: CollisionStrategy) -> Self {
        self.collision_strategy = strategy;
        self
    }

    pub fn rename_logical_ids(mut self, enabled: bool) -> Self {
        self.rename_logical_ids = enabled;
        self
    }

    pub fn with_metadata_lookup(mut self, lookup: Box<dyn MetadataLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Run every enabled stage over the template and return the rename map
    /// (old id → new id, actual renames only). Hosts use the map to retarget
    /// assets they already staged under the old ids.
    pub fn normalize(&self, template: &mut Template) -> RenameMap {
        clean_zipfile_content(template);

        if self.remove_cdk_metadata {
            remove_cdk_metadata_resources(template);
        }
        if self.strip_asset_metadata {
            strip_asset_metadata(template, self.keep_path_metadata);
        }
        if self.rename_logical_ids {
            clean_asset_parameters(template);
        }

        let mut renames = RenameMap::new();
        if self.rename_logical_ids {
            let mapping = self.compute_name_mapping(template);
            if !mapping.is_empty() {
                let mut root = Value::Map(std::mem::take(template.root_mut()));
                rewrite_references(&mut root, &mapping);
                *template.root_mut() = match root {
                    Value::Map(map) => map,
                    _ => unreachable!("root stays a map"),
                };
                rename_resource_keys(template, &mapping);
            }
            renames = mapping
                .into_iter()
                .filter(|(old, new)| old != new)
                .collect();
        }

        if self.remove_cdk_metadata {
            remove_condition(template, "CDKMetadataAvailable");
        }

        debug!(renamed = renames.len(), "identity normalization finished");
        renames
    }

    fn compute_name_mapping(&self, template: &Template) -> RenameMap {
        let Some(resources) = template.resources() else {
            return RenameMap::new();
        };

        let mut derived: Vec<(String, String)> = Vec::new();
        for (old_name, resource) in resources {
            let metadata = resource.get("Metadata").and_then(Value::as_map);
            let mut base = self.derive_base_name(old_name, metadata);
            if self.strip_hashes {
                base = strip_hash_suffix(&base).to_owned();
            }
            if self.semantic_naming {
                base = apply_semantics(&base);
            }
            derived.push((old_name.clone(), base));
        }

        let mut groups: RenameMap = RenameMap::new();
        let mut grouped: indexmap::IndexMap<String, Vec<String>> = indexmap::IndexMap::new();
        for (old, base) in derived {
            grouped.entry(base).or_default().push(old);
        }
        for (base, mut olds) in grouped {
            olds.sort();
            for (idx, old) in olds.into_iter().enumerate() {
                let new = if idx == 0 {
                    base.clone()
                } else {
                    match self.collision_strategy {
                        CollisionStrategy::Numbered => format!("{base}{}", idx + 1),
                        CollisionStrategy::ShortHash => format!("{base}{}", short_hash(&old)),
                    }
                };
                groups.insert(old, new);
            }
        }
        groups
    }

    fn derive_base_name(&self, old_name: &str, metadata: Option<&Map>) -> String {
        if let Some(lookup) = &self.lookup
            && let Some(info) = lookup.construct_info(old_name)
            && !info.construct_name.is_empty()
        {
            let name = if info.is_generated {
                simplify_generated_name(&info.construct_name)
            } else {
                info.construct_name
            };
            return sanitize_logical_id(&name);
        }

        // Without exact metadata the original id stays the base; the CDK
        // path only informs a handful of API Gateway special cases.
        let mut base = old_name.to_owned();
        if let Some(path) = metadata
            .and_then(|md| md.get("aws:cdk:path"))
            .and_then(Value::as_str)
        {
            let parts: Vec<&str> = path.split('/').collect();
            let is_lambda = parts
                .iter()
                .any(|part| part.contains("Lambda") || part.contains("Function"));
            let is_api = parts
                .iter()
                .any(|part| part.contains("ApiGateway") || part.contains("Api"));
            if !is_lambda && is_api {
                let lowered = path.to_ascii_lowercase();
                if lowered.contains("proxy") && lowered.contains("resource") {
                    base = "ApiGatewayProxyResource".to_owned();
                } else if parts
                    .iter()
                    .any(|part| part.to_ascii_lowercase().contains("permission"))
                {
                    const METHODS: [&str; 7] =
                        ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "ANY"];
                    if let Some(method) = parts.iter().find(|part| METHODS.contains(part)) {
                        base = format!("ApiGateway{method}Permission");
                    }
                }
            }
        }

        sanitize_logical_id(&base)
    }
}

/// Restrict a name to `[A-Za-z][A-Za-z0-9]*`, defaulting to `Resource`.
fn sanitize_logical_id(name: &str) -> String {
    let cleaned: String = name.chars().filter(char::is_ascii_alphanumeric).collect();
    match cleaned.chars().next() {
        None => "Resource".to_owned(),
        Some(first) if !first.is_ascii_alphabetic() => format!("Resource{cleaned}"),
        Some(_) => cleaned,
    }
}

fn apply_semantics(name: &str) -> String {
    for (pattern, replacement) in SEMANTIC_PATTERNS.iter() {
        if pattern.is_match(name) {
            return pattern.replace(name, *replacement).into_owned();
        }
    }
    name.to_owned()
}

fn simplify_generated_name(name: &str) -> String {
    let mut name = name.to_owned();
    for pattern in GENERATED_SIMPLIFICATIONS.iter() {
        if pattern.is_match(&name) {
            name = pattern.replace(&name, "${1}").into_owned();
        }
    }
    name
}

/// Deterministic 4-hex-digit uppercase digest of an original logical id.
fn short_hash(name: &str) -> String {
    let digest = blake3::hash(name.as_bytes());
    digest.to_hex()[..4].to_ascii_uppercase()
}

/// Trailing whitespace inside inline `ZipFile` code blocks defeats literal
/// block emission downstream; trim it up front.
fn clean_zipfile_content(template: &mut Template) {
    let Some(resources) = template.resources_mut() else {
        return;
    };
    for resource in resources.values_mut() {
        if crate::template::resource_type(resource) != Some("AWS::Lambda::Function") {
            continue;
        }
        let Some(zipfile) = resource
            .get_mut("Properties")
            .and_then(|props| props.get_mut("Code"))
            .and_then(|code| code.get_mut("ZipFile"))
        else {
            continue;
        };
        if let Value::String(content) = zipfile {
            *content = content.trim_end().to_owned();
        }
    }
}

fn remove_cdk_metadata_resources(template: &mut Template) {
    let Some(resources) = template.resources_mut() else {
        return;
    };
    resources
        .retain(|_, resource| crate::template::resource_type(resource) != Some("AWS::CDK::Metadata"));
}

fn strip_asset_metadata(template: &mut Template, keep_path_metadata: bool) {
    let Some(resources) = template.resources_mut() else {
        return;
    };
    for resource in resources.values_mut() {
        let Some(metadata) = resource
            .get_mut("Metadata")
            .and_then(Value::as_map_mut)
        else {
            continue;
        };
        metadata.retain(|key, _| {
            if key.starts_with("aws:asset") || key.starts_with("aws:cdk:asset") {
                return false;
            }
            !(key == "aws:cdk:path" && !keep_path_metadata)
        });
    }
}

fn remove_condition(template: &mut Template, condition_name: &str) {
    let Some(conditions) = template
        .root_mut()
        .get_mut("Conditions")
        .and_then(Value::as_map_mut)
    else {
        return;
    };
    conditions.shift_remove(condition_name);
}

/// Drop legacy CDK v1 `AssetParameters*` parameters and replace their `Ref`
/// usages with suffix-keyed placeholders.
fn clean_asset_parameters(template: &mut Template) {
    let Some(parameters) = template
        .root_mut()
        .get_mut("Parameters")
        .and_then(Value::as_map_mut)
    else {
        return;
    };
    let removed: Vec<String> = parameters
        .keys()
        .filter(|key| key.starts_with("AssetParameters"))
        .cloned()
        .collect();
    if removed.is_empty() {
        return;
    }
    for name in &removed {
        parameters.shift_remove(name);
    }

    let placeholders: std::collections::HashMap<&str, &'static str> = removed
        .iter()
        .map(|name| (name.as_str(), asset_placeholder(name)))
        .collect();

    let mut root = Value::Map(std::mem::take(template.root_mut()));
    replace_asset_refs(&mut root, &placeholders);
    *template.root_mut() = match root {
        Value::Map(map) => map,
        _ => unreachable!("root stays a map"),
    };
}

fn asset_placeholder(name: &str) -> &'static str {
    if name.ends_with("S3Bucket") {
        "<asset-bucket>"
    } else if name.ends_with("S3VersionKey") {
        "<asset-key>"
    } else if name.ends_with("ArtifactHash") {
        "<asset-hash>"
    } else {
        "<asset-param>"
    }
}

fn replace_asset_refs(node: &mut Value, placeholders: &std::collections::HashMap<&str, &'static str>) {
    let replacement = match &*node {
        Value::Map(map) if map.len() == 1 => map
            .get("Ref")
            .and_then(Value::as_str)
            .and_then(|target| placeholders.get(target))
            .copied(),
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::Ref(payload) => payload
                .as_str()
                .and_then(|target| placeholders.get(target))
                .copied(),
            _ => None,
        },
        _ => None,
    };
    if let Some(placeholder) = replacement {
        *node = Value::string(placeholder);
        return;
    }
    match node {
        Value::Map(map) => {
            for value in map.values_mut() {
                replace_asset_refs(value, placeholders);
            }
        }
        Value::List(items) => {
            for item in items {
                replace_asset_refs(item, placeholders);
            }
        }
        Value::Intrinsic(tag) => replace_asset_refs(tag.payload_mut(), placeholders),
        _ => {}
    }
}

/// Rebuild the `Resources` map with renamed keys, keeping the original
/// insertion order, and rewrite `DependsOn` entries along the way.
fn rename_resource_keys(template: &mut Template, mapping: &RenameMap) {
    let Some(resources) = template.resources_mut() else {
        return;
    };
    let old = std::mem::take(resources);
    for (old_name, mut resource) in old {
        if let Some(map) = resource.as_map_mut() {
            match map.get_mut("DependsOn") {
                Some(Value::String(entry)) => {
                    if let Some(new) = mapping.get(entry.as_str()) {
                        *entry = new.clone();
                    }
                }
                Some(Value::List(entries)) => {
                    for entry in entries {
                        if let Value::String(name) = entry
                            && let Some(new) = mapping.get(name.as_str())
                        {
                            *name = new.clone();
                        }
                    }
                }
                _ => {}
            }
        }
        let new_name = mapping.get(&old_name).cloned().unwrap_or(old_name);
        resources.insert(new_name, resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_suffix_detection() {
        assert!(is_cdk_hash("MyBucketF68F3FF0"));
        assert!(!is_cdk_hash("MyBucket"));
        assert!(!is_cdk_hash("lowercasef68f3ff0"));
        assert_eq!(strip_hash_suffix("MyBucketF68F3FF0"), "MyBucket");
        assert_eq!(strip_hash_suffix("MyBucket"), "MyBucket");
    }

    #[test]
    fn simple_rename_updates_references() {
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "MyBucketF68F3FF0": { "Type": "AWS::S3::Bucket" },
                "Reader": {
                    "Type": "AWS::Lambda::Function",
                    "DependsOn": "MyBucketF68F3FF0",
                    "Properties": {
                        "Environment": {
                            "Variables": {
                                "BUCKET": { "Ref": "MyBucketF68F3FF0" },
                                "ARN": { "Fn::GetAtt": ["MyBucketF68F3FF0", "Arn"] },
                            }
                        }
                    },
                },
            }
        }))
        .unwrap();
        let renames = Normalizer::readable().normalize(&mut template);
        assert_eq!(
            renames.get("MyBucketF68F3FF0").map(String::as_str),
            Some("MyBucket")
        );
        let json = template.to_json();
        assert!(json["Resources"].get("MyBucket").is_some());
        assert_eq!(json["Resources"]["Reader"]["DependsOn"], "MyBucket");
        let vars = &json["Resources"]["Reader"]["Properties"]["Environment"]["Variables"];
        assert_eq!(vars["BUCKET"], serde_json::json!({ "Ref": "MyBucket" }));
        assert_eq!(
            vars["ARN"],
            serde_json::json!({ "Fn::GetAtt": ["MyBucket", "Arn"] })
        );
    }

    #[test]
    fn sub_tokens_and_dotted_getatt_follow_renames() {
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "QueueAB12CD34": { "Type": "AWS::SQS::Queue" },
            },
            "Outputs": {
                "Url": { "Value": { "Fn::Sub": "https://${QueueAB12CD34.QueueName}.example" } },
                "Arn": { "Value": { "Fn::GetAtt": "QueueAB12CD34.Arn" } },
            },
        }))
        .unwrap();
        Normalizer::readable().normalize(&mut template);
        let json = template.to_json();
        assert_eq!(
            json["Outputs"]["Url"]["Value"]["Fn::Sub"],
            "https://${Queue.QueueName}.example"
        );
        assert_eq!(json["Outputs"]["Arn"]["Value"]["Fn::GetAtt"], "Queue.Arn");
    }

    #[test]
    fn short_form_conditions_are_visited() {
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "TopicDEADBEEF": { "Type": "AWS::SNS::Topic" },
            },
        }))
        .unwrap();
        // An `If` short tag wrapping a Ref, as a front end would parse `!If`.
        template.root_mut().insert(
            "Outputs".into(),
            Value::Map(Map::from_iter([(
                "Maybe".to_owned(),
                Value::Intrinsic(Box::new(Intrinsic::Other(
                    "Fn::If".to_owned(),
                    Value::List(vec![
                        Value::string("SomeCondition"),
                        Value::reference("TopicDEADBEEF"),
                        Value::string("none"),
                    ]),
                ))),
            )])),
        );
        Normalizer::readable().normalize(&mut template);
        let json = template.to_json();
        assert_eq!(
            json["Outputs"]["Maybe"]["Fn::If"][1],
            serde_json::json!({ "Ref": "Topic" })
        );
    }

    #[test]
    fn cdk_metadata_and_condition_are_removed() {
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "CDKMetadata": { "Type": "AWS::CDK::Metadata", "Properties": { "Analytics": "x" } },
                "Bucket": { "Type": "AWS::S3::Bucket" },
            },
            "Conditions": {
                "CDKMetadataAvailable": { "Fn::Equals": ["a", "a"] },
                "Other": { "Fn::Equals": ["b", "b"] },
            },
        }))
        .unwrap();
        Normalizer::readable().normalize(&mut template);
        let json = template.to_json();
        assert!(json["Resources"].get("CDKMetadata").is_none());
        assert!(json["Conditions"].get("CDKMetadataAvailable").is_none());
        assert!(json["Conditions"].get("Other").is_some());
    }

    #[test]
    fn asset_metadata_strip_respects_path_flag() {
        let fixture = serde_json::json!({
            "Resources": {
                "Fn": {
                    "Type": "AWS::Lambda::Function",
                    "Metadata": {
                        "aws:asset:path": "asset.123",
                        "aws:asset:property": "Code",
                        "aws:cdk:path": "Stack/Fn/Resource",
                    },
                },
            }
        });
        let mut template = Template::from_json(fixture.clone()).unwrap();
        Normalizer::readable().normalize(&mut template);
        let md = &template.to_json()["Resources"]["Fn"]["Metadata"];
        assert!(md.get("aws:asset:path").is_none());
        assert_eq!(md["aws:cdk:path"], "Stack/Fn/Resource");

        let mut template = Template::from_json(fixture).unwrap();
        Normalizer::readable()
            .keep_path_metadata(false)
            .normalize(&mut template);
        let md = &template.to_json()["Resources"]["Fn"]["Metadata"];
        assert!(md.get("aws:cdk:path").is_none());
    }

    #[test]
    fn semantic_suffixes_collapse() {
        assert_eq!(apply_semantics("HandlerServiceRole"), "HandlerRole");
        assert_eq!(
            apply_semantics("HandlerServiceRoleDefaultPolicy"),
            "HandlerPolicy"
        );
        assert_eq!(apply_semantics("HandlerLogGroup"), "HandlerLogs");
        assert_eq!(apply_semantics("Handler"), "Handler");
    }

    #[test]
    fn collisions_number_in_lexicographic_order() {
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "ItemB2222BBBB": { "Type": "AWS::S3::Bucket" },
                "ItemA1111AAAA": { "Type": "AWS::S3::Bucket" },
            }
        }))
        .unwrap();
        // Both derive to "Item" once custom bases collide.
        struct Fixed;
        impl MetadataLookup for Fixed {
            fn construct_info(&self, _logical_id: &str) -> Option<ConstructInfo> {
                Some(ConstructInfo {
                    construct_name: "Item".to_owned(),
                    is_generated: false,
                    resource_type: None,
                })
            }
        }
        let renames = Normalizer::readable()
            .with_metadata_lookup(Box::new(Fixed))
            .normalize(&mut template);
        assert_eq!(renames.get("ItemA1111AAAA").map(String::as_str), Some("Item"));
        assert_eq!(renames.get("ItemB2222BBBB").map(String::as_str), Some("Item2"));
    }

    #[test]
    fn short_hash_collisions_are_deterministic() {
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "ItemB2222BBBB": { "Type": "AWS::S3::Bucket" },
                "ItemA1111AAAA": { "Type": "AWS::S3::Bucket" },
            }
        }))
        .unwrap();
        struct Fixed;
        impl MetadataLookup for Fixed {
            fn construct_info(&self, _logical_id: &str) -> Option<ConstructInfo> {
                Some(ConstructInfo {
                    construct_name: "Item".to_owned(),
                    is_generated: false,
                    resource_type: None,
                })
            }
        }
        let renames = Normalizer::readable()
            .with_metadata_lookup(Box::new(Fixed))
            .collision_strategy(CollisionStrategy::ShortHash)
            .normalize(&mut template);
        assert_eq!(renames.get("ItemA1111AAAA").map(String::as_str), Some("Item"));
        let second = renames.get("ItemB2222BBBB").unwrap();
        assert!(second.starts_with("Item") && second.len() == 8);
        let suffix = &second[4..];
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(suffix, &short_hash("ItemB2222BBBB"));
    }

    #[test]
    fn asset_parameters_become_placeholders() {
        let mut template = Template::from_json(serde_json::json!({
            "Parameters": {
                "AssetParameters111S3Bucket": { "Type": "String" },
                "AssetParameters111S3VersionKey": { "Type": "String" },
                "AssetParameters111ArtifactHash": { "Type": "String" },
                "Keep": { "Type": "String" },
            },
            "Resources": {
                "Fn": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Code": {
                            "S3Bucket": { "Ref": "AssetParameters111S3Bucket" },
                            "S3Key": { "Ref": "AssetParameters111S3VersionKey" },
                        },
                        "Tag": { "Ref": "AssetParameters111ArtifactHash" },
                    },
                },
            },
        }))
        .unwrap();
        Normalizer::readable().normalize(&mut template);
        let json = template.to_json();
        assert!(json["Parameters"].get("AssetParameters111S3Bucket").is_none());
        assert!(json["Parameters"].get("Keep").is_some());
        let props = &json["Resources"]["Fn"]["Properties"];
        assert_eq!(props["Code"]["S3Bucket"], "<asset-bucket>");
        assert_eq!(props["Code"]["S3Key"], "<asset-key>");
        assert_eq!(props["Tag"], "<asset-hash>");
    }

    #[test]
    fn normalizing_twice_is_idempotent() {
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "MyBucketF68F3FF0": { "Type": "AWS::S3::Bucket" },
                "HandlerServiceRoleA1B2C3D4": { "Type": "AWS::IAM::Role" },
            }
        }))
        .unwrap();
        let first = Normalizer::readable().normalize(&mut template);
        assert!(!first.is_empty());
        let snapshot = template.clone();
        let second = Normalizer::readable().normalize(&mut template);
        assert!(second.is_empty());
        assert_eq!(template, snapshot);
    }

    #[test]
    fn deployable_mode_keeps_ids() {
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "MyBucketF68F3FF0": { "Type": "AWS::S3::Bucket" },
            }
        }))
        .unwrap();
        let renames = Normalizer::deployable().normalize(&mut template);
        assert!(renames.is_empty());
        assert!(template.resource("MyBucketF68F3FF0").is_some());
    }
}
