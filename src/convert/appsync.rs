//! AppSync collapsing: a `GraphQLApi` constellation — schema, data sources,
//! function configurations, pipeline resolvers and api keys — folds into a
//! single `AWS::Serverless::GraphQLApi`.
//!
//! SAM synthesizes api-key logical ids by prefixing the parent api's id, so
//! removing the standalone `AWS::AppSync::ApiKey` resources requires a
//! rename applied both structurally and — because CDK embeds key ids inside
//! other synthesized strings — through the best-effort literal rewrite.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;
use tracing::debug;

use crate::convert::{Context, Pass};
use crate::error::SamaraError;
use crate::graph::remove_resources;
use crate::refs::{RenameMap, extract_logical_id, rewrite_literal_refs};
use crate::stage::{format_code_uri, prepare_inline_code};
use crate::template::{Template, properties, resource_type};
use crate::value::{Intrinsic, Map, Value};

static ASSET_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9a-f]{32,64}").expect("asset hash pattern"));

pub(crate) struct AppSyncApis;

impl Pass for AppSyncApis {
    fn name(&self) -> &'static str {
        "appsync-apis"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        let Some(resources) = template.resources() else {
            return Ok(false);
        };
        let api_ids: Vec<String> = resources
            .iter()
            .filter(|(_, resource)| {
                resource_type(resource) == Some("AWS::AppSync::GraphQLApi")
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut changed = false;
        let mut consumed: Vec<String> = Vec::new();
        let mut renames = RenameMap::new();
        let mut api_key_blocks: Vec<Vec<String>> = Vec::new();

        for api_id in api_ids {
            let Some(outcome) = convert_single_api(template, &api_id, cx)? else {
                continue;
            };
            debug!(%api_id, "collapsed AppSync API");
            consumed.extend(outcome.consumed);
            renames.extend(outcome.renames);
            if !outcome.api_key_names.is_empty() {
                api_key_blocks.push(outcome.api_key_names);
            }
            changed = true;
        }

        remove_resources(template, &consumed);
        if !renames.is_empty() {
            let expanded = expand_renames_with_strings(template, &renames);
            for key_names in api_key_blocks {
                rewrite_api_key_string_refs(template, &key_names);
            }
            let mut root = Value::Map(std::mem::take(template.root_mut()));
            rewrite_literal_refs(&mut root, &expanded, false, &HashSet::from(["DependsOn"]));
            *template.root_mut() = match root {
                Value::Map(map) => map,
                _ => unreachable!("root stays a map"),
            };
        }
        Ok(changed)
    }
}

struct ApiFold {
    consumed: Vec<String>,
    renames: RenameMap,
    api_key_names: Vec<String>,
}

fn convert_single_api(
    template: &mut Template,
    api_id: &str,
    cx: &mut Context,
) -> Result<Option<ApiFold>, SamaraError> {
    let Some(resources) = template.resources() else {
        return Ok(None);
    };
    let Some(props) = resources.get(api_id).and_then(properties).cloned() else {
        return Ok(None);
    };

    let Some((schema_id, schema_props)) = find_schema(resources, api_id) else {
        return Ok(None);
    };
    let schema_inline = schema_props.get("Definition").cloned();
    let schema_uri = schema_props.get("DefinitionS3Location").cloned();
    if schema_inline.is_none() && schema_uri.is_none() {
        return Ok(None);
    }

    let Some(data_sources) = collect_data_sources(resources, api_id) else {
        return Ok(None);
    };
    let Some(functions) = collect_functions(resources, api_id, &data_sources.name_lookup, cx)?
    else {
        return Ok(None);
    };
    let Some(resolvers) = collect_resolvers(resources, api_id, &functions.lookup, cx)? else {
        return Ok(None);
    };
    let api_keys = collect_api_keys(resources, api_id);

    let Some(auth) = build_auth_block(&props) else {
        return Ok(None);
    };

    let mut new_props = Map::new();
    new_props.insert("Auth".into(), Value::Map(auth));
    if let Some(name) = props.get("Name") {
        new_props.insert("Name".into(), name.clone());
    }
    if let Some(Value::String(definition)) = &schema_inline {
        let prepared = prepare_inline_code(definition);
        let mut externalized = false;
        if cx.options.prefer_external_assets
            && let Some(stager) = cx.stager.as_deref_mut()
        {
            let schema_logical = schema_id.clone();
            let staged = stager
                .stage_inline_text(&schema_logical, &prepared, "schema.graphql")
                .map_err(|err| SamaraError::staging(schema_logical, err))?;
            new_props.insert(
                "SchemaUri".into(),
                Value::string(format_code_uri(&staged, cx.options.relative_to.as_deref())),
            );
            externalized = true;
        }
        if !externalized {
            new_props.insert("SchemaInline".into(), Value::String(prepared));
        }
    } else if let Some(uri) = schema_uri {
        new_props.insert("SchemaUri".into(), uri);
    }
    new_props.insert("DataSources".into(), Value::Map(data_sources.block));
    new_props.insert("Functions".into(), Value::Map(functions.block));
    new_props.insert("Resolvers".into(), Value::Map(resolvers.block));
    if !api_keys.block.is_empty() {
        new_props.insert("ApiKeys".into(), Value::Map(api_keys.block.clone()));
    }
    for (source, target) in [
        ("LogConfig", "Logging"),
        ("XrayEnabled", "XrayEnabled"),
        ("Tags", "Tags"),
        ("Cache", "Cache"),
        ("DomainName", "DomainName"),
    ] {
        if let Some(value) = props.get(source) {
            new_props.insert(target.to_owned(), value.clone());
        }
    }

    let resource = template
        .resource_mut(api_id)
        .and_then(Value::as_map_mut)
        .expect("looked up above");
    resource.insert("Type".into(), Value::string("AWS::Serverless::GraphQLApi"));
    resource.insert("Properties".into(), Value::Map(new_props));

    let mut consumed = vec![schema_id];
    consumed.extend(data_sources.consumed);
    consumed.extend(functions.consumed);
    consumed.extend(resolvers.consumed);
    consumed.extend(api_keys.consumed);

    Ok(Some(ApiFold {
        consumed,
        renames: api_keys.renames,
        api_key_names: api_keys.block.keys().cloned().collect(),
    }))
}

fn belongs_to_api(props: &Map, api_id: &str) -> bool {
    props.get("ApiId").and_then(extract_logical_id) == Some(api_id)
}

fn find_schema(resources: &Map, api_id: &str) -> Option<(String, Map)> {
    for (logical_id, resource) in resources {
        if resource_type(resource) != Some("AWS::AppSync::GraphQLSchema") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        if belongs_to_api(props, api_id) {
            return Some((logical_id.clone(), props.clone()));
        }
    }
    None
}

struct DataSources {
    block: Map,
    name_lookup: HashMap<String, String>,
    consumed: Vec<String>,
}

/// Only DynamoDB and Lambda data sources are expressible; any other kind
/// blocks the whole collapse.
fn collect_data_sources(resources: &Map, api_id: &str) -> Option<DataSources> {
    let mut dynamodb = Map::new();
    let mut lambda = Map::new();
    let mut name_lookup = HashMap::new();
    let mut consumed = Vec::new();

    for (logical_id, resource) in resources {
        if resource_type(resource) != Some("AWS::AppSync::DataSource") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        if !belongs_to_api(props, api_id) {
            continue;
        }
        let entry_key = props
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or(logical_id)
            .to_owned();
        match props.get("Type").and_then(Value::as_str) {
            Some("AMAZON_DYNAMODB") => {
                let mut entry = Map::new();
                if let Some(config) = props.get("DynamoDBConfig").and_then(Value::as_map) {
                    for (source, target) in [
                        ("TableName", "TableName"),
                        ("AwsRegion", "Region"),
                        ("DeltaSyncConfig", "DeltaSync"),
                        ("UseCallerCredentials", "UseCallerCredentials"),
                        ("Versioned", "Versioned"),
                    ] {
                        if let Some(value) = config.get(source) {
                            entry.insert(target.to_owned(), value.clone());
                        }
                    }
                }
                for key in ["ServiceRoleArn", "Description", "Name"] {
                    if let Some(value) = props.get(key) {
                        entry.insert(key.to_owned(), value.clone());
                    }
                }
                dynamodb.insert(entry_key.clone(), Value::Map(entry));
            }
            Some("AWS_LAMBDA") => {
                let mut entry = Map::new();
                if let Some(arn) = props
                    .get("LambdaConfig")
                    .and_then(|config| config.get("LambdaFunctionArn"))
                {
                    entry.insert("FunctionArn".into(), arn.clone());
                }
                for key in ["ServiceRoleArn", "Description", "Name"] {
                    if let Some(value) = props.get(key) {
                        entry.insert(key.to_owned(), value.clone());
                    }
                }
                lambda.insert(entry_key.clone(), Value::Map(entry));
            }
            _ => return None,
        }
        if let Some(friendly) = props.get("Name").and_then(Value::as_str) {
            name_lookup.insert(friendly.to_owned(), entry_key.clone());
        }
        name_lookup.insert(logical_id.clone(), entry_key);
        consumed.push(logical_id.clone());
    }

    let mut block = Map::new();
    if !dynamodb.is_empty() {
        block.insert("DynamoDb".into(), Value::Map(dynamodb));
    }
    if !lambda.is_empty() {
        block.insert("Lambda".into(), Value::Map(lambda));
    }
    if block.is_empty() {
        return None;
    }
    Some(DataSources {
        block,
        name_lookup,
        consumed,
    })
}

struct Functions {
    block: Map,
    lookup: HashMap<String, String>,
    consumed: Vec<String>,
}

fn collect_functions(
    resources: &Map,
    api_id: &str,
    data_source_lookup: &HashMap<String, String>,
    cx: &mut Context,
) -> Result<Option<Functions>, SamaraError> {
    let mut block = Map::new();
    let mut lookup = HashMap::new();
    let mut consumed = Vec::new();

    for (logical_id, resource) in resources {
        if resource_type(resource) != Some("AWS::AppSync::FunctionConfiguration") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        if !belongs_to_api(props, api_id) {
            continue;
        }

        let mut entry = Map::new();
        if let Some(runtime) = normalize_graphql_runtime(props.get("Runtime")) {
            entry.insert("Runtime".into(), Value::Map(runtime));
        }
        if let Some(data_source) = props.get("DataSourceName").and_then(Value::as_str) {
            let resolved = data_source_lookup
                .get(data_source)
                .cloned()
                .unwrap_or_else(|| data_source.to_owned());
            entry.insert("DataSource".into(), Value::String(resolved));
        }
        for (source, target) in [
            ("Description", "Description"),
            ("Name", "Name"),
            ("MaxBatchSize", "MaxBatchSize"),
            ("SyncConfig", "Sync"),
        ] {
            if let Some(value) = props.get(source) {
                entry.insert(target.to_owned(), value.clone());
            }
        }
        let code = resolve_code_asset(logical_id, props, "function", cx)?;
        if let Some(inline) = code.inline {
            entry.insert("InlineCode".into(), inline);
        }
        if let Some(uri) = code.uri {
            entry.insert("CodeUri".into(), uri);
        }

        block.insert(logical_id.clone(), Value::Map(entry));
        lookup.insert(logical_id.clone(), logical_id.clone());
        consumed.push(logical_id.clone());
    }

    if block.is_empty() {
        return Ok(None);
    }
    Ok(Some(Functions {
        block,
        lookup,
        consumed,
    }))
}

struct Resolvers {
    block: Map,
    consumed: Vec<String>,
}

/// Resolvers group by GraphQL type name. Only pipeline resolvers are
/// expressible; a unit resolver aborts the collapse.
fn collect_resolvers(
    resources: &Map,
    api_id: &str,
    function_lookup: &HashMap<String, String>,
    cx: &mut Context,
) -> Result<Option<Resolvers>, SamaraError> {
    let mut grouped = Map::new();
    let mut consumed = Vec::new();

    for (logical_id, resource) in resources {
        if resource_type(resource) != Some("AWS::AppSync::Resolver") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        if !belongs_to_api(props, api_id) {
            continue;
        }
        if props
            .get("Kind")
            .is_some_and(|kind| kind.as_str() != Some("PIPELINE"))
        {
            return Ok(None);
        }
        let Some(type_name) = props.get("TypeName").and_then(Value::as_str) else {
            return Ok(None);
        };
        let Some(field_name) = props.get("FieldName").and_then(Value::as_str) else {
            return Ok(None);
        };
        if type_name.is_empty() || field_name.is_empty() {
            return Ok(None);
        }
        let Some(pipeline_refs) = props
            .get("PipelineConfig")
            .and_then(|config| config.get("Functions"))
            .and_then(Value::as_list)
            .filter(|refs| !refs.is_empty())
        else {
            return Ok(None);
        };
        let mut pipeline = Vec::new();
        for reference in pipeline_refs {
            let Some(target) = extract_logical_id(reference) else {
                return Ok(None);
            };
            let resolved = function_lookup
                .get(target)
                .cloned()
                .unwrap_or_else(|| target.to_owned());
            pipeline.push(Value::String(resolved));
        }

        let mut entry = Map::new();
        entry.insert("FieldName".into(), Value::string(field_name));
        entry.insert("Pipeline".into(), Value::List(pipeline));
        if let Some(runtime) = normalize_graphql_runtime(props.get("Runtime")) {
            entry.insert("Runtime".into(), Value::Map(runtime));
        }
        for (source, target) in [
            ("MaxBatchSize", "MaxBatchSize"),
            ("SyncConfig", "Sync"),
            ("CachingConfig", "Caching"),
        ] {
            if let Some(value) = props.get(source) {
                entry.insert(target.to_owned(), value.clone());
            }
        }
        let code = resolve_code_asset(logical_id, props, "resolver", cx)?;
        if let Some(inline) = code.inline {
            entry.insert("InlineCode".into(), inline);
        }
        if let Some(uri) = code.uri {
            entry.insert("CodeUri".into(), uri);
        }

        let group = grouped
            .entry(type_name.to_owned())
            .or_insert_with(|| Value::Map(Map::new()));
        if let Some(group) = group.as_map_mut() {
            group.insert(logical_id.clone(), Value::Map(entry));
        }
        consumed.push(logical_id.clone());
    }

    if grouped.is_empty() {
        return Ok(None);
    }
    Ok(Some(Resolvers {
        block: grouped,
        consumed,
    }))
}

struct ApiKeys {
    block: Map,
    consumed: Vec<String>,
    renames: RenameMap,
}

fn collect_api_keys(resources: &Map, api_id: &str) -> ApiKeys {
    let mut block = Map::new();
    let mut consumed = Vec::new();
    let mut renames = RenameMap::new();

    for (logical_id, resource) in resources {
        if resource_type(resource) != Some("AWS::AppSync::ApiKey") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        if !belongs_to_api(props, api_id) {
            continue;
        }

        let mut entry = Map::new();
        if let Some(description) = props.get("Description") {
            entry.insert("Description".into(), description.clone());
        }
        if let Some(expires) = props.get("Expires") {
            entry.insert("ExpiresOn".into(), expires.clone());
        }
        let key_id = props
            .get("ApiKeyId")
            .cloned()
            .unwrap_or_else(|| Value::string(logical_id));
        entry.insert("ApiKeyId".into(), key_id);
        block.insert(logical_id.clone(), Value::Map(entry));
        consumed.push(logical_id.clone());

        // SAM prefixes api-key logical ids with the parent api's id.
        let generated = format!("{api_id}{logical_id}");
        renames.insert(logical_id.clone(), generated.clone());
        renames.insert(generated.clone(), generated);
    }

    ApiKeys {
        block,
        consumed,
        renames,
    }
}

fn build_auth_block(props: &Map) -> Option<Map> {
    let auth_type = props.get("AuthenticationType").and_then(Value::as_str)?;
    let mut auth = Map::new();
    auth.insert("Type".into(), Value::string(auth_type));

    for (source, target) in [
        ("OpenIDConnectConfig", "OpenIDConnect"),
        ("UserPoolConfig", "UserPool"),
        ("LambdaAuthorizerConfig", "LambdaAuthorizer"),
    ] {
        if let Some(value) = props.get(source) {
            auth.insert(target.to_owned(), value.clone());
        }
    }

    let mut additional = Vec::new();
    if let Some(providers) = props
        .get("AdditionalAuthenticationProviders")
        .and_then(Value::as_list)
    {
        for provider in providers {
            let Some(provider_type) = provider
                .get("AuthenticationType")
                .and_then(Value::as_str)
            else {
                continue;
            };
            let mut entry = Map::new();
            entry.insert("Type".into(), Value::string(provider_type));
            for (source, target) in [
                ("LambdaAuthorizerConfig", "LambdaAuthorizer"),
                ("OpenIDConnectConfig", "OpenIDConnect"),
                ("UserPoolConfig", "UserPool"),
            ] {
                if let Some(value) = provider.get(source) {
                    entry.insert(target.to_owned(), value.clone());
                }
            }
            additional.push(Value::Map(entry));
        }
    }
    if !additional.is_empty() {
        auth.insert("Additional".into(), Value::List(additional));
    }
    Some(auth)
}

struct ResolvedCode {
    uri: Option<Value>,
    inline: Option<Value>,
}

/// Resolve an AppSync `Code`/`CodeS3Location` to inline text or a staged
/// file, mirroring the Lambda code-resolution order.
fn resolve_code_asset(
    logical_id: &str,
    props: &Map,
    default_name: &str,
    cx: &mut Context,
) -> Result<ResolvedCode, SamaraError> {
    let preferred_name = infer_code_filename(props, default_name);
    let relative_to = cx.options.relative_to.as_deref().map(Utf8Path::to_owned);

    if let Some(Value::String(code)) = props.get("Code") {
        let prepared = prepare_inline_code(code);
        if cx.options.prefer_external_assets
            && let Some(stager) = cx.stager.as_deref_mut()
        {
            let staged = stager
                .stage_inline_text(logical_id, &prepared, &preferred_name)
                .map_err(|err| SamaraError::staging(logical_id, err))?;
            return Ok(ResolvedCode {
                uri: Some(Value::string(format_code_uri(&staged, relative_to.as_deref()))),
                inline: None,
            });
        }
        return Ok(ResolvedCode {
            uri: None,
            inline: Some(Value::String(prepared)),
        });
    }

    let Some(location) = props.get("CodeS3Location") else {
        return Ok(ResolvedCode {
            uri: None,
            inline: None,
        });
    };

    let resolved = resolve_s3_location(location, cx);
    if let Some(stager) = cx.stager.as_deref_mut() {
        let lookup = resolved.as_deref().or_else(|| stringify_s3_location(location));
        if let Some(candidates) = lookup.and_then(local_asset_candidates) {
            if let Some(found) = stager.find_named_asset(&candidates) {
                let file_name = filename_for(&found, &preferred_name);
                let staged = stager
                    .stage_file_asset(logical_id, &found, &file_name)
                    .map_err(|err| SamaraError::staging(logical_id, err))?;
                return Ok(ResolvedCode {
                    uri: Some(Value::string(format_code_uri(&staged, relative_to.as_deref()))),
                    inline: None,
                });
            }
            if let Some((bucket, key)) = lookup.and_then(parse_literal_s3_uri) {
                let file_name = filename_for(Utf8Path::new(&key), &preferred_name);
                let staged = stager
                    .stage_s3_file(logical_id, &bucket, &key, None, &file_name)
                    .map_err(|err| SamaraError::staging(logical_id, err))?;
                return Ok(ResolvedCode {
                    uri: Some(Value::string(format_code_uri(&staged, relative_to.as_deref()))),
                    inline: None,
                });
            }
        }
    }

    let uri = match resolved {
        Some(resolved) => Value::String(resolved),
        None => location.clone(),
    };
    Ok(ResolvedCode {
        uri: Some(uri),
        inline: None,
    })
}

fn resolve_s3_location(location: &Value, cx: &mut Context) -> Option<String> {
    if let Some(literal) = stringify_s3_location(location)
        && !literal.contains("${")
    {
        return Some(literal.to_owned());
    }
    cx.stager
        .as_deref()
        .and_then(|stager| stager.resolve_string(location))
        .or_else(|| stringify_s3_location(location).map(str::to_owned))
}

fn stringify_s3_location(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::Sub(payload) => match payload {
                Value::String(s) => Some(s),
                Value::List(items) => items.first().and_then(Value::as_str),
                _ => None,
            },
            _ => None,
        },
        Value::Map(map) => match map.get("Fn::Sub") {
            Some(Value::String(s)) => Some(s),
            Some(Value::List(items)) => items.first().and_then(Value::as_str),
            _ => None,
        },
        _ => None,
    }
}

/// File names a CDK-synthesized S3 key might be staged under locally.
fn local_asset_candidates(location: &str) -> Option<Vec<String>> {
    if !location.to_ascii_lowercase().starts_with("s3://") {
        return None;
    }
    let key = location.splitn(4, '/').nth(3)?;
    let base_name = Utf8Path::new(key).file_name()?.to_owned();
    let mut candidates = vec![base_name.clone()];
    if !base_name.starts_with("asset.") {
        candidates.push(format!("asset.{base_name}"));
        if let Some(hash) = ASSET_HASH.find(&base_name) {
            let suffix = Utf8Path::new(&base_name)
                .extension()
                .map(|ext| format!(".{ext}"))
                .unwrap_or_default();
            candidates.push(format!("asset.{}{suffix}", hash.as_str()));
        }
    }
    Some(candidates)
}

fn parse_literal_s3_uri(location: &str) -> Option<(String, String)> {
    if !location.to_ascii_lowercase().starts_with("s3://") {
        return None;
    }
    let (bucket, key) = location[5..].split_once('/')?;
    if bucket.is_empty() || key.is_empty() || bucket.contains("${") || key.contains("${") {
        return None;
    }
    Some((bucket.to_owned(), key.to_owned()))
}

fn filename_for(source: &Utf8Path, preferred: &str) -> String {
    match source.extension() {
        Some(ext) => {
            let suffix = format!(".{ext}");
            if preferred.ends_with(&suffix) {
                preferred.to_owned()
            } else {
                format!("{preferred}{suffix}")
            }
        }
        None => preferred.to_owned(),
    }
}

fn infer_code_filename(props: &Map, default_name: &str) -> String {
    let suffix = props
        .get("CodeS3Location")
        .and_then(stringify_s3_location)
        .and_then(|location| Utf8Path::new(location).extension())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_else(|| ".js".to_owned());
    format!("{default_name}{suffix}")
}

fn normalize_graphql_runtime(value: Option<&Value>) -> Option<Map> {
    let map = value?.as_map()?;
    let mut runtime = Map::new();
    if let Some(name) = map.get("Name") {
        runtime.insert("Name".into(), name.clone());
    }
    if let Some(version) = map.get("Version").or_else(|| map.get("RuntimeVersion")) {
        runtime.insert("Version".into(), version.clone());
    }
    (!runtime.is_empty()).then_some(runtime)
}

fn collect_strings(node: &Value, into: &mut HashSet<String>) {
    match node {
        Value::String(s) => {
            into.insert(s.clone());
        }
        Value::List(items) => {
            for item in items {
                collect_strings(item, into);
            }
        }
        Value::Map(map) => {
            for value in map.values() {
                collect_strings(value, into);
            }
        }
        Value::Intrinsic(tag) => collect_strings(tag.payload(), into),
        _ => {}
    }
}

/// Literal strings that *end with* a renamed id are renamed too — synthesized
/// ids embed the key id as a suffix. Heuristic, not a sound rewrite.
fn expand_renames_with_strings(template: &Template, renames: &RenameMap) -> RenameMap {
    let mut strings = HashSet::new();
    collect_strings(&Value::Map(template.root().clone()), &mut strings);

    let mut expanded = renames.clone();
    for candidate in &strings {
        for (key, new) in renames {
            if candidate != key && candidate.ends_with(key.as_str()) {
                expanded.insert(candidate.clone(), new.clone());
            }
        }
    }
    expanded
}

/// Literal strings *containing* an api-key id collapse down to the bare key
/// name, which the structural pass then maps to the SAM-synthesized id.
fn rewrite_api_key_string_refs(template: &mut Template, key_names: &[String]) {
    let mut strings = HashSet::new();
    collect_strings(&Value::Map(template.root().clone()), &mut strings);

    let mut renames = RenameMap::new();
    for candidate in &strings {
        for key in key_names {
            if candidate != key && candidate.contains(key.as_str()) {
                renames.insert(candidate.clone(), key.clone());
            }
        }
    }
    if renames.is_empty() {
        return;
    }
    let mut root = Value::Map(std::mem::take(template.root_mut()));
    rewrite_literal_refs(&mut root, &renames, true, &HashSet::from(["DependsOn"]));
    *template.root_mut() = match root {
        Value::Map(map) => map,
        _ => unreachable!("root stays a map"),
    };
}
