//! API Gateway folding: proxy methods become `Api` events on their target
//! functions, and orphaned REST/HTTP API shells collapse into
//! `AWS::Serverless::Api` / `AWS::Serverless::HttpApi`.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::convert::{Context, Pass, attach_event, event_entry};
use crate::error::SamaraError;
use crate::graph::{api_resource_paths, remove_resources, resolve_method_path};
use crate::refs::{extract_logical_id, references_any};
use crate::template::{Template, metadata, properties, resource_type};
use crate::value::{Intrinsic, Map, Value};

static SUB_ARN_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9]+)\.Arn\}").expect("arn token pattern"));

static INVOCATION_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"functions/([A-Za-z0-9]+)/invocations").expect("uri pattern"));

/// `AWS::ApiGateway::Method` with an `AWS_PROXY` integration to a converted
/// function → `Api` event, plus removal of the paired invoke permission.
pub(crate) struct ApiMethods;

impl Pass for ApiMethods {
    fn name(&self) -> &'static str {
        "apigateway-methods"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        if cx.converted.is_empty() {
            return Ok(false);
        }
        let Some(resources) = template.resources() else {
            return Ok(false);
        };
        let paths = api_resource_paths(resources);

        struct MethodFold {
            method_id: String,
            function_id: String,
            event_name: String,
            event: Value,
        }

        let mut folds: Vec<MethodFold> = Vec::new();
        let mut permission_ids: Vec<String> = Vec::new();
        for (method_id, resource) in resources {
            if resource_type(resource) != Some("AWS::ApiGateway::Method") {
                continue;
            }
            let Some(props) = properties(resource) else {
                continue;
            };
            let Some(integration) = props.get("Integration") else {
                continue;
            };
            if !is_lambda_proxy_integration(integration) {
                continue;
            }
            let Some(function_id) = function_from_integration(integration) else {
                continue;
            };
            if !cx.is_converted(&function_id) {
                continue;
            }
            let Some(path) = props
                .get("ResourceId")
                .and_then(|id| resolve_method_path(id, &paths))
            else {
                continue;
            };
            let rest_api_id = props.get("RestApiId").cloned();
            let method = props
                .get("HttpMethod")
                .and_then(Value::as_str)
                .unwrap_or("ANY")
                .to_ascii_uppercase();

            let mut event_props = Map::new();
            if let Some(rest_api_id) = &rest_api_id {
                event_props.insert("RestApiId".into(), rest_api_id.clone());
            }
            event_props.insert("Path".into(), Value::string(&path));
            event_props.insert("Method".into(), Value::string(&method));
            let event = event_entry("Api", event_props);

            let event_name = format!(
                "Api{}{}",
                title_case(&method),
                sanitize_path_for_name(&path)
            );
            permission_ids.extend(method_permission_ids(
                resources,
                &function_id,
                rest_api_id.as_ref(),
            ));
            folds.push(MethodFold {
                method_id: method_id.clone(),
                function_id,
                event_name,
                event,
            });
        }

        let mut removals = Vec::new();
        for fold in folds {
            let Some(function) = template.resource_mut(&fold.function_id) else {
                continue;
            };
            attach_event(function, &fold.event_name, fold.event);
            debug!(method_id = %fold.method_id, function_id = %fold.function_id, "folded API method");
            removals.push(fold.method_id);
        }
        let changed = !removals.is_empty();
        remove_resources(template, &removals);
        remove_resources(template, &permission_ids);
        Ok(changed)
    }
}

fn is_lambda_proxy_integration(integration: &Value) -> bool {
    let Some(map) = integration.as_map() else {
        return false;
    };
    if let Some(kind) = map.get("Type").and_then(Value::as_str)
        && !kind.eq_ignore_ascii_case("AWS_PROXY")
    {
        return false;
    }
    function_from_integration(integration).is_some()
}

/// The function a proxy integration invokes, pulled out of whichever shape
/// the `Uri` takes: `GetAtt`, `Sub` with an `${Fn.Arn}` token, `Join` with a
/// `GetAtt` fragment, or a literal invocation URI.
fn function_from_integration(integration: &Value) -> Option<String> {
    let uri = integration
        .get("Uri")
        .or_else(|| integration.get("IntegrationUri"))?;

    match uri {
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::GetAtt(_) => extract_logical_id(uri).map(str::to_owned),
            Intrinsic::Sub(payload) => {
                let template = match payload {
                    Value::List(items) => items.first()?.as_str()?,
                    Value::String(s) => s,
                    _ => return None,
                };
                sub_arn_function(template)
            }
            Intrinsic::Join(payload) => join_getatt_function(payload),
            _ => None,
        },
        Value::Map(map) => {
            if map.contains_key("Fn::GetAtt") {
                return extract_logical_id(uri).map(str::to_owned);
            }
            if let Some(sub) = map.get("Fn::Sub") {
                let template = match sub {
                    Value::List(items) => items.first()?.as_str()?,
                    Value::String(s) => s,
                    _ => return None,
                };
                return sub_arn_function(template);
            }
            join_getatt_function(map.get("Fn::Join")?)
        }
        Value::String(s) => INVOCATION_URI
            .captures(s)
            .map(|caps| caps[1].to_owned()),
        _ => None,
    }
}

fn sub_arn_function(template: &str) -> Option<String> {
    SUB_ARN_TOKEN
        .captures(template)
        .map(|caps| caps[1].to_owned())
}

fn join_getatt_function(payload: &Value) -> Option<String> {
    let items = payload.as_list()?;
    let [_, fragments] = items else {
        return None;
    };
    fragments.as_list()?.iter().find_map(|part| {
        let is_getatt = match part {
            Value::Intrinsic(tag) => matches!(&**tag, Intrinsic::GetAtt(_)),
            Value::Map(map) => map.contains_key("Fn::GetAtt"),
            _ => false,
        };
        is_getatt
            .then(|| extract_logical_id(part).map(str::to_owned))
            .flatten()
    })
}

/// Invoke permissions the method fold makes redundant: principal
/// `apigateway.amazonaws.com`, aimed at the function, source ARN naming the
/// API, and a CDK path placing them under the ApiGateway construct.
fn method_permission_ids(
    resources: &Map,
    function_id: &str,
    rest_api_id: Option<&Value>,
) -> Vec<String> {
    let rest_api_name = rest_api_id.and_then(extract_logical_id);
    let mut ids = Vec::new();
    for (logical_id, resource) in resources {
        if resource_type(resource) != Some("AWS::Lambda::Permission") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        if props.get("Principal").and_then(Value::as_str) != Some("apigateway.amazonaws.com") {
            continue;
        }
        if props.get("FunctionName").and_then(extract_logical_id) != Some(function_id) {
            continue;
        }
        if let Some(api_name) = rest_api_name {
            let refers = props
                .get("SourceArn")
                .is_some_and(|arn| source_arn_refers_to_api(arn, api_name));
            if !refers {
                continue;
            }
        }
        let in_api_construct = metadata(resource)
            .and_then(|md| md.get("aws:cdk:path"))
            .and_then(Value::as_str)
            .is_some_and(|path| path.contains("ApiGateway"));
        if !in_api_construct {
            continue;
        }
        ids.push(logical_id.clone());
    }
    ids
}

fn source_arn_refers_to_api(source_arn: &Value, api_name: &str) -> bool {
    let sub_template = match source_arn {
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::Sub(payload) => match payload {
                Value::List(items) => items.first().and_then(Value::as_str),
                Value::String(s) => Some(s.as_str()),
                _ => None,
            },
            Intrinsic::Join(payload) => {
                return join_refers_to_api(payload, api_name);
            }
            _ => None,
        },
        Value::Map(map) => {
            if let Some(join) = map.get("Fn::Join") {
                return join_refers_to_api(join, api_name);
            }
            match map.get("Fn::Sub") {
                Some(Value::List(items)) => items.first().and_then(Value::as_str),
                Some(Value::String(s)) => Some(s.as_str()),
                _ => None,
            }
        }
        Value::String(s) => return s.contains(api_name),
        _ => None,
    };
    sub_template.is_some_and(|template| {
        template.contains(&format!("${{{api_name}}}")) || template.contains(api_name)
    })
}

fn join_refers_to_api(payload: &Value, api_name: &str) -> bool {
    let Some(items) = payload.as_list() else {
        return false;
    };
    if items.len() != 2 {
        return false;
    }
    let Some(parts) = items[1].as_list() else {
        return false;
    };
    parts.iter().any(|part| match part {
        Value::String(s) => s.contains(api_name),
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::Ref(payload) => payload.as_str() == Some(api_name),
            _ => false,
        },
        Value::Map(map) => map.get("Ref").and_then(Value::as_str) == Some(api_name),
        _ => false,
    })
}

/// `ApiGetItems`-style event names from a request path.
fn sanitize_path_for_name(path: &str) -> String {
    let words: Vec<String> = path
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(title_case)
        .collect();
    if words.is_empty() {
        "Root".to_owned()
    } else {
        words.concat()
    }
}

fn title_case(word: impl AsRef<str>) -> String {
    let word = word.as_ref();
    let mut chars = word.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => {
            first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
        }
    }
}

/// Collapse a `RestApi` + `Deployment` + `Stage` shell (plus an optional
/// uniform root CORS `OPTIONS` layer) into `AWS::Serverless::Api`, once
/// nothing else depends on the deployment or stage.
pub(crate) struct RestApiShells;

impl Pass for RestApiShells {
    fn name(&self) -> &'static str {
        "rest-api-shells"
    }

    fn run(&self, template: &mut Template, _cx: &mut Context) -> Result<bool, SamaraError> {
        let Some(resources) = template.resources() else {
            return Ok(false);
        };
        let paths = api_resource_paths(resources);
        let api_ids: Vec<String> = resources
            .iter()
            .filter(|(_, resource)| {
                resource_type(resource) == Some("AWS::ApiGateway::RestApi")
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut changed = false;
        let mut removals: Vec<String> = Vec::new();
        let mut stage_rewrites: Vec<(Vec<String>, String)> = Vec::new();

        for api_id in api_ids {
            let Some(resources) = template.resources() else {
                break;
            };
            let cors = detect_cors_configuration(resources, &api_id, &paths);
            if !cors.other_methods.is_empty() {
                continue;
            }
            if !cors.methods.is_empty() && cors.config.is_none() {
                continue;
            }

            let permission_ids = api_permission_ids(resources, &api_id);
            let child_ids = api_child_resource_ids(resources, &api_id);
            let excluded: HashSet<&str> = cors
                .methods
                .iter()
                .chain(&permission_ids)
                .chain(&child_ids)
                .map(String::as_str)
                .collect();

            let Some(deps) = collect_rest_api_deps(resources, &api_id, &excluded) else {
                continue;
            };
            let stage_name = select_stage_name(resources, &deps.stages, &api_id);

            let Some(new_props) =
                convert_rest_api_props(resources.get(&api_id).expect("listed above"), stage_name.as_deref(), cors.config.as_ref())
            else {
                continue;
            };

            let resource = template
                .resource_mut(&api_id)
                .and_then(Value::as_map_mut)
                .expect("listed above");
            resource.insert("Type".into(), Value::string("AWS::Serverless::Api"));
            resource.insert("Properties".into(), Value::Map(new_props));
            debug!(%api_id, "folded REST API shell");

            if let Some(stage_name) = stage_name
                && !deps.stages.is_empty()
            {
                stage_rewrites.push((deps.stages.clone(), stage_name));
            }
            removals.extend(deps.deployments);
            removals.extend(deps.stages);
            removals.extend(cors.methods);
            removals.extend(child_ids);
            removals.extend(permission_ids);
            changed = true;
        }

        for (stage_ids, stage_name) in stage_rewrites {
            rewrite_stage_references(template, &stage_ids, &stage_name);
        }
        remove_resources(template, &removals);
        Ok(changed)
    }
}

struct RestApiDeps {
    deployments: Vec<String>,
    stages: Vec<String>,
}

/// Deployments and stages belonging to the API — or `None` when some other
/// surviving resource still references the shell, which blocks the fold.
fn collect_rest_api_deps(
    resources: &Map,
    api_id: &str,
    excluded: &HashSet<&str>,
) -> Option<RestApiDeps> {
    let mut deployments = Vec::new();
    let mut stages = Vec::new();

    for (logical_id, resource) in resources {
        if excluded.contains(logical_id.as_str()) {
            continue;
        }
        let kind = resource_type(resource);
        let rest_api = properties(resource)
            .and_then(|props| props.get("RestApiId"))
            .and_then(extract_logical_id);
        if kind == Some("AWS::ApiGateway::Deployment") && rest_api == Some(api_id) {
            deployments.push(logical_id.clone());
        }
        if kind == Some("AWS::ApiGateway::Stage") && rest_api == Some(api_id) {
            stages.push(logical_id.clone());
        }
    }

    let mut targets: HashSet<&str> = HashSet::from([api_id]);
    targets.extend(deployments.iter().map(String::as_str));
    targets.extend(stages.iter().map(String::as_str));

    for (logical_id, resource) in resources {
        if excluded.contains(logical_id.as_str()) {
            continue;
        }
        match resource_type(resource) {
            Some("AWS::ApiGateway::Deployment") | Some("AWS::ApiGateway::RestApi")
            | Some("AWS::Serverless::Function") | Some("AWS::Serverless::Api") => continue,
            Some("AWS::ApiGateway::Stage") => {
                // A stage of another API pinned to one of our deployments
                // still blocks removal.
                let rest_api = properties(resource)
                    .and_then(|props| props.get("RestApiId"))
                    .and_then(extract_logical_id);
                if rest_api == Some(api_id) {
                    continue;
                }
                let deployment = properties(resource)
                    .and_then(|props| props.get("DeploymentId"))
                    .and_then(extract_logical_id);
                if deployment.is_some_and(|id| deployments.iter().any(|d| d == id)) {
                    return None;
                }
            }
            _ => {
                if references_any(resource, &targets) {
                    return None;
                }
            }
        }
    }

    Some(RestApiDeps {
        deployments,
        stages,
    })
}

struct CorsDetection {
    config: Option<Map>,
    methods: Vec<String>,
    other_methods: Vec<String>,
}

/// A shell is only foldable when every method left on the API is a uniform
/// MOCK CORS `OPTIONS` layer that includes the root resource.
fn detect_cors_configuration(resources: &Map, api_id: &str, paths: &std::collections::HashMap<String, String>) -> CorsDetection {
    let mut methods = Vec::new();
    let mut other_methods = Vec::new();
    let mut allow_origin: Option<String> = None;
    let mut allow_headers: Option<String> = None;
    let mut allow_methods: Option<String> = None;
    let mut has_root_cors = false;

    for (logical_id, resource) in resources {
        if resource_type(resource) != Some("AWS::ApiGateway::Method") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        if props.get("RestApiId").and_then(extract_logical_id) != Some(api_id) {
            continue;
        }
        let method = props
            .get("HttpMethod")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_uppercase();
        if method != "OPTIONS" {
            other_methods.push(logical_id.clone());
            continue;
        }
        let Some((origin, headers, cors_methods)) =
            extract_cors_from_integration(props.get("Integration"))
        else {
            other_methods.push(logical_id.clone());
            continue;
        };

        let consistent = |slot: &mut Option<String>, value: Option<String>| match value {
            None => true,
            Some(value) => match slot {
                None => {
                    *slot = Some(value);
                    true
                }
                Some(existing) => *existing == value,
            },
        };
        if !consistent(&mut allow_origin, Some(origin))
            || !consistent(&mut allow_headers, headers)
            || !consistent(&mut allow_methods, cors_methods)
        {
            other_methods.push(logical_id.clone());
            continue;
        }

        if props
            .get("ResourceId")
            .and_then(|id| resolve_method_path(id, paths))
            .as_deref()
            == Some("/")
        {
            has_root_cors = true;
        }
        methods.push(logical_id.clone());
    }

    if methods.is_empty() {
        return CorsDetection {
            config: None,
            methods: Vec::new(),
            other_methods,
        };
    }
    if !other_methods.is_empty() {
        return CorsDetection {
            config: None,
            methods,
            other_methods,
        };
    }
    if !has_root_cors || allow_origin.is_none() {
        return CorsDetection {
            config: None,
            methods,
            other_methods: Vec::new(),
        };
    }

    let mut config = Map::new();
    config.insert(
        "AllowOrigin".into(),
        Value::String(allow_origin.expect("checked above")),
    );
    if let Some(headers) = allow_headers {
        config.insert("AllowHeaders".into(), Value::String(headers));
    }
    if let Some(methods_value) = allow_methods {
        config.insert("AllowMethods".into(), Value::String(methods_value));
    }
    CorsDetection {
        config: Some(config),
        methods,
        other_methods: Vec::new(),
    }
}

fn extract_cors_from_integration(
    integration: Option<&Value>,
) -> Option<(String, Option<String>, Option<String>)> {
    let integration = integration?.as_map()?;
    if !integration
        .get("Type")
        .and_then(Value::as_str)
        .is_some_and(|kind| kind.eq_ignore_ascii_case("MOCK"))
    {
        return None;
    }
    let responses = integration.get("IntegrationResponses")?.as_list()?;
    let params = responses
        .first()?
        .get("ResponseParameters")?
        .as_map()?;

    let origin = params
        .get("method.response.header.Access-Control-Allow-Origin")?
        .as_str()?
        .to_owned();
    let optional_header = |key: &str| -> Option<Option<String>> {
        match params.get(key) {
            None => Some(None),
            Some(Value::String(value)) => Some(Some(value.clone())),
            Some(_) => None,
        }
    };
    let headers = optional_header("method.response.header.Access-Control-Allow-Headers")?;
    let methods = optional_header("method.response.header.Access-Control-Allow-Methods")?;
    Some((origin, headers, methods))
}

fn api_child_resource_ids(resources: &Map, api_id: &str) -> Vec<String> {
    resources
        .iter()
        .filter(|(_, resource)| {
            resource_type(resource) == Some("AWS::ApiGateway::Resource")
                && properties(resource)
                    .and_then(|props| props.get("RestApiId"))
                    .and_then(extract_logical_id)
                    == Some(api_id)
        })
        .map(|(id, _)| id.clone())
        .collect()
}

fn api_permission_ids(resources: &Map, api_id: &str) -> Vec<String> {
    resources
        .iter()
        .filter(|(_, resource)| {
            if resource_type(resource) != Some("AWS::Lambda::Permission") {
                return false;
            }
            let Some(props) = properties(resource) else {
                return false;
            };
            props.get("Principal").and_then(Value::as_str) == Some("apigateway.amazonaws.com")
                && props
                    .get("SourceArn")
                    .is_some_and(|arn| source_arn_refers_to_api(arn, api_id))
        })
        .map(|(id, _)| id.clone())
        .collect()
}

fn select_stage_name(resources: &Map, stage_ids: &[String], api_id: &str) -> Option<String> {
    for stage_id in stage_ids {
        let Some(resource) = resources.get(stage_id) else {
            continue;
        };
        if resource_type(resource) != Some("AWS::ApiGateway::Stage") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        if props.get("RestApiId").and_then(extract_logical_id) != Some(api_id) {
            continue;
        }
        if let Some(name) = props.get("StageName").and_then(Value::as_str)
            && !name.is_empty()
        {
            return Some(name.to_owned());
        }
    }
    None
}

const REST_API_PROPERTY_MAP: [&str; 17] = [
    "Name",
    "Description",
    "FailOnWarnings",
    "EndpointConfiguration",
    "BinaryMediaTypes",
    "MinimumCompressionSize",
    "AccessLogSetting",
    "CanarySetting",
    "Mode",
    "ApiKeySourceType",
    "Policy",
    "OpenApiVersion",
    "Models",
    "Domain",
    "AlwaysDeploy",
    "PropagateTags",
    "Tags",
];

fn convert_rest_api_props(
    resource: &Value,
    stage_name: Option<&str>,
    cors: Option<&Map>,
) -> Option<Map> {
    let props = properties(resource)?;
    let mut new_props = Map::new();
    for key in REST_API_PROPERTY_MAP {
        if let Some(value) = props.get(key) {
            new_props.insert(key.to_owned(), value.clone());
        }
    }
    for key in ["DefinitionBody", "DefinitionUri"] {
        if let Some(value) = props.get(key) {
            new_props.insert(key.to_owned(), value.clone());
        }
    }
    if let Some(stage_name) = stage_name.filter(|name| !name.is_empty()) {
        new_props.insert("StageName".into(), Value::string(stage_name));
    }
    if let Some(cors) = cors.filter(|config| !config.is_empty()) {
        new_props.insert("Cors".into(), Value::Map(cors.clone()));
    }
    Some(new_props)
}

/// Replace `${StageId}` Sub tokens (and Join fragments referencing the
/// stage) with the literal stage name the shell fold discovered.
fn rewrite_stage_references(template: &mut Template, stage_ids: &[String], stage_name: &str) {
    if stage_ids.is_empty() || stage_name.is_empty() {
        return;
    }
    let mut root = Value::Map(std::mem::take(template.root_mut()));
    rewrite_stage_node(&mut root, stage_ids, stage_name);
    *template.root_mut() = match root {
        Value::Map(map) => map,
        _ => unreachable!("root stays a map"),
    };
}

fn replace_stage_tokens(value: &str, stage_ids: &[String], stage_name: &str) -> String {
    let mut out = value.to_owned();
    for stage_id in stage_ids {
        out = out.replace(&format!("${{{stage_id}}}"), stage_name);
    }
    out
}

fn rewrite_stage_node(node: &mut Value, stage_ids: &[String], stage_name: &str) {
    match node {
        Value::Intrinsic(tag) => match &mut **tag {
            Intrinsic::Sub(payload) => match payload {
                Value::String(s) => *s = replace_stage_tokens(s, stage_ids, stage_name),
                Value::List(items) => {
                    if let Some(Value::String(s)) = items.first_mut() {
                        *s = replace_stage_tokens(s, stage_ids, stage_name);
                    }
                }
                _ => {}
            },
            Intrinsic::Join(payload) => rewrite_stage_join(payload, stage_ids, stage_name),
            _ => {}
        },
        Value::Map(map) => {
            for (key, value) in map.iter_mut() {
                match key.as_str() {
                    "Fn::Sub" => match value {
                        Value::String(s) => *s = replace_stage_tokens(s, stage_ids, stage_name),
                        Value::List(items) => {
                            if let Some(Value::String(s)) = items.first_mut() {
                                *s = replace_stage_tokens(s, stage_ids, stage_name);
                            }
                        }
                        _ => {}
                    },
                    "Fn::Join" => rewrite_stage_join(value, stage_ids, stage_name),
                    _ => rewrite_stage_node(value, stage_ids, stage_name),
                }
            }
        }
        Value::List(items) => {
            for item in items {
                rewrite_stage_node(item, stage_ids, stage_name);
            }
        }
        _ => {}
    }
}

fn rewrite_stage_join(payload: &mut Value, stage_ids: &[String], stage_name: &str) {
    let Some(items) = payload.as_list_mut() else {
        return;
    };
    if items.len() != 2 {
        for item in items {
            rewrite_stage_node(item, stage_ids, stage_name);
        }
        return;
    }
    let Some(parts) = items[1].as_list_mut() else {
        return;
    };
    for part in parts {
        let stage_ref = match &*part {
            Value::Map(map) => map.get("Ref").and_then(Value::as_str),
            Value::Intrinsic(tag) => match &**tag {
                Intrinsic::Ref(payload) => payload.as_str(),
                _ => None,
            },
            _ => None,
        };
        if stage_ref.is_some_and(|id| stage_ids.iter().any(|stage| stage == id)) {
            *part = Value::string(stage_name);
        } else if let Value::String(s) = part {
            *s = replace_stage_tokens(s, stage_ids, stage_name);
        }
    }
}

/// `AWS::ApiGatewayV2::Api` without routes → `AWS::Serverless::HttpApi`.
pub(crate) struct HttpApiShells;

impl Pass for HttpApiShells {
    fn name(&self) -> &'static str {
        "http-api-shells"
    }

    fn run(&self, template: &mut Template, _cx: &mut Context) -> Result<bool, SamaraError> {
        let Some(resources) = template.resources() else {
            return Ok(false);
        };
        let api_ids: Vec<String> = resources
            .iter()
            .filter(|(_, resource)| resource_type(resource) == Some("AWS::ApiGatewayV2::Api"))
            .map(|(id, _)| id.clone())
            .collect();

        let mut changed = false;
        let mut removals: Vec<String> = Vec::new();
        for api_id in api_ids {
            let Some(resources) = template.resources() else {
                break;
            };
            let route_present = resources.values().any(|resource| {
                resource_type(resource) == Some("AWS::ApiGatewayV2::Route")
                    && properties(resource)
                        .and_then(|props| props.get("ApiId"))
                        .and_then(extract_logical_id)
                        == Some(api_id.as_str())
            });
            if route_present {
                continue;
            }

            let Some(deps) = collect_http_api_deps(resources, &api_id) else {
                continue;
            };
            let Some(new_props) = convert_http_api_props(resources.get(&api_id).expect("listed"))
            else {
                continue;
            };

            let resource = template
                .resource_mut(&api_id)
                .and_then(Value::as_map_mut)
                .expect("listed above");
            resource.insert("Type".into(), Value::string("AWS::Serverless::HttpApi"));
            resource.insert("Properties".into(), Value::Map(new_props));
            debug!(%api_id, "folded HTTP API shell");
            removals.extend(deps.integrations);
            removals.extend(deps.stages);
            changed = true;
        }
        remove_resources(template, &removals);
        Ok(changed)
    }
}

struct HttpApiDeps {
    integrations: Vec<String>,
    stages: Vec<String>,
}

fn collect_http_api_deps(resources: &Map, api_id: &str) -> Option<HttpApiDeps> {
    let mut integrations = Vec::new();
    let mut stages = Vec::new();

    for (logical_id, resource) in resources {
        let kind = resource_type(resource);
        let api = properties(resource)
            .and_then(|props| props.get("ApiId"))
            .and_then(extract_logical_id);
        if api != Some(api_id) {
            continue;
        }
        match kind {
            Some("AWS::ApiGatewayV2::Integration") => integrations.push(logical_id.clone()),
            Some("AWS::ApiGatewayV2::Stage") => stages.push(logical_id.clone()),
            _ => {}
        }
    }

    let mut targets: HashSet<&str> = HashSet::from([api_id]);
    targets.extend(integrations.iter().map(String::as_str));
    targets.extend(stages.iter().map(String::as_str));

    const SHELL_TYPES: [&str; 4] = [
        "AWS::ApiGatewayV2::Api",
        "AWS::ApiGatewayV2::Integration",
        "AWS::ApiGatewayV2::Route",
        "AWS::ApiGatewayV2::Stage",
    ];
    for resource in resources.values() {
        let kind = resource_type(resource).unwrap_or_default();
        if SHELL_TYPES.contains(&kind) {
            continue;
        }
        if references_any(resource, &targets) {
            return None;
        }
    }

    Some(HttpApiDeps {
        integrations,
        stages,
    })
}

const HTTP_API_PROPERTY_MAP: [&str; 10] = [
    "Name",
    "Description",
    "FailOnWarnings",
    "CorsConfiguration",
    "DefaultRouteSettings",
    "RouteSettings",
    "StageVariables",
    "Tags",
    "PropagateTags",
    "DisableExecuteApiEndpoint",
];

fn convert_http_api_props(resource: &Value) -> Option<Map> {
    let props = properties(resource)?;
    let mut new_props = Map::new();
    for key in HTTP_API_PROPERTY_MAP {
        if let Some(value) = props.get(key) {
            new_props.insert(key.to_owned(), value.clone());
        }
    }
    if let Some(body) = props.get("Body") {
        new_props.insert("DefinitionBody".into(), body.clone());
    }
    if let Some(location) = props.get("BodyS3Location") {
        new_props.insert("DefinitionUri".into(), location.clone());
    }
    Some(new_props)
}
