//! Lambda function conversion and function-URL folding.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::convert::{Context, Pass};
use crate::error::SamaraError;
use crate::refs::{RenameMap, extract_logical_id, rewrite_literal_refs};
use crate::stage::{LocalAsset, format_code_uri, prepare_inline_code};
use crate::template::{Template, ensure_properties, metadata, properties, resource_type};
use crate::value::{Map, Value};

static HANDLER_SANITIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_\-]").expect("handler pattern"));

/// `AWS::Lambda::Function` → `AWS::Serverless::Function`.
///
/// The only real work is deciding where the code lives. Resolution order:
/// local CDK asset (when present on disk) → inline `ZipFile` → S3
/// bucket/key → missing-asset placeholder path. A function whose code shape
/// is not understood is left untouched.
pub(crate) struct LambdaFunctions;

impl Pass for LambdaFunctions {
    fn name(&self) -> &'static str {
        "lambda-functions"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        let Some(resources) = template.resources() else {
            return Ok(false);
        };
        let candidates: Vec<String> = resources
            .iter()
            .filter(|(_, resource)| resource_type(resource) == Some("AWS::Lambda::Function"))
            .map(|(id, _)| id.clone())
            .collect();

        let mut changed = false;
        for logical_id in candidates {
            if convert_function(template, &logical_id, cx)? {
                debug!(%logical_id, "converted Lambda function");
                cx.converted.push(logical_id);
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn convert_function(
    template: &mut Template,
    logical_id: &str,
    cx: &mut Context,
) -> Result<bool, SamaraError> {
    let Some(resource) = template.resource(logical_id) else {
        return Ok(false);
    };
    let Some(props) = properties(resource) else {
        return Ok(false);
    };
    let props = props.clone();
    let md = metadata(resource).cloned();

    let Some(code_entry) = resolve_function_code(logical_id, &props, md.as_ref(), cx)? else {
        return Ok(false);
    };

    let mut new_props = Map::new();
    let (key, value) = code_entry;
    new_props.insert(key.to_owned(), value);
    for (prop, value) in props {
        if prop == "Code" {
            continue;
        }
        new_props.insert(prop, value);
    }

    // Mutate in place so anything attached to the resource node survives.
    let resource = template
        .resource_mut(logical_id)
        .and_then(Value::as_map_mut)
        .expect("resource looked up above");
    resource.insert("Type".into(), Value::string("AWS::Serverless::Function"));
    resource.insert("Properties".into(), Value::Map(new_props));
    Ok(true)
}

/// Either `("CodeUri", ...)` or `("InlineCode", ...)`; `None` to skip.
fn resolve_function_code(
    logical_id: &str,
    props: &Map,
    md: Option<&Map>,
    cx: &mut Context,
) -> Result<Option<(&'static str, Value)>, SamaraError> {
    let relative_to = cx.options.relative_to.as_deref();
    let mut missing_asset = None;

    let asset_path = md.and_then(|md| md.get("aws:asset:path")).and_then(Value::as_str);
    let asset_property = md
        .and_then(|md| md.get("aws:asset:property"))
        .and_then(Value::as_str);
    if let Some(path) = asset_path
        && asset_property.is_none_or(|prop| prop == "Code")
        && let Some(stager) = cx.stager.as_deref_mut()
    {
        match stager.find_asset(path) {
            Some(LocalAsset::Present(found)) => {
                let staged = stager
                    .stage_local_path(logical_id, &found)
                    .map_err(|err| SamaraError::staging(logical_id, err))?;
                let uri = format_code_uri(&staged, relative_to);
                return Ok(Some(("CodeUri", Value::string(uri))));
            }
            Some(LocalAsset::Missing(candidate)) => missing_asset = Some(candidate),
            None => return Ok(None),
        }
    }

    if let Some(code) = props.get("Code").and_then(Value::as_map) {
        if let Some(Value::String(zipfile)) = code.get("ZipFile") {
            let inline = prepare_inline_code(zipfile);
            if cx.options.prefer_external_assets
                && let Some(stager) = cx.stager.as_deref_mut()
            {
                let file_name = inline_handler_filename(props);
                let staged = stager
                    .stage_inline_text(logical_id, &inline, &file_name)
                    .map_err(|err| SamaraError::staging(logical_id, err))?;
                let dir = staged.parent().unwrap_or(&staged);
                let uri = format_code_uri(dir, relative_to);
                return Ok(Some(("CodeUri", Value::string(uri))));
            }
            return Ok(Some(("InlineCode", Value::string(inline))));
        }

        if code.contains_key("S3Bucket") && code.contains_key("S3Key") {
            let bucket = code.get("S3Bucket").expect("checked");
            let key = code.get("S3Key").expect("checked");
            let version = code.get("S3ObjectVersion");
            let version_str = version.and_then(Value::as_str);

            if let Some(stager) = cx.stager.as_deref_mut() {
                let resolved_bucket = stager
                    .resolve_string(bucket)
                    .or_else(|| bucket.as_str().map(str::to_owned));
                let resolved_key = stager
                    .resolve_string(key)
                    .or_else(|| key.as_str().map(str::to_owned));
                if let (Some(bucket), Some(key)) = (resolved_bucket, resolved_key)
                    && version.is_none_or(|_| version_str.is_some())
                {
                    let staged = stager
                        .stage_s3_code(logical_id, &bucket, &key, version_str)
                        .map_err(|err| SamaraError::staging(logical_id, err))?;
                    let uri = format_code_uri(&staged, relative_to);
                    return Ok(Some(("CodeUri", Value::string(uri))));
                }
            }

            let mut uri = Map::new();
            uri.insert("Bucket".into(), bucket.clone());
            uri.insert("Key".into(), key.clone());
            if let Some(version) = version {
                uri.insert("Version".into(), version.clone());
            }
            return Ok(Some(("CodeUri", Value::Map(uri))));
        }
    }

    if let Some(missing) = missing_asset {
        let uri = format_code_uri(&missing, relative_to);
        return Ok(Some(("CodeUri", Value::string(uri))));
    }

    Ok(None)
}

/// A stable file name for externalized inline code, derived from the
/// handler and the runtime's conventional extension.
fn inline_handler_filename(props: &Map) -> String {
    let mut base = "index".to_owned();
    if let Some(handler) = props.get("Handler").and_then(Value::as_str)
        && !handler.trim().is_empty()
    {
        let stem = handler
            .split("::")
            .next()
            .unwrap_or(handler)
            .split('.')
            .next()
            .unwrap_or(handler);
        let stem = stem.rsplit('/').next().unwrap_or(stem);
        let cleaned = HANDLER_SANITIZE.replace_all(stem, "_").into_owned();
        if !cleaned.is_empty() {
            base = cleaned;
        }
    }
    let runtime = props.get("Runtime").and_then(Value::as_str);
    format!("{base}{}", runtime_extension(runtime))
}

fn runtime_extension(runtime: Option<&str>) -> &'static str {
    let Some(runtime) = runtime else {
        return ".js";
    };
    let lowered = runtime.to_ascii_lowercase();
    if lowered.starts_with("python") {
        ".py"
    } else if lowered.starts_with("nodejs") {
        ".js"
    } else if lowered.starts_with("ruby") {
        ".rb"
    } else if lowered.starts_with("dotnet") {
        ".cs"
    } else if lowered.starts_with("go") {
        ".go"
    } else if lowered.starts_with("java") {
        ".java"
    } else if lowered.contains("provided") {
        ".txt"
    } else {
        ".js"
    }
}

/// Fold `AWS::Lambda::Url` resources into `FunctionUrlConfig` on their
/// converted target function.
///
/// SAM synthesizes a `<FunctionId>Url` resource for a function with a URL
/// config, so the removed resource's id is renamed to that synthesized id —
/// including inside literal strings, which is best-effort by design.
pub(crate) struct FunctionUrls;

impl Pass for FunctionUrls {
    fn name(&self) -> &'static str {
        "function-urls"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        if cx.converted.is_empty() {
            return Ok(false);
        }
        let Some(resources) = template.resources_mut() else {
            return Ok(false);
        };

        let url_ids: Vec<String> = resources
            .iter()
            .filter(|(_, resource)| resource_type(resource) == Some("AWS::Lambda::Url"))
            .map(|(id, _)| id.clone())
            .collect();

        let mut renames = RenameMap::new();
        let mut with_config = HashSet::new();
        let mut removals = Vec::new();
        let mut changed = false;

        for url_id in url_ids {
            let Some(props) = resources.get(&url_id).and_then(properties) else {
                continue;
            };
            let Some(function_id) = props
                .get("TargetFunctionArn")
                .and_then(extract_logical_id)
                .map(str::to_owned)
            else {
                continue;
            };
            if !cx.is_converted(&function_id) {
                continue;
            }

            let mut config = Map::new();
            for key in ["AuthType", "Cors", "InvokeMode"] {
                if let Some(value) = props.get(key) {
                    config.insert(key.to_owned(), value.clone());
                }
            }

            let Some(function) = resources.get_mut(&function_id) else {
                continue;
            };
            let Some(fn_props) = ensure_properties(function) else {
                continue;
            };
            if !fn_props.contains_key("FunctionUrlConfig") {
                if config.is_empty() {
                    continue;
                }
                fn_props.insert("FunctionUrlConfig".into(), Value::Map(config));
            }

            with_config.insert(function_id.clone());
            renames.insert(url_id.clone(), format!("{function_id}Url"));
            removals.push(url_id);
            changed = true;
        }

        for url_id in &removals {
            resources.shift_remove(url_id);
        }

        // Permissions that only existed for the URL go away with it.
        let permission_ids: Vec<String> = resources
            .iter()
            .filter(|(_, resource)| {
                resource_type(resource) == Some("AWS::Lambda::Permission")
            })
            .filter(|(_, resource)| {
                let Some(props) = properties(resource) else {
                    return false;
                };
                let target = props.get("FunctionName").and_then(extract_logical_id);
                let for_url = props.contains_key("FunctionUrlAuthType")
                    || props
                        .get("InvokedViaFunctionUrl")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                target.is_some_and(|id| with_config.contains(id)) && for_url
            })
            .map(|(id, _)| id.clone())
            .collect();
        for permission_id in permission_ids {
            resources.shift_remove(&permission_id);
            changed = true;
        }

        if !renames.is_empty() {
            let mut root = Value::Map(std::mem::take(template.root_mut()));
            rewrite_literal_refs(&mut root, &renames, true, &HashSet::new());
            *template.root_mut() = match root {
                Value::Map(map) => map,
                _ => unreachable!("root stays a map"),
            };
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::testutil::{MockStager, samify_json};
    use crate::convert::{SamOptions, samify};
    use crate::template::SAM_TRANSFORM;

    #[test]
    fn inline_zipfile_becomes_inline_code() {
        let (template, changed) = samify_json(serde_json::json!({
            "Resources": {
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Runtime": "python3.12",
                        "Handler": "index.handler",
                        "Code": { "ZipFile": "\n    def handler(event, context):\n        return event\n" },
                    },
                },
            }
        }));
        assert!(changed);
        let json = template.to_json();
        let handler = &json["Resources"]["Handler"];
        assert_eq!(handler["Type"], "AWS::Serverless::Function");
        assert_eq!(
            handler["Properties"]["InlineCode"],
            "def handler(event, context):\n    return event"
        );
        assert!(handler["Properties"].get("Code").is_none());
        assert_eq!(json["Transform"], SAM_TRANSFORM);
    }

    #[test]
    fn unresolvable_code_shape_is_skipped() {
        let (template, changed) = samify_json(serde_json::json!({
            "Resources": {
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Code": { "ImageUri": "ecr/image:latest" },
                    },
                },
            }
        }));
        assert!(!changed);
        let json = template.to_json();
        assert_eq!(json["Resources"]["Handler"]["Type"], "AWS::Lambda::Function");
        assert!(json.get("Transform").is_none());
    }

    #[test]
    fn s3_code_without_stager_keeps_structured_uri() {
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Code": { "S3Bucket": "deploy-bucket", "S3Key": "app.zip" },
                        "Runtime": "nodejs20.x",
                    },
                },
            }
        }));
        let json = template.to_json();
        assert_eq!(
            json["Resources"]["Handler"]["Properties"]["CodeUri"],
            serde_json::json!({ "Bucket": "deploy-bucket", "Key": "app.zip" })
        );
    }

    #[test]
    fn s3_code_with_stager_is_downloaded() {
        let mut stager = MockStager {
            s3_objects: vec![("deploy-bucket".into(), "app.zip".into())],
            ..MockStager::default()
        };
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Code": { "S3Bucket": "deploy-bucket", "S3Key": "app.zip" },
                    },
                },
            }
        }))
        .unwrap();
        let options = SamOptions::default();
        samify(&mut template, &options, Some(&mut stager)).unwrap();
        let json = template.to_json();
        assert_eq!(
            json["Resources"]["Handler"]["Properties"]["CodeUri"],
            "staged/Handler"
        );
        assert_eq!(stager.staged, ["Handler"]);
    }

    #[test]
    fn missing_local_asset_keeps_placeholder_path() {
        let mut stager = MockStager::default();
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Metadata": { "aws:asset:path": "asset.deadbeef", "aws:asset:property": "Code" },
                    "Properties": { "Code": {} },
                },
            }
        }))
        .unwrap();
        let options = SamOptions::default();
        samify(&mut template, &options, Some(&mut stager)).unwrap();
        let json = template.to_json();
        assert_eq!(
            json["Resources"]["Handler"]["Properties"]["CodeUri"],
            "asset.deadbeef"
        );
    }

    #[test]
    fn externalized_inline_code_uses_handler_filename() {
        let mut stager = MockStager::default();
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Runtime": "python3.12",
                        "Handler": "app.handler",
                        "Code": { "ZipFile": "print('hi')" },
                    },
                },
            }
        }))
        .unwrap();
        let options = SamOptions {
            prefer_external_assets: true,
            ..SamOptions::default()
        };
        samify(&mut template, &options, Some(&mut stager)).unwrap();
        let json = template.to_json();
        assert_eq!(
            json["Resources"]["Handler"]["Properties"]["CodeUri"],
            "staged/Handler"
        );
        assert_eq!(stager.staged, ["Handler"]);
    }

    #[test]
    fn function_url_folds_into_config() {
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": { "Code": { "ZipFile": "x" } },
                },
                "HandlerUrlResource": {
                    "Type": "AWS::Lambda::Url",
                    "Properties": {
                        "TargetFunctionArn": { "Fn::GetAtt": ["Handler", "Arn"] },
                        "AuthType": "NONE",
                    },
                },
                "UrlPermission": {
                    "Type": "AWS::Lambda::Permission",
                    "Properties": {
                        "FunctionName": { "Ref": "Handler" },
                        "FunctionUrlAuthType": "NONE",
                        "Principal": "*",
                    },
                },
                "Out": {
                    "Type": "AWS::SSM::Parameter",
                    "Properties": {
                        "Value": { "Fn::GetAtt": ["HandlerUrlResource", "FunctionUrl"] },
                    },
                },
            }
        }));
        let json = template.to_json();
        assert!(json["Resources"].get("HandlerUrlResource").is_none());
        assert!(json["Resources"].get("UrlPermission").is_none());
        assert_eq!(
            json["Resources"]["Handler"]["Properties"]["FunctionUrlConfig"],
            serde_json::json!({ "AuthType": "NONE" })
        );
        // References retarget to the id SAM will synthesize.
        assert_eq!(
            json["Resources"]["Out"]["Properties"]["Value"],
            serde_json::json!({ "Fn::GetAtt": ["HandlerUrl", "FunctionUrl"] })
        );
    }
}
