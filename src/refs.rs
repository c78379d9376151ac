//! The reference model: extracting and rewriting logical-id references.
//!
//! CloudFormation lets the same reference appear in many surface forms — a
//! short-tag `!Ref`, a long-form `{"Ref": ...}` mapping, a `!GetAtt` with a
//! list or a dotted-string payload, a `${Token}` inside `Fn::Sub`, or a bare
//! string in `DependsOn`. Everything in this module is a pure function over
//! [`Value`] trees that treats all of those forms uniformly.

use std::collections::HashSet;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::value::{Intrinsic, Map, Value};

/// Mapping from old logical ids to their replacements, applied atomically
/// over a whole template so no reference is ever left dangling.
pub type RenameMap = IndexMap<String, String>;

static SUB_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("sub token pattern"));

/// Extract the base logical id referenced by a node, if it is a reference.
///
/// Accepts `!Ref`/`!GetAtt` tags, long-form `Ref`/`Fn::GetAtt` mappings and
/// bare strings (with an optional `.Attribute` suffix, which is dropped).
pub fn extract_logical_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.split_once('.').map_or(s.as_str(), |(base, _)| base)),
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::Ref(payload) => payload.as_str(),
            Intrinsic::GetAtt(payload) => getatt_base(payload),
            _ => None,
        },
        Value::Map(map) => {
            if let Some(target) = map.get("Fn::GetAtt") {
                return getatt_base(target);
            }
            map.get("Ref").and_then(Value::as_str)
        }
        _ => None,
    }
}

fn getatt_base(payload: &Value) -> Option<&str> {
    match payload {
        Value::List(items) => items.first().and_then(Value::as_str),
        Value::String(s) => Some(s.split_once('.').map_or(s.as_str(), |(base, _)| base)),
        _ => None,
    }
}

/// For a `!GetAtt` payload, the attribute the reference resolves to.
pub(crate) fn getatt_attribute(payload: &Value) -> Option<&str> {
    match payload {
        Value::List(items) => items.get(1).and_then(Value::as_str),
        Value::String(s) => s.split_once('.').map(|(_, attr)| attr),
        _ => None,
    }
}

/// Deep walk checking whether any reference inside `node` resolves into
/// `targets`. Bare strings match on equality or a `Target.` prefix, so
/// `DependsOn` entries and dotted attribute strings are caught too.
pub fn references_any(node: &Value, targets: &HashSet<&str>) -> bool {
    match node {
        Value::String(s) => {
            targets.contains(s.as_str())
                || s.split_once('.')
                    .is_some_and(|(base, _)| targets.contains(base))
        }
        Value::List(items) => items.iter().any(|item| references_any(item, targets)),
        Value::Map(map) => map.values().any(|value| references_any(value, targets)),
        Value::Intrinsic(tag) => {
            extract_logical_id(node).is_some_and(|id| targets.contains(id))
                || references_any(tag.payload(), targets)
        }
        _ => false,
    }
}

/// Deep substring scan over every literal string in the tree, including
/// intrinsic payloads. Used for the permission `SourceArn` heuristics where
/// synthesized ids end up embedded inside longer strings.
pub(crate) fn mentions(node: &Value, needle: &str) -> bool {
    match node {
        Value::String(s) => s.contains(needle),
        Value::List(items) => items.iter().any(|item| mentions(item, needle)),
        Value::Map(map) => map.values().any(|value| mentions(value, needle)),
        Value::Intrinsic(tag) => mentions(tag.payload(), needle),
        _ => false,
    }
}

/// Rewrite every structural reference in the tree according to `renames`.
///
/// Type-preserving: a dotted-string `GetAtt` stays a dotted string, a
/// list-form one stays a list, and `Sub` templates keep their shape with
/// only the mapped `${Token}` bases substituted. Tokens containing `::`
/// (pseudo-parameters) are never touched.
pub fn rewrite_references(node: &mut Value, renames: &RenameMap) {
    match node {
        Value::Map(map) => {
            if map.len() == 1 {
                let key = map.keys().next().expect("len checked").clone();
                let value = map.get_mut(&key).expect("len checked");
                match key.as_str() {
                    "Ref" => {
                        rewrite_ref_payload(value, renames);
                        return;
                    }
                    "Fn::GetAtt" => {
                        rewrite_getatt_payload(value, renames);
                        return;
                    }
                    "Fn::Sub" => {
                        rewrite_sub_payload(value, renames);
                        return;
                    }
                    "Fn::ImportValue" => {
                        if let Value::String(s) = value {
                            *s = rewrite_sub_tokens(s, renames);
                        } else {
                            rewrite_references(value, renames);
                        }
                        return;
                    }
                    _ => {}
                }
            }
            for value in map.values_mut() {
                rewrite_references(value, renames);
            }
        }
        Value::List(items) => {
            for item in items {
                rewrite_references(item, renames);
            }
        }
        Value::Intrinsic(tag) => match &mut **tag {
            Intrinsic::Ref(payload) => rewrite_ref_payload(payload, renames),
            Intrinsic::GetAtt(payload) => rewrite_getatt_payload(payload, renames),
            Intrinsic::Sub(payload) => rewrite_sub_payload(payload, renames),
            Intrinsic::Join(payload) | Intrinsic::Other(_, payload) => {
                rewrite_references(payload, renames)
            }
        },
        _ => {}
    }
}

fn rewrite_ref_payload(payload: &mut Value, renames: &RenameMap) {
    if let Value::String(s) = payload
        && let Some(new) = renames.get(s.as_str())
    {
        *s = new.clone();
    }
}

fn rewrite_getatt_payload(payload: &mut Value, renames: &RenameMap) {
    match payload {
        Value::List(items) => {
            if let Some(Value::String(base)) = items.first_mut()
                && let Some(new) = renames.get(base.as_str())
            {
                *base = new.clone();
            }
        }
        Value::String(s) => {
            if let Some((base, rest)) = s.split_once('.')
                && let Some(new) = renames.get(base)
            {
                *s = format!("{new}.{rest}");
            }
        }
        _ => {}
    }
}

fn rewrite_sub_payload(payload: &mut Value, renames: &RenameMap) {
    match payload {
        Value::String(s) => *s = rewrite_sub_tokens(s, renames),
        Value::List(items) => {
            let mut iter = items.iter_mut();
            if let Some(first) = iter.next()
                && let Value::String(s) = first
            {
                *s = rewrite_sub_tokens(s, renames);
            }
            // Substitution-map values can themselves carry references.
            for rest in iter {
                rewrite_references(rest, renames);
            }
        }
        _ => {}
    }
}

/// Substitute `${Token}` / `${Token.Attr}` bases inside a `Fn::Sub` template
/// string. Pseudo-parameter tokens (anything containing `::`) pass through.
pub fn rewrite_sub_tokens(template: &str, renames: &RenameMap) -> String {
    SUB_TOKEN
        .replace_all(template, |caps: &regex::Captures| {
            let token = &caps[1];
            if token.contains("::") {
                return caps[0].to_owned();
            }
            let (name, rest) = match token.split_once('.') {
                Some((name, rest)) => (name, Some(rest)),
                None => (token, None),
            };
            match renames.get(name) {
                Some(new) if new != name => match rest {
                    Some(rest) => format!("${{{new}.{rest}}}"),
                    None => format!("${{{new}}}"),
                },
                _ => caps[0].to_owned(),
            }
        })
        .into_owned()
}

/// Linearize a `Fn::Join` into a single `Fn::Sub` template string.
///
/// Only literal fragments, `!Ref` and `!GetAtt` are supported; any other
/// fragment kind means the join cannot be represented exactly, and the
/// function returns `None` rather than approximating.
pub fn join_to_sub(delimiter: &str, fragments: &[Value]) -> Option<String> {
    let mut out = String::new();
    for (idx, fragment) in fragments.iter().enumerate() {
        if idx > 0 {
            out.push_str(delimiter);
        }
        out.push_str(&render_join_token(fragment)?);
    }
    Some(out)
}

/// Convenience wrapper over a full `Fn::Join` payload (`[delimiter, list]`).
pub fn join_payload_to_sub(payload: &Value) -> Option<String> {
    let items = payload.as_list()?;
    let [delimiter, fragments] = items else {
        return None;
    };
    join_to_sub(delimiter.as_str()?, fragments.as_list()?)
}

fn render_join_token(token: &Value) -> Option<String> {
    match token {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::Ref(payload) => payload.as_str().map(|id| format!("${{{id}}}")),
            Intrinsic::GetAtt(payload) => match payload {
                Value::String(s) => Some(format!("${{{s}}}")),
                Value::List(items) => {
                    let base = items.first().and_then(Value::as_str)?;
                    let attr = items.get(1).and_then(Value::as_str)?;
                    Some(format!("${{{base}.{attr}}}"))
                }
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

/// Split a `Fn::Sub` payload into its template string and optional
/// substitution map.
pub(crate) fn extract_sub_parts(payload: &Value) -> Option<(&str, Option<&Map>)> {
    match payload {
        Value::String(s) => Some((s, None)),
        Value::List(items) if items.len() == 2 => {
            let template = items[0].as_str()?;
            Some((template, items[1].as_map()))
        }
        _ => None,
    }
}

/// Best-effort rename rewrite that also touches literal strings.
///
/// Unlike [`rewrite_references`] this will rewrite a bare `"OldId"` or
/// `"OldId.Attr"` string wherever it appears under an allow-listed key (or
/// everywhere, when `rewrite_literals` is set). This is a heuristic — a
/// literal that merely happens to spell a logical id gets rewritten too —
/// so it is only used where synthesized ids are known to leak into strings,
/// such as AppSync api-key ids.
pub fn rewrite_literal_refs(
    node: &mut Value,
    renames: &RenameMap,
    rewrite_literals: bool,
    key_allowlist: &HashSet<&str>,
) {
    let mut allowed: HashSet<&str> = key_allowlist.clone();
    allowed.extend(["DependsOn", "Ref", "Fn::GetAtt"]);
    rewrite_literal_walk(node, renames, rewrite_literals, None, &allowed);
}

fn rewrite_literal_walk(
    node: &mut Value,
    renames: &RenameMap,
    rewrite_literals: bool,
    parent_key: Option<&str>,
    allowed: &HashSet<&str>,
) {
    match node {
        Value::Map(map) => {
            for (key, value) in map.iter_mut() {
                if let Value::String(s) = value {
                    let should = rewrite_literals || allowed.contains(key.as_str());
                    if should && let Some(new) = rewrite_string_reference(s, renames) {
                        *s = new;
                        continue;
                    }
                }
                rewrite_literal_walk(value, renames, rewrite_literals, Some(key.as_str()), allowed);
            }
        }
        Value::List(items) => {
            for item in items {
                if let Value::String(s) = item {
                    let should = rewrite_literals
                        || parent_key.is_some_and(|key| allowed.contains(key));
                    if should && let Some(new) = rewrite_string_reference(s, renames) {
                        *s = new;
                        continue;
                    }
                }
                rewrite_literal_walk(item, renames, rewrite_literals, parent_key, allowed);
            }
        }
        Value::Intrinsic(tag) => match &mut **tag {
            Intrinsic::Ref(payload) => rewrite_ref_payload(payload, renames),
            Intrinsic::GetAtt(payload) => rewrite_getatt_payload(payload, renames),
            other => {
                let payload = other.payload_mut();
                if let Value::String(s) = payload {
                    if rewrite_literals && let Some(new) = rewrite_string_reference(s, renames) {
                        *s = new;
                    }
                } else {
                    rewrite_literal_walk(payload, renames, rewrite_literals, None, allowed);
                }
            }
        },
        _ => {}
    }
}

fn rewrite_string_reference(value: &str, renames: &RenameMap) -> Option<String> {
    if let Some(new) = renames.get(value) {
        return Some(new.clone());
    }
    let (base, rest) = value.split_once('.')?;
    renames.get(base).map(|new| format!("{new}.{rest}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renames(pairs: &[(&str, &str)]) -> RenameMap {
        pairs
            .iter()
            .map(|(old, new)| (old.to_string(), new.to_string()))
            .collect()
    }

    #[test]
    fn extracts_all_reference_forms() {
        assert_eq!(extract_logical_id(&Value::reference("Fn")), Some("Fn"));
        assert_eq!(extract_logical_id(&Value::get_att("Fn", "Arn")), Some("Fn"));
        assert_eq!(
            extract_logical_id(&Value::String("Fn.Arn".into())),
            Some("Fn")
        );
        let long = Value::from_json(serde_json::json!({ "Fn::GetAtt": "Fn.Arn" }));
        assert_eq!(extract_logical_id(&long), Some("Fn"));
        let long = Value::from_json(serde_json::json!({ "Ref": "Fn" }));
        assert_eq!(extract_logical_id(&long), Some("Fn"));
        assert_eq!(extract_logical_id(&Value::Bool(true)), None);
    }

    #[test]
    fn empty_rename_map_is_a_no_op() {
        let mut value = Value::from_json(serde_json::json!({
            "A": { "Ref": "Old" },
            "B": { "Fn::Sub": "${Old.Arn}-suffix" },
        }));
        let before = value.clone();
        rewrite_references(&mut value, &RenameMap::new());
        assert_eq!(value, before);
    }

    #[test]
    fn rewrites_every_surface_form() {
        let map = renames(&[("MyBucketF68F3FF0", "MyBucket")]);
        let mut value = Value::from_json(serde_json::json!({
            "Plain": { "Ref": "MyBucketF68F3FF0" },
            "AttList": { "Fn::GetAtt": ["MyBucketF68F3FF0", "Arn"] },
            "AttStr": { "Fn::GetAtt": "MyBucketF68F3FF0.Arn" },
            "SubStr": { "Fn::Sub": "arn:${AWS::Partition}:${MyBucketF68F3FF0.Arn}" },
            "SubList": { "Fn::Sub": ["${MyBucketF68F3FF0}", { "X": { "Ref": "MyBucketF68F3FF0" } }] },
            "Unrelated": { "Ref": "Other" },
        }));
        rewrite_references(&mut value, &map);
        assert_eq!(
            value.to_json(),
            serde_json::json!({
                "Plain": { "Ref": "MyBucket" },
                "AttList": { "Fn::GetAtt": ["MyBucket", "Arn"] },
                "AttStr": { "Fn::GetAtt": "MyBucket.Arn" },
                "SubStr": { "Fn::Sub": "arn:${AWS::Partition}:${MyBucket.Arn}" },
                "SubList": { "Fn::Sub": ["${MyBucket}", { "X": { "Ref": "MyBucket" } }] },
                "Unrelated": { "Ref": "Other" },
            })
        );
    }

    #[test]
    fn rewrites_short_tags() {
        let map = renames(&[("Old", "New")]);
        let mut value = Value::List(vec![
            Value::reference("Old"),
            Value::get_att("Old", "Arn"),
            Value::sub("https://${Old}.example.com"),
        ]);
        rewrite_references(&mut value, &map);
        assert_eq!(
            value,
            Value::List(vec![
                Value::reference("New"),
                Value::get_att("New", "Arn"),
                Value::sub("https://${New}.example.com"),
            ])
        );
    }

    #[test]
    fn pseudo_parameters_stay_untouched() {
        let map = renames(&[("AWS", "Broken")]);
        assert_eq!(
            rewrite_sub_tokens("${AWS::Region}-${AWS::AccountId}", &map),
            "${AWS::Region}-${AWS::AccountId}"
        );
    }

    #[test]
    fn detects_references_in_depends_on_strings() {
        let targets = HashSet::from(["Role"]);
        assert!(references_any(&Value::String("Role".into()), &targets));
        assert!(references_any(&Value::String("Role.Arn".into()), &targets));
        assert!(!references_any(&Value::String("RoleX".into()), &targets));
    }

    #[test]
    fn join_to_sub_handles_supported_fragments() {
        let fragments = vec![
            Value::String("arn:".into()),
            Value::reference("Api"),
            Value::String("/stage/".into()),
            Value::get_att("Fn", "Arn"),
        ];
        assert_eq!(
            join_to_sub("", &fragments),
            Some("arn:${Api}/stage/${Fn.Arn}".to_string())
        );
    }

    #[test]
    fn join_to_sub_rejects_unsupported_fragments() {
        let fragments = vec![
            Value::String("a".into()),
            Value::from_json(serde_json::json!({ "Fn::ImportValue": "x" })),
        ];
        assert_eq!(join_to_sub("-", &fragments), None);
    }

    #[test]
    fn literal_rewrite_honors_allowlist() {
        let map = renames(&[("OldUrl", "FnUrl")]);
        let mut value = Value::from_json(serde_json::json!({
            "DependsOn": ["OldUrl"],
            "Description": "OldUrl",
        }));
        rewrite_literal_refs(&mut value, &map, false, &HashSet::new());
        assert_eq!(
            value.to_json(),
            serde_json::json!({
                "DependsOn": ["FnUrl"],
                "Description": "OldUrl",
            })
        );
    }
}
