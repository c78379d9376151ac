//! IAM absorption: fold a converted function's role policies into SAM
//! `Policies` entries and drop the boilerplate execution role.

use std::collections::HashSet;
use std::sync::LazyLock;

use tracing::debug;

use crate::convert::{Context, Pass};
use crate::error::SamaraError;
use crate::graph::remove_resources;
use crate::refs::{extract_logical_id, getatt_attribute, mentions, references_any};
use crate::template::{Template, properties, properties_mut, prune_depends_on, resource_type};
use crate::value::{Intrinsic, Map, Value};

static S3_READ_ACTIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "s3:GetObject",
        "s3:GetObjectVersion",
        "s3:ListBucket",
        "s3:ListBucketVersions",
    ])
});

static S3_CRUD_ACTIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    let mut actions = S3_READ_ACTIONS.clone();
    actions.extend(["s3:PutObject", "s3:DeleteObject", "s3:AbortMultipartUpload"]);
    actions
});

static SQS_POLLER_ACTIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "sqs:ReceiveMessage",
        "sqs:DeleteMessage",
        "sqs:GetQueueAttributes",
        "sqs:GetQueueUrl",
        "sqs:ChangeMessageVisibility",
    ])
});

static DYNAMODB_CRUD_ACTIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "dynamodb:BatchGetItem",
        "dynamodb:GetRecords",
        "dynamodb:GetShardIterator",
        "dynamodb:Query",
        "dynamodb:GetItem",
        "dynamodb:Scan",
        "dynamodb:ConditionCheckItem",
        "dynamodb:BatchWriteItem",
        "dynamodb:PutItem",
        "dynamodb:UpdateItem",
        "dynamodb:DeleteItem",
        "dynamodb:DescribeTable",
    ])
});

pub(crate) struct IamAbsorption;

impl Pass for IamAbsorption {
    fn name(&self) -> &'static str {
        "iam-absorption"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        let mut changed = false;
        for function_id in cx.converted.clone() {
            changed |= merge_role_policies(template, &function_id);
            changed |= maybe_remove_basic_role(template, &function_id);
        }
        Ok(changed)
    }
}

/// Move every `AWS::IAM::Policy` attached to the function's role into the
/// function's `Policies` list, pattern-matching statements against SAM
/// policy templates and falling back to inline statement blocks.
fn merge_role_policies(template: &mut Template, function_id: &str) -> bool {
    let Some(role_id) = template
        .resource(function_id)
        .and_then(properties)
        .and_then(|props| props.get("Role"))
        .and_then(extract_logical_id)
        .map(str::to_owned)
    else {
        return false;
    };

    let Some(resources) = template.resources() else {
        return false;
    };
    let mut collected: Vec<(String, Map)> = Vec::new();
    for (logical_id, resource) in resources {
        if resource_type(resource) != Some("AWS::IAM::Policy") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        let attached = props
            .get("Roles")
            .and_then(Value::as_list)
            .is_some_and(|roles| {
                roles
                    .iter()
                    .any(|role| extract_logical_id(role) == Some(role_id.as_str()))
            });
        if !attached {
            continue;
        }
        if let Some(doc) = props.get("PolicyDocument").and_then(Value::as_map) {
            collected.push((logical_id.clone(), doc.clone()));
        }
    }
    if collected.is_empty() {
        return false;
    }

    let mut removals = Vec::new();
    for (policy_id, doc) in collected {
        let entries = convert_policy_document(&doc);
        let Some(function) = template.resource_mut(function_id) else {
            return false;
        };
        let Some(props) = properties_mut(function) else {
            return false;
        };
        if !props.contains_key("Policies") {
            props.insert("Policies".into(), Value::List(Vec::new()));
        }
        let Some(policies) = props.get_mut("Policies").and_then(Value::as_list_mut) else {
            continue;
        };
        policies.extend(entries);
        prune_depends_on(function, &policy_id);
        debug!(%function_id, %policy_id, "absorbed IAM policy into function");
        removals.push(policy_id);
    }
    remove_resources(template, &removals);
    !removals.is_empty()
}

/// Turn a policy document into SAM `Policies` entries. Statements matching a
/// known template shape become named policy-template entries; everything
/// else survives as one inline statement block.
fn convert_policy_document(doc: &Map) -> Vec<Value> {
    let statements = match doc.get("Statement") {
        Some(Value::List(items)) => items.clone(),
        Some(Value::Map(single)) => vec![Value::Map(single.clone())],
        _ => return vec![Value::Map(doc.clone())],
    };

    let mut templates: Vec<Value> = Vec::new();
    let mut remaining: Vec<Value> = Vec::new();
    let mut dynamodb: Vec<Value> = Vec::new();

    for statement in statements {
        if let Some(entry) = match_s3_template(&statement) {
            templates.push(entry);
        } else if let Some(entry) = match_sqs_template(&statement) {
            templates.push(entry);
        } else if is_dynamodb_statement(&statement) {
            dynamodb.push(statement);
        } else {
            remaining.push(statement);
        }
    }

    let mut results = templates;
    match detect_single_table(&dynamodb) {
        Some(table) => {
            let mut config = Map::new();
            config.insert("TableName".into(), table);
            let mut entry = Map::new();
            entry.insert("DynamoDBCrudPolicy".into(), Value::Map(config));
            results.push(Value::Map(entry));
        }
        None => remaining.extend(dynamodb),
    }

    if !remaining.is_empty() {
        let mut inline = doc.clone();
        inline.insert("Statement".into(), Value::List(remaining));
        results.push(Value::Map(inline));
    }

    if results.is_empty() {
        return vec![Value::Map(doc.clone())];
    }
    results
}

fn match_s3_template(statement: &Value) -> Option<Value> {
    let actions = actions_as_set(statement)?;
    let resources = resources_as_list(statement)?;
    let bucket = single_target(&resources, bucket_name_from)?;
    let template = if actions.iter().all(|a| S3_READ_ACTIONS.contains(a.as_str())) {
        "S3ReadPolicy"
    } else if actions.iter().all(|a| S3_CRUD_ACTIONS.contains(a.as_str())) {
        "S3CrudPolicy"
    } else {
        return None;
    };
    let mut config = Map::new();
    config.insert("BucketName".into(), bucket);
    let mut entry = Map::new();
    entry.insert(template.to_owned(), Value::Map(config));
    Some(Value::Map(entry))
}

fn match_sqs_template(statement: &Value) -> Option<Value> {
    let actions = actions_as_set(statement)?;
    if !actions
        .iter()
        .all(|a| SQS_POLLER_ACTIONS.contains(a.as_str()))
    {
        return None;
    }
    let resources = resources_as_list(statement)?;
    let queue = single_target(&resources, queue_name_from)?;
    let mut config = Map::new();
    config.insert("QueueName".into(), queue);
    let mut entry = Map::new();
    entry.insert("SQSPollerPolicy".to_owned(), Value::Map(config));
    Some(Value::Map(entry))
}

fn actions_as_set(statement: &Value) -> Option<HashSet<String>> {
    match statement.get("Action")? {
        Value::String(action) => Some(HashSet::from([action.clone()])),
        Value::List(actions) => {
            let set: HashSet<String> = actions
                .iter()
                .filter_map(|action| action.as_str().map(str::to_owned))
                .collect();
            (!set.is_empty()).then_some(set)
        }
        _ => None,
    }
}

fn resources_as_list(statement: &Value) -> Option<Vec<Value>> {
    match statement.get("Resource")? {
        Value::List(items) => (!items.is_empty()).then(|| items.clone()),
        other => Some(vec![other.clone()]),
    }
}

/// All statement resources must resolve to the same target for a policy
/// template to apply.
fn single_target(
    resources: &[Value],
    extract: impl Fn(&Value) -> Option<Value>,
) -> Option<Value> {
    let mut target = None;
    for resource in resources {
        let candidate = extract(resource)?;
        match &target {
            None => target = Some(candidate),
            Some(existing) if *existing != candidate => return None,
            Some(_) => {}
        }
    }
    target
}

fn bucket_name_from(value: &Value) -> Option<Value> {
    if let Some(name) = ref_or_arn_target(value) {
        return Some(name);
    }
    // ${Bucket.Arn}-style Sub templates and literals.
    let literal = match value {
        Value::String(s) => Some(s.as_str()),
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::Sub(payload) => payload.as_str(),
            _ => None,
        },
        Value::Map(map) if map.len() == 1 => map.get("Fn::Sub").and_then(Value::as_str),
        _ => None,
    };
    let literal = literal?;
    if let Some(rest) = literal.split_once("${").map(|(_, rest)| rest)
        && let Some((inner, _)) = rest.split_once('}')
        && let Some((logical, _)) = inner.split_once(".Arn")
        && !logical.is_empty()
    {
        return Some(Value::reference(logical));
    }
    arn_leading_segment(value)
}

fn queue_name_from(value: &Value) -> Option<Value> {
    ref_or_arn_target(value).or_else(|| arn_leading_segment(value))
}

/// `{Ref}` stays a ref; `GetAtt X.Arn` collapses to `{Ref: X}`.
fn ref_or_arn_target(value: &Value) -> Option<Value> {
    match value {
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::Ref(payload) => payload.as_str().map(Value::reference),
            Intrinsic::GetAtt(payload) => (getatt_attribute(payload) == Some("Arn"))
                .then(|| extract_logical_id(value))
                .flatten()
                .map(Value::reference),
            _ => None,
        },
        Value::Map(map) => {
            if let Some(Value::String(id)) = map.get("Ref") {
                return Some(Value::reference(id.clone()));
            }
            let target = map.get("Fn::GetAtt")?;
            (getatt_attribute(target) == Some("Arn"))
                .then(|| extract_logical_id(value))
                .flatten()
                .map(Value::reference)
        }
        _ => None,
    }
}

/// First path segment of a literal ARN's resource portion.
fn arn_leading_segment(value: &Value) -> Option<Value> {
    let arn = value.as_str()?;
    if !arn.starts_with("arn:") {
        return None;
    }
    let parts: Vec<&str> = arn.split(':').collect();
    let resource = parts.get(5).copied().filter(|part| !part.is_empty())?;
    let name = resource.split('/').next().filter(|part| !part.is_empty())?;
    Some(Value::string(name))
}

enum TableTarget {
    Table(String),
    NoValue,
}

fn table_name_from(value: &Value) -> Option<TableTarget> {
    let getatt = match value {
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::GetAtt(payload) => Some(payload),
            Intrinsic::Ref(payload) => {
                return (payload.as_str() == Some("AWS::NoValue")).then_some(TableTarget::NoValue);
            }
            _ => None,
        },
        Value::Map(map) => {
            if map.get("Ref").and_then(Value::as_str) == Some("AWS::NoValue") {
                return Some(TableTarget::NoValue);
            }
            map.get("Fn::GetAtt")
        }
        _ => None,
    };
    let payload = getatt?;
    if getatt_attribute(payload) != Some("Arn") {
        return None;
    }
    extract_logical_id(value).map(|id| TableTarget::Table(id.to_owned()))
}

fn is_dynamodb_statement(statement: &Value) -> bool {
    let actions = match statement.get("Action") {
        Some(Value::String(action)) => vec![action.clone()],
        Some(Value::List(actions)) => actions
            .iter()
            .map(|action| action.as_str().map(str::to_owned))
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default(),
        _ => return false,
    };
    if actions.is_empty()
        || !actions
            .iter()
            .all(|action| DYNAMODB_CRUD_ACTIONS.contains(action.as_str()))
    {
        return false;
    }
    let Some(resources) = resources_as_list(statement) else {
        return false;
    };
    resources
        .iter()
        .any(|entry| matches!(table_name_from(entry), Some(TableTarget::Table(_))))
}

fn detect_single_table(statements: &[Value]) -> Option<Value> {
    let mut table: Option<String> = None;
    for statement in statements {
        let resources = resources_as_list(statement)?;
        let mut statement_tables = HashSet::new();
        for entry in &resources {
            if let Some(TableTarget::Table(name)) = table_name_from(entry) {
                statement_tables.insert(name);
            }
        }
        if statement_tables.is_empty() {
            continue;
        }
        if statement_tables.len() != 1 {
            return None;
        }
        let found = statement_tables.into_iter().next().expect("len checked");
        match &table {
            None => table = Some(found),
            Some(existing) if *existing != found => return None,
            Some(_) => {}
        }
    }
    table.map(Value::reference)
}

/// Delete the function's role when it is the exact CDK-generated basic
/// execution role and nothing else references it.
fn maybe_remove_basic_role(template: &mut Template, function_id: &str) -> bool {
    let Some(role_id) = template
        .resource(function_id)
        .and_then(properties)
        .and_then(|props| props.get("Role"))
        .and_then(extract_logical_id)
        .map(str::to_owned)
    else {
        return false;
    };
    let Some(role) = template.resource(&role_id) else {
        return false;
    };
    if !is_basic_lambda_role(role) {
        return false;
    }
    if role_referenced_elsewhere(template, function_id, &role_id) {
        return false;
    }

    let Some(function) = template.resource_mut(function_id) else {
        return false;
    };
    if let Some(props) = properties_mut(function) {
        props.shift_remove("Role");
    }
    prune_depends_on(function, &role_id);
    if let Some(resources) = template.resources_mut() {
        resources.shift_remove(&role_id);
    }
    debug!(%function_id, %role_id, "dropped basic execution role");
    true
}

fn is_basic_lambda_role(resource: &Value) -> bool {
    if resource_type(resource) != Some("AWS::IAM::Role") {
        return false;
    }
    let Some(props) = properties(resource) else {
        return false;
    };
    if props
        .keys()
        .any(|key| key != "AssumeRolePolicyDocument" && key != "ManagedPolicyArns")
    {
        return false;
    }
    let Some(doc) = props.get("AssumeRolePolicyDocument") else {
        return false;
    };
    if !assume_role_allows_lambda(doc) {
        return false;
    }
    let Some(managed) = props.get("ManagedPolicyArns").and_then(Value::as_list) else {
        return false;
    };
    managed.len() == 1 && mentions(&managed[0], "AWSLambdaBasicExecutionRole")
}

fn assume_role_allows_lambda(doc: &Value) -> bool {
    let statements = match doc.get("Statement") {
        Some(Value::List(items)) => items.clone(),
        Some(Value::Map(single)) => vec![Value::Map(single.clone())],
        _ => return false,
    };
    statements.iter().any(|statement| {
        if statement.get("Effect").and_then(Value::as_str) != Some("Allow") {
            return false;
        }
        let assumes = match statement.get("Action") {
            Some(Value::String(action)) => action == "sts:AssumeRole",
            Some(Value::List(actions)) => actions
                .iter()
                .any(|action| action.as_str() == Some("sts:AssumeRole")),
            _ => false,
        };
        if !assumes {
            return false;
        }
        match statement
            .get("Principal")
            .and_then(|principal| principal.get("Service"))
        {
            Some(Value::String(service)) => service == "lambda.amazonaws.com",
            Some(Value::List(services)) => services
                .iter()
                .any(|service| service.as_str() == Some("lambda.amazonaws.com")),
            _ => false,
        }
    })
}

/// Does anything other than the function's own `Role` property (and its
/// matching `DependsOn` entry) still reference the role?
fn role_referenced_elsewhere(template: &Template, function_id: &str, role_id: &str) -> bool {
    let targets = HashSet::from([role_id]);
    for (section, value) in template.root() {
        if section == "Resources" {
            continue;
        }
        if references_any(value, &targets) {
            return true;
        }
    }
    let Some(resources) = template.resources() else {
        return false;
    };
    for (logical_id, resource) in resources {
        if logical_id == role_id {
            continue;
        }
        if logical_id != function_id {
            if references_any(resource, &targets) {
                return true;
            }
            continue;
        }
        let Some(map) = resource.as_map() else {
            continue;
        };
        for (key, value) in map {
            match key.as_str() {
                "Properties" => {
                    if let Some(props) = value.as_map() {
                        for (prop, prop_value) in props {
                            if prop == "Role" {
                                continue;
                            }
                            if references_any(prop_value, &targets) {
                                return true;
                            }
                        }
                    }
                }
                "DependsOn" => {
                    let blocked = match value {
                        Value::String(entry) => {
                            entry != role_id && references_any(value, &targets)
                        }
                        Value::List(entries) => entries.iter().any(|entry| {
                            entry.as_str() != Some(role_id) && references_any(entry, &targets)
                        }),
                        other => references_any(other, &targets),
                    };
                    if blocked {
                        return true;
                    }
                }
                _ => {
                    if references_any(value, &targets) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::testutil::samify_json;

    fn basic_role_json() -> serde_json::Value {
        serde_json::json!({
            "Type": "AWS::IAM::Role",
            "Properties": {
                "AssumeRolePolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Action": "sts:AssumeRole",
                        "Principal": { "Service": "lambda.amazonaws.com" },
                    }],
                },
                "ManagedPolicyArns": [{
                    "Fn::Join": ["", [
                        "arn:", { "Ref": "AWS::Partition" },
                        ":iam::aws:policy/service-role/AWSLambdaBasicExecutionRole",
                    ]],
                }],
            },
        })
    }

    #[test]
    fn basic_execution_role_is_dropped() {
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "HandlerRole": basic_role_json(),
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "DependsOn": "HandlerRole",
                    "Properties": {
                        "Code": { "ZipFile": "x" },
                        "Role": { "Fn::GetAtt": ["HandlerRole", "Arn"] },
                    },
                },
            }
        }));
        let json = template.to_json();
        assert!(json["Resources"].get("HandlerRole").is_none());
        let handler = &json["Resources"]["Handler"];
        assert!(handler["Properties"].get("Role").is_none());
        assert!(handler.get("DependsOn").is_none());
    }

    #[test]
    fn referenced_role_is_kept() {
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "HandlerRole": basic_role_json(),
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Code": { "ZipFile": "x" },
                        "Role": { "Fn::GetAtt": ["HandlerRole", "Arn"] },
                    },
                },
            },
            "Outputs": {
                "RoleArn": { "Value": { "Fn::GetAtt": ["HandlerRole", "Arn"] } },
            },
        }));
        let json = template.to_json();
        assert!(json["Resources"].get("HandlerRole").is_some());
        assert!(json["Resources"]["Handler"]["Properties"].get("Role").is_some());
    }

    #[test]
    fn dynamodb_crud_statement_becomes_policy_template() {
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "Table": { "Type": "AWS::DynamoDB::Table" },
                "HandlerRole": basic_role_json(),
                "HandlerPolicy": {
                    "Type": "AWS::IAM::Policy",
                    "Properties": {
                        "Roles": [{ "Ref": "HandlerRole" }],
                        "PolicyDocument": {
                            "Version": "2012-10-17",
                            "Statement": [{
                                "Effect": "Allow",
                                "Action": [
                                    "dynamodb:GetItem",
                                    "dynamodb:PutItem",
                                    "dynamodb:UpdateItem",
                                    "dynamodb:BatchGetItem",
                                ],
                                "Resource": { "Fn::GetAtt": ["Table", "Arn"] },
                            }],
                        },
                    },
                },
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Code": { "ZipFile": "x" },
                        "Role": { "Fn::GetAtt": ["HandlerRole", "Arn"] },
                    },
                },
            }
        }));
        let json = template.to_json();
        assert!(json["Resources"].get("HandlerPolicy").is_none());
        assert!(json["Resources"].get("HandlerRole").is_none());
        assert_eq!(
            json["Resources"]["Handler"]["Properties"]["Policies"],
            serde_json::json!([{ "DynamoDBCrudPolicy": { "TableName": { "Ref": "Table" } } }])
        );
    }

    #[test]
    fn s3_and_sqs_templates_with_inline_remainder() {
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "Bucket": { "Type": "AWS::S3::Bucket" },
                "Queue": { "Type": "AWS::SQS::Queue" },
                "HandlerRole": basic_role_json(),
                "HandlerPolicy": {
                    "Type": "AWS::IAM::Policy",
                    "Properties": {
                        "Roles": [{ "Ref": "HandlerRole" }],
                        "PolicyDocument": {
                            "Version": "2012-10-17",
                            "Statement": [
                                {
                                    "Effect": "Allow",
                                    "Action": ["s3:GetObject", "s3:ListBucket"],
                                    "Resource": [{ "Fn::GetAtt": ["Bucket", "Arn"] }],
                                },
                                {
                                    "Effect": "Allow",
                                    "Action": [
                                        "sqs:ReceiveMessage",
                                        "sqs:DeleteMessage",
                                        "sqs:GetQueueAttributes",
                                    ],
                                    "Resource": { "Fn::GetAtt": ["Queue", "Arn"] },
                                },
                                {
                                    "Effect": "Allow",
                                    "Action": "execute-api:ManageConnections",
                                    "Resource": "arn:aws:execute-api:*",
                                },
                            ],
                        },
                    },
                },
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Code": { "ZipFile": "x" },
                        "Role": { "Fn::GetAtt": ["HandlerRole", "Arn"] },
                    },
                },
            }
        }));
        let json = template.to_json();
        let policies = &json["Resources"]["Handler"]["Properties"]["Policies"];
        assert_eq!(
            policies[0],
            serde_json::json!({ "S3ReadPolicy": { "BucketName": { "Ref": "Bucket" } } })
        );
        assert_eq!(
            policies[1],
            serde_json::json!({ "SQSPollerPolicy": { "QueueName": { "Ref": "Queue" } } })
        );
        // The statement no template matched survives verbatim, inline.
        assert_eq!(policies[2]["Version"], "2012-10-17");
        assert_eq!(
            policies[2]["Statement"][0]["Action"],
            "execute-api:ManageConnections"
        );
    }

    #[test]
    fn multi_table_statements_stay_inline() {
        let (template, _) = samify_json(serde_json::json!({
            "Resources": {
                "TableA": { "Type": "AWS::DynamoDB::Table" },
                "TableB": { "Type": "AWS::DynamoDB::Table" },
                "HandlerRole": basic_role_json(),
                "HandlerPolicy": {
                    "Type": "AWS::IAM::Policy",
                    "Properties": {
                        "Roles": [{ "Ref": "HandlerRole" }],
                        "PolicyDocument": {
                            "Statement": [{
                                "Effect": "Allow",
                                "Action": ["dynamodb:GetItem"],
                                "Resource": [
                                    { "Fn::GetAtt": ["TableA", "Arn"] },
                                    { "Fn::GetAtt": ["TableB", "Arn"] },
                                ],
                            }],
                        },
                    },
                },
                "Handler": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Code": { "ZipFile": "x" },
                        "Role": { "Fn::GetAtt": ["HandlerRole", "Arn"] },
                    },
                },
            }
        }));
        let json = template.to_json();
        let policies = &json["Resources"]["Handler"]["Properties"]["Policies"];
        assert!(policies[0].get("DynamoDBCrudPolicy").is_none());
        assert_eq!(policies[0]["Statement"][0]["Action"], serde_json::json!(["dynamodb:GetItem"]));
    }
}
