//! Event-source folding: `EventSourceMapping`, EventBridge rules, S3 bucket
//! notifications, IoT topic rules and Cognito triggers all collapse into the
//! `Events` block of the converted function they target.

use tracing::debug;

use crate::convert::{Context, Pass, attach_event, event_entry};
use crate::error::SamaraError;
use crate::graph::remove_resources;
use crate::refs::{extract_logical_id, mentions};
use crate::template::{Template, properties, resource_type};
use crate::value::{Map, Value};

/// Mapping properties SAM event sources share, in emission order.
const COMMON_MAPPING_KEYS: [&str; 17] = [
    "BatchSize",
    "Enabled",
    "StartingPosition",
    "StartingPositionTimestamp",
    "MaximumBatchingWindowInSeconds",
    "MaximumRetryAttempts",
    "BisectBatchOnFunctionError",
    "MaximumRecordAgeInSeconds",
    "ParallelizationFactor",
    "DestinationConfig",
    "FunctionResponseTypes",
    "FilterCriteria",
    "TumblingWindowInSeconds",
    "ScalingConfig",
    "ConsumerGroupId",
    "ProvisionedPollerConfig",
    "MetricsConfig",
];

/// Accepted on the mapping but never copied to the event — their contents
/// are flattened instead.
const INPUT_ONLY_KEYS: [&str; 3] = [
    "DocumentDBEventSourceConfig",
    "SelfManagedEventSource",
    "AmazonManagedKafkaEventSourceConfig",
];

struct SourceKind {
    event_type: &'static str,
    /// Key the source lands under in the SAM event (`Queue`, `Stream`, ...).
    sam_key: &'static str,
    /// Key the source is read from on the mapping.
    source_key: &'static str,
    extra_allowed: &'static [&'static str],
}

const KAFKA_EXTRA: &[&str] = &[
    "Topics",
    "ConsumerGroupId",
    "SourceAccessConfigurations",
    "SchemaRegistryConfig",
    "AmazonManagedKafkaEventSourceConfig",
    "ProvisionedPollerConfig",
    "MetricsConfig",
];

const SELF_MANAGED_KAFKA_EXTRA: &[&str] = &[
    "Topics",
    "ConsumerGroupId",
    "SourceAccessConfigurations",
    "SchemaRegistryConfig",
    "SelfManagedEventSource",
    "ProvisionedPollerConfig",
    "MetricsConfig",
];

const MQ_EXTRA: &[&str] = &["Queues", "SourceAccessConfigurations"];

const DOCUMENTDB_EXTRA: &[&str] = &[
    "DocumentDBEventSourceConfig",
    "SourceAccessConfigurations",
    "SecretsManagerKmsKeyId",
];

pub(crate) struct EventSourceMappings;

impl Pass for EventSourceMappings {
    fn name(&self) -> &'static str {
        "event-source-mappings"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        if cx.converted.is_empty() {
            return Ok(false);
        }
        let Some(resources) = template.resources() else {
            return Ok(false);
        };

        let mut folds: Vec<(String, String, Value)> = Vec::new();
        for (logical_id, resource) in resources {
            if resource_type(resource) != Some("AWS::Lambda::EventSourceMapping") {
                continue;
            }
            let Some(props) = properties(resource) else {
                continue;
            };
            let Some(function_id) = props
                .get("FunctionName")
                .and_then(extract_logical_id)
                .map(str::to_owned)
            else {
                continue;
            };
            if !cx.is_converted(&function_id) {
                continue;
            }
            let Some(event) = convert_event_source_mapping(logical_id, props, resources)? else {
                continue;
            };
            folds.push((logical_id.clone(), function_id, event));
        }

        let mut removals = Vec::new();
        for (mapping_id, function_id, event) in folds {
            let Some(function) = template.resource_mut(&function_id) else {
                continue;
            };
            attach_event(function, &mapping_id, event);
            debug!(%mapping_id, %function_id, "folded event source mapping");
            removals.push(mapping_id);
        }
        let changed = !removals.is_empty();
        remove_resources(template, &removals);
        Ok(changed)
    }
}

fn convert_event_source_mapping(
    mapping_id: &str,
    props: &Map,
    resources: &Map,
) -> Result<Option<Value>, SamaraError> {
    let Some(kind) = detect_source_kind(props, resources) else {
        return Ok(None);
    };

    // A property outside the per-type allow-list means the mapping carries
    // something SAM cannot express; skip rather than drop it silently.
    let allowed = |key: &str| {
        key == "FunctionName"
            || key == kind.source_key
            || COMMON_MAPPING_KEYS.contains(&key)
            || kind.extra_allowed.contains(&key)
    };
    if props.keys().any(|key| !allowed(key)) {
        return Ok(None);
    }

    let target = match props.get(kind.source_key) {
        Some(value) => Some(value.clone()),
        None if kind.source_key == "KafkaBootstrapServers" => props
            .get("SelfManagedEventSource")
            .and_then(|source| source.get("Endpoints"))
            .and_then(|endpoints| endpoints.get("KafkaBootstrapServers"))
            .cloned(),
        None => None,
    };
    let Some(target) = target else {
        return Ok(None);
    };

    let mut event_props = Map::new();
    event_props.insert(kind.sam_key.to_owned(), target);

    if let Some(amk) = props
        .get("AmazonManagedKafkaEventSourceConfig")
        .and_then(Value::as_map)
        && let Some(consumer_group) = amk.get("ConsumerGroupId")
    {
        if props.contains_key("ConsumerGroupId") {
            return Err(SamaraError::validation(
                mapping_id,
                "ConsumerGroupId",
                "Conflict: ConsumerGroupId specified both directly and via \
                 AmazonManagedKafkaEventSourceConfig.",
            ));
        }
        if !matches!(
            consumer_group,
            Value::String(_) | Value::Map(_) | Value::Intrinsic(_)
        ) {
            return Err(SamaraError::validation(
                mapping_id,
                "ConsumerGroupId",
                "ConsumerGroupId from AmazonManagedKafkaEventSourceConfig must be a string \
                 or intrinsic function.",
            ));
        }
        event_props.insert("ConsumerGroupId".into(), consumer_group.clone());
    }

    for key in COMMON_MAPPING_KEYS {
        if let Some(value) = props.get(key) {
            event_props.insert(key.to_owned(), value.clone());
        }
    }
    for key in kind.extra_allowed {
        if *key == kind.source_key || INPUT_ONLY_KEYS.contains(key) {
            continue;
        }
        if let Some(value) = props.get(*key) {
            event_props.insert((*key).to_owned(), value.clone());
        }
    }

    if kind.event_type == "DocumentDB" {
        if let Some(config) = props
            .get("DocumentDBEventSourceConfig")
            .and_then(Value::as_map)
        {
            for key in ["DatabaseName", "CollectionName", "FullDocument"] {
                if let Some(value) = config.get(key) {
                    event_props.insert(key.to_owned(), value.clone());
                }
            }
        }
        let complete = event_props.contains_key("DatabaseName")
            && event_props.contains_key("SourceAccessConfigurations")
            && event_props.contains_key("StartingPosition");
        if !complete {
            return Ok(None);
        }
    }

    Ok(Some(event_entry(kind.event_type, event_props)))
}

/// Infer the concrete event-source type from the referenced resource's
/// `Type`, falling back to the shape of the ARN.
fn detect_source_kind(props: &Map, resources: &Map) -> Option<SourceKind> {
    if props.contains_key("SelfManagedEventSource") {
        return Some(SourceKind {
            event_type: "SelfManagedKafka",
            sam_key: "KafkaBootstrapServers",
            source_key: "KafkaBootstrapServers",
            extra_allowed: SELF_MANAGED_KAFKA_EXTRA,
        });
    }

    let arn = props.get("EventSourceArn")?;
    if let Some(referenced) = extract_logical_id(arn)
        .and_then(|id| resources.get(id))
        .and_then(resource_type)
    {
        let kind = match referenced {
            "AWS::SQS::Queue" => Some(("SQS", "Queue", &[] as &[&str])),
            "AWS::Kinesis::Stream" => Some(("Kinesis", "Stream", &[] as &[&str])),
            "AWS::DynamoDB::Table" => Some(("DynamoDB", "Stream", &[] as &[&str])),
            "AWS::MSK::Cluster" => Some(("MSK", "Stream", KAFKA_EXTRA)),
            "AWS::AmazonMQ::Broker" => Some(("MQ", "Broker", MQ_EXTRA)),
            "AWS::DocDB::DBCluster" => Some(("DocumentDB", "Cluster", DOCUMENTDB_EXTRA)),
            _ => None,
        };
        if let Some((event_type, sam_key, extra)) = kind {
            return Some(SourceKind {
                event_type,
                sam_key,
                source_key: "EventSourceArn",
                extra_allowed: extra,
            });
        }
    }

    let rendered = serde_json::to_string(&arn.to_json())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let by_shape = if rendered.contains("kafka") && rendered.contains("cluster") {
        ("MSK", "Stream", KAFKA_EXTRA)
    } else if rendered.contains(":mq:") {
        ("MQ", "Broker", MQ_EXTRA)
    } else if rendered.contains(":docdb:")
        || (rendered.contains(":rds:") && rendered.contains(":cluster:") && rendered.contains("docdb"))
    {
        ("DocumentDB", "Cluster", DOCUMENTDB_EXTRA)
    } else if rendered.contains(":dynamodb:") {
        ("DynamoDB", "Stream", &[] as &[&str])
    } else if rendered.contains(":kinesis:") {
        ("Kinesis", "Stream", &[] as &[&str])
    } else if rendered.contains(":sqs:") {
        ("SQS", "Queue", &[] as &[&str])
    } else {
        return None;
    };
    let (event_type, sam_key, extra) = by_shape;
    Some(SourceKind {
        event_type,
        sam_key,
        source_key: "EventSourceArn",
        extra_allowed: extra,
    })
}

/// EventBridge rules and S3 bucket notifications targeting converted
/// functions become `EventBridgeRule`/`Schedule`/`S3` events.
pub(crate) struct PushEvents;

impl Pass for PushEvents {
    fn name(&self) -> &'static str {
        "push-events"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        if cx.converted.is_empty() {
            return Ok(false);
        }
        let mut changed = fold_event_rules(template, cx);
        changed |= fold_s3_notifications(template, cx);
        Ok(changed)
    }
}

fn fold_event_rules(template: &mut Template, cx: &Context) -> bool {
    let Some(resources) = template.resources() else {
        return false;
    };

    let mut folds: Vec<(String, String, Value)> = Vec::new();
    let mut permission_ids: Vec<String> = Vec::new();
    for (rule_id, resource) in resources {
        if resource_type(resource) != Some("AWS::Events::Rule") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        let Some(targets) = props.get("Targets").and_then(Value::as_list) else {
            continue;
        };
        let [target] = targets else {
            continue;
        };
        let Some(target) = target.as_map() else {
            continue;
        };
        let Some(function_id) = target
            .get("Arn")
            .and_then(extract_logical_id)
            .map(str::to_owned)
        else {
            continue;
        };
        if !cx.is_converted(&function_id) {
            continue;
        }
        if target.contains_key("InputTransformer") {
            continue; // unsupported; skip
        }
        let Some(event) = convert_events_rule(props, target) else {
            continue;
        };
        permission_ids.extend(lambda_permission_ids(resources, &function_id, None, Some(rule_id)));
        folds.push((rule_id.clone(), function_id, event));
    }

    let mut removals = Vec::new();
    for (rule_id, function_id, event) in folds {
        let Some(function) = template.resource_mut(&function_id) else {
            continue;
        };
        attach_event(function, &rule_id, event);
        debug!(%rule_id, %function_id, "folded events rule");
        removals.push(rule_id);
    }
    let changed = !removals.is_empty();
    remove_resources(template, &removals);
    remove_resources(template, &permission_ids);
    changed
}

fn convert_events_rule(props: &Map, target: &Map) -> Option<Value> {
    if props.contains_key("EventPattern") {
        const ALLOWED: [&str; 6] = [
            "Name",
            "Description",
            "EventBusName",
            "EventPattern",
            "State",
            "Targets",
        ];
        if props.keys().any(|key| !ALLOWED.contains(&key.as_str())) {
            return None;
        }
        let mut event_props = Map::new();
        event_props.insert("Pattern".into(), props.get("EventPattern")?.clone());
        if let Some(bus) = props.get("EventBusName") {
            event_props.insert("EventBusName".into(), bus.clone());
        }
        if let Some(state) = props.get("State") {
            event_props.insert(
                "Enabled".into(),
                Value::Bool(state.as_str() == Some("ENABLED")),
            );
        }
        if let Some(description) = props.get("Description") {
            event_props.insert("Description".into(), description.clone());
        }
        return Some(event_entry("EventBridgeRule", event_props));
    }

    if !props.contains_key("ScheduleExpression") {
        return None;
    }
    const ALLOWED: [&str; 5] = ["Name", "Description", "ScheduleExpression", "State", "Targets"];
    if props.keys().any(|key| !ALLOWED.contains(&key.as_str())) {
        return None;
    }
    let mut event_props = Map::new();
    event_props.insert("Schedule".into(), props.get("ScheduleExpression")?.clone());
    if let Some(state) = props.get("State") {
        event_props.insert(
            "Enabled".into(),
            Value::Bool(state.as_str() == Some("ENABLED")),
        );
    }
    if let Some(description) = props.get("Description") {
        event_props.insert("Description".into(), description.clone());
    }
    for key in ["Input", "DeadLetterConfig", "RetryPolicy"] {
        if let Some(value) = target.get(key) {
            event_props.insert(key.to_owned(), value.clone());
        }
    }
    Some(event_entry("Schedule", event_props))
}

fn fold_s3_notifications(template: &mut Template, cx: &Context) -> bool {
    let Some(resources) = template.resources() else {
        return false;
    };

    struct S3Fold {
        bucket_id: String,
        index: usize,
        function_id: String,
        event_name: String,
        event: Value,
    }

    let mut folds: Vec<S3Fold> = Vec::new();
    let mut permission_ids: Vec<String> = Vec::new();
    for (bucket_id, resource) in resources {
        if resource_type(resource) != Some("AWS::S3::Bucket") {
            continue;
        }
        let Some(configs) = properties(resource)
            .and_then(|props| props.get("NotificationConfiguration"))
            .and_then(|conf| conf.get("LambdaConfigurations"))
            .and_then(Value::as_list)
        else {
            continue;
        };
        let total = configs.len();
        for (index, config) in configs.iter().enumerate() {
            let Some(config) = config.as_map() else {
                continue;
            };
            let Some(function_id) = config
                .get("Function")
                .and_then(extract_logical_id)
                .map(str::to_owned)
            else {
                continue;
            };
            if !cx.is_converted(&function_id) {
                continue;
            }
            let Some(event) = convert_s3_notification(bucket_id, config) else {
                continue;
            };
            permission_ids.extend(lambda_permission_ids(
                resources,
                &function_id,
                Some("s3.amazonaws.com"),
                Some(bucket_id),
            ));
            // One notification keeps the bare bucket id as the event name;
            // multiple get an index suffix for uniqueness.
            let event_name = if total == 1 {
                bucket_id.clone()
            } else {
                format!("{bucket_id}{index}")
            };
            folds.push(S3Fold {
                bucket_id: bucket_id.clone(),
                index,
                function_id,
                event_name,
                event,
            });
        }
    }

    let mut removed_per_bucket: indexmap::IndexMap<String, Vec<usize>> = indexmap::IndexMap::new();
    for fold in folds {
        let Some(function) = template.resource_mut(&fold.function_id) else {
            continue;
        };
        attach_event(function, &fold.event_name, fold.event);
        debug!(bucket_id = %fold.bucket_id, function_id = %fold.function_id, "folded S3 notification");
        removed_per_bucket
            .entry(fold.bucket_id)
            .or_default()
            .push(fold.index);
    }

    let changed = !removed_per_bucket.is_empty();
    for (bucket_id, mut indexes) in removed_per_bucket {
        let Some(props) = template
            .resource_mut(&bucket_id)
            .and_then(crate::template::properties_mut)
        else {
            continue;
        };
        let Some(notification) = props
            .get_mut("NotificationConfiguration")
            .and_then(Value::as_map_mut)
        else {
            continue;
        };
        if let Some(configs) = notification
            .get_mut("LambdaConfigurations")
            .and_then(Value::as_list_mut)
        {
            indexes.sort_unstable_by(|a, b| b.cmp(a));
            for idx in indexes {
                if idx < configs.len() {
                    configs.remove(idx);
                }
            }
            if configs.is_empty() {
                notification.shift_remove("LambdaConfigurations");
            }
        }
        if notification.is_empty() {
            props.shift_remove("NotificationConfiguration");
        }
    }
    remove_resources(template, &permission_ids);
    changed
}

fn convert_s3_notification(bucket_id: &str, config: &Map) -> Option<Value> {
    let events = config.get("Event").or_else(|| config.get("Events"))?;
    let event_list = match events {
        Value::List(items) => items.clone(),
        other => vec![other.clone()],
    };
    let mut props = Map::new();
    props.insert("Bucket".into(), Value::reference(bucket_id));
    props.insert("Events".into(), Value::List(event_list));
    if let Some(rules) = extract_s3_filter_rules(config.get("Filter")) {
        let mut s3_key = Map::new();
        s3_key.insert("Rules".into(), Value::List(rules));
        let mut filter = Map::new();
        filter.insert("S3Key".into(), Value::Map(s3_key));
        props.insert("Filter".into(), Value::Map(filter));
    }
    Some(event_entry("S3", props))
}

fn extract_s3_filter_rules(filter: Option<&Value>) -> Option<Vec<Value>> {
    let rules = filter?
        .get("S3Key")
        .and_then(|s3_key| s3_key.get("Rules"))
        .and_then(Value::as_list)?;
    let normalized: Vec<Value> = rules
        .iter()
        .filter_map(|rule| {
            let name = rule.get("Name").and_then(Value::as_str)?;
            if name != "prefix" && name != "suffix" {
                return None;
            }
            let value = rule.get("Value")?;
            let mut entry = Map::new();
            entry.insert("Name".into(), Value::string(name));
            entry.insert("Value".into(), value.clone());
            Some(Value::Map(entry))
        })
        .collect();
    (!normalized.is_empty()).then_some(normalized)
}

/// Ids of `AWS::Lambda::Permission` resources pointing at `function_id`,
/// optionally filtered by principal and by a substring the `SourceArn` must
/// mention. The substring check is a heuristic over the rendered value.
fn lambda_permission_ids(
    resources: &Map,
    function_id: &str,
    principal: Option<&str>,
    source_mentions: Option<&str>,
) -> Vec<String> {
    let mut ids = Vec::new();
    for (logical_id, resource) in resources {
        if resource_type(resource) != Some("AWS::Lambda::Permission") {
            continue;
        }
        let Some(props) = properties(resource) else {
            continue;
        };
        if props.get("FunctionName").and_then(extract_logical_id) != Some(function_id) {
            continue;
        }
        if let Some(expected) = principal
            && let Some(actual) = props.get("Principal").and_then(Value::as_str)
            && actual != expected
        {
            continue;
        }
        if let Some(needle) = source_mentions {
            let Some(source_arn) = props.get("SourceArn") else {
                continue;
            };
            if !mentions(source_arn, needle) {
                continue;
            }
        }
        ids.push(logical_id.clone());
    }
    ids
}

/// `AWS::IoT::TopicRule` with a single Lambda action → `IoTRule` event.
pub(crate) struct IotRules;

impl Pass for IotRules {
    fn name(&self) -> &'static str {
        "iot-rules"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        if cx.converted.is_empty() {
            return Ok(false);
        }
        let Some(resources) = template.resources() else {
            return Ok(false);
        };

        let mut folds: Vec<(String, String, Value)> = Vec::new();
        let mut permission_ids: Vec<String> = Vec::new();
        for (rule_id, resource) in resources {
            if resource_type(resource) != Some("AWS::IoT::TopicRule") {
                continue;
            }
            let Some(props) = properties(resource) else {
                continue;
            };
            let Some(actions) = props.get("Actions").and_then(Value::as_list) else {
                continue;
            };
            let [action] = actions else {
                continue;
            };
            let Some(function_id) = action
                .get("Lambda")
                .and_then(|lambda| lambda.get("FunctionArn"))
                .and_then(extract_logical_id)
                .map(str::to_owned)
            else {
                continue;
            };
            if !cx.is_converted(&function_id) {
                continue;
            }
            let Some(payload) = props.get("TopicRulePayload").and_then(Value::as_map) else {
                continue;
            };
            let Some(sql) = payload.get("Sql").filter(|sql| {
                sql.as_str().is_none_or(|s| !s.is_empty())
            }) else {
                continue;
            };
            let mut event_props = Map::new();
            event_props.insert("Sql".into(), sql.clone());
            for key in ["Description", "RuleDisabled", "AwsIotSqlVersion"] {
                if let Some(value) = payload.get(key) {
                    event_props.insert(key.to_owned(), value.clone());
                }
            }
            permission_ids.extend(lambda_permission_ids(
                resources,
                &function_id,
                Some("iot.amazonaws.com"),
                None,
            ));
            folds.push((rule_id.clone(), function_id, event_entry("IoTRule", event_props)));
        }

        let mut removals = Vec::new();
        for (rule_id, function_id, event) in folds {
            let Some(function) = template.resource_mut(&function_id) else {
                continue;
            };
            attach_event(function, &rule_id, event);
            removals.push(rule_id);
        }
        let changed = !removals.is_empty();
        remove_resources(template, &removals);
        remove_resources(template, &permission_ids);
        Ok(changed)
    }
}

/// Cognito user-pool `LambdaConfig` triggers → `Cognito` events. The pool
/// itself stays; only the trigger wiring moves onto the function.
pub(crate) struct CognitoTriggers;

impl Pass for CognitoTriggers {
    fn name(&self) -> &'static str {
        "cognito-triggers"
    }

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError> {
        if cx.converted.is_empty() {
            return Ok(false);
        }
        let Some(resources) = template.resources() else {
            return Ok(false);
        };

        // (pool, trigger name, function)
        let mut folds: Vec<(String, String, String)> = Vec::new();
        for (pool_id, resource) in resources {
            if resource_type(resource) != Some("AWS::Cognito::UserPool") {
                continue;
            }
            let Some(triggers) = properties(resource)
                .and_then(|props| props.get("LambdaConfig"))
                .and_then(Value::as_map)
            else {
                continue;
            };
            for (trigger_name, reference) in triggers {
                let Some(function_id) = extract_logical_id(reference).map(str::to_owned) else {
                    continue;
                };
                if !cx.is_converted(&function_id) {
                    continue;
                }
                folds.push((pool_id.clone(), trigger_name.clone(), function_id));
            }
        }

        let mut changed = false;
        for (pool_id, trigger_name, function_id) in folds {
            let mut event_props = Map::new();
            event_props.insert("UserPool".into(), Value::reference(&pool_id));
            event_props.insert("Trigger".into(), Value::string(&trigger_name));
            let event = event_entry("Cognito", event_props);
            let Some(function) = template.resource_mut(&function_id) else {
                continue;
            };
            attach_event(function, &format!("{pool_id}{trigger_name}"), event);

            let Some(props) = template
                .resource_mut(&pool_id)
                .and_then(crate::template::properties_mut)
            else {
                continue;
            };
            if let Some(triggers) = props.get_mut("LambdaConfig").and_then(Value::as_map_mut) {
                triggers.shift_remove(&trigger_name);
                if triggers.is_empty() {
                    props.shift_remove("LambdaConfig");
                }
            }
            debug!(%pool_id, %trigger_name, %function_id, "folded Cognito trigger");
            changed = true;
        }
        Ok(changed)
    }
}
