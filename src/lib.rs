#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod convert;
mod error;
mod graph;
mod normalize;
mod refs;
mod stage;
mod template;
mod value;

pub use crate::convert::{SamOptions, samify, strip_cdk_metadata};
pub use crate::error::SamaraError;
pub use crate::graph::{api_resource_paths, remove_resources, resolve_method_path, unique_name};
pub use crate::normalize::{
    CollisionStrategy, ConstructInfo, MetadataLookup, NormalizeMode, Normalizer, is_cdk_hash,
    strip_hash_suffix,
};
pub use crate::refs::{
    RenameMap, extract_logical_id, join_payload_to_sub, join_to_sub, references_any,
    rewrite_literal_refs, rewrite_references, rewrite_sub_tokens,
};
pub use crate::stage::{
    AssetStager, AwsEnvironment, LocalAsset, ProjectStager, S3Downloader, StagedAsset,
    format_code_uri, format_s3_uri, infer_partition, prepare_inline_code,
};
pub use crate::template::{
    SAM_TRANSFORM, Template, ensure_properties, metadata, properties, properties_mut,
    resource_type,
};
pub use crate::value::{Intrinsic, Map, Value};

#[cfg(test)]
mod tests {
    use super::*;

    /// The full host flow: normalize identities first, then fold into SAM.
    #[test]
    fn normalize_then_samify() {
        let mut template = Template::from_json(serde_json::json!({
            "Resources": {
                "CDKMetadata": { "Type": "AWS::CDK::Metadata", "Properties": { "Analytics": "x" } },
                "HandlerServiceRole1A2B3C4D": {
                    "Type": "AWS::IAM::Role",
                    "Properties": {
                        "AssumeRolePolicyDocument": {
                            "Statement": [{
                                "Effect": "Allow",
                                "Action": "sts:AssumeRole",
                                "Principal": { "Service": "lambda.amazonaws.com" },
                            }],
                        },
                        "ManagedPolicyArns": [
                            "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole",
                        ],
                    },
                },
                "HandlerABCD1234": {
                    "Type": "AWS::Lambda::Function",
                    "Metadata": { "aws:cdk:path": "Stack/Handler/Resource" },
                    "Properties": {
                        "Runtime": "python3.12",
                        "Handler": "index.handler",
                        "Role": { "Fn::GetAtt": ["HandlerServiceRole1A2B3C4D", "Arn"] },
                        "Code": { "ZipFile": "def handler(event, context):\n    return event" },
                    },
                },
            },
        }))
        .unwrap();

        let renames = Normalizer::readable().normalize(&mut template);
        assert_eq!(
            renames.get("HandlerABCD1234").map(String::as_str),
            Some("Handler")
        );
        assert_eq!(
            renames.get("HandlerServiceRole1A2B3C4D").map(String::as_str),
            Some("HandlerRole")
        );

        let changed = samify(&mut template, &SamOptions::default(), None).unwrap();
        assert!(changed);

        let json = template.to_json();
        assert_eq!(json["Transform"], SAM_TRANSFORM);
        assert!(json["Resources"].get("CDKMetadata").is_none());
        assert!(json["Resources"].get("HandlerRole").is_none());
        let handler = &json["Resources"]["Handler"];
        assert_eq!(handler["Type"], "AWS::Serverless::Function");
        assert!(handler["Properties"].get("Role").is_none());
        assert_eq!(
            handler["Properties"]["InlineCode"],
            "def handler(event, context):\n    return event"
        );
    }

    /// Resources the engine does not recognize round-trip untouched.
    #[test]
    fn unknown_resources_round_trip() {
        let fixture = serde_json::json!({
            "AWSTemplateFormatVersion": "2010-09-09",
            "Resources": {
                "Vpc": {
                    "Type": "AWS::EC2::VPC",
                    "Properties": { "CidrBlock": "10.0.0.0/16" },
                },
                "Cluster": {
                    "Type": "AWS::ECS::Cluster",
                    "DependsOn": "Vpc",
                },
            },
        });
        let mut template = Template::from_json(fixture.clone()).unwrap();
        let changed = samify(&mut template, &SamOptions::default(), None).unwrap();
        assert!(!changed);
        assert_eq!(template.to_json(), fixture);
    }
}
