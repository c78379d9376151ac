//! The SAM conversion engine.
//!
//! Each conversion is a [`Pass`]: identify a multi-resource CloudFormation
//! pattern, prove via the reference model that nothing else depends on the
//! satellites about to be folded, then mutate the primary resource in place
//! and remove the satellites. Passes run in a fixed declared order because
//! later passes consume earlier conversions' output — event folding only
//! applies to functions the Lambda pass already converted, shell folding
//! only fires once methods are gone, and so on.
//!
//! Unsupported shapes are skipped, never guessed. Detected-invalid input
//! (a supported feature specified contradictorily) raises
//! [`SamaraError::Validation`] naming the property and resource.

mod api;
mod appsync;
mod events;
mod function;
mod iam;
mod optimize;
mod state_machine;

pub use optimize::strip_cdk_metadata;

use camino::Utf8PathBuf;
use tracing::debug;

use crate::error::SamaraError;
use crate::graph::unique_name;
use crate::stage::AssetStager;
use crate::template::{Template, ensure_properties};
use crate::value::{Map, Value};

/// Knobs shared by every pass.
pub struct SamOptions {
    /// Base directory staged asset paths are rendered relative to.
    pub relative_to: Option<Utf8PathBuf>,
    /// Write inline code out through the stager instead of embedding it.
    pub prefer_external_assets: bool,
    /// Hoist properties shared by all converted functions into
    /// `Globals.Function`.
    pub hoist_globals: bool,
}

impl Default for SamOptions {
    fn default() -> Self {
        Self {
            relative_to: None,
            prefer_external_assets: false,
            hoist_globals: true,
        }
    }
}

/// State threaded through the pass pipeline. Converted functions are
/// tracked by logical id only — passes look the resource up fresh each time
/// instead of aliasing into the tree.
pub struct Context<'a> {
    pub(crate) stager: Option<&'a mut dyn AssetStager>,
    pub(crate) options: &'a SamOptions,
    pub(crate) converted: Vec<String>,
}

impl Context<'_> {
    pub(crate) fn is_converted(&self, logical_id: &str) -> bool {
        self.converted.iter().any(|id| id == logical_id)
    }
}

pub(crate) trait Pass {
    fn name(&self) -> &'static str;

    fn run(&self, template: &mut Template, cx: &mut Context) -> Result<bool, SamaraError>;
}

fn passes() -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(function::LambdaFunctions),
        Box::new(iam::IamAbsorption),
        Box::new(function::FunctionUrls),
        Box::new(api::ApiMethods),
        Box::new(events::EventSourceMappings),
        Box::new(events::PushEvents),
        Box::new(api::RestApiShells),
        Box::new(api::HttpApiShells),
        Box::new(state_machine::StateMachines),
        Box::new(appsync::AppSyncApis),
        Box::new(optimize::SimpleTables),
        Box::new(optimize::Layers),
        Box::new(events::IotRules),
        Box::new(events::CognitoTriggers),
        Box::new(optimize::FunctionGlobals),
    ]
}

/// Run the full pass pipeline over a template the caller owns exclusively.
///
/// Returns whether anything changed. On change the SAM transform is
/// declared on the template root.
pub fn samify(
    template: &mut Template,
    options: &SamOptions,
    stager: Option<&mut dyn AssetStager>,
) -> Result<bool, SamaraError> {
    let mut cx = Context {
        stager,
        options,
        converted: Vec::new(),
    };
    let mut changed = false;
    for pass in passes() {
        let span = tracing::debug_span!("pass", name = pass.name());
        let _enter = span.enter();
        let pass_changed = pass.run(template, &mut cx)?;
        if pass_changed {
            debug!(pass = pass.name(), "pass changed the template");
        }
        changed |= pass_changed;
    }
    if changed {
        template.ensure_sam_transform();
    }
    Ok(changed)
}

/// Append an event to a function's `Events` block under a unique name
/// derived from `name_base`.
pub(crate) fn attach_event(function: &mut Value, name_base: &str, event: Value) -> Option<String> {
    let props = ensure_properties(function)?;
    if !matches!(props.get("Events"), Some(Value::Map(_))) {
        props.insert("Events".into(), Value::Map(Map::new()));
    }
    let events = props.get_mut("Events").and_then(Value::as_map_mut)?;
    let name = unique_name(|candidate| events.contains_key(candidate), name_base);
    events.insert(name.clone(), event);
    Some(name)
}

/// Build a `{Type, Properties}` event entry.
pub(crate) fn event_entry(event_type: &str, properties: Map) -> Value {
    let mut entry = Map::new();
    entry.insert("Type".into(), Value::string(event_type));
    entry.insert("Properties".into(), Value::Map(properties));
    Value::Map(entry)
}
