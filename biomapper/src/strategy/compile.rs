//! Turns a strategy definition into a runnable pipeline.
//!
//! Step params may reference strategy parameters as `${parameters.<key>}`.
//! A string that is exactly one reference takes the parameter's value with
//! its JSON type; references embedded in longer strings are interpolated as
//! text. The keys `confidence_threshold`, `cost_budget`, `cost_per_call` and
//! `method` configure the stage and are not passed to the action.

use super::{StepDescriptor, StrategyDefinition};
use crate::actions::{ActionParams, ActionRegistry};
use crate::context::JsonMap;
use crate::errors::{BiomapperError, Result, ValidationError};
use crate::pipeline::{WaterfallPipeline, WaterfallStage};
use serde_json::Value;
use tracing::debug;

const REFERENCE_PREFIX: &str = "${parameters.";

/// Overlays submission parameters on the strategy defaults.
#[must_use]
pub fn merge_parameters(defaults: &JsonMap, overrides: &JsonMap) -> JsonMap {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Builds a pipeline with one stage per step.
///
/// # Errors
///
/// - `Validation` if the definition is invalid, a reference names an
///   unknown parameter, or a stage setting has the wrong type
/// - `NotFound` if a step names an unregistered action type
pub fn compile(
    definition: &StrategyDefinition,
    parameters: &JsonMap,
    actions: &ActionRegistry,
) -> Result<WaterfallPipeline> {
    definition.validate()?;
    let mut pipeline = WaterfallPipeline::new(&definition.name);
    for step in &definition.steps {
        pipeline = pipeline.with_stage(compile_step(step, parameters, actions)?);
    }
    pipeline.validate()?;
    debug!(strategy = %definition.name, stages = pipeline.len(), "Compiled strategy");
    Ok(pipeline)
}

fn compile_step(step: &StepDescriptor, parameters: &JsonMap, actions: &ActionRegistry) -> Result<WaterfallStage> {
    let action = actions.get(&step.action_type).ok_or_else(|| {
        BiomapperError::NotFound(format!(
            "action type '{}' (step '{}')",
            step.action_type, step.name
        ))
    })?;

    let mut params = JsonMap::new();
    for (key, value) in &step.params {
        let field = format!("steps.{}.params.{key}", step.name);
        params.insert(key.clone(), substitute(value, parameters, &field)?);
    }

    let mut stage = WaterfallStage::new(&step.name, action);
    if let Some(value) = params.remove("confidence_threshold") {
        stage = stage.with_threshold(number(&value, &step.name, "confidence_threshold")?);
    }
    if let Some(value) = params.remove("cost_budget") {
        let budget = value.as_u64().ok_or_else(|| {
            ValidationError::new(
                format!("steps.{}.cost_budget", step.name),
                "must be a non-negative integer",
            )
        })?;
        stage = stage.with_budget(budget);
    }
    if let Some(value) = params.remove("cost_per_call") {
        stage = stage.with_cost_per_call(number(&value, &step.name, "cost_per_call")?);
    }
    if let Some(value) = params.remove("method") {
        let method = value
            .as_str()
            .ok_or_else(|| ValidationError::new(format!("steps.{}.method", step.name), "must be a string"))?;
        stage = stage.with_method(method);
    }
    Ok(stage.with_params(ActionParams::from_map(params)))
}

fn number(value: &Value, step: &str, key: &str) -> Result<f64, ValidationError> {
    value
        .as_f64()
        .ok_or_else(|| ValidationError::new(format!("steps.{step}.{key}"), "must be a number"))
}

/// Replaces `${parameters.<key>}` references, recursing into arrays and
/// objects.
fn substitute(value: &Value, parameters: &JsonMap, field: &str) -> Result<Value, ValidationError> {
    match value {
        Value::String(s) => substitute_str(s, parameters, field),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, parameters, field))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), substitute(v, parameters, field)?)))
            .collect::<Result<JsonMap, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn substitute_str(s: &str, parameters: &JsonMap, field: &str) -> Result<Value, ValidationError> {
    if !s.contains(REFERENCE_PREFIX) {
        return Ok(Value::String(s.to_string()));
    }

    let lookup = |key: &str| {
        parameters.get(key).ok_or_else(|| {
            ValidationError::new(field, format!("unknown parameter '{key}'"))
        })
    };

    if let Some(key) = s
        .strip_prefix(REFERENCE_PREFIX)
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|key| !key.contains('}'))
    {
        return lookup(key).cloned();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(REFERENCE_PREFIX) {
        out.push_str(&rest[..start]);
        let after = &rest[start + REFERENCE_PREFIX.len()..];
        let end = after
            .find('}')
            .ok_or_else(|| ValidationError::new(field, "unterminated parameter reference"))?;
        match lookup(&after[..end])? {
            Value::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}
