use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::executor::engine::ApplyReport;
use crate::resolve::{self, EvalContext, ResolvedValues};
use crate::template::types::Template;

/// The projected value of a single deployment output.
///
/// Outputs referencing a resource that did not converge (failed, skipped, or
/// disabled) are reported unavailable rather than projected from stale or
/// missing state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutputValue {
    Resolved(serde_json::Value),
    Unavailable,
}

impl OutputValue {
    pub fn as_resolved(&self) -> Option<&serde_json::Value> {
        match self {
            OutputValue::Resolved(v) => Some(v),
            OutputValue::Unavailable => None,
        }
    }
}

/// Evaluate every template output against the states observed during apply.
///
/// Partial success is the input here, not the exception: after a run where
/// some nodes failed, the outputs whose referenced resources did converge
/// still project normally.
pub fn project_outputs(
    template: &Template,
    values: &ResolvedValues,
    report: &ApplyReport,
) -> Result<BTreeMap<String, OutputValue>> {
    let states: DashMap<String, serde_json::Value> = report
        .resource_states
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let ctx = EvalContext {
        parameters: &values.parameters,
        variables: &values.variables,
        scope: &values.scope,
        resource_states: Some(&states),
        slot_aliases: Some(&report.slot_aliases),
    };

    let mut outputs = BTreeMap::new();
    for spec in &template.outputs {
        let available = spec.value.references().iter().all(|path| {
            referenced_resource(path, &report.slot_aliases)
                .map(|name| report.resource_states.contains_key(&name))
                .unwrap_or(true)
        });
        if !available {
            debug!(output = %spec.name, "referenced resource did not converge");
            outputs.insert(spec.name.clone(), OutputValue::Unavailable);
            continue;
        }
        let value = resolve::evaluate(&spec.value, &ctx)?;
        outputs.insert(spec.name.clone(), OutputValue::Resolved(value));
    }
    Ok(outputs)
}

/// The logical resource a reference path points at, if any. Slot roles are
/// resolved through the selection made during apply.
fn referenced_resource(
    path: &[String],
    slot_aliases: &BTreeMap<String, String>,
) -> Option<String> {
    match path.first().map(String::as_str) {
        Some("parameters") | Some("variables") | None => None,
        Some("slot") => path
            .get(1)
            .and_then(|role| slot_aliases.get(role))
            .cloned(),
        Some("resources") => path.get(1).cloned(),
        Some(name) => Some(name.to_string()),
    }
}
