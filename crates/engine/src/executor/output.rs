//! Output shaping: raw action results to node outputs, node outputs to final chain outputs.

use chainfury_types::{ActionSchema, ChainDefinition, NodeDefinition, NodeStatus, RunWarning};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};

use crate::{
    resolve::{NodeOutputs, lookup_output, select_path},
    trace::ExecutionTrace,
};

/// Key used when a non-object result has no single declared output to land in.
pub const DEFAULT_OUTPUT_KEY: &str = "output";

/// Turn a raw action result into the node's named outputs.
///
/// - With `outputs` declared on the node, each name is selected from the result by path;
///   names whose path does not exist are left out.
/// - Otherwise an object result is used as-is.
/// - A non-object result lands under the schema's only output, or under `output`.
pub fn shape_outputs(node: &NodeDefinition, schema: &ActionSchema, raw: JsonValue) -> JsonMap<String, JsonValue> {
    if !node.outputs.is_empty() {
        let mut shaped = JsonMap::new();
        for (name, path) in &node.outputs {
            match select_path(&raw, path) {
                Some(value) => {
                    shaped.insert(name.clone(), value.clone());
                }
                None => debug!(node_id = %node.id, output = %name, path = %path, "declared output not present in action result"),
            }
        }
        return shaped;
    }

    match raw {
        JsonValue::Object(map) => map,
        other => {
            let key = match schema.outputs.len() {
                1 => schema.outputs.keys().next().cloned().unwrap_or_else(|| DEFAULT_OUTPUT_KEY.to_string()),
                _ => DEFAULT_OUTPUT_KEY.to_string(),
            };
            JsonMap::from_iter([(key, other)])
        }
    }
}

/// Collect the chain's final outputs. Mappings that cannot be satisfied are omitted and
/// reported as warnings.
pub fn assemble_final_outputs(
    chain: &ChainDefinition,
    node_outputs: &NodeOutputs,
    trace: &ExecutionTrace,
) -> (JsonMap<String, JsonValue>, Vec<RunWarning>) {
    let mut final_outputs = JsonMap::new();
    let mut warnings = Vec::new();

    for (output, target) in &chain.output_mapping {
        let value = node_outputs.get(&target.node).and_then(|outputs| lookup_output(outputs, &target.field));
        if let Some(value) = value {
            final_outputs.insert(output.clone(), value.clone());
            continue;
        }

        let message = match trace.status_of(&target.node) {
            Some(NodeStatus::Succeeded) => format!("node '{}' did not produce '{}'", target.node, target.field),
            Some(NodeStatus::Failed) => format!("node '{}' failed", target.node),
            Some(NodeStatus::Skipped) => format!("node '{}' was skipped", target.node),
            _ => format!("node '{}' did not run", target.node),
        };
        warn!(output = %output, node_id = %target.node, %message, "final output omitted");
        warnings.push(RunWarning {
            output: output.clone(),
            node_id: target.node.clone(),
            message,
        });
    }

    (final_outputs, warnings)
}
