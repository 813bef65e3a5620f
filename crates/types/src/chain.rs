//! Strongly typed chain definitions as they are authored and submitted for execution.
//!
//! The models preserve authoring order (via `IndexMap` and `Vec`) because node declaration
//! order is the tie-break used when scheduling nodes of the same dependency layer, which in
//! turn keeps execution traces deterministic.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::schema::FieldSpec;

/// A user-defined directed graph of nodes representing an end-to-end workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChainDefinition {
    /// Canonical chain identifier used in traces and stored runs.
    #[serde(default)]
    pub id: String,
    /// Optional human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Optional descriptive copy.
    #[serde(default)]
    pub description: Option<String>,
    /// Declared chain-level inputs keyed by name, in authoring order.
    ///
    /// When the map is empty the chain accepts any caller input and chain-input bindings are
    /// not checked against a declaration.
    #[serde(default)]
    pub inputs: IndexMap<String, FieldSpec>,
    /// Nodes in declaration order.
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    /// Final output name mapped to the node output that produces it.
    #[serde(default)]
    pub output_mapping: IndexMap<String, OutputTarget>,
    /// Failure policy requested by the chain author. Run options may override it.
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
}

impl ChainDefinition {
    /// Returns the node with the given identifier, if declared.
    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// Returns the display label: the name when present, otherwise the identifier.
    pub fn label(&self) -> &str {
        self.name.as_deref().filter(|name| !name.trim().is_empty()).unwrap_or(&self.id)
    }
}

/// One step in a chain, bound to an action type and its configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    /// Identifier, unique within the chain.
    pub id: String,
    /// Registered action type executed by this node.
    pub action_type: String,
    /// Optional descriptive copy surfaced in traces.
    #[serde(default)]
    pub description: Option<String>,
    /// Static literal parameters passed to the action untouched.
    #[serde(default)]
    pub config: JsonMap<String, JsonValue>,
    /// Input name mapped to the expression producing its value.
    #[serde(default)]
    pub input_bindings: IndexMap<String, InputBinding>,
    /// Output name mapped to a dotted path into the raw action result.
    ///
    /// When empty, an object result is used as the node output directly.
    #[serde(default)]
    pub outputs: IndexMap<String, String>,
    /// Per-node invocation timeout overriding the action default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl NodeDefinition {
    /// Returns the identifiers of nodes referenced by this node's bindings, in binding order
    /// and without duplicates.
    pub fn referenced_nodes(&self) -> Vec<&str> {
        let mut referenced: Vec<&str> = Vec::new();
        for binding in self.input_bindings.values() {
            if let InputBinding::NodeOutput { node, .. } = binding
                && !referenced.contains(&node.as_str())
            {
                referenced.push(node.as_str());
            }
        }
        referenced
    }
}

/// Expression determining where a node input value comes from.
///
/// Serialized untagged so authors can write `{ "literal": 3 }`, `{ "input": "topic" }`, or
/// `{ "node": "fetch", "field": "body.items.0" }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InputBinding {
    /// Output field (optionally a dotted path) of an upstream node.
    NodeOutput {
        /// Source node identifier.
        node: String,
        /// Output field, optionally followed by `.`-separated nested segments.
        field: String,
    },
    /// Caller-supplied chain input.
    ChainInput {
        /// Chain input name.
        input: String,
    },
    /// Literal JSON value used verbatim.
    Literal {
        /// The value.
        literal: JsonValue,
    },
}

impl InputBinding {
    /// Convenience constructor for a literal binding.
    pub fn literal(value: impl Into<JsonValue>) -> Self {
        Self::Literal { literal: value.into() }
    }

    /// Convenience constructor for a chain input binding.
    pub fn input(name: impl Into<String>) -> Self {
        Self::ChainInput { input: name.into() }
    }

    /// Convenience constructor for a node output binding.
    pub fn node_output(node: impl Into<String>, field: impl Into<String>) -> Self {
        Self::NodeOutput {
            node: node.into(),
            field: field.into(),
        }
    }
}

/// Location of a node output promoted to a final chain output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputTarget {
    /// Node producing the value.
    pub node: String,
    /// Output field, optionally followed by nested segments.
    pub field: String,
}

impl OutputTarget {
    pub fn new(node: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            field: field.into(),
        }
    }
}

/// How the executor reacts when a node fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching, skip every node that has not started, and report the run aborted.
    #[default]
    Abort,
    /// Keep running nodes that do not depend on the failure.
    Continue,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Abort => formatter.write_str("abort"),
            FailurePolicy::Continue => formatter.write_str("continue"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "continue" => Ok(FailurePolicy::Continue),
            other => Err(format!("unknown failure policy '{other}' (expected 'abort' or 'continue')")),
        }
    }
}
