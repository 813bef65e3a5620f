//! Variable resolution: turns a node's bindings into concrete, typed input values.
//!
//! Resolution is a pure lookup over the caller's chain inputs and the outputs of nodes that
//! already succeeded. Values are coerced towards the declared field type when the conversion
//! is lossless (numeric text, `"true"`/`"false"`, scalars to text) and rejected otherwise.

use std::collections::HashSet;

use chainfury_types::{ActionSchema, ChainDefinition, FieldSpec, FieldType, InputBinding, NodeDefinition, validate_candidate_value};
use chainfury_util::text_processing::{REDACTED, is_sensitive_key};
use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

use crate::error::ResolutionError;

/// Outputs of completed nodes keyed by node identifier.
pub type NodeOutputs = IndexMap<String, JsonMap<String, JsonValue>>;

/// Caller-supplied chain inputs with declared defaults applied.
#[derive(Debug, Clone, Default)]
pub struct ChainInputs {
    values: JsonMap<String, JsonValue>,
    declared: IndexMap<String, FieldSpec>,
}

impl ChainInputs {
    /// Combine the caller's values with the chain's declared input defaults.
    pub fn new(chain: &ChainDefinition, supplied: JsonMap<String, JsonValue>) -> Self {
        let mut values = supplied;
        for (name, spec) in &chain.inputs {
            if let Some(default) = &spec.default
                && values.get(name).is_none_or(JsonValue::is_null)
            {
                values.insert(name.clone(), default.clone());
            }
        }
        Self {
            values,
            declared: chain.inputs.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name)
    }

    /// Whether the chain declares an input with this name.
    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains_key(name)
    }

    pub fn is_secret(&self, name: &str) -> bool {
        self.declared.get(name).is_some_and(|spec| spec.secret)
    }

    pub fn values(&self) -> &JsonMap<String, JsonValue> {
        &self.values
    }

    /// Declared chain inputs that are required but were not supplied.
    pub fn missing_required(&self) -> Vec<&str> {
        self.declared
            .iter()
            .filter(|(name, spec)| spec.required && self.values.get(*name).is_none_or(JsonValue::is_null))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Concrete input values for one node, ready to hand to an action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedInputs {
    values: JsonMap<String, JsonValue>,
    secrets: HashSet<String>,
}

impl ResolvedInputs {
    pub fn values(&self) -> &JsonMap<String, JsonValue> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name)
    }

    pub fn into_values(self) -> JsonMap<String, JsonValue> {
        self.values
    }

    /// Copy of the values suitable for traces: secret and credential-named fields are redacted.
    pub fn snapshot(&self) -> JsonMap<String, JsonValue> {
        self.values
            .iter()
            .map(|(name, value)| {
                if self.secrets.contains(name) || is_sensitive_key(name) {
                    (name.clone(), JsonValue::String(REDACTED.to_string()))
                } else {
                    (name.clone(), value.clone())
                }
            })
            .collect()
    }

    fn insert(&mut self, name: &str, value: JsonValue, secret: bool) {
        if secret {
            self.secrets.insert(name.to_string());
        }
        self.values.insert(name.to_string(), value);
    }
}

/// Resolve every declared input of `schema` for `node`.
///
/// Bound extra inputs are included when the schema accepts additional inputs. Unbound inputs
/// fall back to the schema default, then to a same-named declared chain input, and are
/// omitted when optional.
pub fn resolve(
    node: &NodeDefinition,
    schema: &ActionSchema,
    chain_inputs: &ChainInputs,
    completed_outputs: &NodeOutputs,
) -> Result<ResolvedInputs, ResolutionError> {
    let mut resolved = ResolvedInputs::default();

    for (name, spec) in &schema.inputs {
        if let Some((value, secret)) = resolve_field(node, name, spec, chain_inputs, completed_outputs)? {
            resolved.insert(name, value, secret);
        }
    }

    if schema.additional_inputs {
        let untyped = FieldSpec::default();
        for name in node.input_bindings.keys() {
            if schema.inputs.contains_key(name) {
                continue;
            }
            if let Some((value, secret)) = resolve_field(node, name, &untyped, chain_inputs, completed_outputs)? {
                resolved.insert(name, value, secret);
            }
        }
    }

    Ok(resolved)
}

/// Where a required value was expected to come from when it turned out absent.
enum MissingSource<'a> {
    ChainInput(&'a str),
    Upstream { source_node: &'a str, field: &'a str },
}

fn resolve_field(
    node: &NodeDefinition,
    name: &str,
    spec: &FieldSpec,
    chain_inputs: &ChainInputs,
    completed_outputs: &NodeOutputs,
) -> Result<Option<(JsonValue, bool)>, ResolutionError> {
    let mut secret = spec.secret;
    let mut missing_source: Option<MissingSource<'_>> = None;

    let candidate = match node.input_bindings.get(name) {
        Some(InputBinding::Literal { literal }) => Some(literal.clone()),
        Some(InputBinding::ChainInput { input }) => {
            secret |= chain_inputs.is_secret(input);
            match chain_inputs.get(input).filter(|value| !value.is_null()) {
                Some(value) => Some(value.clone()),
                None => {
                    missing_source = Some(MissingSource::ChainInput(input));
                    spec.default.clone()
                }
            }
        }
        Some(InputBinding::NodeOutput { node: source_node, field }) => {
            let value = completed_outputs
                .get(source_node)
                .and_then(|outputs| lookup_output(outputs, field))
                .ok_or_else(|| ResolutionError::UpstreamOutputMissing {
                    node_id: node.id.clone(),
                    input: name.to_string(),
                    source_node: source_node.clone(),
                    field: field.clone(),
                })?;
            if value.is_null() {
                missing_source = Some(MissingSource::Upstream { source_node, field });
            }
            Some(value.clone())
        }
        None => match &spec.default {
            Some(default) => Some(default.clone()),
            None if chain_inputs.is_declared(name) => {
                secret |= chain_inputs.is_secret(name);
                match chain_inputs.get(name) {
                    Some(value) => Some(value.clone()),
                    None => {
                        missing_source = Some(MissingSource::ChainInput(name));
                        None
                    }
                }
            }
            None => None,
        },
    };

    let candidate = candidate.filter(|value| !value.is_null() || spec.field_type == FieldType::Any);
    let Some(candidate) = candidate else {
        if !spec.required {
            return Ok(None);
        }
        return Err(match missing_source {
            Some(MissingSource::ChainInput(chain_input)) => ResolutionError::MissingChainInput {
                node_id: node.id.clone(),
                input: name.to_string(),
                chain_input: chain_input.to_string(),
            },
            Some(MissingSource::Upstream { source_node, field }) => ResolutionError::UpstreamOutputMissing {
                node_id: node.id.clone(),
                input: name.to_string(),
                source_node: source_node.to_string(),
                field: field.to_string(),
            },
            None => ResolutionError::MissingRequiredInput {
                node_id: node.id.clone(),
                input: name.to_string(),
            },
        });
    };

    let found = json_type_name(&candidate);
    let value = coerce(candidate, spec.field_type).ok_or_else(|| ResolutionError::TypeMismatch {
        node_id: node.id.clone(),
        input: name.to_string(),
        expected: spec.field_type,
        found: found.to_string(),
    })?;

    if let Some(validation) = &spec.validate {
        validate_candidate_value(&value, validation).map_err(|message| ResolutionError::ValidationFailed {
            node_id: node.id.clone(),
            input: name.to_string(),
            message,
        })?;
    }

    Ok(Some((value, secret)))
}

/// Convert a value to the declared type when the conversion is unambiguous.
///
/// Returns `None` for irreconcilable combinations such as an object where a number is expected.
pub fn coerce(value: JsonValue, field_type: FieldType) -> Option<JsonValue> {
    if field_type.matches(&value) {
        return Some(value);
    }
    match (field_type, value) {
        (FieldType::String, JsonValue::Number(number)) => Some(JsonValue::String(number.to_string())),
        (FieldType::String, JsonValue::Bool(flag)) => Some(JsonValue::String(flag.to_string())),
        (FieldType::Number, JsonValue::String(text)) => parse_number(&text),
        (FieldType::Integer, JsonValue::String(text)) => text.trim().parse::<i64>().ok().map(JsonValue::from),
        (FieldType::Boolean, JsonValue::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Some(JsonValue::Bool(true)),
            "false" => Some(JsonValue::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<JsonValue> {
    let trimmed = text.trim();
    if let Ok(integer) = trimmed.parse::<i64>() {
        return Some(JsonValue::from(integer));
    }
    trimmed.parse::<f64>().ok().and_then(Number::from_f64).map(JsonValue::Number)
}

/// Look up an output field, where `field` may continue into the value with dotted segments.
pub fn lookup_output<'a>(outputs: &'a JsonMap<String, JsonValue>, field: &str) -> Option<&'a JsonValue> {
    match field.split_once('.') {
        Some((name, rest)) => outputs.get(name).and_then(|value| select_path(value, rest)),
        None => outputs.get(field),
    }
}

/// Navigate a dotted path through objects (by key) and arrays (by index).
///
/// An empty path selects the value itself.
pub fn select_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

pub(crate) fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainfury_types::FieldValidation;
    use serde_json::json;

    fn node_with(bindings: Vec<(&str, InputBinding)>) -> NodeDefinition {
        let mut node = NodeDefinition {
            id: "target".into(),
            action_type: "echo".into(),
            ..Default::default()
        };
        for (name, binding) in bindings {
            node.input_bindings.insert(name.to_string(), binding);
        }
        node
    }

    fn outputs(entries: Vec<(&str, JsonValue)>) -> NodeOutputs {
        entries
            .into_iter()
            .map(|(node_id, value)| (node_id.to_string(), value.as_object().cloned().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn resolves_each_binding_kind() {
        let schema = ActionSchema::new("test")
            .input("count", FieldSpec::required(FieldType::Integer))
            .input("topic", FieldSpec::required(FieldType::String))
            .input("text", FieldSpec::required(FieldType::String));
        let node = node_with(vec![
            ("count", InputBinding::literal(3)),
            ("topic", InputBinding::input("topic")),
            ("text", InputBinding::node_output("fetch", "body.items.1")),
        ]);
        let chain = ChainDefinition::default();
        let inputs = ChainInputs::new(&chain, json!({"topic": "rust"}).as_object().cloned().unwrap_or_default());
        let completed = outputs(vec![("fetch", json!({"body": {"items": ["a", "b"]}}))]);

        let resolved = resolve(&node, &schema, &inputs, &completed).expect("resolved");
        assert_eq!(resolved.values(), json!({"count": 3, "topic": "rust", "text": "b"}).as_object().expect("object"));
    }

    #[test]
    fn coerces_numeric_text_and_booleans() {
        assert_eq!(coerce(json!("42"), FieldType::Number), Some(json!(42)));
        assert_eq!(coerce(json!(" 2.5 "), FieldType::Number), Some(json!(2.5)));
        assert_eq!(coerce(json!("TRUE"), FieldType::Boolean), Some(json!(true)));
        assert_eq!(coerce(json!(7), FieldType::String), Some(json!("7")));
        assert_eq!(coerce(json!({"a": 1}), FieldType::Number), None);
        assert_eq!(coerce(json!("2.5"), FieldType::Integer), None);
    }

    #[test]
    fn type_mismatch_is_reported_not_coerced() {
        let schema = ActionSchema::new("test").input("count", FieldSpec::required(FieldType::Number));
        let node = node_with(vec![("count", InputBinding::literal(json!(["x"])))]);
        let error = resolve(&node, &schema, &ChainInputs::default(), &NodeOutputs::new()).expect_err("mismatch");
        assert_eq!(
            error,
            ResolutionError::TypeMismatch {
                node_id: "target".into(),
                input: "count".into(),
                expected: FieldType::Number,
                found: "array".into(),
            }
        );
    }

    #[test]
    fn missing_upstream_output_is_an_error() {
        let schema = ActionSchema::new("test").input("text", FieldSpec::optional(FieldType::String));
        let node = node_with(vec![("text", InputBinding::node_output("fetch", "missing"))]);
        let completed = outputs(vec![("fetch", json!({"body": "x"}))]);
        let error = resolve(&node, &schema, &ChainInputs::default(), &completed).expect_err("missing");
        assert!(matches!(error, ResolutionError::UpstreamOutputMissing { source_node, .. } if source_node == "fetch"));
    }

    #[test]
    fn null_upstream_value_for_required_input_names_the_source() {
        let schema = ActionSchema::new("test").input("text", FieldSpec::required(FieldType::String));
        let node = node_with(vec![("text", InputBinding::node_output("fetch", "body"))]);
        let completed = outputs(vec![("fetch", json!({"body": null}))]);
        let error = resolve(&node, &schema, &ChainInputs::default(), &completed).expect_err("null upstream");
        assert_eq!(
            error,
            ResolutionError::UpstreamOutputMissing {
                node_id: "target".into(),
                input: "text".into(),
                source_node: "fetch".into(),
                field: "body".into(),
            }
        );

        let optional = ActionSchema::new("test").input("text", FieldSpec::optional(FieldType::String));
        let resolved = resolve(&node, &optional, &ChainInputs::default(), &completed).expect("optional");
        assert!(resolved.get("text").is_none());
    }

    #[test]
    fn missing_required_chain_input_names_the_input() {
        let schema = ActionSchema::new("test").input("topic", FieldSpec::required(FieldType::String));
        let node = node_with(vec![("topic", InputBinding::input("subject"))]);
        let error = resolve(&node, &schema, &ChainInputs::default(), &NodeOutputs::new()).expect_err("missing");
        assert!(matches!(error, ResolutionError::MissingChainInput { chain_input, .. } if chain_input == "subject"));
    }

    #[test]
    fn unbound_inputs_fall_back_to_defaults_then_declared_chain_inputs() {
        let schema = ActionSchema::new("test")
            .input("limit", FieldSpec::optional(FieldType::Integer).with_default(10))
            .input("api_key", FieldSpec::required(FieldType::String))
            .input("note", FieldSpec::optional(FieldType::String));
        let mut chain = ChainDefinition::default();
        chain.inputs.insert("api_key".into(), FieldSpec::required(FieldType::String).secret());
        let inputs = ChainInputs::new(&chain, json!({"api_key": "sk-test"}).as_object().cloned().unwrap_or_default());

        let resolved = resolve(&node_with(Vec::new()), &schema, &inputs, &NodeOutputs::new()).expect("resolved");
        assert_eq!(resolved.get("limit"), Some(&json!(10)));
        assert_eq!(resolved.get("api_key"), Some(&json!("sk-test")));
        assert!(resolved.get("note").is_none());
        assert_eq!(resolved.snapshot()["api_key"], json!(REDACTED));
    }

    #[test]
    fn unbound_required_input_without_source_fails() {
        let schema = ActionSchema::new("test").input("prompt", FieldSpec::required(FieldType::String));
        let error = resolve(&node_with(Vec::new()), &schema, &ChainInputs::default(), &NodeOutputs::new()).expect_err("missing");
        assert!(matches!(error, ResolutionError::MissingRequiredInput { .. }));
    }

    #[test]
    fn validation_rules_apply_after_coercion() {
        let schema = ActionSchema::new("test").input(
            "mode",
            FieldSpec::required(FieldType::String).with_validation(FieldValidation {
                allowed_values: vec![json!("fast"), json!("slow")],
                ..Default::default()
            }),
        );
        let node = node_with(vec![("mode", InputBinding::literal("medium"))]);
        let error = resolve(&node, &schema, &ChainInputs::default(), &NodeOutputs::new()).expect_err("invalid");
        assert!(matches!(error, ResolutionError::ValidationFailed { .. }));
    }

    #[test]
    fn extra_bindings_require_additional_inputs() {
        let node = node_with(vec![("extra", InputBinding::literal(1))]);
        let strict = ActionSchema::new("strict");
        let open = ActionSchema::new("open").with_additional_inputs();

        let resolved = resolve(&node, &strict, &ChainInputs::default(), &NodeOutputs::new()).expect("strict");
        assert!(resolved.values().is_empty());
        let resolved = resolve(&node, &open, &ChainInputs::default(), &NodeOutputs::new()).expect("open");
        assert_eq!(resolved.get("extra"), Some(&json!(1)));
    }

    #[test]
    fn chain_input_defaults_are_applied() {
        let mut chain = ChainDefinition::default();
        chain.inputs.insert("lang".into(), FieldSpec::optional(FieldType::String).with_default("en"));
        chain.inputs.insert("topic".into(), FieldSpec::required(FieldType::String));
        let inputs = ChainInputs::new(&chain, JsonMap::new());
        assert_eq!(inputs.get("lang"), Some(&json!("en")));
        assert_eq!(inputs.missing_required(), vec!["topic"]);
    }

    #[test]
    fn select_path_walks_objects_and_arrays() {
        let value = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(select_path(&value, "choices.0.message.content"), Some(&json!("hi")));
        assert_eq!(select_path(&value, "choices.3"), None);
        assert_eq!(select_path(&value, ""), Some(&value));
    }
}
