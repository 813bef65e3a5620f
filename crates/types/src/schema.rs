//! Typed field descriptors shared by action schemas and chain input declarations.

pub mod validation;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub use validation::{compiled_pattern, validate_candidate_value};

/// Primitive type declared for an input or output field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    /// Any JSON value, including null.
    #[default]
    Any,
}

impl FieldType {
    /// Returns true when the value already has this type, without any coercion.
    pub fn matches(&self, value: &JsonValue) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|number| number.fract() == 0.0),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Describes one named field: its type, whether it must be present, and how it is validated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    /// Declared primitive type.
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    /// Whether a value must be supplied.
    #[serde(default)]
    pub required: bool,
    /// Descriptive copy for catalogues and error messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Value used when the field is left unbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    /// Secret values are redacted from trace snapshots and persisted runs.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secret: bool,
    /// Declarative validation rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<FieldValidation>,
}

impl FieldSpec {
    /// A field that must be supplied.
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            ..Default::default()
        }
    }

    /// A field that may be omitted.
    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            ..Default::default()
        }
    }

    pub fn with_default(mut self, value: impl Into<JsonValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_validation(mut self, validation: FieldValidation) -> Self {
        self.validate = Some(validation);
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }
}

/// Declarative validation settings attached to a field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FieldValidation {
    /// Enumerated set of allowed values, if constrained.
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<JsonValue>,
    /// Regular expression the value must match (strings only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Minimum length for string values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    /// Maximum length for string values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

/// Declared input/output contract of a registered action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActionSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form capability tags (for example `text_to_text`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Named input fields in declaration order.
    #[serde(default)]
    pub inputs: IndexMap<String, FieldSpec>,
    /// Named output fields in declaration order.
    #[serde(default)]
    pub outputs: IndexMap<String, FieldSpec>,
    /// Accept bound inputs that are not declared in `inputs`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub additional_inputs: bool,
    /// Default invocation timeout for this action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ActionSchema {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn input(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.inputs.insert(name.into(), spec);
        self
    }

    pub fn output(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.outputs.insert(name.into(), spec);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_additional_inputs(mut self) -> Self {
        self.additional_inputs = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Input names that are marked required, in declaration order.
    pub fn required_inputs(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.inputs.iter().filter(|(_, spec)| spec.required)
    }
}
