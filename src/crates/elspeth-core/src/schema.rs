//! Row schemas, validation, and compatibility checking
//!
//! Schemas serve two masters. At the edges of the system they are trust
//! boundaries: sources validate every incoming row in strict mode and
//! quarantine what does not fit. Inside the graph they are compile-time
//! contracts: the DAG compiler checks that every edge's producer emits what
//! its consumer requires, and after that internal stages trust their
//! inputs completely - a type mismatch mid-pipeline is an upstream bug,
//! not a routable condition.
//!
//! Compatibility rules on an edge `(A, B)`: every required field of `B`'s
//! input schema with no default must be produced by `A`'s output schema
//! with a compatible type - exact match, `int → float` widening, `T`
//! accepted where `Optional<T>` is declared, and `Any` on either side.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type of a schema field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Float,
    Bool,
    String,
    Object,
    Array,
    /// Accepts (and may produce) anything.
    Any,
    /// `null` or the inner type.
    Optional(Box<FieldType>),
}

impl FieldType {
    /// Whether a value produced as `self` satisfies a consumer declaring
    /// `required`.
    #[must_use]
    pub fn compatible_with(&self, required: &FieldType) -> bool {
        match (self, required) {
            (FieldType::Any, _) | (_, FieldType::Any) => true,
            (FieldType::Optional(a), FieldType::Optional(b)) => a.compatible_with(b),
            // A maybe-null producer cannot feed a non-null consumer.
            (FieldType::Optional(_), _) => false,
            (a, FieldType::Optional(b)) => a.compatible_with(b),
            (FieldType::Int, FieldType::Float) => true,
            (a, b) => a == b,
        }
    }

    /// Whether `value` inhabits this type.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Int => value.as_i64().is_some() || value.as_u64().is_some(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::String => value.is_string(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
            FieldType::Optional(inner) => value.is_null() || inner.accepts(value),
        }
    }

    fn name(&self) -> String {
        match self {
            FieldType::Int => "int".to_string(),
            FieldType::Float => "float".to_string(),
            FieldType::Bool => "bool".to_string(),
            FieldType::String => "string".to_string(),
            FieldType::Object => "object".to_string(),
            FieldType::Array => "array".to_string(),
            FieldType::Any => "any".to_string(),
            FieldType::Optional(inner) => format!("optional<{}>", inner.name()),
        }
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Default applied by the consumer when the field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    #[must_use]
    pub fn required(ty: FieldType) -> Self {
        Self {
            ty,
            required: true,
            default: None,
        }
    }

    #[must_use]
    pub fn optional(ty: FieldType) -> Self {
        Self {
            ty,
            required: false,
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(ty: FieldType, default: Value) -> Self {
        Self {
            ty,
            required: true,
            default: Some(default),
        }
    }
}

/// A row schema: named, typed fields.
///
/// In `strict` mode unknown fields are rejected; otherwise they pass
/// through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub strict: bool,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field declaration.
    #[must_use]
    pub fn field(mut self, name: &str, spec: FieldSpec) -> Self {
        self.fields.insert(name.to_string(), spec);
        self
    }

    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Validates one row. Returns the list of violations, empty when the
    /// row conforms.
    #[must_use]
    pub fn validate(&self, row: &Value) -> Vec<String> {
        let mut issues = Vec::new();
        let Some(object) = row.as_object() else {
            return vec!["row is not an object".to_string()];
        };
        for (name, spec) in &self.fields {
            match object.get(name) {
                Some(value) => {
                    if !spec.ty.accepts(value) {
                        issues.push(format!(
                            "field '{name}' expected {} but got {value}",
                            spec.ty.name()
                        ));
                    }
                }
                None => {
                    if spec.required && spec.default.is_none() {
                        issues.push(format!("missing required field '{name}'"));
                    }
                }
            }
        }
        if self.strict {
            for name in object.keys() {
                if !self.fields.contains_key(name) {
                    issues.push(format!("unexpected field '{name}'"));
                }
            }
        }
        issues
    }

    /// JSON form used for schema hashing in the audit record.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("schema serialization is infallible")
    }
}

/// Checks that `producer`'s output satisfies `consumer`'s input.
///
/// Returns the list of incompatibilities; empty means the edge is valid.
#[must_use]
pub fn check_compatibility(producer: &Schema, consumer: &Schema) -> Vec<String> {
    let mut issues = Vec::new();
    for (name, required_spec) in &consumer.fields {
        if !required_spec.required || required_spec.default.is_some() {
            continue;
        }
        match producer.fields.get(name) {
            None => issues.push(format!("required field '{name}' is not produced upstream")),
            Some(produced) => {
                if !produced.ty.compatible_with(&required_spec.ty) {
                    issues.push(format!(
                        "field '{name}': produced {} is not accepted as {}",
                        produced.ty.name(),
                        required_spec.ty.name()
                    ));
                }
            }
        }
    }
    issues
}
