//! Minimal JSON-schema subset used to validate type definitions and encoded metadata.
//!
//! Supports `type`, `enum`, `minimum`, `required` and `properties`. Keys without a property
//! schema are accepted as-is, matching JSON schema's default `additionalProperties`.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

/// JSON type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

/// Schema for a single property.
#[derive(Debug, Clone)]
pub struct Property {
    pub kind: ValueKind,
    pub description: &'static str,
    pub choices: Option<Vec<Value>>,
    pub minimum: Option<f64>,
}

/// Object schema: required keys plus per-key property schemas.
#[derive(Debug, Clone)]
pub struct Schema {
    pub title: String,
    pub description: String,
    pub required: Vec<String>,
    pub properties: BTreeMap<String, Property>,
}

// ========================================================== Property ===|

impl Property {
    pub fn new(kind: ValueKind, description: &'static str) -> Self {
        Self { kind, description, choices: None, minimum: None }
    }

    pub fn with_choices(mut self, choices: impl IntoIterator<Item = Value>) -> Self {
        self.choices = Some(choices.into_iter().collect());
        self
    }

    pub fn with_minimum(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    fn validate(&self, key: &str, value: &Value) -> Result<(), String> {
        let type_ok = match self.kind {
            ValueKind::String => value.is_string(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Number => value.is_number(),
            ValueKind::Boolean => value.is_boolean(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
            ValueKind::Any => true,
        };

        if !type_ok {
            return Err(format!("'{key}' must be of type {}, got {value}", self.kind.as_str()));
        }

        if let Some(choices) = &self.choices {
            if !choices.iter().any(|c| json_eq(c, value)) {
                let choices = Value::from(choices.clone());
                return Err(format!("'{key}' must be one of {choices}, got {value}"));
            }
        }

        if let (Some(min), Some(v)) = (self.minimum, value.as_f64()) {
            if v < min {
                return Err(format!("'{key}' must be >= {min}, got {v}"));
            }
        }

        Ok(())
    }

    fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("description".into(), self.description.into());
        if self.kind != ValueKind::Any {
            out.insert("type".into(), self.kind.as_str().into());
        }
        if let Some(choices) = &self.choices {
            out.insert("enum".into(), choices.clone().into());
        }
        if let Some(min) = self.minimum {
            out.insert("minimum".into(), min.into());
        }
        out.into()
    }
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

// ========================================================== Schema ===|

impl Schema {
    /// Validates an instance. Returns a human readable reason on the first violation.
    pub fn validate(&self, instance: &Map<String, Value>) -> Result<(), String> {
        for key in &self.required {
            if !instance.contains_key(key) {
                return Err(format!("missing required property '{key}'"));
            }
        }

        for (key, value) in instance {
            if let Some(prop) = self.properties.get(key) {
                prop.validate(key, value)?;
            }
        }

        Ok(())
    }

    /// Draft-07 representation, for tools on the other side of the wire.
    pub fn to_json(&self) -> Value {
        let properties: Map<String, Value> =
            self.properties.iter().map(|(k, p)| (k.clone(), p.to_json())).collect();

        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": self.title,
            "description": self.description,
            "type": "object",
            "required": self.required,
            "properties": properties,
        })
    }
}

/// Numeric-aware equality; `8` and `8.0` compare equal the way JSON schema `enum` treats them.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
