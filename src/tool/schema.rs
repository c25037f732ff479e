//! Input schemas for tools
//!
//! A small data-shape language covering what tool inputs need: objects
//! with named fields, strings, numbers, booleans, arrays, and optional
//! values. Schemas render to JSON Schema for the model-facing tool
//! definitions, and input is validated against that rendering with
//! `jsonschema`.

use jsonschema::error::ValidationErrorKind;
use jsonschema::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Shape of a tool input value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schema {
    String,
    Number,
    Integer,
    Boolean,
    Array { items: Box<Schema> },
    Object { fields: Vec<Field> },
    Optional { inner: Box<Schema> },
    Any,
}

/// Named field of an object schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A single schema violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Location of the offending value, `/` for the root
    pub path: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl Field {
    pub fn new(name: &str, schema: Schema) -> Self {
        Self {
            name: name.to_string(),
            schema,
            description: None,
        }
    }

    /// Attach model-facing documentation
    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn is_required(&self) -> bool {
        !matches!(self.schema, Schema::Optional { .. })
    }
}

impl Schema {
    pub fn object(fields: impl IntoIterator<Item = Field>) -> Self {
        Schema::Object {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array {
            items: Box::new(items),
        }
    }

    /// Wrap this schema so that an absent or `null` value is accepted
    pub fn optional(self) -> Self {
        match self {
            Schema::Optional { .. } => self,
            other => Schema::Optional {
                inner: Box::new(other),
            },
        }
    }

    /// Validate a value, collecting every violation
    ///
    /// Compiles a fresh validator on each call; registered tools keep a
    /// compiled [`InputValidator`] instead.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<Violation>> {
        match InputValidator::compile(self) {
            Ok(validator) => validator.validate(value),
            Err(message) => Err(vec![Violation {
                path: "/".to_string(),
                message,
            }]),
        }
    }

    /// Render as a JSON Schema document
    pub fn to_json_schema(&self) -> Value {
        match self {
            Schema::String => json!({ "type": "string" }),
            Schema::Number => json!({ "type": "number" }),
            Schema::Integer => json!({ "type": "integer" }),
            Schema::Boolean => json!({ "type": "boolean" }),
            Schema::Any => json!({}),
            Schema::Optional { inner } => nullable(inner.to_json_schema()),
            Schema::Array { items } => json!({
                "type": "array",
                "items": items.to_json_schema(),
            }),
            Schema::Object { fields } => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in fields {
                    let mut prop = field.schema.to_json_schema();
                    if let (Some(desc), Some(obj)) = (&field.description, prop.as_object_mut()) {
                        obj.insert("description".to_string(), json!(desc));
                    }
                    properties.insert(field.name.clone(), prop);
                    if field.is_required() {
                        required.push(json!(field.name));
                    }
                }
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                })
            }
        }
    }
}

/// Compiled JSON Schema validator for one tool's input
pub struct InputValidator {
    validator: jsonschema::Validator,
}

impl fmt::Debug for InputValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputValidator").finish_non_exhaustive()
    }
}

impl InputValidator {
    /// Compile the rendered JSON Schema of `schema`
    pub fn compile(schema: &Schema) -> Result<Self, String> {
        let validator = jsonschema::Validator::new(&schema.to_json_schema())
            .map_err(|e| format!("invalid input schema: {}", e))?;
        Ok(Self { validator })
    }

    /// Validate a value, collecting every violation
    pub fn validate(&self, value: &Value) -> Result<(), Vec<Violation>> {
        if self.validator.is_valid(value) {
            return Ok(());
        }
        let violations = self
            .validator
            .iter_errors(value)
            .map(|error| Violation {
                path: violation_path(&error),
                message: error.to_string(),
            })
            .collect();
        Err(violations)
    }
}

// A missing property is reported against its parent object; point at the
// property itself.
fn violation_path(error: &ValidationError<'_>) -> String {
    let mut path = error.instance_path.to_string();
    if let ValidationErrorKind::Required { property } = &error.kind {
        if let Some(name) = property.as_str() {
            path.push('/');
            path.push_str(&name.replace('~', "~0").replace('/', "~1"));
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Let an optional value also be `null`
fn nullable(mut rendered: Value) -> Value {
    if let Some(obj) = rendered.as_object_mut() {
        if let Some(Value::String(ty)) = obj.get("type").cloned() {
            obj.insert("type".to_string(), json!([ty, "null"]));
        }
    }
    rendered
}
