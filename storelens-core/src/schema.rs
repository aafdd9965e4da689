// src/schema.rs
// Collection validators ($jsonSchema subset)

use regex::Regex;
use serde_json::{Map, Value};

use crate::dates;
use crate::error::{Result, StoreLensError};

/// Accepted JSON value kinds, spelled like `bsonType` / `type`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaType {
    String,
    /// Any number (`double`, `decimal`, `number`)
    Number,
    /// Integral number (`int`, `long`, `integer`)
    Integer,
    Boolean,
    /// Timestamp string
    Date,
    Object,
    Array,
    Null,
}

impl SchemaType {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "string" => Some(Self::String),
            "number" | "double" | "decimal" => Some(Self::Number),
            "int" | "long" | "integer" => Some(Self::Integer),
            "bool" | "boolean" => Some(Self::Boolean),
            "date" => Some(Self::Date),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "null" => Some(Self::Null),
            _ => None,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => value.is_i64() || value.is_u64(),
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Date => value.as_str().map(dates::looks_like_timestamp).unwrap_or(false),
            SchemaType::Object => value.is_object(),
            SchemaType::Array => value.is_array(),
            SchemaType::Null => value.is_null(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "int",
            SchemaType::Boolean => "bool",
            SchemaType::Date => "date",
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::Null => "null",
        }
    }
}

/// Compiled property schema
#[derive(Clone, Debug, Default)]
pub struct PropertySchema {
    /// Any of these types; empty accepts every type
    pub types: Vec<SchemaType>,
    pub enum_values: Option<Vec<Value>>,
    pub pattern: Option<Regex>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    /// Nested object schema
    pub object: Option<Box<CompiledSchema>>,
    /// Schema every array element must satisfy
    pub items: Option<Box<PropertySchema>>,
}

#[derive(Clone, Debug, Default)]
pub struct CompiledSchema {
    required: Vec<String>,
    properties: Vec<(String, PropertySchema)>,
}

impl CompiledSchema {
    /// Compile a validator; accepts `{"$jsonSchema": {...}}` or the bare schema
    pub fn from_value(schema: &Value) -> Result<Self> {
        let obj = schema.as_object().ok_or_else(|| {
            StoreLensError::SchemaError("Schema must be a JSON object".to_string())
        })?;
        if let Some(inner) = obj.get("$jsonSchema") {
            return Self::from_value(inner);
        }

        for key in ["bsonType", "type"] {
            if let Some(kind) = obj.get(key) {
                if kind.as_str() != Some("object") {
                    return Err(StoreLensError::SchemaError(
                        "Only object schemas are supported at the top level".to_string(),
                    ));
                }
            }
        }
        Self::compile_object(obj, "")
    }

    fn compile_object(obj: &Map<String, Value>, prefix: &str) -> Result<Self> {
        let mut required = Vec::new();
        if let Some(required_value) = obj.get("required") {
            let arr = required_value.as_array().ok_or_else(|| {
                StoreLensError::SchemaError("required must be an array of field names".to_string())
            })?;
            for entry in arr {
                let field = entry.as_str().ok_or_else(|| {
                    StoreLensError::SchemaError("required entries must be strings".to_string())
                })?;
                required.push(field.to_string());
            }
        }

        let mut properties = Vec::new();
        if let Some(props) = obj.get("properties") {
            let props_obj = props.as_object().ok_or_else(|| {
                StoreLensError::SchemaError("properties must be an object".to_string())
            })?;
            for (field, spec) in props_obj {
                let path = join_path(prefix, field);
                properties.push((field.clone(), PropertySchema::compile(spec, &path)?));
            }
        }

        Ok(Self {
            required,
            properties,
        })
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Check a document; violations are `ConstraintViolation`
    pub fn validate(&self, value: &Value) -> Result<()> {
        self.validate_at(value, "").map_err(|reason| {
            StoreLensError::ConstraintViolation(format!("Document failed validation: {}", reason))
        })
    }

    fn validate_at(&self, value: &Value, prefix: &str) -> std::result::Result<(), String> {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("'{}' must be an object", prefix))?;

        for field in &self.required {
            if !obj.contains_key(field) {
                return Err(format!("missing required field '{}'", join_path(prefix, field)));
            }
        }

        for (field, property) in &self.properties {
            if let Some(field_value) = obj.get(field) {
                property.validate_at(field_value, &join_path(prefix, field))?;
            }
        }
        Ok(())
    }
}

impl PropertySchema {
    fn compile(spec: &Value, path: &str) -> Result<Self> {
        let spec = spec.as_object().ok_or_else(|| {
            StoreLensError::SchemaError(format!("Property '{}' schema must be an object", path))
        })?;
        let mut property = PropertySchema::default();

        for key in ["bsonType", "type"] {
            let Some(kind) = spec.get(key) else {
                continue;
            };
            let names: Vec<&Value> = match kind {
                Value::Array(names) => names.iter().collect(),
                single => vec![single],
            };
            for name in names {
                let name = name.as_str().ok_or_else(|| {
                    StoreLensError::SchemaError(format!("Property '{}' {} must be a string", path, key))
                })?;
                let parsed = SchemaType::from_str(name).ok_or_else(|| {
                    StoreLensError::SchemaError(format!(
                        "Unsupported type '{}' for field '{}'",
                        name, path
                    ))
                })?;
                property.types.push(parsed);
            }
        }

        if let Some(enum_value) = spec.get("enum") {
            let enum_arr = enum_value.as_array().ok_or_else(|| {
                StoreLensError::SchemaError(format!("Property '{}' enum must be an array", path))
            })?;
            property.enum_values = Some(enum_arr.clone());
        }

        if let Some(pattern_value) = spec.get("pattern") {
            let pattern_str = pattern_value.as_str().ok_or_else(|| {
                StoreLensError::SchemaError(format!("Property '{}' pattern must be a string", path))
            })?;
            let regex = Regex::new(pattern_str).map_err(|e| {
                StoreLensError::SchemaError(format!(
                    "Property '{}' has invalid regex pattern: {}",
                    path, e
                ))
            })?;
            property.pattern = Some(regex);
        }

        property.minimum = number_constraint(spec, "minimum", path)?;
        property.maximum = number_constraint(spec, "maximum", path)?;
        property.min_items = count_constraint(spec, "minItems", path)?;
        property.max_items = count_constraint(spec, "maxItems", path)?;

        if spec.contains_key("properties") || spec.contains_key("required") {
            property.object = Some(Box::new(CompiledSchema::compile_object(spec, path)?));
        }
        if let Some(items) = spec.get("items") {
            let item_path = format!("{}[]", path);
            property.items = Some(Box::new(PropertySchema::compile(items, &item_path)?));
        }

        Ok(property)
    }

    fn validate_at(&self, value: &Value, path: &str) -> std::result::Result<(), String> {
        if !self.types.is_empty() && !self.types.iter().any(|t| t.matches(value)) {
            let expected: Vec<&str> = self.types.iter().map(SchemaType::as_str).collect();
            return Err(format!("field '{}' expected type {}", path, expected.join(" | ")));
        }

        if let Some(enum_values) = &self.enum_values {
            if !enum_values.contains(value) {
                return Err(format!(
                    "field '{}' value {} not in allowed enum values",
                    path, value
                ));
            }
        }

        if let (Some(pattern), Some(s)) = (&self.pattern, value.as_str()) {
            if !pattern.is_match(s) {
                return Err(format!("field '{}' does not match required pattern", path));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum {
                if n < min {
                    return Err(format!("field '{}' is below minimum {}", path, min));
                }
            }
            if let Some(max) = self.maximum {
                if n > max {
                    return Err(format!("field '{}' is above maximum {}", path, max));
                }
            }
        }

        if let Some(arr) = value.as_array() {
            if let Some(min) = self.min_items {
                if arr.len() < min {
                    return Err(format!(
                        "field '{}' has {} items, minimum required is {}",
                        path,
                        arr.len(),
                        min
                    ));
                }
            }
            if let Some(max) = self.max_items {
                if arr.len() > max {
                    return Err(format!(
                        "field '{}' has {} items, maximum allowed is {}",
                        path,
                        arr.len(),
                        max
                    ));
                }
            }
            if let Some(items) = &self.items {
                for (i, item) in arr.iter().enumerate() {
                    items.validate_at(item, &format!("{}.{}", path, i))?;
                }
            }
        }

        if let (Some(object), true) = (&self.object, value.is_object()) {
            object.validate_at(value, path)?;
        }
        Ok(())
    }
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", prefix, field)
    }
}

fn number_constraint(spec: &Map<String, Value>, key: &str, path: &str) -> Result<Option<f64>> {
    spec.get(key)
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                StoreLensError::SchemaError(format!("Property '{}' {} must be a number", path, key))
            })
        })
        .transpose()
}

fn count_constraint(spec: &Map<String, Value>, key: &str, path: &str) -> Result<Option<usize>> {
    spec.get(key)
        .map(|v| {
            v.as_u64().map(|n| n as usize).ok_or_else(|| {
                StoreLensError::SchemaError(format!(
                    "Property '{}' {} must be a non-negative integer",
                    path, key
                ))
            })
        })
        .transpose()
}
