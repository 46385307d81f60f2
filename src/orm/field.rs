//! Field metadata: attribute name, column name, type, default, nullability, serial flag.

use crate::config::ValidationRule;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Text,
    Integer,
    Serial,
    BigInt,
    Float,
    Boolean,
    Date,
    DateTime,
    Json,
    Uuid,
}

impl FieldType {
    /// PostgreSQL type used for DDL and parameter casts.
    pub fn pg_type(&self) -> &'static str {
        match self {
            FieldType::String => "varchar",
            FieldType::Text => "text",
            FieldType::Integer | FieldType::Serial => "integer",
            FieldType::BigInt => "bigint",
            FieldType::Float => "double precision",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "timestamptz",
            FieldType::Json => "jsonb",
            FieldType::Uuid => "uuid",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Serial | FieldType::BigInt)
    }
}

#[derive(Clone, Debug)]
pub struct FieldDef {
    /// Attribute name used on records and in builder calls.
    pub name: String,
    /// Underlying column name.
    pub column: String,
    pub field_type: FieldType,
    pub default: Option<Value>,
    pub nullable: bool,
    pub serial: bool,
    pub validation: Option<ValidationRule>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        FieldDef {
            column: name.clone(),
            name,
            serial: field_type == FieldType::Serial,
            field_type,
            default: None,
            nullable: true,
            validation: None,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn validate(mut self, rule: ValidationRule) -> Self {
        self.validation = Some(rule);
        self
    }

    /// Coerce an incoming value to this field's type. Values that cannot be
    /// coerced are passed through unchanged; the backend decides.
    pub fn coerce(&self, value: Value) -> Value {
        match (&self.field_type, value) {
            (_, Value::Null) => Value::Null,
            (t, Value::String(s)) if t.is_integer() => match s.trim().parse::<i64>() {
                Ok(n) => Value::Number(n.into()),
                Err(_) => Value::String(s),
            },
            (FieldType::Float, Value::String(s)) => match s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
            {
                Some(n) => Value::Number(n),
                None => Value::String(s),
            },
            (FieldType::Boolean, Value::String(s)) => match s.to_lowercase().as_str() {
                "true" | "1" | "t" | "yes" | "on" => Value::Bool(true),
                "false" | "0" | "f" | "no" | "off" => Value::Bool(false),
                _ => Value::String(s),
            },
            (FieldType::Boolean, Value::Number(n)) => Value::Bool(n.as_i64().map(|i| i != 0).unwrap_or(true)),
            (FieldType::DateTime, Value::String(s)) => match DateTime::parse_from_rfc3339(&s) {
                Ok(d) => Value::String(d.with_timezone(&Utc).to_rfc3339()),
                Err(_) => Value::String(s),
            },
            (FieldType::Date, Value::String(s)) => match NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
                Ok(d) => Value::String(d.format("%Y-%m-%d").to_string()),
                Err(_) => Value::String(s),
            },
            (FieldType::String | FieldType::Text, Value::Number(n)) => Value::String(n.to_string()),
            (_, v) => v,
        }
    }
}
