//! Raw config types: model definitions as JSON, field validation rules and runtime settings.

use crate::orm::{FieldDef, FieldType, IdStrategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    /// Column name when it differs from the attribute name.
    #[serde(default)]
    pub column: Option<String>,
    #[serde(rename = "type")]
    pub type_: FieldType,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub serial: bool,
    #[serde(default)]
    pub validation: Option<ValidationRule>,
}

fn default_true() -> bool {
    true
}

impl FieldConfig {
    pub fn to_field(&self) -> FieldDef {
        let mut f = FieldDef::new(&self.name, self.type_);
        if let Some(col) = &self.column {
            f.column = col.clone();
        }
        f.default = self.default.clone();
        f.nullable = self.nullable;
        f.serial = self.serial || self.type_ == FieldType::Serial;
        f.validation = self.validation.clone();
        f
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Table name; defaults to the underscored model name.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default)]
    pub id_strategy: Option<IdStrategy>,
}

fn default_id_field() -> String {
    "id".into()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
}

/// Runtime settings. See `Settings::from_env` for the variables read.
#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: Option<String>,
    pub schema: String,
    /// Log rendered query text at debug level.
    pub db_debug: bool,
    pub bind: String,
    pub charset: String,
    /// CORS before-all filter is registered only when set.
    pub cors_origin: Option<String>,
    pub session_cookie: String,
    pub session_max_age: Duration,
    /// Identity cache entry lifetime; `None` keeps entries until cleared.
    pub cache_ttl: Option<Duration>,
    pub body_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: None,
            schema: "public".into(),
            db_debug: false,
            bind: "0.0.0.0:3000".into(),
            charset: "utf-8".into(),
            cors_origin: None,
            session_cookie: "railcar.sid".into(),
            session_max_age: Duration::from_secs(86_400),
            cache_ttl: None,
            body_limit: 1024 * 1024,
        }
    }
}
