//! Model definition validation: unique names, a single typed id field, sane serial flags.

use crate::config::ModelConfig;
use crate::error::ConfigError;
use std::collections::HashSet;

pub fn validate_models(models: &[ModelConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for m in models {
        if !names.insert(m.name.as_str()) {
            return Err(ConfigError::Duplicate(m.name.clone()));
        }
        validate_model(m)?;
    }
    Ok(())
}

pub fn validate_model(model: &ModelConfig) -> Result<(), ConfigError> {
    if model.name.trim().is_empty() {
        return Err(ConfigError::Validation("model name must not be empty".into()));
    }
    let mut field_names = HashSet::new();
    let mut columns = HashSet::new();
    for f in &model.fields {
        if !field_names.insert(f.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("{}.{}", model.name, f.name)));
        }
        let column = f.column.as_deref().unwrap_or(&f.name);
        if !columns.insert(column) {
            return Err(ConfigError::Duplicate(format!("{} column {}", model.name, column)));
        }
        if f.serial && !f.type_.is_integer() {
            return Err(ConfigError::Validation(format!(
                "{}.{}: serial requires an integer type",
                model.name, f.name
            )));
        }
    }
    if !field_names.contains(model.id_field.as_str()) {
        return Err(ConfigError::InvalidIdField {
            model: model.name.clone(),
            field: model.id_field.clone(),
        });
    }
    Ok(())
}
