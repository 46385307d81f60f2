//! Field-level validation run by `Record::save` before any hook.

use crate::config::ValidationRule;
use crate::error::AppError;
use crate::orm::FieldDef;
use crate::sql::Row;
use regex::Regex;
use serde_json::Value;

/// Check record attributes against field rules. New records must carry every
/// required field; existing records are checked only for the attributes present.
pub fn validate_record(fields: &[FieldDef], data: &Row, is_new: bool) -> Result<(), AppError> {
    for field in fields {
        let value = data.get(&field.name);
        let missing = value.map(Value::is_null).unwrap_or(true);
        let required = field
            .validation
            .as_ref()
            .and_then(|r| r.required)
            .unwrap_or(false);
        if missing && required && (is_new || value.is_some()) {
            return Err(AppError::Validation(format!("{} is required", field.name)));
        }
        if let (Some(v), Some(rule)) = (value, &field.validation) {
            check(&field.name, v, rule)?;
        }
    }
    Ok(())
}

fn check(name: &str, v: &Value, rule: &ValidationRule) -> Result<(), AppError> {
    if v.is_null() {
        return Ok(());
    }
    if let Some(format) = &rule.format {
        check_format(name, v, format)?;
    }
    if let Some(s) = v.as_str() {
        let len = s.chars().count();
        if let Some(max) = rule.max_length {
            if len > max as usize {
                return Err(AppError::Validation(format!("{} must be at most {} characters", name, max)));
            }
        }
        if let Some(min) = rule.min_length {
            if len < min as usize {
                return Err(AppError::Validation(format!("{} must be at least {} characters", name, min)));
            }
        }
        if let Some(pattern) = &rule.pattern {
            let re = Regex::new(pattern)
                .map_err(|_| AppError::Validation(format!("invalid pattern for {}", name)))?;
            if !re.is_match(s) {
                return Err(AppError::Validation(format!("{} does not match required pattern", name)));
            }
        }
    }
    if let Some(allowed) = &rule.allowed {
        if !allowed.iter().any(|a| same_value(v, a)) {
            return Err(AppError::Validation(format!("{} is not an allowed value", name)));
        }
    }
    if let Some(n) = v.as_f64() {
        if rule.minimum.map(|min| n < min).unwrap_or(false) {
            return Err(AppError::Validation(format!("{} is below the minimum", name)));
        }
        if rule.maximum.map(|max| n > max).unwrap_or(false) {
            return Err(AppError::Validation(format!("{} is above the maximum", name)));
        }
    }
    Ok(())
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

fn check_format(name: &str, v: &Value, format: &str) -> Result<(), AppError> {
    let Some(s) = v.as_str() else {
        return Ok(());
    };
    let ok = match format.to_lowercase().as_str() {
        "email" => s.len() >= 3 && s.contains('@'),
        "uuid" => uuid::Uuid::parse_str(s).is_ok(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(AppError::Validation(format!("{} must be a valid {}", name, format)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::FieldType;
    use serde_json::json;

    fn fields() -> Vec<FieldDef> {
        vec![
            FieldDef::new("email", FieldType::String).validate(ValidationRule {
                required: Some(true),
                format: Some("email".into()),
                ..Default::default()
            }),
            FieldDef::new("age", FieldType::Integer).validate(ValidationRule {
                minimum: Some(0.0),
                ..Default::default()
            }),
        ]
    }

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn required_only_for_new_records() {
        assert!(validate_record(&fields(), &row(json!({"age": 3})), true).is_err());
        assert!(validate_record(&fields(), &row(json!({"age": 3})), false).is_ok());
    }

    #[test]
    fn rules_apply_to_present_values() {
        let err = validate_record(&fields(), &row(json!({"email": "nope"})), true).unwrap_err();
        assert_eq!(err.to_string(), "validation: email must be a valid email");
        assert!(validate_record(&fields(), &row(json!({"email": "a@b", "age": -1})), true).is_err());
        assert!(validate_record(&fields(), &row(json!({"email": "a@b", "age": 1})), true).is_ok());
    }
}
