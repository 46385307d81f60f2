//! Convert serde_json::Value to types that sqlx can bind.

use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::Database;

/// A value that can be bound to a PostgreSQL query. Converts from serde_json::Value.
#[derive(Clone, Debug)]
pub enum PgBindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Json(Value),
}

impl PgBindValue {
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => PgBindValue::Null,
            Value::Bool(b) => PgBindValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PgBindValue::I64(i)
                } else {
                    PgBindValue::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            // uuid-shaped text stays text; uuid columns get an explicit cast
            Value::String(s) => PgBindValue::String(s.clone()),
            Value::Array(_) | Value::Object(_) => PgBindValue::Json(v.clone()),
        }
    }
}

impl<'q> Encode<'q, Postgres> for PgBindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Ok(match self {
            PgBindValue::Null => <Option<i32> as Encode<Postgres>>::encode_by_ref(&None, buf)?,
            PgBindValue::Bool(b) => <bool as Encode<Postgres>>::encode_by_ref(b, buf)?,
            PgBindValue::I64(n) => <i64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::F64(n) => <f64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::String(s) => {
                let s_ref: &str = s.as_str();
                <&str as Encode<Postgres>>::encode_by_ref(&s_ref, buf)?
            }
            PgBindValue::Json(v) => <serde_json::Value as Encode<Postgres>>::encode_by_ref(v, buf)?,
        })
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(match self {
            PgBindValue::Null | PgBindValue::String(_) => PgTypeInfo::with_name("TEXT"),
            PgBindValue::Bool(_) => PgTypeInfo::with_name("BOOL"),
            PgBindValue::I64(_) => PgTypeInfo::with_name("INT8"),
            PgBindValue::F64(_) => PgTypeInfo::with_name("FLOAT8"),
            PgBindValue::Json(_) => PgTypeInfo::with_name("JSONB"),
        })
    }
}

impl sqlx::Type<Postgres> for PgBindValue {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("TEXT")
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_split_into_int_and_float() {
        assert!(matches!(PgBindValue::from_json(&json!(3)), PgBindValue::I64(3)));
        assert!(matches!(PgBindValue::from_json(&json!(1.5)), PgBindValue::F64(_)));
    }

    #[test]
    fn uuid_looking_strings_bind_as_text() {
        let v = json!("67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert!(matches!(
            PgBindValue::from_json(&v),
            PgBindValue::String(s) if s == "67e55044-10b1-426f-9247-bb680e5fe0c8"
        ));
        assert!(matches!(PgBindValue::from_json(&json!("plain")), PgBindValue::String(_)));
    }
}
