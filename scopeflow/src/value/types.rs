//! Value type handlers.

use super::RawValue;
use crate::error::{ScopeError, ScopeResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;

/// Structural shape of a payload. Every registered type maps onto one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueShape {
    Null,
    Boolean,
    Integer,
    Decimal,
    Text,
    Bytes,
    Date,
    Json,
}

/// Years an RFC 3339 timestamp can spell.
const RFC3339_YEARS: std::ops::RangeInclusive<i32> = 0..=9999;

impl ValueShape {
    pub const ALL: [ValueShape; 8] = [
        ValueShape::Null,
        ValueShape::Boolean,
        ValueShape::Integer,
        ValueShape::Decimal,
        ValueShape::Text,
        ValueShape::Bytes,
        ValueShape::Date,
        ValueShape::Json,
    ];

    /// Type id under which the built-in handler for this shape is registered.
    pub fn builtin_id(self) -> &'static str {
        match self {
            ValueShape::Null => "null",
            ValueShape::Boolean => "boolean",
            ValueShape::Integer => "integer",
            ValueShape::Decimal => "decimal",
            ValueShape::Text => "text",
            ValueShape::Bytes => "bytes",
            ValueShape::Date => "date",
            ValueShape::Json => "json",
        }
    }

    fn check(self, type_id: &str, raw: &RawValue) -> ScopeResult<()> {
        if raw.shape() != self {
            return Err(ScopeError::type_mismatch(
                self.builtin_id(),
                raw.shape().builtin_id(),
                format!("value of type {}", type_id),
            ));
        }
        if let RawValue::Decimal(f) = raw {
            if !f.is_finite() {
                return Err(ScopeError::type_mismatch(
                    "finite decimal",
                    f.to_string(),
                    format!("value of type {}", type_id),
                ));
            }
        }
        if let RawValue::Date(d) = raw {
            if !RFC3339_YEARS.contains(&d.year()) {
                return Err(ScopeError::type_mismatch(
                    "date within years 0000-9999",
                    d.to_rfc3339(),
                    format!("value of type {}", type_id),
                ));
            }
        }
        Ok(())
    }

    fn encode(self, raw: &RawValue) -> ScopeResult<serde_json::Value> {
        use serde_json::Value as Json;
        Ok(match raw {
            RawValue::Null => Json::Null,
            RawValue::Boolean(b) => Json::Bool(*b),
            RawValue::Integer(i) => Json::from(*i),
            RawValue::Decimal(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .ok_or_else(|| ScopeError::CorruptValue(format!("non-finite decimal {}", f)))?,
            RawValue::Text(s) => Json::String(s.clone()),
            RawValue::Bytes(b) => Json::String(BASE64.encode(b)),
            RawValue::Date(d) => Json::String(d.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            RawValue::Json(j) => j.clone(),
        })
    }

    fn decode(self, payload: &serde_json::Value) -> ScopeResult<RawValue> {
        let corrupt = || {
            ScopeError::CorruptValue(format!(
                "payload {} is not a valid {}",
                payload,
                self.builtin_id()
            ))
        };
        match self {
            ValueShape::Null => payload.is_null().then_some(RawValue::Null).ok_or_else(corrupt),
            ValueShape::Boolean => payload.as_bool().map(RawValue::Boolean).ok_or_else(corrupt),
            ValueShape::Integer => payload.as_i64().map(RawValue::Integer).ok_or_else(corrupt),
            ValueShape::Decimal => payload.as_f64().map(RawValue::Decimal).ok_or_else(corrupt),
            ValueShape::Text => payload
                .as_str()
                .map(|s| RawValue::Text(s.to_string()))
                .ok_or_else(corrupt),
            ValueShape::Bytes => {
                let encoded = payload.as_str().ok_or_else(corrupt)?;
                BASE64
                    .decode(encoded)
                    .map(RawValue::Bytes)
                    .map_err(|e| ScopeError::CorruptValue(format!("invalid base64: {}", e)))
            }
            ValueShape::Date => {
                let encoded = payload.as_str().ok_or_else(corrupt)?;
                DateTime::parse_from_rfc3339(encoded)
                    .map(|d| RawValue::Date(d.with_timezone(&Utc)))
                    .map_err(|e| ScopeError::CorruptValue(format!("invalid date: {}", e)))
            }
            ValueShape::Json => Ok(RawValue::Json(payload.clone())),
        }
    }
}

/// Handler for one registered type id.
///
/// The handler fully determines how a payload is validated, encoded and
/// decoded. Implementations must be stateless or internally synchronized:
/// they are shared by every value of the type across threads.
pub trait ValueType: Send + Sync {
    fn type_id(&self) -> &str;

    fn shape(&self) -> ValueShape;

    /// Check that `raw` is an acceptable payload for this type.
    fn validate(&self, raw: &RawValue) -> ScopeResult<()> {
        self.shape().check(self.type_id(), raw)
    }

    fn encode(&self, raw: &RawValue) -> ScopeResult<serde_json::Value> {
        self.shape().encode(raw)
    }

    fn decode(&self, payload: &serde_json::Value) -> ScopeResult<RawValue> {
        let raw = self.shape().decode(payload)?;
        self.validate(&raw)
            .map_err(|e| ScopeError::CorruptValue(e.to_string()))?;
        Ok(raw)
    }
}

/// One of the built-in types, registered under [`ValueShape::builtin_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinType(pub ValueShape);

static BUILTIN_TYPES: Lazy<Vec<Arc<dyn ValueType>>> = Lazy::new(|| {
    ValueShape::ALL
        .iter()
        .map(|shape| Arc::new(BuiltinType(*shape)) as Arc<dyn ValueType>)
        .collect()
});

impl BuiltinType {
    /// The process-wide handler instance for `shape`.
    pub fn shared(shape: ValueShape) -> Arc<dyn ValueType> {
        let index = ValueShape::ALL
            .iter()
            .position(|s| *s == shape)
            .unwrap_or_default();
        Arc::clone(&BUILTIN_TYPES[index])
    }
}

impl ValueType for BuiltinType {
    fn type_id(&self) -> &str {
        self.0.builtin_id()
    }

    fn shape(&self) -> ValueShape {
        self.0
    }
}

type Constraint = Box<dyn Fn(&RawValue) -> bool + Send + Sync>;

/// A user-defined type: a built-in shape narrowed by a predicate.
///
/// ```
/// use scopeflow::{ConstrainedType, RawValue, TypeRegistry, ValueShape};
///
/// # fn main() -> scopeflow::ScopeResult<()> {
/// let percentage = ConstrainedType::new("percentage", ValueShape::Integer, |raw| {
///     matches!(raw, RawValue::Integer(0..=100))
/// });
/// let mut registry = TypeRegistry::with_builtins();
/// registry.register(percentage)?;
///
/// assert!(registry.wrap("percentage", 42i64).is_ok());
/// assert!(registry.wrap("percentage", 142i64).is_err());
/// # Ok(())
/// # }
/// ```
pub struct ConstrainedType {
    id: String,
    shape: ValueShape,
    constraint: Constraint,
}

impl ConstrainedType {
    pub fn new(
        id: impl Into<String>,
        shape: ValueShape,
        constraint: impl Fn(&RawValue) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            shape,
            constraint: Box::new(constraint),
        }
    }
}

impl fmt::Debug for ConstrainedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstrainedType")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .finish()
    }
}

impl ValueType for ConstrainedType {
    fn type_id(&self) -> &str {
        &self.id
    }

    fn shape(&self) -> ValueShape {
        self.shape
    }

    fn validate(&self, raw: &RawValue) -> ScopeResult<()> {
        self.shape.check(&self.id, raw)?;
        if !(self.constraint)(raw) {
            return Err(ScopeError::type_mismatch(
                self.id.clone(),
                format!("{:?}", raw),
                format!("constraint of type {}", self.id),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ids_are_distinct() {
        let mut ids: Vec<_> = ValueShape::ALL.iter().map(|s| s.builtin_id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), ValueShape::ALL.len());
    }

    #[test]
    fn test_shared_builtin_matches_shape() {
        for shape in ValueShape::ALL {
            let ty = BuiltinType::shared(shape);
            assert_eq!(ty.shape(), shape);
            assert_eq!(ty.type_id(), shape.builtin_id());
        }
    }

    #[test]
    fn test_constrained_type_rejects_out_of_range() {
        let pct = ConstrainedType::new("percentage", ValueShape::Integer, |raw| {
            matches!(raw, RawValue::Integer(0..=100))
        });
        assert!(pct.validate(&RawValue::Integer(42)).is_ok());
        assert!(matches!(
            pct.validate(&RawValue::Integer(142)),
            Err(ScopeError::TypeMismatch { .. })
        ));
        assert!(matches!(
            pct.decode(&serde_json::json!(142)),
            Err(ScopeError::CorruptValue(_))
        ));
    }

    #[test]
    fn test_bad_base64_is_corrupt() {
        let err = BuiltinType(ValueShape::Bytes)
            .decode(&serde_json::json!("***"))
            .unwrap_err();
        assert!(matches!(err, ScopeError::CorruptValue(_)));
    }
}
