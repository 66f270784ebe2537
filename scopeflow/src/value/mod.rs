//! Typed variable values.
//!
//! A [`TypedValue`] pairs an immutable payload with the [`ValueType`] that
//! interprets it. The type handler owns encoding, so a value can always be
//! serialized without consulting a registry; decoding goes through a
//! [`TypeRegistry`] because the envelope only carries the type id.

pub mod registry;
pub mod types;

pub use registry::TypeRegistry;
pub use types::{BuiltinType, ConstrainedType, ValueShape, ValueType};

use crate::error::{ScopeError, ScopeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Untyped payload carried by a [`TypedValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(DateTime<Utc>),
    Json(serde_json::Value),
}

impl RawValue {
    pub fn shape(&self) -> ValueShape {
        match self {
            RawValue::Null => ValueShape::Null,
            RawValue::Boolean(_) => ValueShape::Boolean,
            RawValue::Integer(_) => ValueShape::Integer,
            RawValue::Decimal(_) => ValueShape::Decimal,
            RawValue::Text(_) => ValueShape::Text,
            RawValue::Bytes(_) => ValueShape::Bytes,
            RawValue::Date(_) => ValueShape::Date,
            RawValue::Json(_) => ValueShape::Json,
        }
    }
}

impl From<bool> for RawValue {
    fn from(v: bool) -> Self {
        RawValue::Boolean(v)
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue::Integer(v)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Decimal(v)
    }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        RawValue::Text(v.to_string())
    }
}

impl From<String> for RawValue {
    fn from(v: String) -> Self {
        RawValue::Text(v)
    }
}

impl From<Vec<u8>> for RawValue {
    fn from(v: Vec<u8>) -> Self {
        RawValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(v: DateTime<Utc>) -> Self {
        RawValue::Date(v)
    }
}

impl From<serde_json::Value> for RawValue {
    fn from(v: serde_json::Value) -> Self {
        RawValue::Json(v)
    }
}

/// Serialized form of a value, the contract handed to persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEnvelope {
    #[serde(rename = "type")]
    pub type_id: String,
    #[serde(default)]
    pub version: u64,
    pub payload: serde_json::Value,
}

/// An immutable, type-tagged variable value.
///
/// Equality compares the type id and payload only; `version` is bookkeeping
/// stamped by the store and does not make two values different.
#[derive(Clone)]
pub struct TypedValue {
    ty: Arc<dyn ValueType>,
    payload: Arc<RawValue>,
    version: u64,
}

impl TypedValue {
    pub(crate) fn from_parts(ty: Arc<dyn ValueType>, payload: RawValue) -> Self {
        Self {
            ty,
            payload: Arc::new(payload),
            version: 0,
        }
    }

    /// Wrap a raw value using the built-in type registry.
    pub fn wrap(type_id: &str, raw: impl Into<RawValue>) -> ScopeResult<Self> {
        TypeRegistry::builtin().wrap(type_id, raw)
    }

    /// Decode a value produced by [`TypedValue::serialize`] using the
    /// built-in registry.
    pub fn deserialize(bytes: &[u8]) -> ScopeResult<Self> {
        TypeRegistry::builtin().deserialize(bytes)
    }

    pub fn null() -> Self {
        Self::from_parts(BuiltinType::shared(ValueShape::Null), RawValue::Null)
    }

    pub fn boolean(v: bool) -> Self {
        Self::from_parts(BuiltinType::shared(ValueShape::Boolean), RawValue::Boolean(v))
    }

    pub fn integer(v: i64) -> Self {
        Self::from_parts(BuiltinType::shared(ValueShape::Integer), RawValue::Integer(v))
    }

    /// Fails with `TypeMismatch` for NaN and infinities, which have no
    /// serialized form.
    pub fn decimal(v: f64) -> ScopeResult<Self> {
        Self::wrap(ValueShape::Decimal.builtin_id(), v)
    }

    pub fn text(v: impl Into<String>) -> Self {
        Self::from_parts(BuiltinType::shared(ValueShape::Text), RawValue::Text(v.into()))
    }

    pub fn bytes(v: impl Into<Vec<u8>>) -> Self {
        Self::from_parts(BuiltinType::shared(ValueShape::Bytes), RawValue::Bytes(v.into()))
    }

    /// Fails with `TypeMismatch` outside years 0000-9999, which RFC 3339
    /// cannot express.
    pub fn date(v: DateTime<Utc>) -> ScopeResult<Self> {
        Self::wrap(ValueShape::Date.builtin_id(), v)
    }

    pub fn json(v: serde_json::Value) -> Self {
        Self::from_parts(BuiltinType::shared(ValueShape::Json), RawValue::Json(v))
    }

    pub fn type_id(&self) -> &str {
        self.ty.type_id()
    }

    pub fn value_type(&self) -> &Arc<dyn ValueType> {
        &self.ty
    }

    pub fn payload(&self) -> &RawValue {
        &self.payload
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// A copy of this value stamped with `version`. The payload is shared.
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            ty: Arc::clone(&self.ty),
            payload: Arc::clone(&self.payload),
            version,
        }
    }

    /// Borrow the payload, checking that the value has the expected type.
    pub fn unwrap(&self, expected_type_id: &str) -> ScopeResult<&RawValue> {
        if self.type_id() != expected_type_id {
            return Err(ScopeError::type_mismatch(
                expected_type_id,
                self.type_id(),
                "unwrap",
            ));
        }
        Ok(&self.payload)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match *self.payload {
            RawValue::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<f64> {
        match *self.payload {
            RawValue::Decimal(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self.payload {
            RawValue::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &*self.payload {
            RawValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(*self.payload, RawValue::Null)
    }

    pub fn to_envelope(&self) -> ScopeResult<ValueEnvelope> {
        Ok(ValueEnvelope {
            type_id: self.type_id().to_string(),
            version: self.version,
            payload: self.ty.encode(&self.payload)?,
        })
    }

    pub fn serialize(&self) -> ScopeResult<Vec<u8>> {
        let envelope = self.to_envelope()?;
        Ok(serde_json::to_vec(&envelope)?)
    }
}

impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_id() == other.type_id() && self.payload == other.payload
    }
}

impl fmt::Debug for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedValue")
            .field("type_id", &self.type_id())
            .field("payload", &self.payload)
            .field("version", &self.version)
            .finish()
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.payload {
            RawValue::Null => write!(f, "null"),
            RawValue::Boolean(b) => write!(f, "{}", b),
            RawValue::Integer(i) => write!(f, "{}", i),
            RawValue::Decimal(d) => write!(f, "{}", d),
            RawValue::Text(s) => write!(f, "{:?}", s),
            RawValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            RawValue::Date(d) => write!(f, "{}", d.to_rfc3339()),
            RawValue::Json(j) => write!(f, "{}", j),
        }?;
        write!(f, ":{}", self.type_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wrap_unregistered_type() {
        let err = TypedValue::wrap("money", 10i64).unwrap_err();
        assert_eq!(err, ScopeError::UnsupportedType("money".to_string()));
    }

    #[test]
    fn test_wrap_rejects_wrong_shape() {
        let err = TypedValue::wrap("integer", "ten").unwrap_err();
        assert!(matches!(err, ScopeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_unwrap_checks_type() {
        let v = TypedValue::integer(7);
        assert_eq!(v.unwrap("integer").unwrap(), &RawValue::Integer(7));
        let err = v.unwrap("text").unwrap_err();
        assert_eq!(err, ScopeError::type_mismatch("text", "integer", "unwrap"));
    }

    #[test]
    fn test_equality_ignores_version() {
        let a = TypedValue::text("hello");
        let b = a.with_version(3);
        assert_eq!(a, b);
        assert_eq!(b.version(), 3);
        assert_ne!(a, TypedValue::text("world"));
    }

    #[test]
    fn test_envelope_shape() {
        let v = TypedValue::bytes(vec![1u8, 2, 3]).with_version(2);
        let bytes = v.serialize().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "bytes", "version": 2, "payload": "AQID"})
        );
    }

    #[test]
    fn test_date_round_trip_keeps_version() {
        let when = Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 0).unwrap();
        let v = TypedValue::date(when).unwrap().with_version(5);
        let back = TypedValue::deserialize(&v.serialize().unwrap()).unwrap();
        assert_eq!(back, v);
        assert_eq!(back.version(), 5);
    }

    #[test]
    fn test_date_beyond_rfc3339_years_is_rejected() {
        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            TypedValue::date(far),
            Err(ScopeError::TypeMismatch { .. })
        ));
        let edge = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        let v = TypedValue::date(edge).unwrap();
        assert_eq!(TypedValue::deserialize(&v.serialize().unwrap()).unwrap(), v);
    }

    #[test]
    fn test_deserialize_garbage_is_corrupt() {
        let err = TypedValue::deserialize(b"{not json").unwrap_err();
        assert!(matches!(err, ScopeError::CorruptValue(_)));

        let err = TypedValue::deserialize(br#"{"type":"integer","payload":"x"}"#).unwrap_err();
        assert!(matches!(err, ScopeError::CorruptValue(_)));
    }

    #[test]
    fn test_non_finite_decimal_rejected() {
        assert!(TypedValue::decimal(f64::NAN).is_err());
        assert_eq!(TypedValue::decimal(1.5).unwrap().as_decimal(), Some(1.5));
    }

    #[test]
    fn test_display() {
        assert_eq!(TypedValue::integer(3).to_string(), "3:integer");
        assert_eq!(TypedValue::text("a").to_string(), "\"a\":text");
    }
}
