use super::types::{BuiltinType, ValueShape, ValueType};
use super::{RawValue, TypedValue, ValueEnvelope};
use crate::error::{ScopeError, ScopeResult};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

static BUILTIN_REGISTRY: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::with_builtins);

/// The set of type ids a process instance can wrap and decode.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<dyn ValueType>>,
}

impl TypeRegistry {
    /// A registry with no types at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry holding the built-in types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for shape in ValueShape::ALL {
            registry
                .types
                .insert(shape.builtin_id().to_string(), BuiltinType::shared(shape));
        }
        registry
    }

    /// Shared registry of built-in types.
    pub fn builtin() -> &'static TypeRegistry {
        &BUILTIN_REGISTRY
    }

    /// Register a custom type. Re-registering an existing id is rejected so
    /// that values already in flight never change interpretation.
    pub fn register(&mut self, ty: impl ValueType + 'static) -> ScopeResult<()> {
        let id = ty.type_id().to_string();
        if self.types.contains_key(&id) {
            return Err(ScopeError::Config(format!(
                "type '{}' is already registered",
                id
            )));
        }
        log::debug!("Registered value type '{}' ({:?})", id, ty.shape());
        self.types.insert(id, Arc::new(ty));
        Ok(())
    }

    pub fn get(&self, type_id: &str) -> Option<&Arc<dyn ValueType>> {
        self.types.get(type_id)
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.types.contains_key(type_id)
    }

    /// Registered ids, sorted.
    pub fn type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.types.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn wrap(&self, type_id: &str, raw: impl Into<RawValue>) -> ScopeResult<TypedValue> {
        let ty = self
            .get(type_id)
            .ok_or_else(|| ScopeError::UnsupportedType(type_id.to_string()))?;
        let raw = raw.into();
        ty.validate(&raw)?;
        Ok(TypedValue::from_parts(Arc::clone(ty), raw))
    }

    pub fn from_envelope(&self, envelope: &ValueEnvelope) -> ScopeResult<TypedValue> {
        let ty = self
            .get(&envelope.type_id)
            .ok_or_else(|| ScopeError::UnsupportedType(envelope.type_id.clone()))?;
        let raw = ty.decode(&envelope.payload)?;
        Ok(TypedValue::from_parts(Arc::clone(ty), raw).with_version(envelope.version))
    }

    pub fn deserialize(&self, bytes: &[u8]) -> ScopeResult<TypedValue> {
        let envelope: ValueEnvelope = serde_json::from_slice(bytes)?;
        self.from_envelope(&envelope)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_ids())
            .finish()
    }
}
