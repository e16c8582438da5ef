//! Output serialization through a model's field list
//!
//! Serialization walks the *declared* fields only, so anything the handler
//! returned beyond the model is dropped. Default per-field transforms are
//! those of [`Value::to_json`] (datetime → ISO-8601, bytes → base64); a
//! [`FieldSerializer`] replaces the transform for one field.
//!
//! ```
//! use turbo_validation::{FieldDescriptor, FnFieldSerializer, ModelSchema, SerializerContext, TypeDescriptor, Value};
//! use serde_json::json;
//!
//! let schema = ModelSchema::new("Card")
//!     .field(FieldDescriptor::new("number", TypeDescriptor::String))
//!     .serializer(FnFieldSerializer::new("number", |value, _ctx| match value {
//!         Value::String(s) => Value::String(format!("****{}", &s[s.len() - 4..])),
//!         other => other.clone(),
//!     }));
//!
//! let out = schema
//!     .dump(json!({"number": "4111111111111111", "cvv": "123"}), &SerializerContext::new())
//!     .unwrap();
//! assert_eq!(out, json!({"number": "****1111"}));
//! ```

use crate::errors::ValidationResult;
use crate::model::{ModelInstance, ModelSchema};
use crate::types::{TypeDescriptor, Value};
use std::sync::Arc;

// ============================================================================
// Serializer Context
// ============================================================================

/// Options applied during serialization
#[derive(Debug, Clone, Default)]
pub struct SerializerContext {
    exclude_none: bool,
    exclude_fields: Vec<String>,
    include_fields: Vec<String>,
}

impl SerializerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop fields whose value is null
    pub fn with_exclude_none(mut self, exclude: bool) -> Self {
        self.exclude_none = exclude;
        self
    }

    pub fn with_exclude(mut self, fields: Vec<String>) -> Self {
        self.exclude_fields = fields;
        self
    }

    pub fn with_include(mut self, fields: Vec<String>) -> Self {
        self.include_fields = fields;
        self
    }

    pub fn exclude_none(&self) -> bool {
        self.exclude_none
    }

    /// Check if a field should be excluded
    pub fn should_exclude(&self, field: &str) -> bool {
        if self.exclude_fields.iter().any(|f| f == field) {
            return true;
        }
        !self.include_fields.is_empty() && !self.include_fields.iter().any(|f| f == field)
    }
}

// ============================================================================
// Field Serializer
// ============================================================================

/// Custom transform for one field's output
pub trait FieldSerializer: Send + Sync {
    /// Declared (not aliased) field name this serializer applies to
    fn field_name(&self) -> &str;

    fn serialize(&self, value: &Value, ctx: &SerializerContext) -> Value;
}

pub type BoxedFieldSerializer = Arc<dyn FieldSerializer>;

/// Closure-backed [`FieldSerializer`]
pub struct FnFieldSerializer<F> {
    field: String,
    func: F,
}

impl<F> FnFieldSerializer<F>
where
    F: Fn(&Value, &SerializerContext) -> Value + Send + Sync,
{
    pub fn new(field: impl Into<String>, func: F) -> Self {
        Self {
            field: field.into(),
            func,
        }
    }
}

impl<F> FieldSerializer for FnFieldSerializer<F>
where
    F: Fn(&Value, &SerializerContext) -> Value + Send + Sync,
{
    fn field_name(&self) -> &str {
        &self.field
    }

    fn serialize(&self, value: &Value, ctx: &SerializerContext) -> Value {
        (self.func)(value, ctx)
    }
}

// ============================================================================
// Model serialization
// ============================================================================

impl ModelSchema {
    /// Register a custom field serializer
    pub fn serializer(mut self, serializer: impl FieldSerializer + 'static) -> Self {
        self.serializers.push(Arc::new(serializer));
        self
    }

    /// Serialize a validated instance to JSON using the declared field list.
    pub fn serialize(&self, instance: &ModelInstance, ctx: &SerializerContext) -> serde_json::Value {
        let mut pairs: Vec<(String, Value)> = instance.values().to_vec();
        pairs.extend(instance.extra().iter().cloned());
        self.serialize_pairs(&pairs, ctx)
    }

    /// Validate `raw` through the model and serialize the result.
    ///
    /// This is the response-shaping path: undeclared keys are dropped and
    /// per-field transforms are applied.
    pub fn dump(&self, raw: impl Into<Value>, ctx: &SerializerContext) -> ValidationResult<serde_json::Value> {
        let instance = self.construct(raw)?;
        Ok(self.serialize(&instance, ctx))
    }

    fn serialize_pairs(&self, pairs: &[(String, Value)], ctx: &SerializerContext) -> serde_json::Value {
        let exclude_none = ctx.exclude_none() || self.model_config().exclude_none;
        let mut out = serde_json::Map::new();

        for field in self.fields() {
            if ctx.should_exclude(&field.name) {
                continue;
            }
            let Some(value) = pairs.iter().find(|(k, _)| *k == field.name).map(|(_, v)| v) else {
                continue;
            };
            if exclude_none && value.is_null() {
                continue;
            }

            let json = match self.serializers.iter().find(|s| s.field_name() == field.name) {
                Some(custom) => custom.serialize(value, ctx).to_json(),
                None => serialize_typed(value, &field.type_desc, ctx),
            };
            out.insert(field.external_name().to_string(), json);
        }

        // Extras (ExtraFields::Allow) pass through untouched.
        for (key, value) in pairs {
            if self.field_named(key).is_none() && !ctx.should_exclude(key) {
                out.insert(key.clone(), value.to_json());
            }
        }

        serde_json::Value::Object(out)
    }
}

fn serialize_typed(value: &Value, type_desc: &TypeDescriptor, ctx: &SerializerContext) -> serde_json::Value {
    match (type_desc, value) {
        (TypeDescriptor::Optional(inner), _) => serialize_typed(value, inner, ctx),
        (TypeDescriptor::Model(schema), Value::Object(pairs)) => schema.serialize_pairs(pairs, ctx),
        (TypeDescriptor::List(items), Value::List(values)) => serde_json::Value::Array(
            values.iter().map(|v| serialize_typed(v, items, ctx)).collect(),
        ),
        _ => value.to_json(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::FieldDescriptor;
    use serde_json::json;

    fn event_schema() -> ModelSchema {
        ModelSchema::new("Event")
            .field(FieldDescriptor::new("id", TypeDescriptor::Int))
            .field(FieldDescriptor::new("at", TypeDescriptor::DateTime))
            .field(FieldDescriptor::new("note", TypeDescriptor::String).optional())
    }

    #[test]
    fn test_dump_drops_undeclared_and_formats_datetime() {
        let out = event_schema()
            .dump(
                json!({"id": 1, "at": "2024-03-01T08:30:00", "secret": "x"}),
                &SerializerContext::new(),
            )
            .unwrap();
        assert_eq!(out, json!({"id": 1, "at": "2024-03-01T08:30:00Z", "note": null}));
    }

    #[test]
    fn test_exclude_none_and_fields() {
        let ctx = SerializerContext::new()
            .with_exclude_none(true)
            .with_exclude(vec!["id".to_string()]);
        let out = event_schema()
            .dump(json!({"id": 1, "at": "2024-03-01T08:30:00Z"}), &ctx)
            .unwrap();
        assert_eq!(out, json!({"at": "2024-03-01T08:30:00Z"}));
    }

    #[test]
    fn test_nested_lists_of_models_are_shaped() {
        let tag = Arc::new(
            ModelSchema::new("Tag").field(FieldDescriptor::new("label", TypeDescriptor::String)),
        );
        let schema = ModelSchema::new("Post").field(FieldDescriptor::new(
            "tags",
            TypeDescriptor::list(TypeDescriptor::Model(tag)),
        ));
        let out = schema
            .dump(
                json!({"tags": [{"label": "rust", "score": 9}]}),
                &SerializerContext::new(),
            )
            .unwrap();
        assert_eq!(out, json!({"tags": [{"label": "rust"}]}));
    }

    #[test]
    fn test_alias_used_on_output() {
        let schema = ModelSchema::new("Page")
            .field(FieldDescriptor::new("page_size", TypeDescriptor::Int).alias("pageSize"));
        let out = schema.dump(json!({"page_size": 3}), &SerializerContext::new()).unwrap();
        assert_eq!(out, json!({"pageSize": 3}));
    }
}
