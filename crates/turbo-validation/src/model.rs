//! Declared models
//!
//! A [`ModelSchema`] is the unit the API layer validates request bodies
//! against and shapes responses through. Construction is batched: every
//! field is examined and all failures are returned together.

use crate::config::{ExtraFields, ModelConfig};
use crate::constraints::FieldDescriptor;
use crate::errors::{ErrorType, ValidationContext, ValidationError, ValidationErrors, ValidationResult};
use crate::serializers::BoxedFieldSerializer;
use crate::types::Value;
use crate::validators::validate_field;
use std::fmt;

/// A named collection of field descriptors plus configuration.
#[derive(Clone)]
pub struct ModelSchema {
    name: String,
    fields: Vec<FieldDescriptor>,
    config: ModelConfig,
    pub(crate) serializers: Vec<BoxedFieldSerializer>,
}

impl ModelSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            config: ModelConfig::default(),
            serializers: Vec::new(),
        }
    }

    /// Append a field. Declaration order is preserved on output.
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Build an instance from raw input, reporting errors under location `body`.
    pub fn construct(&self, raw: impl Into<Value>) -> ValidationResult<ModelInstance> {
        let mut ctx = ValidationContext::with_location("body");
        let mut errors = ValidationErrors::new();

        let instance = match raw.into() {
            Value::Object(pairs) => self.construct_at(pairs, &mut ctx, &mut errors),
            other => {
                errors.add(ctx.type_error(format!(
                    "invalid object (got {})",
                    other.type_name()
                )));
                None
            }
        };

        match instance {
            Some(instance) if errors.is_empty() => Ok(instance),
            _ => Err(errors),
        }
    }

    /// Build an instance at the current context position, appending failures to `errors`.
    pub fn construct_at(
        &self,
        pairs: Vec<(String, Value)>,
        ctx: &mut ValidationContext,
        errors: &mut ValidationErrors,
    ) -> Option<ModelInstance> {
        let before = errors.len();
        let mut remaining = pairs;
        let mut values = Vec::with_capacity(self.fields.len());

        for field in &self.fields {
            let raw = take_key(&mut remaining, field.external_name())
                .or_else(|| take_key(&mut remaining, &field.name));
            if let Some(value) = validate_field(raw, field, self.config.coercion, ctx, errors) {
                values.push((field.name.clone(), value));
            }
        }

        let extra = match self.config.extra {
            ExtraFields::Ignore => Vec::new(),
            ExtraFields::Allow => remaining,
            ExtraFields::Forbid => {
                for (key, _) in &remaining {
                    ctx.push(key);
                    errors.add(ValidationError::new(
                        ctx.location(),
                        ctx.field(),
                        "Extra inputs are not permitted".to_string(),
                        ErrorType::ExtraForbidden,
                    ));
                    ctx.pop();
                }
                Vec::new()
            }
        };

        if errors.len() > before {
            return None;
        }

        Some(ModelInstance {
            model: self.name.clone(),
            values,
            extra,
        })
    }
}

fn take_key(pairs: &mut Vec<(String, Value)>, key: &str) -> Option<Value> {
    let index = pairs.iter().position(|(k, _)| k == key)?;
    Some(pairs.remove(index).1)
}

impl fmt::Debug for ModelSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSchema")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("config", &self.config)
            .field(
                "serializers",
                &self.serializers.iter().map(|s| s.field_name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A validated model instance; field values are keyed by declared name.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInstance {
    model: String,
    values: Vec<(String, Value)>,
    extra: Vec<(String, Value)>,
}

impl ModelInstance {
    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .chain(self.extra.iter())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }

    /// Extra keys kept under `ExtraFields::Allow`.
    pub fn extra(&self) -> &[(String, Value)] {
        &self.extra
    }

    /// Flatten into an object value (declared fields first, then extras).
    pub fn into_value(self) -> Value {
        let mut pairs = self.values;
        pairs.extend(self.extra);
        Value::Object(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtraFields;
    use crate::constraints::Constraint;
    use crate::types::TypeDescriptor;
    use serde_json::json;

    fn user_schema() -> ModelSchema {
        ModelSchema::new("User")
            .field(FieldDescriptor::new("name", TypeDescriptor::String))
            .field(FieldDescriptor::new("email", TypeDescriptor::String))
            .field(
                FieldDescriptor::new("age", TypeDescriptor::Int)
                    .constraint(Constraint::Ge(0.0)),
            )
            .field(FieldDescriptor::new("active", TypeDescriptor::Bool).default_value(true))
    }

    #[test]
    fn test_construct_valid() {
        let user = user_schema()
            .construct(json!({"name": "ada", "email": "a@b.io", "age": "36"}))
            .unwrap();
        assert_eq!(user.get("age"), Some(&Value::Int(36)));
        assert_eq!(user.get("active"), Some(&Value::Bool(true)));
        assert_eq!(user.model_name(), "User");
    }

    #[test]
    fn test_construct_reports_every_missing_field() {
        let errors = user_schema().construct(json!({})).unwrap_err();
        let fields: Vec<&str> = errors.as_slice().iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "email", "age"]);
        assert!(errors.as_slice().iter().all(|e| e.location == "body"));
    }

    #[test]
    fn test_construct_non_object() {
        let errors = user_schema().construct(json!([1, 2])).unwrap_err();
        assert_eq!(errors.errors[0].message, "invalid object (got array)");
    }

    #[test]
    fn test_extra_policies() {
        let raw = json!({"name": "a", "email": "e", "age": 1, "nick": "x"});

        let ignored = user_schema().construct(raw.clone()).unwrap();
        assert!(ignored.get("nick").is_none());

        let allowed = user_schema()
            .config(ModelConfig::new().extra(ExtraFields::Allow))
            .construct(raw.clone())
            .unwrap();
        assert_eq!(allowed.get("nick"), Some(&Value::from("x")));

        let errors = user_schema()
            .config(ModelConfig::new().forbid_extra())
            .construct(raw)
            .unwrap_err();
        assert_eq!(errors.errors[0].error_type, ErrorType::ExtraForbidden);
        assert_eq!(errors.errors[0].field, "nick");
    }

    #[test]
    fn test_alias_lookup() {
        let schema = ModelSchema::new("Page").field(
            FieldDescriptor::new("page_size", TypeDescriptor::Int).alias("pageSize"),
        );
        let page = schema.construct(json!({"pageSize": 5})).unwrap();
        assert_eq!(page.get("page_size"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_nested_model_error_path() {
        let address = ModelSchema::new("Address")
            .field(FieldDescriptor::new("zip", TypeDescriptor::Int));
        let schema = ModelSchema::new("Customer").field(FieldDescriptor::new(
            "address",
            TypeDescriptor::Model(std::sync::Arc::new(address)),
        ));
        let errors = schema
            .construct(json!({"address": {"zip": "abc"}}))
            .unwrap_err();
        assert_eq!(errors.errors[0].field, "address.zip");
        assert_eq!(errors.errors[0].message, "invalid integer");
    }

    #[test]
    fn test_strict_mode() {
        let schema = ModelSchema::new("Strict")
            .field(FieldDescriptor::new("n", TypeDescriptor::Int))
            .config(ModelConfig::new().strict());
        assert!(schema.construct(json!({"n": "1"})).is_err());
        assert!(schema.construct(json!({"n": 1})).is_ok());
    }
}
