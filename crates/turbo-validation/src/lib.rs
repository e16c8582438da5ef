//! Turbo Validation
//!
//! Schema models for the TurboAPI request pipeline: lax coercion of raw
//! request inputs, ordered constraint checks, batched error reporting and
//! model-driven response serialization.
//!
//! # Example
//!
//! ```rust
//! use turbo_validation::{Constraint, FieldDescriptor, ModelSchema, TypeDescriptor, Value};
//! use serde_json::json;
//!
//! let item = ModelSchema::new("Item")
//!     .field(FieldDescriptor::new("name", TypeDescriptor::String).constraint(Constraint::MinLength(1)))
//!     .field(FieldDescriptor::new("price", TypeDescriptor::Float).constraint(Constraint::Gt(0.0)));
//!
//! let ok = item.construct(json!({"name": "pen", "price": "1.5"})).unwrap();
//! assert_eq!(ok.get("price"), Some(&Value::Float(1.5)));
//!
//! // Every failing field is reported, not just the first.
//! let err = item.construct(json!({"name": "", "price": -1})).unwrap_err();
//! assert_eq!(err.len(), 2);
//! ```

pub mod coerce;
pub mod config;
pub mod constraints;
pub mod errors;
pub mod formats;
pub mod model;
pub mod serializers;
pub mod types;
pub mod validators;

pub use config::{CoercionMode, ExtraFields, ModelConfig};
pub use constraints::{Constraint, FieldDescriptor, Violation};
pub use errors::{ErrorType, ValidationContext, ValidationError, ValidationErrors, ValidationResult};
pub use formats::StringFormat;
pub use model::{ModelInstance, ModelSchema};
pub use serializers::{BoxedFieldSerializer, FieldSerializer, FnFieldSerializer, SerializerContext};
pub use types::{TypeDescriptor, Value};
pub use validators::{validate, validate_field, validate_value};
