//! Core validation engine
//!
//! Every entry point here coerces *and* validates: the output is the typed
//! value ready for a handler, and failures are appended to a shared
//! [`ValidationErrors`] so callers can batch across many fields.

use crate::coerce::coerce_scalar;
use crate::config::CoercionMode;
use crate::constraints::FieldDescriptor;
use crate::errors::{ValidationContext, ValidationError, ValidationErrors, ValidationResult};
use crate::types::{TypeDescriptor, Value};

// ============================================================================
// Public API
// ============================================================================

/// Coerce and validate a single value against a type descriptor.
///
/// ```
/// use turbo_validation::{validate, TypeDescriptor, Value};
///
/// let value = validate(Value::from("42"), &TypeDescriptor::Int).unwrap();
/// assert_eq!(value, Value::Int(42));
/// assert!(validate(Value::from("x"), &TypeDescriptor::Int).is_err());
/// ```
pub fn validate(value: Value, type_desc: &TypeDescriptor) -> ValidationResult<Value> {
    let mut ctx = ValidationContext::new();
    let mut errors = ValidationErrors::new();
    match validate_value(value, type_desc, CoercionMode::Lax, &mut ctx, &mut errors) {
        Some(v) if errors.is_empty() => Ok(v),
        _ => Err(errors),
    }
}

/// Coerce and validate a value at the current context position.
///
/// Returns `None` when at least one error was recorded for this value.
pub fn validate_value(
    value: Value,
    type_desc: &TypeDescriptor,
    mode: CoercionMode,
    ctx: &mut ValidationContext,
    errors: &mut ValidationErrors,
) -> Option<Value> {
    match type_desc {
        TypeDescriptor::Any => Some(value),
        TypeDescriptor::Optional(inner) => {
            if value.is_null() {
                Some(Value::Null)
            } else {
                validate_value(value, inner, mode, ctx, errors)
            }
        }
        TypeDescriptor::List(items) => validate_list(value, items, mode, ctx, errors),
        TypeDescriptor::Model(schema) => match value {
            Value::Object(pairs) => schema
                .construct_at(pairs, ctx, errors)
                .map(|instance| instance.into_value()),
            _ => {
                errors.add(ctx.type_error("invalid object"));
                None
            }
        },
        scalar => match coerce_scalar(value, scalar, mode) {
            Ok(v) => Some(v),
            Err(reason) => {
                errors.add(ctx.type_error(reason));
                None
            }
        },
    }
}

/// Resolve, coerce and constrain one declared field.
///
/// `raw` is `None` when the input did not carry the field at all. The field
/// name is pushed onto `ctx` for the duration of the call; constraints are
/// checked in order and only the first failure is reported.
pub fn validate_field(
    raw: Option<Value>,
    field: &FieldDescriptor,
    mode: CoercionMode,
    ctx: &mut ValidationContext,
    errors: &mut ValidationErrors,
) -> Option<Value> {
    ctx.push(field.external_name());
    let result = validate_field_inner(raw, field, mode, ctx, errors);
    ctx.pop();
    result
}

fn validate_field_inner(
    raw: Option<Value>,
    field: &FieldDescriptor,
    mode: CoercionMode,
    ctx: &mut ValidationContext,
    errors: &mut ValidationErrors,
) -> Option<Value> {
    let raw = match raw {
        Some(Value::Null) if !field.required => None,
        other => other,
    };

    let value = match raw {
        Some(value) => validate_value(value, &field.type_desc, mode, ctx, errors)?,
        None => {
            return match (&field.default, field.required) {
                (Some(default), _) => Some(default.clone()),
                (None, true) => {
                    errors.add(ctx.missing());
                    None
                }
                (None, false) => Some(Value::Null),
            };
        }
    };

    if value.is_null() {
        return Some(value);
    }

    for constraint in &field.constraints {
        if let Err(violation) = constraint.check(&value) {
            errors.add(ValidationError::new(
                ctx.location(),
                ctx.field(),
                violation.message,
                violation.error_type,
            ));
            return None;
        }
    }

    Some(value)
}

// ============================================================================
// Collections
// ============================================================================

fn validate_list(
    value: Value,
    items: &TypeDescriptor,
    mode: CoercionMode,
    ctx: &mut ValidationContext,
    errors: &mut ValidationErrors,
) -> Option<Value> {
    let raw_items = match value {
        Value::List(raw_items) => raw_items,
        _ => {
            errors.add(ctx.type_error("invalid list"));
            return None;
        }
    };

    let before = errors.len();
    let mut out = Vec::with_capacity(raw_items.len());
    for (i, item) in raw_items.into_iter().enumerate() {
        ctx.push(&i.to_string());
        if let Some(v) = validate_value(item, items, mode, ctx, errors) {
            out.push(v);
        }
        ctx.pop();
    }

    if errors.len() == before {
        Some(Value::List(out))
    } else {
        None
    }
}
