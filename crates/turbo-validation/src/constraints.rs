//! Field constraints and field descriptors
//!
//! Constraints are kept in declaration order. The validator stops at the first
//! failing constraint of a field, so the order given by the caller is the
//! order errors are reported in.

use crate::errors::ErrorType;
use crate::formats::StringFormat;
use crate::types::{TypeDescriptor, Value};
use regex::Regex;

// ============================================================================
// Constraint
// ============================================================================

/// A single check applied after a value has been coerced to its target type.
///
/// Checks that do not apply to the coerced value's type are skipped, so a
/// `MinLength` on an integer field is a no-op rather than an error.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Minimum length: characters for strings, items for lists, bytes for bytes
    MinLength(usize),
    /// Maximum length (same units as `MinLength`)
    MaxLength(usize),
    /// Regex the whole string must match (use anchors for full matches)
    Pattern(Regex),
    /// Greater than or equal
    Ge(f64),
    /// Strictly greater than
    Gt(f64),
    /// Less than or equal
    Le(f64),
    /// Strictly less than
    Lt(f64),
    /// Numeric value must be a multiple of this
    MultipleOf(f64),
    /// Value must equal one of these
    OneOf(Vec<Value>),
    /// String must match a predefined format
    Format(StringFormat),
}

/// A failed constraint check.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub message: String,
    pub error_type: ErrorType,
}

impl Violation {
    fn value(message: String) -> Self {
        Self {
            message,
            error_type: ErrorType::ValueError,
        }
    }
}

impl Constraint {
    /// Compile a `Pattern` constraint.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Pattern)
    }

    /// Enumerated choices.
    pub fn one_of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::OneOf(values.into_iter().map(Into::into).collect())
    }

    /// Check a coerced value.
    pub fn check(&self, value: &Value) -> Result<(), Violation> {
        match self {
            Self::MinLength(min) => match measure(value) {
                Some((len, unit)) if len < *min => Err(Violation::value(format!(
                    "{} must have at least {} {} (got {})",
                    kind(value),
                    min,
                    unit,
                    len
                ))),
                _ => Ok(()),
            },
            Self::MaxLength(max) => match measure(value) {
                Some((len, unit)) if len > *max => Err(Violation::value(format!(
                    "{} must have at most {} {} (got {})",
                    kind(value),
                    max,
                    unit,
                    len
                ))),
                _ => Ok(()),
            },
            Self::Pattern(re) => match value {
                Value::String(s) if !re.is_match(s) => Err(Violation::value(format!(
                    "String does not match pattern: {}",
                    re.as_str()
                ))),
                _ => Ok(()),
            },
            Self::Ge(bound) => bound_check(value, |n| n >= *bound, ">=", *bound),
            Self::Gt(bound) => bound_check(value, |n| n > *bound, ">", *bound),
            Self::Le(bound) => bound_check(value, |n| n <= *bound, "<=", *bound),
            Self::Lt(bound) => bound_check(value, |n| n < *bound, "<", *bound),
            Self::MultipleOf(multiple) => match value.as_f64() {
                Some(n) if !is_multiple(n, *multiple) => Err(Violation::value(format!(
                    "Value must be a multiple of {}",
                    multiple
                ))),
                _ => Ok(()),
            },
            Self::OneOf(allowed) => {
                if allowed.iter().any(|a| loosely_equal(a, value)) {
                    Ok(())
                } else {
                    let formatted: Vec<String> = allowed.iter().map(display_choice).collect();
                    Err(Violation::value(format!(
                        "Value must be one of: [{}]",
                        formatted.join(", ")
                    )))
                }
            }
            Self::Format(format) => match value {
                Value::String(s) if !format.matches(s) => Err(Violation {
                    message: format!("Invalid {} format", format.name()),
                    error_type: ErrorType::FormatError,
                }),
                _ => Ok(()),
            },
        }
    }
}

fn measure(value: &Value) -> Option<(usize, &'static str)> {
    match value {
        Value::String(s) => Some((s.chars().count(), "characters")),
        Value::List(items) => Some((items.len(), "items")),
        Value::Bytes(b) => Some((b.len(), "bytes")),
        _ => None,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "String",
        Value::List(_) => "List",
        _ => "Value",
    }
}

fn bound_check(
    value: &Value,
    ok: impl Fn(f64) -> bool,
    op: &str,
    bound: f64,
) -> Result<(), Violation> {
    match value {
        Value::Int(_) | Value::Float(_) => {
            let n = value.as_f64().unwrap_or_default();
            if ok(n) {
                Ok(())
            } else {
                Err(Violation::value(format!(
                    "Value must be {} {} (got {})",
                    op,
                    bound,
                    display_choice(value)
                )))
            }
        }
        _ => Ok(()),
    }
}

// Floats use a relative tolerance so 0.3 is a multiple of 0.1.
fn is_multiple(n: f64, multiple: f64) -> bool {
    if multiple == 0.0 {
        return true;
    }
    let remainder = (n % multiple).abs();
    let tolerance = multiple.abs() * 1e-9;
    remainder <= tolerance || (multiple.abs() - remainder).abs() <= tolerance
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn display_choice(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_json().to_string(),
    }
}

// ============================================================================
// Field Descriptor
// ============================================================================

/// Field descriptor for model and parameter validation
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    /// Field name
    pub name: String,
    /// Target type
    pub type_desc: TypeDescriptor,
    /// Whether this field must be present
    pub required: bool,
    /// Value used when the field is absent
    pub default: Option<Value>,
    /// Ordered constraints checked after coercion
    pub constraints: Vec<Constraint>,
    /// External name used for input and output
    pub alias: Option<String>,
    /// Optional description for documentation
    pub description: Option<String>,
}

impl FieldDescriptor {
    /// Create a new required field descriptor
    pub fn new(name: impl Into<String>, type_desc: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            type_desc,
            required: true,
            default: None,
            constraints: Vec::new(),
            alias: None,
            description: None,
        }
    }

    /// Set field as optional (absent becomes null)
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Set default value (implies optional)
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self.required = false;
        self
    }

    /// Append a constraint
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Set alias for both input and output
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set description
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Name looked up in raw input and written on output
    pub fn external_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_units() {
        let c = Constraint::MinLength(3);
        assert!(c.check(&Value::from("héllo")).is_ok());
        let err = c.check(&Value::from("hé")).unwrap_err();
        assert_eq!(err.message, "String must have at least 3 characters (got 2)");

        let c = Constraint::MaxLength(1);
        let err = c.check(&Value::from(vec![1i64, 2])).unwrap_err();
        assert_eq!(err.message, "List must have at most 1 items (got 2)");
    }

    #[test]
    fn test_numeric_bounds() {
        assert!(Constraint::Ge(1.0).check(&Value::Int(1)).is_ok());
        assert!(Constraint::Gt(1.0).check(&Value::Int(1)).is_err());
        assert!(Constraint::Le(2.5).check(&Value::Float(2.5)).is_ok());
        let err = Constraint::Lt(10.0).check(&Value::Int(11)).unwrap_err();
        assert_eq!(err.message, "Value must be < 10 (got 11)");
        // Not numeric: skipped
        assert!(Constraint::Ge(0.0).check(&Value::from("x")).is_ok());
    }

    #[test]
    fn test_multiple_of() {
        assert!(Constraint::MultipleOf(0.1).check(&Value::Float(0.3)).is_ok());
        assert!(Constraint::MultipleOf(5.0).check(&Value::Int(12)).is_err());
    }

    #[test]
    fn test_pattern_and_one_of() {
        let c = Constraint::pattern(r"^\d{3}$").unwrap();
        assert!(c.check(&Value::from("123")).is_ok());
        assert!(c.check(&Value::from("12a")).is_err());
        assert!(Constraint::pattern("(").is_err());

        let c = Constraint::one_of(["asc", "desc"]);
        assert!(c.check(&Value::from("asc")).is_ok());
        let err = c.check(&Value::from("up")).unwrap_err();
        assert_eq!(err.message, "Value must be one of: [\"asc\", \"desc\"]");
    }

    #[test]
    fn test_format_error_type() {
        let err = Constraint::Format(StringFormat::Email)
            .check(&Value::from("nope"))
            .unwrap_err();
        assert_eq!(err.error_type, ErrorType::FormatError);
    }

    #[test]
    fn test_field_descriptor_builder() {
        let field = FieldDescriptor::new("page_size", TypeDescriptor::Int)
            .default_value(20i64)
            .constraint(Constraint::Ge(1.0))
            .alias("pageSize");
        assert!(!field.required);
        assert_eq!(field.external_name(), "pageSize");
        assert_eq!(field.constraints.len(), 1);
    }
}
