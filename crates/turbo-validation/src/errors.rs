//! Validation error types
//!
//! Validation is batched: every failing field contributes one
//! [`ValidationError`] to a [`ValidationErrors`] collection.

use std::fmt;

pub type ValidationResult<T> = Result<T, ValidationErrors>;

// ============================================================================
// Batched errors
// ============================================================================

/// Every failure found while validating one input set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn add(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    /// `Ok(())` when nothing was collected
    pub fn into_result(self) -> ValidationResult<()> {
        match self.errors.is_empty() {
            true => Ok(()),
            false => Err(self),
        }
    }

    pub fn as_slice(&self) -> &[ValidationError] {
        &self.errors
    }

    /// First error whose dotted field path equals `field`
    pub fn for_field(&self, field: &str) -> Option<&ValidationError> {
        self.errors.iter().find(|e| e.field == field)
    }

    /// The 422 `detail` array: `[{"loc", "msg", "type"}, ...]`
    pub fn to_json(&self) -> serde_json::Value {
        self.errors.iter().map(ValidationError::to_json).collect()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        write!(f, "{} validation error(s): {}", parts.len(), parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl IntoIterator for ValidationErrors {
    type Item = ValidationError;
    type IntoIter = std::vec::IntoIter<ValidationError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

// ============================================================================
// One failure
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Input source: `path`, `query`, `header`, `cookie` or `body`
    pub location: String,
    /// Dotted path below the source, e.g. `items.0.price`; empty for the
    /// source as a whole
    pub field: String,
    pub message: String,
    pub error_type: ErrorType,
}

impl ValidationError {
    pub fn new(location: String, field: String, message: String, error_type: ErrorType) -> Self {
        Self {
            location,
            field,
            message,
            error_type,
        }
    }

    pub fn type_error(location: String, field: String, message: String) -> Self {
        Self::new(location, field, message, ErrorType::TypeError)
    }

    pub fn value_error(location: String, field: String, message: String) -> Self {
        Self::new(location, field, message, ErrorType::ValueError)
    }

    pub fn missing_error(location: String, field: String) -> Self {
        Self::new(location, field, "Field required".to_string(), ErrorType::Missing)
    }

    /// Source followed by each component of the field path
    pub fn loc(&self) -> Vec<String> {
        std::iter::once(self.location.clone())
            .chain(self.field.split('.').filter(|part| !part.is_empty()).map(str::to_string))
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "loc": self.loc(),
            "msg": self.message,
            "type": self.error_type.as_str(),
        })
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} [{}]", self.loc().join("."), self.message, self.error_type)
    }
}

/// Machine-readable error kind, rendered as the `type` member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Coercion to the target type failed
    TypeError,
    /// A constraint rejected the value
    ValueError,
    Missing,
    ExtraForbidden,
    /// A string format (email, uuid, ...) did not match
    FormatError,
    JsonInvalid,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TypeError => "type_error",
            Self::ValueError => "value_error",
            Self::Missing => "missing",
            Self::ExtraForbidden => "extra_forbidden",
            Self::FormatError => "format_error",
            Self::JsonInvalid => "json_invalid",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Path tracking
// ============================================================================

/// Where the validator currently is: the source, then nested field names
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub path: Vec<String>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(location: &str) -> Self {
        Self {
            path: vec![location.to_string()],
        }
    }

    pub fn push(&mut self, field: &str) {
        self.path.push(field.to_string());
    }

    pub fn pop(&mut self) {
        self.path.pop();
    }

    pub fn location(&self) -> String {
        self.path.first().cloned().unwrap_or_default()
    }

    pub fn field(&self) -> String {
        self.path.get(1..).map(|rest| rest.join(".")).unwrap_or_default()
    }

    pub fn type_error(&self, message: impl Into<String>) -> ValidationError {
        ValidationError::type_error(self.location(), self.field(), message.into())
    }

    pub fn value_error(&self, message: impl Into<String>) -> ValidationError {
        ValidationError::value_error(self.location(), self.field(), message.into())
    }

    pub fn missing(&self) -> ValidationError {
        ValidationError::missing_error(self.location(), self.field())
    }
}
