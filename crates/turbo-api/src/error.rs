//! Error types
//!
//! [`ApiError`] covers everything that can end a request early and knows how
//! to render itself as a `{"detail": ...}` response. [`RegistrationError`] is
//! returned from `AppBuilder::build` and never produced while serving.

use crate::response::Response;
use turbo_common::{HttpMethod, HttpStatus};
use turbo_validation::ValidationErrors;

/// Result type alias for request-time operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Request-time errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No route for {method} {path}")]
    NotFound { method: HttpMethod, path: String },

    #[error("Method not allowed (allowed: {})", join_methods(.allowed))]
    MethodNotAllowed { allowed: Vec<HttpMethod> },

    #[error("Validation error: {0}")]
    Validation(ValidationErrors),

    /// A dependency callable failed; the wrapped error decides status and body.
    #[error("Dependency `{dependency}` failed: {source}")]
    Dependency {
        dependency: String,
        #[source]
        source: Box<ApiError>,
    },

    /// Deliberate HTTP error raised by application code.
    #[error("HTTP {status}: {detail}")]
    Http {
        status: u16,
        detail: serde_json::Value,
        headers: Vec<(String, String)>,
    },

    /// Unhandled handler failure. The message is logged, never sent by default.
    #[error("Handler error: {0:#}")]
    Handler(#[from] anyhow::Error),

    #[error("Handler panicked: {0}")]
    Panic(String),

    /// The handler's return value did not fit its declared response model.
    #[error("Response validation failed: {0}")]
    ResponseValidation(ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_methods(methods: &[HttpMethod]) -> String {
    methods
        .iter()
        .map(HttpMethod::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ApiError {
    /// An HTTP error with a plain-text detail.
    pub fn http(status: u16, detail: impl Into<String>) -> Self {
        Self::Http {
            status,
            detail: serde_json::Value::String(detail.into()),
            headers: Vec::new(),
        }
    }

    /// An HTTP error whose detail is the status' reason phrase.
    pub fn status(status: u16) -> Self {
        Self::http(status, HttpStatus(status).reason())
    }

    /// Attach a response header. Only meaningful on [`ApiError::Http`]; other
    /// variants are returned unchanged.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::Http { headers, .. } = &mut self {
            headers.push((name.into().to_ascii_lowercase(), value.into()));
        }
        self
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::MethodNotAllowed { .. } => 405,
            Self::Validation(_) => 422,
            Self::Dependency { source, .. } => source.status_code(),
            Self::Http { status, .. } => *status,
            Self::BadRequest(_) => 400,
            Self::PayloadTooLarge { .. } => 413,
            Self::Handler(_)
            | Self::Panic(_)
            | Self::ResponseValidation(_)
            | Self::Serialization(_)
            | Self::Internal(_) => 500,
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// Extra headers carried by the error
    pub fn headers(&self) -> Vec<(String, String)> {
        match self {
            Self::MethodNotAllowed { allowed } => {
                vec![("allow".to_string(), join_methods(allowed))]
            }
            Self::Http { headers, .. } => headers.clone(),
            Self::Dependency { source, .. } => source.headers(),
            _ => Vec::new(),
        }
    }

    /// The `detail` member of the error body.
    ///
    /// Server errors only expose their message when `debug` is set.
    pub fn detail(&self, debug: bool) -> serde_json::Value {
        match self {
            Self::NotFound { .. } | Self::MethodNotAllowed { .. } => {
                serde_json::Value::String(HttpStatus(self.status_code()).reason().to_string())
            }
            Self::Validation(errors) => errors.to_json(),
            Self::Dependency { source, .. } => source.detail(debug),
            Self::Http { detail, .. } => detail.clone(),
            Self::BadRequest(msg) => serde_json::Value::String(msg.clone()),
            Self::PayloadTooLarge { .. } => serde_json::Value::String(self.to_string()),
            _ if debug => serde_json::Value::String(self.to_string()),
            _ => serde_json::Value::String(HttpStatus(500).reason().to_string()),
        }
    }

    /// Render as a JSON error response
    pub fn to_response(&self, debug: bool) -> Response {
        let mut response = Response::json(&serde_json::json!({ "detail": self.detail(debug) }))
            .with_status(self.status_code());
        for (name, value) in self.headers() {
            response.append_header(name, value);
        }
        response
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}

/// Errors detected while building an application
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Route {method} {template} is registered twice")]
    DuplicateRoute { method: HttpMethod, template: String },

    #[error("Invalid path template `{template}`: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("Route {0} has no handler")]
    MissingHandler(String),

    #[error("Invalid parameter `{name}` on {route}: {reason}")]
    InvalidParameter {
        route: String,
        name: String,
        reason: String,
    },

    #[error("Invalid pattern `{pattern}` for parameter `{name}` on {route}: {reason}")]
    InvalidPattern {
        route: String,
        name: String,
        pattern: String,
        reason: String,
    },

    #[error("Dependency `{0}` is registered twice")]
    DuplicateDependency(String),

    #[error("Unknown dependency `{name}` required by `{required_by}`")]
    UnknownDependency { name: String, required_by: String },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use turbo_validation::ValidationError;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::NotFound {
                method: HttpMethod::Get,
                path: "/x".into()
            }
            .status_code(),
            404
        );
        assert_eq!(ApiError::MethodNotAllowed { allowed: vec![] }.status_code(), 405);
        assert_eq!(ApiError::Validation(ValidationErrors::new()).status_code(), 422);
        assert_eq!(ApiError::http(418, "teapot").status_code(), 418);
        assert_eq!(ApiError::Handler(anyhow::anyhow!("boom")).status_code(), 500);
        assert_eq!(ApiError::PayloadTooLarge { limit: 1 }.status_code(), 413);
    }

    #[test]
    fn test_dependency_error_takes_source_status_and_headers() {
        let err = ApiError::Dependency {
            dependency: "token".into(),
            source: Box::new(
                ApiError::http(401, "Not authenticated").with_header("WWW-Authenticate", "Bearer"),
            ),
        };
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.headers(), vec![("www-authenticate".to_string(), "Bearer".to_string())]);
        assert_eq!(err.detail(false), serde_json::json!("Not authenticated"));
    }

    #[test]
    fn test_handler_message_hidden_unless_debug() {
        let err = ApiError::Handler(anyhow::anyhow!("db password wrong"));
        assert_eq!(err.detail(false), serde_json::json!("Internal Server Error"));
        assert!(err.detail(true).as_str().unwrap().contains("db password wrong"));
    }

    #[test]
    fn test_method_not_allowed_allow_header() {
        let err = ApiError::MethodNotAllowed {
            allowed: vec![HttpMethod::Get, HttpMethod::Post],
        };
        assert_eq!(err.headers(), vec![("allow".to_string(), "GET, POST".to_string())]);
        assert_eq!(err.detail(false), serde_json::json!("Method Not Allowed"));
    }

    #[test]
    fn test_validation_detail_lists_fields() {
        let mut errors = ValidationErrors::new();
        errors.add(ValidationError::type_error(
            "path".into(),
            "item_id".into(),
            "invalid integer".into(),
        ));
        let response = ApiError::Validation(errors).to_response(false);
        assert_eq!(response.status(), 422);
        let body: serde_json::Value =
            serde_json::from_slice(response.body_bytes().unwrap()).unwrap();
        assert_eq!(body["detail"][0]["loc"], serde_json::json!(["path", "item_id"]));
    }

    #[test]
    fn test_registration_error_messages() {
        let err = RegistrationError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Dependency cycle: a -> b -> a");
    }
}
