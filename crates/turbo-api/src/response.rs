//! HTTP response representation
//!
//! A [`Response`] is the `(status, headers, body)` triple handed back to the
//! transport. Header names are stored lower-cased; the same name may appear
//! more than once (`set-cookie`, `vary`).

use crate::cookies::Cookie;
use crate::error::ApiError;
use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use turbo_validation::Value;

/// Error type carried by streaming bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lazy, non-restartable sequence of body chunks
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

// ============================================================================
// Body
// ============================================================================

/// Response body variants
pub enum Body {
    /// No body (204, HEAD, redirects)
    Empty,
    /// Fully buffered bytes
    Full(Bytes),
    /// Chunked body, possibly indefinite (SSE)
    Stream(BodyStream),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Full(bytes) => bytes.is_empty(),
            Body::Stream(_) => false,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// HTTP response
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Body,
}

impl Response {
    /// Empty response with the given status
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// 200 with a JSON body
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200)
            .with_header("content-type", "application/json")
            .with_body(Body::Full(Bytes::from(value.to_string())))
    }

    /// 200 with a JSON body from any serializable type
    pub fn json_from<T: Serialize>(value: &T) -> Result<Self, ApiError> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::new(200)
            .with_header("content-type", "application/json")
            .with_body(Body::Full(Bytes::from(bytes))))
    }

    /// 200 with a plain-text body
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(200)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(Body::Full(Bytes::from(body.into())))
    }

    /// 200 with an HTML body
    pub fn html(body: impl Into<String>) -> Self {
        Self::new(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body(Body::Full(Bytes::from(body.into())))
    }

    /// 200 with raw bytes
    pub fn bytes(body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self::new(200)
            .with_header("content-type", content_type)
            .with_body(Body::Full(body.into()))
    }

    /// 200 with a streaming body
    pub fn stream<S>(stream: S, content_type: impl Into<String>) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self::new(200)
            .with_header("content-type", content_type)
            .with_body(Body::Stream(Box::pin(stream)))
    }

    pub fn no_content() -> Self {
        Self::new(204)
    }

    /// 307 Temporary Redirect
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::new(307).with_header("location", location)
    }

    /// Render an error as `{"detail": ...}`
    pub fn error(error: &ApiError, debug: bool) -> Self {
        error.to_response(debug)
    }

    // ------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Set a header, replacing any existing value
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_cookie(mut self, cookie: &Cookie) -> Self {
        self.set_cookie(cookie);
        self
    }

    // ------------------------------------------------------------------
    // Accessors and mutation
    // ------------------------------------------------------------------

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// First value of a header (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        self.headers.retain(|(k, _)| *k != name);
        self.headers.push((name, value.into()));
    }

    /// Add a header without touching existing values of the same name
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into().to_ascii_lowercase(), value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn set_cookie(&mut self, cookie: &Cookie) {
        self.append_header("set-cookie", cookie.to_header_value());
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Take the body out, leaving it empty
    pub fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::Empty)
    }

    /// Buffered body bytes; `None` for streams
    pub fn body_bytes(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Empty => Some(&[]),
            Body::Full(bytes) => Some(bytes),
            Body::Stream(_) => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    pub fn into_parts(self) -> (u16, Vec<(String, String)>, Body) {
        (self.status, self.headers, self.body)
    }
}

// ============================================================================
// Reply
// ============================================================================

/// What a handler returns
///
/// Json and Value replies go through response shaping (response model,
/// route status code); a full [`Response`] is sent as-is.
#[derive(Debug)]
pub enum Reply {
    Json(serde_json::Value),
    Value(Value),
    Response(Response),
}

impl Reply {
    /// Serialize any `Serialize` type into a JSON reply
    pub fn json<T: Serialize>(value: &T) -> Result<Self, ApiError> {
        Ok(Reply::Json(serde_json::to_value(value)?))
    }

    /// The reply as a validation value, if it is not a full response
    pub(crate) fn into_value(self) -> Result<Value, Response> {
        match self {
            Reply::Json(json) => Ok(Value::from(json)),
            Reply::Value(value) => Ok(value),
            Reply::Response(response) => Err(response),
        }
    }
}

impl From<serde_json::Value> for Reply {
    fn from(value: serde_json::Value) -> Self {
        Reply::Json(value)
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Response(response)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::Response(Response::text(text))
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Response(Response::text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_response() {
        let response = Response::json(&json!({"ok": true}));
        assert_eq!(response.status(), 200);
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        assert_eq!(response.body_bytes(), Some(&b"{\"ok\":true}"[..]));
    }

    #[test]
    fn test_set_header_replaces_append_keeps() {
        let mut response = Response::text("hi").with_header("X-Trace", "1");
        response.set_header("x-trace", "2");
        response.append_header("Vary", "Origin");
        response.append_header("vary", "Accept-Encoding");

        assert_eq!(response.header("x-trace"), Some("2"));
        assert_eq!(response.header_values("vary").count(), 2);
        response.remove_header("VARY");
        assert!(response.header("vary").is_none());
    }

    #[test]
    fn test_cookies_are_appended() {
        let response = Response::no_content()
            .with_cookie(&Cookie::new("a", "1"))
            .with_cookie(&Cookie::new("b", "2"));
        assert_eq!(response.status(), 204);
        assert_eq!(response.header_values("set-cookie").count(), 2);
    }

    #[test]
    fn test_stream_has_no_buffered_bytes() {
        let chunks = futures_util::stream::iter(vec![Ok::<_, BoxError>(Bytes::from("a"))]);
        let response = Response::stream(chunks, "text/plain");
        assert!(response.is_stream());
        assert!(response.body_bytes().is_none());
    }

    #[test]
    fn test_reply_conversions() {
        #[derive(Serialize)]
        struct Item {
            id: u32,
        }
        match Reply::json(&Item { id: 3 }).unwrap() {
            Reply::Json(v) => assert_eq!(v, json!({"id": 3})),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(matches!(Reply::from("plain"), Reply::Response(_)));
    }
}
