//! HTTP request descriptor
//!
//! The transport decodes everything the core needs up front: method, path,
//! query pairs, lower-cased headers, cookies and the collected body. Nothing
//! here touches the network.

use crate::cookies::parse_cookie_header;
use bytes::Bytes;
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use turbo_common::HttpMethod;

/// Decoded incoming request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: HttpMethod,
    /// Path without the query string, still percent-encoded
    pub path: String,
    pub raw_query: Option<String>,
    /// Decoded query pairs in arrival order (keys may repeat)
    pub query: Vec<(String, String)>,
    /// Lower-cased header names
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub body: Bytes,
    /// `http` or `https`
    pub scheme: String,
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    /// Build a request from a method and a target such as `/items?limit=5`.
    pub fn new(method: HttpMethod, target: impl AsRef<str>) -> Self {
        let target = target.as_ref();
        let (path, raw_query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };
        let query = raw_query.as_deref().map(parse_query).unwrap_or_default();

        Self {
            method,
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            raw_query,
            query,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            body: Bytes::new(),
            scheme: "http".to_string(),
            remote_addr: None,
        }
    }

    /// Set a header. A `cookie` header also refreshes the cookie map.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert_header(name.as_ref(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// JSON body plus a matching content type
    pub fn with_json(self, value: &serde_json::Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub(crate) fn insert_header(&mut self, name: &str, value: String) {
        let name = name.to_ascii_lowercase();
        if name == "cookie" {
            self.cookies.extend(parse_cookie_header(&value));
        }
        self.headers.insert(name, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// First value of a query key
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a repeated query key
    pub fn query_params_all(&self, key: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_json(&self) -> bool {
        self.content_type()
            .map(|ct| ct.contains("application/json") || ct.contains("+json"))
            .unwrap_or(false)
    }

    pub fn is_form(&self) -> bool {
        self.content_type()
            .map(|ct| ct.contains("application/x-www-form-urlencoded"))
            .unwrap_or(false)
    }

    /// `host` header without the port
    pub fn host(&self) -> Option<&str> {
        let host = self.header("host")?;
        Some(match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        })
    }

    /// Path plus the raw query, as the client sent it
    pub fn target(&self) -> String {
        match &self.raw_query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

/// Decode a query component: `+` is a space, then percent-decoding.
///
/// Borrows when nothing needs decoding.
pub fn decode_query_component(s: &str) -> Cow<'_, str> {
    if !s.contains('+') && !s.contains('%') {
        return Cow::Borrowed(s);
    }

    if s.contains('+') {
        let with_spaces = s.replace('+', " ");
        match urlencoding::decode(&with_spaces) {
            Ok(decoded) => Cow::Owned(decoded.into_owned()),
            Err(_) => Cow::Owned(with_spaces),
        }
    } else {
        match urlencoding::decode(s) {
            Ok(decoded) => decoded,
            Err(_) => Cow::Borrowed(s),
        }
    }
}

/// Split an `a=1&b=2` string into decoded pairs.
///
/// Used for query strings and url-encoded form bodies. A key without `=`
/// maps to the empty string.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (
                decode_query_component(key).into_owned(),
                decode_query_component(value).into_owned(),
            ),
            None => (decode_query_component(pair).into_owned(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_splits_query() {
        let req = Request::new(HttpMethod::Get, "/search?q=rust+lang&tag=a&tag=b%20c&flag");
        assert_eq!(req.path, "/search");
        assert_eq!(req.query_param("q"), Some("rust lang"));
        assert_eq!(req.query_params_all("tag"), vec!["a", "b c"]);
        assert_eq!(req.query_param("flag"), Some(""));
        assert_eq!(req.target(), "/search?q=rust+lang&tag=a&tag=b%20c&flag");
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let req = Request::new(HttpMethod::Get, "/").with_header("X-Api-Key", "k");
        assert_eq!(req.header("x-api-key"), Some("k"));
        assert_eq!(req.header("X-API-KEY"), Some("k"));
    }

    #[test]
    fn test_cookie_header_populates_cookies() {
        let req = Request::new(HttpMethod::Get, "/").with_header("Cookie", "sid=42; theme=dark");
        assert_eq!(req.cookie("sid"), Some("42"));
        assert_eq!(req.cookie("theme"), Some("dark"));
    }

    #[test]
    fn test_json_helpers() {
        let req = Request::new(HttpMethod::Post, "/items").with_json(&serde_json::json!({"a": 1}));
        assert!(req.is_json());
        assert_eq!(&req.body[..], b"{\"a\":1}");
    }

    #[test]
    fn test_host_strips_port() {
        let req = Request::new(HttpMethod::Get, "/").with_header("host", "api.example.com:8443");
        assert_eq!(req.host(), Some("api.example.com"));
    }

    #[test]
    fn test_decode_query_component_borrows_plain_text() {
        assert!(matches!(decode_query_component("plain"), Cow::Borrowed(_)));
        assert_eq!(decode_query_component("a%2Fb"), "a/b");
    }
}
