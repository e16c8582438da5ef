//! Middleware chain and built-in middleware
//!
//! Middleware wraps the whole pipeline. `before_request` hooks run in
//! registration order and may halt the request with their own response;
//! `after_response` hooks run in reverse order, and only for the middleware
//! whose `before_request` completed.
//!
//! Built-ins:
//! - [`CorsMiddleware`]: CORS headers and preflight answers
//! - [`TrustedHostMiddleware`]: rejects unexpected `Host` headers
//! - [`GZipMiddleware`]: gzip for buffered bodies
//! - [`HttpsRedirectMiddleware`]: redirects plain http to https
//! - [`BasicAuthMiddleware`]: HTTP Basic authentication
//! - [`JwtAuthMiddleware`]: HS256 bearer tokens
//! - [`RateLimitMiddleware`]: fixed-window limit per client address

use crate::error::{ApiError, ApiResult};
use crate::request::Request;
use crate::response::{Body, Response};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;
use turbo_common::HttpMethod;

// ============================================================================
// Middleware Trait
// ============================================================================

/// Request/response hooks around dispatch
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in log fields
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Runs before routing. Returning `Ok(Some(response))` or an error halts
    /// the request; later middleware and the handler are skipped.
    async fn before_request(&self, _req: &mut Request) -> ApiResult<Option<Response>> {
        Ok(None)
    }

    /// Runs after the response is produced, in reverse registration order
    async fn after_response(&self, _req: &Request, _res: &mut Response) -> ApiResult<()> {
        Ok(())
    }
}

/// Result of running the `before_request` hooks
pub enum BeforeOutcome {
    /// Every hook passed
    Continue,
    /// Hook number `depth` halted the request
    Halted {
        depth: usize,
        result: ApiResult<Response>,
    },
}

/// Ordered list of middleware
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(Arc::new(middleware));
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run `before_request` hooks in order until one halts
    pub async fn process_request(&self, req: &mut Request) -> BeforeOutcome {
        for (depth, middleware) in self.middlewares.iter().enumerate() {
            match middleware.before_request(req).await {
                Ok(None) => {}
                Ok(Some(response)) => {
                    debug!(middleware = middleware.name(), status = response.status(), "Middleware answered request");
                    return BeforeOutcome::Halted {
                        depth,
                        result: Ok(response),
                    };
                }
                Err(err) => {
                    debug!(middleware = middleware.name(), error = %err, "Middleware rejected request");
                    return BeforeOutcome::Halted {
                        depth,
                        result: Err(err),
                    };
                }
            }
        }
        BeforeOutcome::Continue
    }

    /// Run `after_response` hooks of the first `depth` middleware, last first
    pub async fn process_response(&self, depth: usize, req: &Request, res: &mut Response) -> ApiResult<()> {
        let depth = depth.min(self.middlewares.len());
        for middleware in self.middlewares[..depth].iter().rev() {
            middleware.after_response(req, res).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.middlewares.iter().map(|m| m.name()))
            .finish()
    }
}

// ============================================================================
// CORS Middleware
// ============================================================================

/// CORS configuration
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Allowed origins (`*` for any)
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    /// Allowed request headers (`*` echoes what the client asked for)
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    /// Preflight cache lifetime in seconds
    pub max_age: Option<u32>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: HttpMethod::ALL.iter().map(|m| m.as_str().to_string()).collect(),
            allowed_headers: vec!["*".to_string()],
            exposed_headers: Vec::new(),
            allow_credentials: false,
            max_age: Some(600),
        }
    }
}

impl CorsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_any_origin(mut self) -> Self {
        self.allowed_origins = vec!["*".to_string()];
        self
    }

    pub fn origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn expose<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exposed_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == "*" || o == origin)
    }

    fn any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    fn is_method_allowed(&self, method: &str) -> bool {
        self.allowed_methods
            .iter()
            .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
    }

    /// `Access-Control-Allow-Origin` value for an allowed origin.
    /// Credentialed responses must name the origin instead of `*`.
    fn origin_value(&self, origin: &str) -> String {
        if self.any_origin() && !self.allow_credentials {
            "*".to_string()
        } else {
            origin.to_string()
        }
    }
}

/// CORS middleware
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    config: CorsConfig,
}

impl CorsMiddleware {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    /// Allows every origin, method and header
    pub fn permissive() -> Self {
        Self::new(CorsConfig::default())
    }

    /// Only the given origins, with credentials
    pub fn restrictive(origins: Vec<String>) -> Self {
        Self::new(CorsConfig::new().origins(origins).allow_credentials(true))
    }

    pub fn config(&self) -> &CorsConfig {
        &self.config
    }

    fn preflight(&self, req: &Request, origin: &str, requested_method: &str) -> Response {
        let mut failures = Vec::new();
        if !self.config.is_origin_allowed(origin) {
            failures.push("origin");
        }
        if !self.config.is_method_allowed(requested_method) {
            failures.push("method");
        }

        let requested_headers = req.header("access-control-request-headers").unwrap_or("");
        let allow_headers = if self.config.allowed_headers.iter().any(|h| h == "*") {
            requested_headers.to_string()
        } else {
            let rejected = requested_headers
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .any(|h| !self.config.allowed_headers.iter().any(|a| a.eq_ignore_ascii_case(h)));
            if rejected {
                failures.push("headers");
            }
            self.config.allowed_headers.join(", ")
        };

        if !failures.is_empty() {
            return Response::text(format!("Disallowed CORS {}", failures.join(", "))).with_status(400);
        }

        let mut res = Response::text("OK")
            .with_header("access-control-allow-origin", self.config.origin_value(origin))
            .with_header("access-control-allow-methods", self.config.allowed_methods.join(", "));
        if !allow_headers.is_empty() {
            res.set_header("access-control-allow-headers", allow_headers);
        }
        if let Some(max_age) = self.config.max_age {
            res.set_header("access-control-max-age", max_age.to_string());
        }
        if self.config.allow_credentials {
            res.set_header("access-control-allow-credentials", "true");
        }
        if !self.config.any_origin() || self.config.allow_credentials {
            res.append_header("vary", "Origin");
        }
        res
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &str {
        "cors"
    }

    async fn before_request(&self, req: &mut Request) -> ApiResult<Option<Response>> {
        if req.method != HttpMethod::Options {
            return Ok(None);
        }
        let (Some(origin), Some(method)) = (req.header("origin"), req.header("access-control-request-method")) else {
            return Ok(None);
        };
        Ok(Some(self.preflight(req, origin, method)))
    }

    async fn after_response(&self, req: &Request, res: &mut Response) -> ApiResult<()> {
        let Some(origin) = req.header("origin") else {
            return Ok(());
        };
        // Preflight answers already carry their headers
        if res.header("access-control-allow-origin").is_some() || !self.config.is_origin_allowed(origin) {
            return Ok(());
        }

        res.set_header("access-control-allow-origin", self.config.origin_value(origin));
        if self.config.allow_credentials {
            res.set_header("access-control-allow-credentials", "true");
        }
        if !self.config.exposed_headers.is_empty() {
            res.set_header("access-control-expose-headers", self.config.exposed_headers.join(", "));
        }
        if !self.config.any_origin() || self.config.allow_credentials {
            res.append_header("vary", "Origin");
        }
        Ok(())
    }
}

// ============================================================================
// Trusted Host Middleware
// ============================================================================

/// Rejects requests whose `Host` header is not in the allow list
///
/// Patterns are exact host names, `*` for any host, or `*.example.com` for
/// any subdomain of `example.com`.
#[derive(Debug, Clone)]
pub struct TrustedHostMiddleware {
    allowed_hosts: Vec<String>,
}

impl TrustedHostMiddleware {
    pub fn new<I, S>(allowed_hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_host_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.allowed_hosts.iter().any(|pattern| {
            if pattern == "*" {
                true
            } else if let Some(suffix) = pattern.strip_prefix('*') {
                host.ends_with(suffix)
            } else {
                *pattern == host
            }
        })
    }
}

#[async_trait]
impl Middleware for TrustedHostMiddleware {
    fn name(&self) -> &str {
        "trusted_host"
    }

    async fn before_request(&self, req: &mut Request) -> ApiResult<Option<Response>> {
        match req.host() {
            Some(host) if self.is_host_allowed(host) => Ok(None),
            _ => Ok(Some(Response::text("Invalid host header").with_status(400))),
        }
    }
}

// ============================================================================
// GZip Middleware
// ============================================================================

/// Gzip-compresses buffered bodies for clients that accept it
#[derive(Debug, Clone)]
pub struct GZipMiddleware {
    minimum_size: usize,
    level: u32,
}

impl Default for GZipMiddleware {
    fn default() -> Self {
        Self {
            minimum_size: 500,
            level: 6,
        }
    }
}

impl GZipMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bodies smaller than this are sent as-is
    pub fn minimum_size(mut self, bytes: usize) -> Self {
        self.minimum_size = bytes;
        self
    }

    /// Compression level, 0 (none) to 9 (best)
    pub fn level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    fn accepts_gzip(req: &Request) -> bool {
        req.header("accept-encoding")
            .map(|v| v.split(',').any(|enc| enc.trim().starts_with("gzip")))
            .unwrap_or(false)
    }
}

/// Compress data using GZip
pub fn compress_gzip(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish()
}

#[async_trait]
impl Middleware for GZipMiddleware {
    fn name(&self) -> &str {
        "gzip"
    }

    async fn after_response(&self, req: &Request, res: &mut Response) -> ApiResult<()> {
        if !Self::accepts_gzip(req) || res.header("content-encoding").is_some() {
            return Ok(());
        }
        let compressed = match res.body_bytes() {
            Some(bytes) if bytes.len() >= self.minimum_size => compress_gzip(bytes, self.level)
                .map_err(|e| ApiError::Internal(format!("gzip failed: {}", e)))?,
            _ => return Ok(()),
        };

        res.set_body(Body::Full(Bytes::from(compressed)));
        res.remove_header("content-length");
        res.set_header("content-encoding", "gzip");
        res.append_header("vary", "Accept-Encoding");
        Ok(())
    }
}

// ============================================================================
// HTTPS Redirect Middleware
// ============================================================================

/// Redirects `http` requests to the same URL over `https`
#[derive(Debug, Clone, Default)]
pub struct HttpsRedirectMiddleware;

impl HttpsRedirectMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for HttpsRedirectMiddleware {
    fn name(&self) -> &str {
        "https_redirect"
    }

    async fn before_request(&self, req: &mut Request) -> ApiResult<Option<Response>> {
        if req.scheme != "http" {
            return Ok(None);
        }
        let host = req
            .header("host")
            .ok_or_else(|| ApiError::BadRequest("Missing host header".to_string()))?;
        let host = host.strip_suffix(":80").unwrap_or(host);
        Ok(Some(Response::redirect(format!("https://{}{}", host, req.target()))))
    }
}

// ============================================================================
// Basic Auth Middleware
// ============================================================================

/// HTTP Basic authentication against a fixed credential map
#[derive(Clone)]
pub struct BasicAuthMiddleware {
    credentials: HashMap<String, String>,
    realm: String,
    excluded_paths: Vec<String>,
}

impl BasicAuthMiddleware {
    pub fn new(credentials: HashMap<String, String>) -> Self {
        Self {
            credentials,
            realm: "Restricted".to_string(),
            excluded_paths: Vec::new(),
        }
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// Paths served without authentication
    pub fn exclude(mut self, path: impl Into<String>) -> Self {
        self.excluded_paths.push(path.into());
        self
    }

    fn challenge(&self) -> ApiError {
        ApiError::http(401, "Unauthorized")
            .with_header("www-authenticate", format!("Basic realm=\"{}\"", self.realm))
    }

    /// Decode `Basic <base64(user:pass)>`
    fn decode(header: &str) -> Option<(String, String)> {
        let (scheme, encoded) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}

impl fmt::Debug for BasicAuthMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthMiddleware")
            .field("users", &self.credentials.len())
            .field("realm", &self.realm)
            .field("excluded_paths", &self.excluded_paths)
            .finish()
    }
}

#[async_trait]
impl Middleware for BasicAuthMiddleware {
    fn name(&self) -> &str {
        "basic_auth"
    }

    async fn before_request(&self, req: &mut Request) -> ApiResult<Option<Response>> {
        if is_excluded(&self.excluded_paths, &req.path) {
            return Ok(None);
        }
        let (user, pass) = req
            .header("authorization")
            .and_then(Self::decode)
            .ok_or_else(|| self.challenge())?;
        match self.credentials.get(&user) {
            Some(expected) if *expected == pass => Ok(None),
            _ => Err(self.challenge()),
        }
    }
}

/// Excluded paths match by prefix: `/health` also covers `/health/live`
fn is_excluded(excluded: &[String], path: &str) -> bool {
    excluded.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

// ============================================================================
// JWT Auth Middleware
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Claims of a verified token
pub type JwtClaims = serde_json::Map<String, serde_json::Value>;

/// HS256 bearer-token authentication
///
/// On success the token's `sub` claim is copied into the `x-auth-subject`
/// request header (any client-sent value is removed first), where handlers
/// read it like any other header parameter.
#[derive(Clone)]
pub struct JwtAuthMiddleware {
    secret: Vec<u8>,
    header_name: String,
    token_type: String,
    subject_header: String,
    excluded_paths: Vec<String>,
}

impl JwtAuthMiddleware {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            header_name: "authorization".to_string(),
            token_type: "Bearer".to_string(),
            subject_header: "x-auth-subject".to_string(),
            excluded_paths: Vec::new(),
        }
    }

    /// Header carrying the token (default `authorization`)
    pub fn header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into().to_ascii_lowercase();
        self
    }

    /// Scheme before the token (default `Bearer`)
    pub fn token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    pub fn subject_header(mut self, name: impl Into<String>) -> Self {
        self.subject_header = name.into().to_ascii_lowercase();
        self
    }

    /// Paths served without a token
    pub fn exclude(mut self, path: impl Into<String>) -> Self {
        self.excluded_paths.push(path.into());
        self
    }

    /// Sign `claims` into a compact HS256 token
    pub fn encode(&self, claims: &serde_json::Value) -> ApiResult<String> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let message = format!("{}.{}", header, payload);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&message)?.finalize().into_bytes());
        Ok(format!("{}.{}", message, signature))
    }

    /// Check the signature, the algorithm and the `exp`/`nbf` claims
    pub fn verify(&self, token: &str) -> ApiResult<JwtClaims> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(self.challenge("Invalid token"));
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| self.challenge("Invalid token"))?;
        self.mac(&format!("{}.{}", header, payload))?
            .verify_slice(&signature)
            .map_err(|_| self.challenge("Invalid token signature"))?;

        let header = self.decode_segment(header)?;
        if header.get("alg").and_then(|alg| alg.as_str()) != Some("HS256") {
            return Err(self.challenge("Unsupported token algorithm"));
        }

        let claims = match self.decode_segment(payload)? {
            serde_json::Value::Object(claims) => claims,
            _ => return Err(self.challenge("Invalid token")),
        };
        let now = unix_now();
        if let Some(exp) = claims.get("exp").and_then(|v| v.as_i64()) {
            if now >= exp {
                return Err(self.challenge("Token has expired"));
            }
        }
        if let Some(nbf) = claims.get("nbf").and_then(|v| v.as_i64()) {
            if now < nbf {
                return Err(self.challenge("Token is not yet valid"));
            }
        }
        Ok(claims)
    }

    fn mac(&self, message: &str) -> ApiResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ApiError::Internal(format!("hmac key rejected: {}", e)))?;
        mac.update(message.as_bytes());
        Ok(mac)
    }

    fn decode_segment(&self, segment: &str) -> ApiResult<serde_json::Value> {
        URL_SAFE_NO_PAD
            .decode(segment)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(|| self.challenge("Invalid token"))
    }

    fn challenge(&self, detail: &str) -> ApiError {
        ApiError::http(401, detail).with_header("www-authenticate", self.token_type.clone())
    }

    fn token<'a>(&self, value: &'a str) -> Option<&'a str> {
        let (scheme, token) = value.trim().split_once(' ')?;
        scheme.eq_ignore_ascii_case(&self.token_type).then(|| token.trim())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl fmt::Debug for JwtAuthMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuthMiddleware")
            .field("header_name", &self.header_name)
            .field("token_type", &self.token_type)
            .field("excluded_paths", &self.excluded_paths)
            .finish()
    }
}

#[async_trait]
impl Middleware for JwtAuthMiddleware {
    fn name(&self) -> &str {
        "jwt_auth"
    }

    async fn before_request(&self, req: &mut Request) -> ApiResult<Option<Response>> {
        req.headers.remove(&self.subject_header);
        if is_excluded(&self.excluded_paths, &req.path) {
            return Ok(None);
        }
        let token = req
            .header(&self.header_name)
            .and_then(|value| self.token(value))
            .ok_or_else(|| self.challenge("Not authenticated"))?
            .to_string();

        let claims = self.verify(&token).map_err(|err| {
            debug!(path = %req.path, error = %err, "Rejected bearer token");
            err
        })?;
        if let Some(subject) = claims.get("sub") {
            let subject = match subject {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            req.headers.insert(self.subject_header.clone(), subject);
        }
        Ok(None)
    }
}

// ============================================================================
// Rate Limit Middleware
// ============================================================================

/// Stale windows are swept once the table grows past this
const RATE_LIMIT_SWEEP_AT: usize = 1024;

/// Fixed-window request limit per client
///
/// The client is the first `x-forwarded-for` entry, then `x-real-ip`, then
/// the peer address. Over the limit the request gets a 429 with
/// `retry-after`.
pub struct RateLimitMiddleware {
    max_requests: u32,
    window: Duration,
    clients: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimitMiddleware {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_second(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Parse a limit like `"10/minute"` or `"100/hour"`
    pub fn parse(limit: &str) -> Option<Self> {
        let (count, unit) = limit.split_once('/')?;
        let count: u32 = count.trim().parse().ok()?;
        let window = match unit.trim().to_ascii_lowercase().as_str() {
            "second" | "sec" | "s" => Duration::from_secs(1),
            "minute" | "min" | "m" => Duration::from_secs(60),
            "hour" | "hr" | "h" => Duration::from_secs(3600),
            "day" | "d" => Duration::from_secs(86400),
            _ => return None,
        };
        Some(Self::new(count, window))
    }

    fn client_key(req: &Request) -> String {
        if let Some(forwarded) = req.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').map(str::trim).find(|ip| !ip.is_empty()) {
                return first.to_string();
            }
        }
        if let Some(real_ip) = req.header("x-real-ip") {
            return real_ip.trim().to_string();
        }
        req.remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Count one request. `Err` holds the time left in the full window.
    fn check(&self, client: &str, now: Instant) -> Result<u32, Duration> {
        let mut clients = self.clients.lock();
        if clients.len() >= RATE_LIMIT_SWEEP_AT {
            let window = self.window;
            clients.retain(|_, (started, _)| now.duration_since(*started) < window);
        }

        let entry = clients.entry(client.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.max_requests {
            return Err(self.window.saturating_sub(now.duration_since(entry.0)));
        }
        entry.1 += 1;
        Ok(self.max_requests - entry.1)
    }
}

impl fmt::Debug for RateLimitMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitMiddleware")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("clients", &self.clients.lock().len())
            .finish()
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn before_request(&self, req: &mut Request) -> ApiResult<Option<Response>> {
        let client = Self::client_key(req);
        match self.check(&client, Instant::now()) {
            Ok(_) => Ok(None),
            Err(retry_after) => {
                debug!(client = %client, path = %req.path, "Rate limit exceeded");
                let seconds = retry_after.as_secs_f64().ceil().max(1.0) as u64;
                Err(ApiError::http(429, "Rate limit exceeded")
                    .with_header("retry-after", seconds.to_string())
                    .with_header("x-ratelimit-limit", self.max_requests.to_string())
                    .with_header("x-ratelimit-remaining", "0"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn request(method: HttpMethod, path: &str) -> Request {
        Request::new(method, path).with_header("host", "api.example.com")
    }

    #[test]
    fn test_cors_config_builder() {
        let config = CorsConfig::new()
            .origins(["https://example.com"])
            .methods(["GET", "POST"])
            .headers(["Content-Type", "Authorization"])
            .allow_credentials(true)
            .max_age(3600);

        assert!(config.is_origin_allowed("https://example.com"));
        assert!(!config.is_origin_allowed("https://other.com"));
        assert_eq!(config.allowed_methods.len(), 2);
        assert_eq!(config.max_age, Some(3600));
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let cors = CorsMiddleware::new(CorsConfig::new().origins(["https://app.example.com"]));
        let mut req = request(HttpMethod::Options, "/items")
            .with_header("origin", "https://app.example.com")
            .with_header("access-control-request-method", "POST")
            .with_header("access-control-request-headers", "content-type");

        let res = cors.before_request(&mut req).await.unwrap().unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.header("access-control-allow-origin"), Some("https://app.example.com"));
        assert!(res.header("access-control-allow-methods").unwrap().contains("POST"));
        assert_eq!(res.header("access-control-allow-headers"), Some("content-type"));
        assert_eq!(res.header("access-control-max-age"), Some("600"));
    }

    #[tokio::test]
    async fn test_cors_preflight_rejects_unknown_origin() {
        let cors = CorsMiddleware::new(CorsConfig::new().origins(["https://app.example.com"]));
        let mut req = request(HttpMethod::Options, "/items")
            .with_header("origin", "https://evil.example.org")
            .with_header("access-control-request-method", "GET");

        let res = cors.before_request(&mut req).await.unwrap().unwrap();
        assert_eq!(res.status(), 400);
    }

    #[tokio::test]
    async fn test_cors_simple_request_headers() {
        let cors = CorsMiddleware::restrictive(vec!["https://app.example.com".to_string()]);
        let req = request(HttpMethod::Get, "/").with_header("origin", "https://app.example.com");
        let mut res = Response::text("hi");
        cors.after_response(&req, &mut res).await.unwrap();

        assert_eq!(res.header("access-control-allow-origin"), Some("https://app.example.com"));
        assert_eq!(res.header("access-control-allow-credentials"), Some("true"));
        assert_eq!(res.header("vary"), Some("Origin"));
    }

    #[tokio::test]
    async fn test_trusted_host() {
        let mw = TrustedHostMiddleware::new(["example.com", "*.example.com"]);
        assert!(mw.is_host_allowed("example.com"));
        assert!(mw.is_host_allowed("api.example.com"));
        assert!(!mw.is_host_allowed("example.org"));

        let mut ok = request(HttpMethod::Get, "/");
        assert!(mw.before_request(&mut ok).await.unwrap().is_none());

        let mut bad = Request::new(HttpMethod::Get, "/").with_header("host", "evil.com:8080");
        let res = mw.before_request(&mut bad).await.unwrap().unwrap();
        assert_eq!(res.status(), 400);
        assert_eq!(res.body_bytes(), Some(&b"Invalid host header"[..]));
    }

    #[tokio::test]
    async fn test_gzip_compresses_large_bodies() {
        let gzip = GZipMiddleware::new().minimum_size(100);
        let req = request(HttpMethod::Get, "/").with_header("accept-encoding", "gzip, deflate");
        let text = "turbo ".repeat(100);
        let mut res = Response::text(text.clone());
        gzip.after_response(&req, &mut res).await.unwrap();

        assert_eq!(res.header("content-encoding"), Some("gzip"));
        assert_eq!(res.header("vary"), Some("Accept-Encoding"));
        let mut decoded = String::new();
        flate2::read::GzDecoder::new(res.body_bytes().unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, text);
    }

    #[tokio::test]
    async fn test_gzip_skips_small_or_unaccepted() {
        let gzip = GZipMiddleware::new();
        let accepting = request(HttpMethod::Get, "/").with_header("accept-encoding", "gzip");
        let mut small = Response::text("tiny");
        gzip.after_response(&accepting, &mut small).await.unwrap();
        assert!(small.header("content-encoding").is_none());

        let plain = request(HttpMethod::Get, "/");
        let mut large = Response::text("x".repeat(1000));
        gzip.after_response(&plain, &mut large).await.unwrap();
        assert!(large.header("content-encoding").is_none());
    }

    #[tokio::test]
    async fn test_https_redirect() {
        let mw = HttpsRedirectMiddleware::new();
        let mut req = Request::new(HttpMethod::Get, "/items?page=2").with_header("host", "example.com:80");
        let res = mw.before_request(&mut req).await.unwrap().unwrap();
        assert_eq!(res.status(), 307);
        assert_eq!(res.header("location"), Some("https://example.com/items?page=2"));

        let mut secure = req.clone().with_scheme("https");
        assert!(mw.before_request(&mut secure).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_basic_auth() {
        let mut users = HashMap::new();
        users.insert("admin".to_string(), "secret".to_string());
        let mw = BasicAuthMiddleware::new(users).realm("admin area").exclude("/health");

        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:secret");
        let mut ok = request(HttpMethod::Get, "/admin").with_header("authorization", format!("Basic {}", encoded));
        assert!(mw.before_request(&mut ok).await.unwrap().is_none());

        let mut missing = request(HttpMethod::Get, "/admin");
        let err = mw.before_request(&mut missing).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
        assert_eq!(
            err.headers(),
            vec![("www-authenticate".to_string(), "Basic realm=\"admin area\"".to_string())]
        );

        let wrong = base64::engine::general_purpose::STANDARD.encode("admin:guess");
        let mut bad = request(HttpMethod::Get, "/admin").with_header("authorization", format!("Basic {}", wrong));
        assert!(mw.before_request(&mut bad).await.is_err());

        let mut health = request(HttpMethod::Get, "/health");
        assert!(mw.before_request(&mut health).await.unwrap().is_none());

        let mut live = request(HttpMethod::Get, "/health/live");
        assert!(mw.before_request(&mut live).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_jwt_auth_accepts_signed_token() {
        let mw = JwtAuthMiddleware::new("s3cret").exclude("/docs");
        let token = mw
            .encode(&serde_json::json!({"sub": "ada", "exp": unix_now() + 60}))
            .unwrap();

        let mut req = request(HttpMethod::Get, "/me")
            .with_header("authorization", format!("Bearer {}", token))
            .with_header("x-auth-subject", "mallory");
        assert!(mw.before_request(&mut req).await.unwrap().is_none());
        assert_eq!(req.header("x-auth-subject"), Some("ada"));

        let mut docs = request(HttpMethod::Get, "/docs/openapi.json");
        assert!(mw.before_request(&mut docs).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_jwt_auth_rejections() {
        let mw = JwtAuthMiddleware::new("s3cret");

        let mut missing = request(HttpMethod::Get, "/me");
        let err = mw.before_request(&mut missing).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.headers(), vec![("www-authenticate".to_string(), "Bearer".to_string())]);

        let forged = JwtAuthMiddleware::new("other")
            .encode(&serde_json::json!({"sub": "ada"}))
            .unwrap();
        assert!(mw.verify(&forged).is_err());

        let expired = mw.encode(&serde_json::json!({"sub": "ada", "exp": unix_now() - 5})).unwrap();
        let mut req = request(HttpMethod::Get, "/me").with_header("authorization", format!("Bearer {}", expired));
        assert_eq!(mw.before_request(&mut req).await.unwrap_err().status_code(), 401);

        let token = mw.encode(&serde_json::json!({"sub": "ada"})).unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(mw.verify(&tampered).is_err());
        assert!(mw.verify("not-a-token").is_err());
        assert_eq!(mw.verify(&token).unwrap().get("sub"), Some(&serde_json::json!("ada")));
    }

    #[test]
    fn test_rate_limit_window() {
        let limiter = RateLimitMiddleware::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert_eq!(limiter.check("10.0.0.1", start), Ok(1));
        assert_eq!(limiter.check("10.0.0.1", start), Ok(0));
        let retry = limiter.check("10.0.0.1", start + Duration::from_secs(20)).unwrap_err();
        assert_eq!(retry, Duration::from_secs(40));

        assert_eq!(limiter.check("10.0.0.2", start), Ok(1));
        assert_eq!(limiter.check("10.0.0.1", start + Duration::from_secs(61)), Ok(1));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_by_forwarded_client() {
        let limiter = RateLimitMiddleware::parse("1/minute").unwrap();

        let mut first = request(HttpMethod::Get, "/items").with_header("x-forwarded-for", "203.0.113.7, 10.0.0.1");
        assert!(limiter.before_request(&mut first).await.unwrap().is_none());

        let mut second = request(HttpMethod::Get, "/items").with_header("x-forwarded-for", "203.0.113.7");
        let err = limiter.before_request(&mut second).await.unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert!(err.headers().iter().any(|(name, value)| name == "retry-after" && value == "60"));

        let mut other = request(HttpMethod::Get, "/items").with_header("x-real-ip", "198.51.100.1");
        assert!(limiter.before_request(&mut other).await.unwrap().is_none());

        assert!(RateLimitMiddleware::parse("ten/minute").is_none());
    }

    struct Tag(&'static str, Arc<parking_lot::Mutex<Vec<String>>>);

    #[async_trait]
    impl Middleware for Tag {
        async fn before_request(&self, _req: &mut Request) -> ApiResult<Option<Response>> {
            self.1.lock().push(format!("before {}", self.0));
            if self.0 == "halt" {
                return Ok(Some(Response::no_content()));
            }
            Ok(None)
        }

        async fn after_response(&self, _req: &Request, _res: &mut Response) -> ApiResult<()> {
            self.1.lock().push(format!("after {}", self.0));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_chain_order_and_halt() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.add(Tag("outer", log.clone()));
        chain.add(Tag("halt", log.clone()));
        chain.add(Tag("inner", log.clone()));

        let mut req = request(HttpMethod::Get, "/");
        let (depth, mut res) = match chain.process_request(&mut req).await {
            BeforeOutcome::Halted { depth, result } => (depth, result.unwrap()),
            BeforeOutcome::Continue => panic!("expected halt"),
        };
        assert_eq!(depth, 1);
        chain.process_response(depth, &req, &mut res).await.unwrap();

        assert_eq!(*log.lock(), vec!["before outer", "before halt", "after outer"]);
    }
}
