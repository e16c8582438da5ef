//! Parameter declarations and request binding
//!
//! Every route (and every dependency) declares the inputs it reads as
//! [`ParameterSpec`]s. At build time the specs of a route and of all the
//! dependencies in its plan are merged into one [`RequestBinder`]; per request
//! the binder pulls raw values out of the [`Request`], coerces them and checks
//! constraints. All failures are collected before returning.
//!
//! # Example
//!
//! ```rust
//! use turbo_api::params::{ParameterSpec, RequestBinder};
//! use turbo_api::Request;
//! use turbo_common::HttpMethod;
//! use turbo_validation::{TypeDescriptor, Value};
//!
//! let binder = RequestBinder::new(vec![
//!     ParameterSpec::path("item_id", TypeDescriptor::Int),
//!     ParameterSpec::query("limit", TypeDescriptor::Int).default(10),
//! ]);
//!
//! let req = Request::new(HttpMethod::Get, "/items/42");
//! let bound = binder.bind(&req, &[("item_id".into(), "42".into())]).unwrap();
//! assert_eq!(bound.get("item_id"), Some(&Value::Int(42)));
//! assert_eq!(bound.get_i64("limit"), Some(10));
//! ```

use crate::error::{ApiError, ApiResult, RegistrationError};
use crate::request::{parse_query, Request};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use turbo_validation::{
    validate_field, validate_value, CoercionMode, Constraint, ErrorType, FieldDescriptor, ModelSchema,
    TypeDescriptor, ValidationContext, ValidationError, ValidationErrors, Value,
};

// ============================================================================
// Parameter sources
// ============================================================================

/// Where a parameter is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamSource {
    Path,
    Query,
    Header,
    Cookie,
    Body,
}

impl ParamSource {
    /// Location tag used in error entries
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Cookie => "cookie",
            Self::Body => "body",
        }
    }
}

impl fmt::Display for ParamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ParameterSpec
// ============================================================================

/// One expected request input
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub source: ParamSource,
    pub field: FieldDescriptor,
    /// Body params only: look the value up by name even when it is the only one
    pub embed: bool,
    invalid_pattern: Option<(String, String)>,
}

impl ParameterSpec {
    pub fn new(source: ParamSource, name: impl Into<String>, type_desc: TypeDescriptor) -> Self {
        let mut field = FieldDescriptor::new(name, type_desc);
        if source == ParamSource::Header {
            field.alias = Some(field.name.replace('_', "-"));
        }
        Self {
            source,
            field,
            embed: false,
            invalid_pattern: None,
        }
    }

    pub fn path(name: impl Into<String>, type_desc: TypeDescriptor) -> Self {
        Self::new(ParamSource::Path, name, type_desc)
    }

    pub fn query(name: impl Into<String>, type_desc: TypeDescriptor) -> Self {
        Self::new(ParamSource::Query, name, type_desc)
    }

    /// Header parameter; the wire name turns `_` into `-` unless aliased.
    pub fn header(name: impl Into<String>, type_desc: TypeDescriptor) -> Self {
        Self::new(ParamSource::Header, name, type_desc)
    }

    pub fn cookie(name: impl Into<String>, type_desc: TypeDescriptor) -> Self {
        Self::new(ParamSource::Cookie, name, type_desc)
    }

    pub fn body(name: impl Into<String>, type_desc: TypeDescriptor) -> Self {
        Self::new(ParamSource::Body, name, type_desc)
    }

    /// Default used when the input is absent
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.field = self.field.default_value(value);
        self
    }

    /// Absent input becomes null instead of an error
    pub fn optional(mut self) -> Self {
        self.field = self.field.optional();
        self
    }

    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.field = self.field.constraint(constraint);
        self
    }

    pub fn ge(self, bound: f64) -> Self {
        self.constraint(Constraint::Ge(bound))
    }

    pub fn le(self, bound: f64) -> Self {
        self.constraint(Constraint::Le(bound))
    }

    pub fn min_length(self, len: usize) -> Self {
        self.constraint(Constraint::MinLength(len))
    }

    pub fn max_length(self, len: usize) -> Self {
        self.constraint(Constraint::MaxLength(len))
    }

    /// Regex constraint. An invalid pattern is reported by `AppBuilder::build`.
    pub fn pattern(mut self, pattern: &str) -> Self {
        match Constraint::pattern(pattern) {
            Ok(constraint) => self.constraint(constraint),
            Err(err) => {
                self.invalid_pattern = Some((pattern.to_string(), err.to_string()));
                self
            }
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.field = self.field.alias(alias);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.field = self.field.description(description);
        self
    }

    pub fn embed(mut self) -> Self {
        self.embed = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.field.name
    }

    /// Name looked up in the request
    pub fn wire_name(&self) -> &str {
        self.field.external_name()
    }

    pub(crate) fn check(&self, route: &str) -> Result<(), RegistrationError> {
        match &self.invalid_pattern {
            Some((pattern, reason)) => Err(RegistrationError::InvalidPattern {
                route: route.to_string(),
                name: self.field.name.clone(),
                pattern: pattern.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Bound values
// ============================================================================

/// Validated inputs, keyed by declared parameter name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundParams {
    values: HashMap<String, Value>,
}

impl BoundParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Deserialize a bound value into a concrete type
    pub fn extract<T: DeserializeOwned>(&self, name: &str) -> ApiResult<T> {
        let value = self
            .get(name)
            .ok_or_else(|| ApiError::Internal(format!("parameter `{}` is not bound", name)))?;
        Ok(serde_json::from_value(value.to_json())?)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

// ============================================================================
// Binder
// ============================================================================

enum BodyInput {
    Absent,
    Parsed(Value),
    /// Url-encoded pairs, repeated keys kept
    Form(Vec<(String, String)>),
    Invalid,
}

/// Pre-built binder for one route
#[derive(Debug, Clone, Default)]
pub struct RequestBinder {
    params: Vec<ParameterSpec>,
    coercion: CoercionMode,
}

impl RequestBinder {
    pub fn new(params: Vec<ParameterSpec>) -> Self {
        Self {
            params,
            coercion: CoercionMode::Lax,
        }
    }

    /// Coercion for JSON bodies. Path, query, header, cookie and form values
    /// are always strings on the wire and stay lax.
    pub fn with_coercion(mut self, mode: CoercionMode) -> Self {
        self.coercion = mode;
        self
    }

    pub fn params(&self) -> &[ParameterSpec] {
        &self.params
    }

    /// Bind every declared parameter, or return every failure.
    ///
    /// `path_params` are the raw router captures. Captures without a
    /// declaration are passed through as strings.
    pub fn bind(
        &self,
        request: &Request,
        path_params: &[(String, String)],
    ) -> Result<BoundParams, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let mut bound = BoundParams::new();

        for (name, raw) in path_params {
            bound.insert(name.clone(), Value::String(raw.clone()));
        }

        let body_specs: Vec<&ParameterSpec> = self
            .params
            .iter()
            .filter(|p| p.source == ParamSource::Body)
            .collect();
        let body = if body_specs.is_empty() {
            BodyInput::Absent
        } else {
            read_body(request, &mut errors)
        };

        for spec in self.params.iter().filter(|p| p.source != ParamSource::Body) {
            let raw = self.raw_value(spec, request, path_params);
            let mut ctx = ValidationContext::with_location(spec.source.as_str());
            if let Some(value) = validate_field(raw, &spec.field, CoercionMode::Lax, &mut ctx, &mut errors) {
                bound.insert(spec.field.name.clone(), value);
            }
        }

        match body {
            BodyInput::Invalid => {}
            BodyInput::Absent if body_specs.is_empty() => {}
            body => self.bind_body(&body_specs, body, &mut bound, &mut errors),
        }

        if errors.is_empty() {
            Ok(bound)
        } else {
            Err(errors)
        }
    }

    fn raw_value(
        &self,
        spec: &ParameterSpec,
        request: &Request,
        path_params: &[(String, String)],
    ) -> Option<Value> {
        let wire = spec.wire_name();
        match spec.source {
            ParamSource::Path => path_params
                .iter()
                .find(|(name, _)| name == wire || *name == spec.field.name)
                .map(|(_, raw)| Value::String(raw.clone())),
            ParamSource::Query if spec.field.type_desc.is_sequence() => {
                let values = request.query_params_all(wire);
                (!values.is_empty()).then(|| Value::from(values.into_iter().map(str::to_string).collect::<Vec<_>>()))
            }
            ParamSource::Query => request.query_param(wire).map(Value::from),
            ParamSource::Header if spec.field.type_desc.is_sequence() => request.header(wire).map(|raw| {
                Value::List(raw.split(',').map(|s| Value::from(s.trim())).collect())
            }),
            ParamSource::Header => request.header(wire).map(Value::from),
            ParamSource::Cookie => request.cookie(wire).map(Value::from),
            ParamSource::Body => None,
        }
    }

    fn bind_body(
        &self,
        specs: &[&ParameterSpec],
        body: BodyInput,
        bound: &mut BoundParams,
        errors: &mut ValidationErrors,
    ) {
        let body = match body {
            BodyInput::Parsed(value) => Some(value),
            BodyInput::Form(pairs) => {
                self.bind_form(specs, &pairs, bound, errors);
                return;
            }
            _ => None,
        };

        // A lone, non-embedded body param takes the whole body.
        if let [spec] = specs {
            if !spec.embed {
                let mut ctx = ValidationContext::with_location("body");
                let value = match body {
                    Some(value) => whole_body(value, spec, self.coercion, &mut ctx, errors),
                    None => match (&spec.field.default, spec.field.required) {
                        (Some(default), _) => Some(default.clone()),
                        (None, true) => {
                            errors.add(ctx.missing());
                            None
                        }
                        (None, false) => Some(Value::Null),
                    },
                };
                if let Some(value) = value {
                    bound.insert(spec.field.name.clone(), value);
                }
                return;
            }
        }

        let mut pairs = match body {
            Some(Value::Object(pairs)) => pairs,
            Some(other) => {
                errors.add(ValidationError::type_error(
                    "body".to_string(),
                    String::new(),
                    format!("invalid object (got {})", other.type_name()),
                ));
                return;
            }
            None => Vec::new(),
        };

        for spec in specs {
            let raw = take_pair(&mut pairs, spec.wire_name());
            let mut ctx = ValidationContext::with_location("body");
            if let Some(value) = validate_field(raw, &spec.field, self.coercion, &mut ctx, errors) {
                bound.insert(spec.field.name.clone(), value);
            }
        }
    }

    /// Form fields bind by name; only a lone model param takes the whole form.
    fn bind_form(
        &self,
        specs: &[&ParameterSpec],
        pairs: &[(String, String)],
        bound: &mut BoundParams,
        errors: &mut ValidationErrors,
    ) {
        if let [spec] = specs {
            if let (false, Some(schema)) = (spec.embed, model_of(&spec.field.type_desc)) {
                let mut object: Vec<(String, Value)> = Vec::new();
                for (key, _) in pairs {
                    if object.iter().any(|(k, _)| k == key) {
                        continue;
                    }
                    let sequence = schema
                        .field_named(key)
                        .map_or(false, |field| field.type_desc.is_sequence());
                    if let Some(value) = form_value(pairs, key, sequence) {
                        object.push((key.clone(), value));
                    }
                }
                let mut ctx = ValidationContext::with_location("body");
                if let Some(value) = whole_body(Value::Object(object), spec, CoercionMode::Lax, &mut ctx, errors) {
                    bound.insert(spec.field.name.clone(), value);
                }
                return;
            }
        }

        for spec in specs {
            let raw = form_value(pairs, spec.wire_name(), spec.field.type_desc.is_sequence());
            let mut ctx = ValidationContext::with_location("body");
            if let Some(value) = validate_field(raw, &spec.field, CoercionMode::Lax, &mut ctx, errors) {
                bound.insert(spec.field.name.clone(), value);
            }
        }
    }
}

fn model_of(type_desc: &TypeDescriptor) -> Option<&Arc<ModelSchema>> {
    match type_desc {
        TypeDescriptor::Model(schema) => Some(schema),
        TypeDescriptor::Optional(inner) => model_of(inner),
        _ => None,
    }
}

/// Every value for `key` when `sequence`, otherwise the first
fn form_value(pairs: &[(String, String)], key: &str, sequence: bool) -> Option<Value> {
    let mut values = pairs
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| Value::String(v.clone()));
    if sequence {
        let all: Vec<Value> = values.collect();
        (!all.is_empty()).then(|| Value::List(all))
    } else {
        values.next()
    }
}

fn whole_body(
    value: Value,
    spec: &ParameterSpec,
    mode: CoercionMode,
    ctx: &mut ValidationContext,
    errors: &mut ValidationErrors,
) -> Option<Value> {
    if value.is_null() && !spec.field.required {
        return Some(spec.field.default.clone().unwrap_or(Value::Null));
    }
    let value = validate_value(value, &spec.field.type_desc, mode, ctx, errors)?;
    for constraint in &spec.field.constraints {
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

fn read_body(request: &Request, errors: &mut ValidationErrors) -> BodyInput {
    if request.body.is_empty() {
        return BodyInput::Absent;
    }

    if request.is_form() {
        let text = String::from_utf8_lossy(&request.body);
        return BodyInput::Form(parse_query(&text));
    }

    match serde_json::from_slice::<serde_json::Value>(&request.body) {
        Ok(json) => BodyInput::Parsed(Value::from(json)),
        Err(err) => {
            errors.add(ValidationError::new(
                "body".to_string(),
                String::new(),
                format!("JSON decode error: {}", err),
                ErrorType::JsonInvalid,
            ));
            BodyInput::Invalid
        }
    }
}

fn take_pair(pairs: &mut Vec<(String, Value)>, key: &str) -> Option<Value> {
    let index = pairs.iter().position(|(k, _)| k == key)?;
    Some(pairs.remove(index).1)
}
