//! Path templates and route matching
//!
//! Templates are split into segments at registration and stored in a segment
//! trie. Each node ranks its children by specificity, so the winner for a
//! concrete path is fixed when routes are registered, never by insertion
//! order:
//!
//! literal > `{x:int}` > `{x:float}` > `{x}` / `{x:str}` > `{x:path}`
//!
//! Lookup walks the most specific branch first and backtracks when it dead
//! ends. The first terminal node that carries the request method wins. When
//! terminals match but none carries the method, the result is a 405 listing
//! every method registered on them.

use crate::error::{ApiError, RegistrationError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use turbo_common::HttpMethod;

// ============================================================================
// Path templates
// ============================================================================

/// Type annotation on a template parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Converter {
    Int,
    Float,
    Str,
    /// Remainder of the path, slashes included. Must be the last segment.
    Path,
}

impl Converter {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "str" => Some(Self::Str),
            "path" => Some(Self::Path),
            _ => None,
        }
    }

    fn accepts(&self, segment: &str) -> bool {
        match self {
            Self::Int => segment.parse::<i64>().is_ok(),
            Self::Float => segment.parse::<f64>().map(f64::is_finite).unwrap_or(false),
            Self::Str | Self::Path => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Path => "path",
        }
    }
}

/// One template segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param { name: String, converter: Converter },
}

/// A parsed path template such as `/items/{item_id:int}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, RegistrationError> {
        let invalid = |reason: &str| RegistrationError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        if !template.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut segments = Vec::new();
        let mut names = BTreeSet::new();

        for part in template.split('/').filter(|s| !s.is_empty()) {
            if matches!(segments.last(), Some(Segment::Param { converter: Converter::Path, .. })) {
                return Err(invalid("a path parameter must be the last segment"));
            }

            let segment = match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(inner) => {
                    let (name, converter) = match inner.split_once(':') {
                        Some((name, conv)) => match Converter::parse(conv) {
                            Some(converter) => (name, converter),
                            None => return Err(invalid(&format!("unknown converter `{}`", conv))),
                        },
                        None => (inner, Converter::Str),
                    };
                    if !is_identifier(name) {
                        return Err(invalid(&format!("invalid parameter name `{}`", name)));
                    }
                    if !names.insert(name.to_string()) {
                        return Err(invalid(&format!("parameter `{}` appears twice", name)));
                    }
                    Segment::Param {
                        name: name.to_string(),
                        converter,
                    }
                }
                None if part.contains('{') || part.contains('}') => {
                    return Err(invalid("parameters must span a whole segment"));
                }
                None => Segment::Literal(part.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: canonical(&segments),
            segments,
        })
    }

    /// Normalized template text (no trailing slash)
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Parameter names in template order
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param { name, .. } => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param_names().any(|n| n == name)
    }

    /// Prefix this template with another (route groups)
    pub fn prefixed(&self, prefix: &PathTemplate) -> Result<Self, RegistrationError> {
        let raw = format!("{}{}", prefix.raw.trim_end_matches('/'), self.raw);
        Self::parse(if raw.is_empty() { "/" } else { &raw })
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn canonical(segments: &[Segment]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        match segment {
            Segment::Literal(lit) => out.push_str(lit),
            Segment::Param { name, converter: Converter::Str } => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
            Segment::Param { name, converter } => {
                out.push_str(&format!("{{{}:{}}}", name, converter.as_str()));
            }
        }
    }
    out
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// Router
// ============================================================================

#[derive(Debug, Default)]
struct Node {
    literals: HashMap<String, Node>,
    /// Ordered by specificity through `Converter`'s `Ord`
    params: BTreeMap<Converter, Node>,
    /// Terminal routes: method → index into `Router::routes`
    methods: BTreeMap<HttpMethod, usize>,
}

/// A registered entry
#[derive(Debug)]
pub struct RouteEntry<T> {
    pub method: HttpMethod,
    pub template: PathTemplate,
    pub value: T,
}

/// Successful lookup
#[derive(Debug)]
pub struct RouteMatch<'a, T> {
    pub entry: &'a RouteEntry<T>,
    /// Percent-decoded raw captures, keyed by template parameter name
    pub params: Vec<(String, String)>,
}

/// Segment-trie router. Immutable once the app is built.
#[derive(Debug)]
pub struct Router<T> {
    root: Node,
    routes: Vec<RouteEntry<T>>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self {
            root: Node::default(),
            routes: Vec::new(),
        }
    }
}

impl<T> Router<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. The same method on the same segment shape is rejected.
    pub fn insert(
        &mut self,
        method: HttpMethod,
        template: PathTemplate,
        value: T,
    ) -> Result<usize, RegistrationError> {
        let mut node = &mut self.root;
        for segment in template.segments() {
            node = match segment {
                Segment::Literal(lit) => node.literals.entry(lit.clone()).or_default(),
                Segment::Param { converter, .. } => node.params.entry(*converter).or_default(),
            };
        }

        if node.methods.contains_key(&method) {
            return Err(RegistrationError::DuplicateRoute {
                method,
                template: template.as_str().to_string(),
            });
        }

        let index = self.routes.len();
        node.methods.insert(method, index);
        self.routes.push(RouteEntry {
            method,
            template,
            value,
        });
        Ok(index)
    }

    pub fn routes(&self) -> &[RouteEntry<T>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Find the route for `method` on a concrete path.
    ///
    /// Trailing and repeated slashes are ignored. HEAD falls back to GET.
    pub fn lookup(&self, method: HttpMethod, path: &str) -> Result<RouteMatch<'_, T>, ApiError> {
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match urlencoding::decode(s) {
                Ok(decoded) => decoded.into_owned(),
                Err(_) => s.to_string(),
            })
            .collect();

        let mut allowed = BTreeSet::new();
        let mut captures = Vec::new();
        let mut found = None;

        walk(&self.root, &segments, &mut captures, &mut |node: &Node, captures: &[String]| {
            let hit = node.methods.get(&method).or_else(|| {
                (method == HttpMethod::Head)
                    .then(|| node.methods.get(&HttpMethod::Get))
                    .flatten()
            });
            match hit {
                Some(&index) => {
                    found = Some((index, captures.to_vec()));
                    true
                }
                None => {
                    allowed.extend(node.methods.keys().copied());
                    false
                }
            }
        });

        if let Some((index, values)) = found {
            let entry = &self.routes[index];
            let params = entry
                .template
                .param_names()
                .map(str::to_string)
                .zip(values)
                .collect();
            return Ok(RouteMatch { entry, params });
        }

        if allowed.is_empty() {
            Err(ApiError::NotFound {
                method,
                path: path.to_string(),
            })
        } else {
            Err(ApiError::MethodNotAllowed {
                allowed: allowed.into_iter().collect(),
            })
        }
    }
}

/// Depth-first walk in specificity order. `visit` is called for every
/// terminal reached; returning `true` stops the walk.
fn walk(
    node: &Node,
    segments: &[String],
    captures: &mut Vec<String>,
    visit: &mut dyn FnMut(&Node, &[String]) -> bool,
) -> bool {
    let Some((head, rest)) = segments.split_first() else {
        return !node.methods.is_empty() && visit(node, captures);
    };

    if let Some(child) = node.literals.get(head) {
        if walk(child, rest, captures, visit) {
            return true;
        }
    }

    for (converter, child) in &node.params {
        match converter {
            Converter::Path => {
                captures.push(segments.join("/"));
                let stop = !child.methods.is_empty() && visit(child, captures);
                captures.pop();
                if stop {
                    return true;
                }
            }
            _ if converter.accepts(head) => {
                captures.push(head.clone());
                let stop = walk(child, rest, captures, visit);
                captures.pop();
                if stop {
                    return true;
                }
            }
            _ => {}
        }
    }

    false
}
