//! Deterministic cache key derivation
//!
//! A key is a pure function of the endpoint, the query parameters and the
//! request context:
//!
//! ```text
//! /subjects?page=1&sort=name#userId=42;tenantId=6
//! ```
//!
//! Parameters are sorted by name and context fields are written in a fixed
//! order, so logically equal requests always collide and different contexts
//! never do. Every component is percent-encoded (path segments one at a
//! time, so `/` survives), which keeps keys ASCII-only and makes the
//! separators (`?`, `&`, `=`, `#`, `;`) unambiguous.

use crate::cache::context::ContextTuple;
use crate::cache::types::CacheKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A scalar query parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "null"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<i32> for Scalar {
    fn from(i: i32) -> Self {
        Scalar::Int(i64::from(i))
    }
}

impl From<u32> for Scalar {
    fn from(i: u32) -> Self {
        Scalar::Int(i64::from(i))
    }
}

impl From<f64> for Scalar {
    fn from(x: f64) -> Self {
        Scalar::Float(x)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Scalar::Null)
    }
}

/// Query parameters of a cached request, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryParams(BTreeMap<String, Scalar>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, replacing any previous value under the same name
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Serialized `name=value` pairs, sorted by name, nulls dropped
    fn encoded(&self) -> String {
        self.0
            .iter()
            .filter(|(_, v)| !matches!(v, Scalar::Null))
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    urlencoding::encode(k),
                    urlencoding::encode(&v.to_string())
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl<K: Into<String>, V: Into<Scalar>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = QueryParams::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Normalize an endpoint path: trimmed, leading `/`, no trailing `/`.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let trimmed = trimmed.trim_start_matches('/');
    format!("/{}", trimmed)
}

/// Endpoint path without its query string or fragment
pub fn path_of(endpoint: &str) -> &str {
    endpoint
        .split(&['?', '#'][..])
        .next()
        .unwrap_or(endpoint)
}

/// Prefix shared by every key of `endpoint` and of its sub-resources.
///
/// Used by prefix invalidation: a rule for `/institute-classes` matches keys
/// under `/institute-classes/12/enrollment-code` as well.
pub fn key_prefix(endpoint: &str) -> String {
    normalize_endpoint(endpoint)
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Derive the cache key for a request.
pub fn generate_key(
    endpoint: &str,
    params: Option<&QueryParams>,
    context: Option<&ContextTuple>,
) -> CacheKey {
    let mut key = key_prefix(endpoint);

    key.push('?');
    if let Some(params) = params {
        key.push_str(&params.encoded());
    }

    key.push('#');
    if let Some(context) = context {
        let ctx = context
            .fields()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join(";");
        key.push_str(&ctx);
    }

    key
}

/// Endpoint segment of a key produced by [`generate_key`]
pub fn endpoint_of(key: &str) -> &str {
    key.split('?').next().unwrap_or(key)
}

/// Builder over [`generate_key`] for call sites that assemble requests piecemeal
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    endpoint: String,
    params: QueryParams,
    context: ContextTuple,
}

impl CacheKeyBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: QueryParams::new(),
            context: ContextTuple::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.params.insert(name, value);
        self
    }

    pub fn context(mut self, context: ContextTuple) -> Self {
        self.context = context;
        self
    }

    pub fn build(self) -> CacheKey {
        generate_key(&self.endpoint, Some(&self.params), Some(&self.context))
    }
}
