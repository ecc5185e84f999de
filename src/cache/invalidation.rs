//! Mutation-driven cache invalidation
//!
//! Writes to the backend make cached reads stale. Instead of tracking
//! dependencies at runtime, a fixed rule table maps each mutating request to
//! the endpoint prefixes whose cached entries must go:
//!
//! ```text
//! POST /institute-classes  ->  /institute-classes, /institute-class-subjects, /students, ...
//! ```
//!
//! Matching is by prefix, so a rule for `/institute-classes` also covers
//! `/institute-classes/12/enrollment-code`. Purging more than necessary is
//! acceptable; leaving stale data behind is not, so a mutation no rule knows
//! about still purges its own top-level resource.

use crate::cache::context::ContextTuple;
use crate::cache::key::{normalize_endpoint, path_of};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// HTTP method of a request reported to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpVerb {
    /// Verbs that change server state
    pub fn mutating() -> Vec<HttpVerb> {
        vec![HttpVerb::Post, HttpVerb::Put, HttpVerb::Patch, HttpVerb::Delete]
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, HttpVerb::Get | HttpVerb::Head)
    }
}

impl fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpVerb::Get => "GET",
            HttpVerb::Head => "HEAD",
            HttpVerb::Post => "POST",
            HttpVerb::Put => "PUT",
            HttpVerb::Patch => "PATCH",
            HttpVerb::Delete => "DELETE",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for HttpVerb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpVerb::Get),
            "HEAD" => Ok(HttpVerb::Head),
            "POST" => Ok(HttpVerb::Post),
            "PUT" => Ok(HttpVerb::Put),
            "PATCH" => Ok(HttpVerb::Patch),
            "DELETE" => Ok(HttpVerb::Delete),
            other => Err(format!("unsupported HTTP verb: {}", other)),
        }
    }
}

/// Reason for cache invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// A mutating request hit the backend
    Mutation { verb: HttpVerb, endpoint: String },
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::Mutation { verb, endpoint } => {
                write!(f, "mutation: {} {}", verb, endpoint)
            }
        }
    }
}

/// One row of the rule table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRule {
    /// Verbs this rule reacts to
    pub verbs: Vec<HttpVerb>,

    /// Mutated endpoints starting with this prefix trigger the rule
    pub endpoint_prefix: String,

    /// Endpoint prefixes whose cached entries are purged
    pub affects: Vec<String>,
}

impl InvalidationRule {
    pub fn new(verbs: Vec<HttpVerb>, endpoint_prefix: &str, affects: &[&str]) -> Self {
        Self {
            verbs,
            endpoint_prefix: normalize_endpoint(endpoint_prefix),
            affects: affects.iter().map(|a| normalize_endpoint(a)).collect(),
        }
    }

    /// Rule reacting to every mutating verb
    pub fn on_mutation(endpoint_prefix: &str, affects: &[&str]) -> Self {
        Self::new(HttpVerb::mutating(), endpoint_prefix, affects)
    }

    pub fn matches(&self, verb: HttpVerb, endpoint: &str) -> bool {
        self.verbs.contains(&verb) && normalize_endpoint(endpoint).starts_with(&self.endpoint_prefix)
    }
}

/// The static rule table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvalidationRules {
    rules: Vec<InvalidationRule>,
}

impl Default for InvalidationRules {
    fn default() -> Self {
        use InvalidationRule as R;

        Self {
            rules: vec![
                R::on_mutation(
                    "/institutes",
                    &["/institutes", "/institute-classes", "/institute-users", "/users"],
                ),
                R::on_mutation(
                    "/institute-classes",
                    &[
                        "/institute-classes",
                        "/institute-class-subjects",
                        "/students",
                        "/enrollments",
                    ],
                ),
                R::on_mutation(
                    "/institute-class-subjects",
                    &["/institute-class-subjects", "/subjects", "/institute-classes"],
                ),
                R::on_mutation("/subjects", &["/subjects", "/institute-class-subjects"]),
                R::on_mutation(
                    "/students",
                    &["/students", "/institute-classes", "/enrollments", "/attendance"],
                ),
                R::on_mutation(
                    "/teachers",
                    &["/teachers", "/institute-class-subjects", "/lectures"],
                ),
                R::on_mutation(
                    "/enrollments",
                    &["/enrollments", "/students", "/institute-classes"],
                ),
                R::on_mutation("/exams", &["/exams", "/results"]),
                R::on_mutation("/results", &["/results", "/exams"]),
                R::on_mutation("/lectures", &["/lectures", "/attendance"]),
                R::on_mutation("/attendance", &["/attendance", "/lectures", "/students"]),
                R::on_mutation("/payments", &["/payments", "/payment-submissions"]),
                R::on_mutation(
                    "/payment-submissions",
                    &["/payment-submissions", "/payments", "/students"],
                ),
                R::on_mutation(
                    "/users",
                    &["/users", "/students", "/teachers", "/institute-users"],
                ),
            ],
        }
    }
}

impl InvalidationRules {
    /// An empty table; every mutation falls back to its own resource
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn new(rules: Vec<InvalidationRule>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, rule: InvalidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[InvalidationRule] {
        &self.rules
    }

    /// Endpoint prefixes to purge after `verb endpoint` succeeded.
    ///
    /// Non-mutating verbs purge nothing. If no rule matches, the first path
    /// segment of the endpoint is returned. Query strings are ignored.
    pub fn affected_prefixes(&self, verb: HttpVerb, endpoint: &str) -> Vec<String> {
        if !verb.is_mutation() {
            return Vec::new();
        }
        let endpoint = path_of(endpoint);

        let mut prefixes: BTreeSet<String> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(verb, endpoint))
            .flat_map(|rule| rule.affects.iter().cloned())
            .collect();

        if prefixes.is_empty() {
            prefixes.insert(resource_root(endpoint));
        }

        prefixes.into_iter().collect()
    }
}

/// First path segment: `/institute-classes/12/x` -> `/institute-classes`
pub fn resource_root(endpoint: &str) -> String {
    let normalized = normalize_endpoint(path_of(endpoint));
    let first = normalized
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default();
    format!("/{}", first)
}

/// Record of one invalidation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Endpoint prefixes purged (empty for context-only purges)
    pub prefixes: Vec<String>,

    /// Context the purge was narrowed to
    pub context: Option<ContextTuple>,

    /// Entries removed
    pub removed: usize,
}

impl InvalidationEvent {
    /// Create a new invalidation event
    pub fn new(reason: InvalidationReason, prefixes: Vec<String>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            prefixes,
            context: None,
            removed: 0,
        }
    }

    pub fn with_context(mut self, context: Option<ContextTuple>) -> Self {
        self.context = context.filter(|c| !c.is_empty());
        self
    }

    pub fn with_removed(mut self, removed: usize) -> Self {
        self.removed = removed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_parse_and_display() {
        assert_eq!("post".parse::<HttpVerb>(), Ok(HttpVerb::Post));
        assert_eq!(" Delete ".parse::<HttpVerb>(), Ok(HttpVerb::Delete));
        assert!("TRACE".parse::<HttpVerb>().is_err());
        assert_eq!(HttpVerb::Patch.to_string(), "PATCH");
        assert!(!HttpVerb::Get.is_mutation());
        assert!(HttpVerb::Put.is_mutation());
    }

    #[test]
    fn test_invalidation_reason_display() {
        let reason = InvalidationReason::Mutation {
            verb: HttpVerb::Post,
            endpoint: "/subjects".to_string(),
        };
        assert_eq!(reason.to_string(), "mutation: POST /subjects");
    }

    #[test]
    fn test_rule_matching_is_prefix_based() {
        let rule = InvalidationRule::on_mutation("/institute-classes", &["/institute-classes"]);
        assert!(rule.matches(HttpVerb::Post, "/institute-classes"));
        assert!(rule.matches(HttpVerb::Patch, "/institute-classes/12/enrollment-code"));
        assert!(!rule.matches(HttpVerb::Get, "/institute-classes"));
        assert!(!rule.matches(HttpVerb::Post, "/subjects"));
    }

    #[test]
    fn test_default_rules_cover_related_resources() {
        let rules = InvalidationRules::default();
        let prefixes = rules.affected_prefixes(HttpVerb::Post, "/institute-classes");

        assert!(prefixes.contains(&"/institute-classes".to_string()));
        assert!(prefixes.contains(&"/students".to_string()));
        assert!(!prefixes.contains(&"/payments".to_string()));
    }

    #[test]
    fn test_sub_resource_mutation_uses_parent_rule() {
        let rules = InvalidationRules::default();
        let prefixes = rules.affected_prefixes(HttpVerb::Put, "/lectures/9/recording");
        assert_eq!(prefixes, vec!["/attendance".to_string(), "/lectures".to_string()]);
    }

    #[test]
    fn test_get_invalidates_nothing() {
        let rules = InvalidationRules::default();
        assert!(rules.affected_prefixes(HttpVerb::Get, "/subjects").is_empty());
        assert!(rules.affected_prefixes(HttpVerb::Head, "/subjects").is_empty());
    }

    #[test]
    fn test_unknown_endpoint_falls_back_to_resource_root() {
        let rules = InvalidationRules::default();
        let prefixes = rules.affected_prefixes(HttpVerb::Delete, "/homework/77/files/3");
        assert_eq!(prefixes, vec!["/homework".to_string()]);

        let empty = InvalidationRules::empty();
        assert_eq!(
            empty.affected_prefixes(HttpVerb::Post, "subjects/"),
            vec!["/subjects".to_string()]
        );
    }

    #[test]
    fn test_query_string_is_ignored_when_matching() {
        let rules = InvalidationRules::default();
        assert_eq!(
            rules.affected_prefixes(HttpVerb::Post, "/homework?draft=true"),
            vec!["/homework".to_string()]
        );
        assert_eq!(
            rules.affected_prefixes(HttpVerb::Post, "/exams?notify=1"),
            vec!["/exams".to_string(), "/results".to_string()]
        );
        assert_eq!(resource_root("/homework/3#files"), "/homework");
    }

    #[test]
    fn test_custom_rule_extends_table() {
        let rules = InvalidationRules::empty().with_rule(InvalidationRule::new(
            vec![HttpVerb::Post],
            "/homework",
            &["/homework", "/lectures"],
        ));

        assert_eq!(
            rules.affected_prefixes(HttpVerb::Post, "/homework"),
            vec!["/homework".to_string(), "/lectures".to_string()]
        );
        // PATCH is not covered by the rule, so the fallback kicks in
        assert_eq!(
            rules.affected_prefixes(HttpVerb::Patch, "/homework"),
            vec!["/homework".to_string()]
        );
    }

    #[test]
    fn test_rules_deserialize_from_json() {
        let json = r#"[
            {"verbs": ["POST", "DELETE"], "endpoint_prefix": "/exams", "affects": ["/exams", "/results"]}
        ]"#;
        let rules: InvalidationRules = serde_json::from_str(json).unwrap();
        assert_eq!(rules.rules().len(), 1);
        assert_eq!(
            rules.affected_prefixes(HttpVerb::Delete, "/exams/3"),
            vec!["/exams".to_string(), "/results".to_string()]
        );
    }

    #[test]
    fn test_resource_root() {
        assert_eq!(resource_root("/institute-classes/12/x"), "/institute-classes");
        assert_eq!(resource_root("students"), "/students");
        assert_eq!(resource_root("/"), "/");
    }

    #[test]
    fn test_invalidation_event() {
        let event = InvalidationEvent::new(
            InvalidationReason::Mutation {
                verb: HttpVerb::Delete,
                endpoint: "/a".to_string(),
            },
            vec!["/a".to_string(), "/b".to_string()],
        )
        .with_context(Some(ContextTuple::new()))
        .with_removed(3);

        assert_eq!(event.prefixes.len(), 2);
        assert_eq!(event.removed, 3);
        assert!(event.context.is_none());
    }
}
