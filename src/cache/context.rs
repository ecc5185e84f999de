//! Request context attached to every cache entry
//!
//! The context tuple scopes cached data to a user, an institute (tenant), a
//! class, a subject and a role. It is part of the cache key, so two users
//! never read each other's entries, and it is stored alongside each entry so
//! purges can target "everything for institute X".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scoping fields for a cached request. Every field is optional.
///
/// Empty strings are normalized to `None`: a caller passing `""` for a field
/// means the same thing as not passing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextTuple {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Institute id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

fn normalize(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.len() == v.len() {
            Some(v)
        } else {
            Some(trimmed.to_string())
        }
    })
}

impl ContextTuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self::new().user(user_id)
    }

    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self::new().tenant(tenant_id)
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = normalize(Some(user_id.into()));
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = normalize(Some(tenant_id.into()));
        self
    }

    pub fn class(mut self, class_id: impl Into<String>) -> Self {
        self.class_id = normalize(Some(class_id.into()));
        self
    }

    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = normalize(Some(subject_id.into()));
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = normalize(Some(role.into()));
        self
    }

    /// Copy with blank fields collapsed to `None`.
    ///
    /// Contexts deserialized from JSON or built with struct literals bypass
    /// the builder methods, so the key generator and matcher normalize again.
    pub fn normalized(&self) -> Self {
        Self {
            user_id: normalize(self.user_id.clone()),
            tenant_id: normalize(self.tenant_id.clone()),
            class_id: normalize(self.class_id.clone()),
            subject_id: normalize(self.subject_id.clone()),
            role: normalize(self.role.clone()),
        }
    }

    /// Present fields in key order: userId, tenantId, classId, subjectId, role.
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        let ordered = [
            ("userId", &self.user_id),
            ("tenantId", &self.tenant_id),
            ("classId", &self.class_id),
            ("subjectId", &self.subject_id),
            ("role", &self.role),
        ];

        ordered
            .into_iter()
            .filter_map(|(name, value)| {
                value
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| (name, v))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Check whether `stored` satisfies this context used as a pattern.
    ///
    /// Every field set here must be equal in `stored`; fields absent here are
    /// wildcards. An empty pattern matches everything.
    pub fn matches(&self, stored: &ContextTuple) -> bool {
        let pattern = self.normalized();
        let stored = stored.normalized();

        fn field_ok(pattern: &Option<String>, stored: &Option<String>) -> bool {
            match pattern {
                None => true,
                Some(p) => stored.as_deref() == Some(p.as_str()),
            }
        }

        field_ok(&pattern.user_id, &stored.user_id)
            && field_ok(&pattern.tenant_id, &stored.tenant_id)
            && field_ok(&pattern.class_id, &stored.class_id)
            && field_ok(&pattern.subject_id, &stored.subject_id)
            && field_ok(&pattern.role, &stored.role)
    }
}

impl fmt::Display for ContextTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();

        if parts.is_empty() {
            write!(f, "<any>")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}
