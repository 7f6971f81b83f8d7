//! Relationship tuples, read filters and read options.
//!
//! Objects are written `type:id`. Users are either a concrete object
//! (`user:anne`), a userset (`group:eng#member`) or a typed wildcard
//! (`user:*`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Separator between an object's type and id.
pub const TYPE_SEPARATOR: char = ':';

/// Separator between a userset's object and relation.
pub const USERSET_SEPARATOR: char = '#';

/// Id used by typed wildcards (`user:*`).
pub const WILDCARD: &str = "*";

/// Return the type half of `type:id`, or the whole string if there is no id.
pub fn object_type(object: &str) -> &str {
    object
        .split_once(TYPE_SEPARATOR)
        .map(|(t, _)| t)
        .unwrap_or(object)
}

/// Return the id half of `type:id`, or an empty string.
pub fn object_id(object: &str) -> &str {
    object
        .split_once(TYPE_SEPARATOR)
        .map(|(_, id)| id)
        .unwrap_or("")
}

/// Split a user into its object and optional userset relation.
pub fn split_user(user: &str) -> (&str, Option<&str>) {
    match user.split_once(USERSET_SEPARATOR) {
        Some((object, relation)) => (object, Some(relation)),
        None => (user, None),
    }
}

/// Returns true for `type:*` users.
pub fn is_wildcard(user: &str) -> bool {
    let (object, relation) = split_user(user);
    relation.is_none() && object_id(object) == WILDCARD
}

/// Named condition attached to a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipCondition {
    pub name: String,
    pub context: Option<serde_json::Value>,
}

/// The identifying part of a relationship tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleKey {
    pub object: String,
    pub relation: String,
    pub user: String,
    pub condition: Option<RelationshipCondition>,
}

impl TupleKey {
    pub fn new(
        object: impl Into<String>,
        relation: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            object: object.into(),
            relation: relation.into(),
            user: user.into(),
            condition: None,
        }
    }

    /// Attach a condition to this key.
    pub fn with_condition(mut self, condition: RelationshipCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// True if both keys name the same relationship, ignoring conditions.
    pub fn same_relationship(&self, other: &TupleKey) -> bool {
        self.object == other.object && self.relation == other.relation && self.user == other.user
    }
}

impl fmt::Display for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.object, self.relation, self.user)
    }
}

/// A stored relationship tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub key: TupleKey,
    pub timestamp: DateTime<Utc>,
}

impl Tuple {
    pub fn new(key: TupleKey) -> Self {
        Self {
            key,
            timestamp: Utc::now(),
        }
    }
}

/// Filter for the plain `read` operation.
///
/// Empty fields match anything. `object` may be a bare `type:` to match every
/// object of that type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFilter {
    pub object: String,
    pub relation: String,
    pub user: String,
}

impl ReadFilter {
    pub fn new(
        object: impl Into<String>,
        relation: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            object: object.into(),
            relation: relation.into(),
            user: user.into(),
        }
    }

    pub fn matches(&self, key: &TupleKey) -> bool {
        let object_matches = if self.object.is_empty() {
            true
        } else if object_id(&self.object).is_empty() {
            object_type(&key.object) == object_type(&self.object)
        } else {
            key.object == self.object
        };

        object_matches
            && (self.relation.is_empty() || key.relation == self.relation)
            && (self.user.is_empty() || key.user == self.user)
    }
}

/// A type (optionally with relation, or as a wildcard) a relation may point to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationReference {
    pub type_name: String,
    pub relation: Option<String>,
    pub wildcard: bool,
}

impl RelationReference {
    /// `type` as a direct reference.
    pub fn direct(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: None,
            wildcard: false,
        }
    }

    /// `type#relation` userset reference.
    pub fn userset(type_name: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: Some(relation.into()),
            wildcard: false,
        }
    }

    /// `type:*` wildcard reference.
    pub fn wildcard(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: None,
            wildcard: true,
        }
    }

    /// Whether a userset or wildcard user satisfies this reference.
    pub fn admits(&self, user: &str) -> bool {
        let (user_object, user_relation) = split_user(user);
        if object_type(user_object) != self.type_name {
            return false;
        }
        if self.wildcard {
            return is_wildcard(user);
        }
        match (&self.relation, user_relation) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }
}

impl fmt::Display for RelationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wildcard {
            return write!(f, "{}:*", self.type_name);
        }
        match &self.relation {
            Some(relation) => write!(f, "{}#{}", self.type_name, relation),
            None => write!(f, "{}", self.type_name),
        }
    }
}

/// Filter for `read_userset_tuples`: tuples on one object and relation whose
/// user is a userset or a wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadUsersetTuplesFilter {
    pub object: String,
    pub relation: String,
    pub allowed_user_type_restrictions: Vec<RelationReference>,
}

impl ReadUsersetTuplesFilter {
    pub fn matches(&self, key: &TupleKey) -> bool {
        if key.object != self.object || key.relation != self.relation {
            return false;
        }
        let (_, user_relation) = split_user(&key.user);
        let is_userset_or_wildcard = user_relation.is_some() || is_wildcard(&key.user);
        if !is_userset_or_wildcard {
            return false;
        }
        self.allowed_user_type_restrictions.is_empty()
            || self
                .allowed_user_type_restrictions
                .iter()
                .any(|reference| reference.admits(&key.user))
    }
}

/// An object with an optional relation, used to describe a user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRelation {
    pub object: String,
    pub relation: Option<String>,
}

impl ObjectRelation {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            relation: None,
        }
    }

    pub fn with_relation(object: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            relation: Some(relation.into()),
        }
    }

    /// Render as a tuple user string.
    pub fn to_user_string(&self) -> String {
        match &self.relation {
            Some(relation) if !relation.is_empty() => {
                format!("{}{}{}", self.object, USERSET_SEPARATOR, relation)
            }
            _ => self.object.clone(),
        }
    }
}

/// Filter for `read_starting_with_user`: reverse lookup from users to the
/// objects of one type they are related to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStartingWithUserFilter {
    pub object_type: String,
    pub relation: String,
    pub user_filter: Vec<ObjectRelation>,
    /// Restrict results to these object ids. `None` means no restriction.
    pub object_ids: Option<BTreeSet<String>>,
}

impl ReadStartingWithUserFilter {
    pub fn matches(&self, key: &TupleKey) -> bool {
        if object_type(&key.object) != self.object_type || key.relation != self.relation {
            return false;
        }
        if let Some(ids) = &self.object_ids {
            if !ids.contains(object_id(&key.object)) {
                return false;
            }
        }
        self.user_filter
            .iter()
            .any(|user| user.to_user_string() == key.user)
    }
}

/// Requested consistency for a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Consistency {
    #[default]
    Unspecified,
    /// Prefer cached results.
    MinimizeLatency,
    /// Always read from the backend.
    HigherConsistency,
}

/// Options shared by every read operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadOptions {
    pub consistency: Consistency,
}

impl ReadOptions {
    pub fn higher_consistency() -> Self {
        Self {
            consistency: Consistency::HigherConsistency,
        }
    }

    pub fn minimize_latency() -> Self {
        Self {
            consistency: Consistency::MinimizeLatency,
        }
    }

    /// True when the caller asked for results no cache may serve.
    pub fn requires_fresh(&self) -> bool {
        self.consistency == Consistency::HigherConsistency
    }
}

/// Page request for `read_page`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page_size: usize,
    /// Continuation token returned by the previous page.
    pub from: Option<String>,
}

impl Pagination {
    pub fn first(page_size: usize) -> Self {
        Self {
            page_size,
            from: None,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_and_id() {
        assert_eq!(object_type("document:1"), "document");
        assert_eq!(object_id("document:1"), "1");
        assert_eq!(object_type("document:"), "document");
        assert_eq!(object_id("document:"), "");
        assert_eq!(object_type("document"), "document");
    }

    #[test]
    fn test_split_user_and_wildcard() {
        assert_eq!(split_user("group:eng#member"), ("group:eng", Some("member")));
        assert_eq!(split_user("user:anne"), ("user:anne", None));
        assert!(is_wildcard("user:*"));
        assert!(!is_wildcard("user:anne"));
        assert!(!is_wildcard("group:*#member"));
    }

    #[test]
    fn test_read_filter_type_prefix() {
        let filter = ReadFilter::new("document:", "viewer", "");
        assert!(filter.matches(&TupleKey::new("document:1", "viewer", "user:anne")));
        assert!(!filter.matches(&TupleKey::new("folder:1", "viewer", "user:anne")));
        assert!(!filter.matches(&TupleKey::new("document:1", "editor", "user:anne")));
    }

    #[test]
    fn test_read_filter_exact() {
        let filter = ReadFilter::new("document:1", "", "user:anne");
        assert!(filter.matches(&TupleKey::new("document:1", "owner", "user:anne")));
        assert!(!filter.matches(&TupleKey::new("document:2", "owner", "user:anne")));
        assert!(ReadFilter::default().matches(&TupleKey::new("a:b", "c", "d:e")));
    }

    #[test]
    fn test_userset_filter_restrictions() {
        let filter = ReadUsersetTuplesFilter {
            object: "document:1".to_string(),
            relation: "viewer".to_string(),
            allowed_user_type_restrictions: vec![
                RelationReference::userset("group", "member"),
                RelationReference::wildcard("user"),
            ],
        };
        assert!(filter.matches(&TupleKey::new("document:1", "viewer", "group:eng#member")));
        assert!(filter.matches(&TupleKey::new("document:1", "viewer", "user:*")));
        assert!(!filter.matches(&TupleKey::new("document:1", "viewer", "user:anne")));
        assert!(!filter.matches(&TupleKey::new("document:1", "viewer", "group:eng#owner")));
        assert!(!filter.matches(&TupleKey::new("document:1", "viewer", "team:x#member")));
    }

    #[test]
    fn test_userset_filter_unrestricted() {
        let filter = ReadUsersetTuplesFilter {
            object: "document:1".to_string(),
            relation: "viewer".to_string(),
            allowed_user_type_restrictions: vec![],
        };
        assert!(filter.matches(&TupleKey::new("document:1", "viewer", "team:x#member")));
        assert!(!filter.matches(&TupleKey::new("document:1", "viewer", "user:anne")));
    }

    #[test]
    fn test_starting_with_user_filter() {
        let mut ids = BTreeSet::new();
        ids.insert("1".to_string());
        let filter = ReadStartingWithUserFilter {
            object_type: "document".to_string(),
            relation: "viewer".to_string(),
            user_filter: vec![
                ObjectRelation::new("user:anne"),
                ObjectRelation::with_relation("group:eng", "member"),
            ],
            object_ids: Some(ids),
        };
        assert!(filter.matches(&TupleKey::new("document:1", "viewer", "user:anne")));
        assert!(filter.matches(&TupleKey::new("document:1", "viewer", "group:eng#member")));
        assert!(!filter.matches(&TupleKey::new("document:2", "viewer", "user:anne")));
        assert!(!filter.matches(&TupleKey::new("document:1", "viewer", "user:bob")));
    }

    #[test]
    fn test_read_options_requires_fresh() {
        assert!(ReadOptions::higher_consistency().requires_fresh());
        assert!(!ReadOptions::minimize_latency().requires_fresh());
        assert!(!ReadOptions::default().requires_fresh());
    }

    #[test]
    fn test_tuple_key_display() {
        let key = TupleKey::new("document:1", "viewer", "user:anne");
        assert_eq!(key.to_string(), "document:1#viewer@user:anne");
    }
}
