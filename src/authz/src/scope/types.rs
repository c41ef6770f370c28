//! Scope type definitions and validation
//!
//! A scope is the wire token consumers string-match against:
//! `{resource_type}:{action}` or `{resource_type}:{action}:{resource_id}`.
//! [`ScopePattern`] adds `*` / `**` wildcards for menu-style consumers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Action, ResourceId, ResourceType};

/// Result type for scope operations
pub type ScopeResult<T> = Result<T, ScopeError>;

/// Errors that can occur during scope operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// Empty scope string provided
    EmptyScope,
    /// Wrong number of segments
    InvalidFormat(String),
    /// Invalid wildcard usage
    InvalidWildcard(String),
    /// Scope segment is empty
    EmptySegment,
    /// First segment is not a known resource type
    UnknownResourceType(String),
    /// Second segment is not a known action
    UnknownAction(String),
    /// Third segment is not a resource id
    InvalidResourceId(String),
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyScope => write!(f, "Scope cannot be empty"),
            Self::InvalidFormat(msg) => write!(f, "Invalid scope format: {}", msg),
            Self::InvalidWildcard(msg) => write!(f, "Invalid wildcard usage: {}", msg),
            Self::EmptySegment => write!(f, "Scope segment cannot be empty"),
            Self::UnknownResourceType(t) => write!(f, "Unknown resource type: {}", t),
            Self::UnknownAction(a) => write!(f, "Unknown action: {}", a),
            Self::InvalidResourceId(id) => write!(f, "Invalid resource id: {}", id),
        }
    }
}

impl std::error::Error for ScopeError {}

fn split_segments(s: &str) -> ScopeResult<Vec<&str>> {
    if s.is_empty() {
        return Err(ScopeError::EmptyScope);
    }

    let segments: Vec<&str> = s.split(':').collect();
    if segments.iter().any(|seg| seg.is_empty()) {
        return Err(ScopeError::EmptySegment);
    }
    if segments.len() < 2 || segments.len() > 3 {
        return Err(ScopeError::InvalidFormat(format!(
            "expected 2 or 3 segments, got {} in '{}'",
            segments.len(),
            s
        )));
    }
    Ok(segments)
}

/// One granted capability
///
/// # Examples
///
/// ```
/// use tessera_authz::scope::Scope;
///
/// let scope = Scope::parse("entity:read").unwrap();
/// assert_eq!(scope.to_string(), "entity:read");
/// assert!(scope.matches("entity:*").unwrap());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub resource_type: ResourceType,
    pub action: Action,
    pub resource_id: Option<ResourceId>,
}

impl Scope {
    /// `{resource_type}:{action}`
    pub fn general(resource_type: ResourceType, action: Action) -> Self {
        Self {
            resource_type,
            action,
            resource_id: None,
        }
    }

    /// `{resource_type}:{action}:{resource_id}`
    pub fn specific(resource_type: ResourceType, action: Action, resource_id: ResourceId) -> Self {
        Self {
            resource_type,
            action,
            resource_id: Some(resource_id),
        }
    }

    /// Parse the wire format. Wildcards are not scopes; use [`ScopePattern`].
    pub fn parse(s: &str) -> ScopeResult<Self> {
        let segments = split_segments(s)?;
        if segments.iter().any(|seg| seg.contains('*')) {
            return Err(ScopeError::InvalidWildcard(format!(
                "'{}' is a pattern, not a scope",
                s
            )));
        }

        let resource_type = segments[0]
            .parse::<ResourceType>()
            .map_err(|_| ScopeError::UnknownResourceType(segments[0].to_string()))?;
        let action = segments[1]
            .parse::<Action>()
            .map_err(|_| ScopeError::UnknownAction(segments[1].to_string()))?;
        let resource_id = match segments.get(2) {
            Some(raw) => Some(
                raw.parse::<ResourceId>()
                    .map_err(|_| ScopeError::InvalidResourceId(raw.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            resource_type,
            action,
            resource_id,
        })
    }

    /// The general scope this one narrows, if it is resource-specific
    pub fn parent(&self) -> Option<Self> {
        self.resource_id
            .map(|_| Self::general(self.resource_type, self.action))
    }

    pub fn is_general(&self) -> bool {
        self.resource_id.is_none()
    }

    /// Checks if this scope matches a consumer pattern such as `entity:*`
    pub fn matches(&self, pattern: &str) -> ScopeResult<bool> {
        Ok(ScopePattern::new(pattern)?.matches(self))
    }
}

impl FromStr for Scope {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource_id {
            Some(id) => write!(f, "{}:{}:{}", self.resource_type, self.action, id),
            None => write!(f, "{}:{}", self.resource_type, self.action),
        }
    }
}

/// Wildcard pattern over scope strings
///
/// - `*` matches exactly one segment: `entity:*` matches `entity:read`
/// - `**` (last segment only) matches zero or more: `entity:**` matches
///   `entity:update:<id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopePattern {
    raw: String,
    segments: Vec<String>,
}

impl ScopePattern {
    pub fn new(s: &str) -> ScopeResult<Self> {
        if s.is_empty() {
            return Err(ScopeError::EmptyScope);
        }

        let segments: Vec<String> = s.split(':').map(|s| s.to_string()).collect();

        for (idx, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(ScopeError::EmptySegment);
            }

            if segment.contains('*') && segment != "*" && segment != "**" {
                return Err(ScopeError::InvalidWildcard(format!(
                    "Wildcards must be standalone: '{}'",
                    segment
                )));
            }

            if segment == "**" && idx < segments.len() - 1 {
                return Err(ScopeError::InvalidWildcard(
                    "Double wildcard '**' can only appear at the end".to_string(),
                ));
            }
        }

        if segments.len() > 3 {
            return Err(ScopeError::InvalidFormat(format!(
                "pattern '{}' has more than 3 segments",
                s
            )));
        }

        Ok(Self {
            raw: s.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, scope: &Scope) -> bool {
        let rendered = scope.to_string();
        let scope_segments: Vec<&str> = rendered.split(':').collect();

        if let Some(last) = self.segments.last() {
            if last == "**" {
                let prefix = &self.segments[..self.segments.len() - 1];
                return prefix.len() <= scope_segments.len()
                    && segments_match(prefix, &scope_segments[..prefix.len()]);
            }
        }

        self.segments.len() == scope_segments.len() && segments_match(&self.segments, &scope_segments)
    }
}

fn segments_match(pattern: &[String], scope: &[&str]) -> bool {
    pattern
        .iter()
        .zip(scope.iter())
        .all(|(p, s)| p == "*" || p == s)
}

impl FromStr for ScopePattern {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ScopePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_wire_format_round_trip() {
        let id = Uuid::new_v4();
        let general = Scope::general(ResourceType::Entity, Action::Read);
        let specific = Scope::specific(ResourceType::Entity, Action::Update, id);

        assert_eq!(general.to_string(), "entity:read");
        assert_eq!(specific.to_string(), format!("entity:update:{}", id));
        assert_eq!(Scope::parse(&specific.to_string()).unwrap(), specific);
        assert_eq!(
            Scope::parse("product_family:approve").unwrap(),
            Scope::general(ResourceType::ProductFamily, Action::Approve)
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Scope::parse(""), Err(ScopeError::EmptyScope));
        assert_eq!(Scope::parse("entity::read"), Err(ScopeError::EmptySegment));
        assert!(matches!(Scope::parse("entity"), Err(ScopeError::InvalidFormat(_))));
        assert!(matches!(Scope::parse("widget:read"), Err(ScopeError::UnknownResourceType(_))));
        assert!(matches!(Scope::parse("entity:write"), Err(ScopeError::UnknownAction(_))));
        assert!(matches!(Scope::parse("entity:read:42"), Err(ScopeError::InvalidResourceId(_))));
        assert!(matches!(Scope::parse("entity:*"), Err(ScopeError::InvalidWildcard(_))));
    }

    #[test]
    fn test_single_wildcard_matching() {
        let scope = Scope::general(ResourceType::Entity, Action::Read);
        assert!(scope.matches("entity:*").unwrap());
        assert!(scope.matches("*:read").unwrap());
        assert!(!scope.matches("page:*").unwrap());
        assert!(!scope.matches("entity:*:*").unwrap());
    }

    #[test]
    fn test_double_wildcard_matching() {
        let specific = Scope::specific(ResourceType::Entity, Action::Update, Uuid::new_v4());
        assert!(specific.matches("entity:**").unwrap());
        assert!(specific.matches("entity:update:**").unwrap());
        assert!(!specific.matches("api:**").unwrap());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(ScopePattern::new("entity*"), Err(ScopeError::InvalidWildcard(_))));
        assert!(matches!(ScopePattern::new("**:read"), Err(ScopeError::InvalidWildcard(_))));
        assert!(matches!(ScopePattern::new("a:b:c:d"), Err(ScopeError::InvalidFormat(_))));
    }

    #[test]
    fn test_parent() {
        let specific = Scope::specific(ResourceType::Api, Action::Execute, Uuid::new_v4());
        assert_eq!(specific.parent(), Some(Scope::general(ResourceType::Api, Action::Execute)));
        assert!(Scope::general(ResourceType::Api, Action::Execute).parent().is_none());
    }
}
