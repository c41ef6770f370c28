//! Access requests, decisions and the condition evaluator seam

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::scope::{resource_key, ResolvedScopes};
use crate::types::{Action, Conditions, FieldVisibility, ResourceId, ResourceType, TenantId, UserId};

/// Question asked of the engine: may `user_id` perform `action` on the resource?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub resource_type: ResourceType,
    /// `None` asks about the resource type in general
    pub resource_id: Option<ResourceId>,
    pub action: Action,

    /// Request attributes handed to the condition evaluator (time, IP, record owner)
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl AccessRequest {
    pub fn new(tenant_id: TenantId, user_id: UserId, resource_type: ResourceType, action: Action) -> Self {
        Self {
            tenant_id,
            user_id,
            resource_type,
            resource_id: None,
            action,
            context: serde_json::Map::new(),
        }
    }

    pub fn on(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// `entity` or `entity:<id>`
    pub fn resource_key(&self) -> String {
        resource_key(self.resource_type, self.resource_id)
    }
}

/// Evaluates the opaque condition maps attached to permissions.
///
/// Without an installed evaluator, scopes granted only by conditional
/// permissions are denied.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, conditions: &Conditions, request: &AccessRequest) -> bool;
}

/// Why a decision came out the way it did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionReason {
    /// An unconditional permission produced the scope
    Granted { scope: String },
    /// The explicit superadmin grant
    Superadmin { scope: String },
    /// At least one condition set attached to the scope passed
    ConditionsSatisfied { scope: String },
    /// Every condition set attached to the scope failed
    ConditionsUnmet { scope: String },
    /// The scope is conditional and no evaluator is installed
    NoEvaluator { scope: String },
    /// Neither the specific nor the general scope is present
    NoMatchingScope,
    /// The requested resource is not in the request tenant's catalog, or is
    /// not of the requested type
    ForeignResource { resource_id: ResourceId },
    /// Resolution failed; fail-secure denial
    ResolutionFailed { error: String },
}

impl DecisionReason {
    pub fn scope(&self) -> Option<&str> {
        match self {
            DecisionReason::Granted { scope }
            | DecisionReason::Superadmin { scope }
            | DecisionReason::ConditionsSatisfied { scope }
            | DecisionReason::ConditionsUnmet { scope }
            | DecisionReason::NoEvaluator { scope } => Some(scope),
            DecisionReason::NoMatchingScope
            | DecisionReason::ForeignResource { .. }
            | DecisionReason::ResolutionFailed { .. } => None,
        }
    }
}

/// Outcome of [`crate::engine::AuthzEngine::authorize`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub allowed: bool,
    pub reason: DecisionReason,
    /// Field rules for the requested resource (specific rules over general ones)
    pub field_permissions: BTreeMap<String, FieldVisibility>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn allow(reason: DecisionReason, field_permissions: BTreeMap<String, FieldVisibility>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            allowed: true,
            reason,
            field_permissions,
            decided_at: at,
        }
    }

    pub fn deny(reason: DecisionReason, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            allowed: false,
            reason,
            field_permissions: BTreeMap::new(),
            decided_at: at,
        }
    }
}

/// Match a request against a resolved scope set
pub(crate) fn decide(
    request: &AccessRequest,
    scopes: &ResolvedScopes,
    evaluator: Option<&dyn ConditionEvaluator>,
    at: DateTime<Utc>,
) -> Decision {
    let mut reason = DecisionReason::NoMatchingScope;

    for scope in scopes.grants_for(request.resource_type, request.resource_id, request.action) {
        let granted = match scopes.conditions_for(&scope) {
            None if scopes.superadmin => Some(DecisionReason::Superadmin { scope }),
            None => Some(DecisionReason::Granted { scope }),
            Some(sets) => match evaluator {
                Some(evaluator) if sets.iter().any(|c| evaluator.evaluate(c, request)) => {
                    Some(DecisionReason::ConditionsSatisfied { scope })
                }
                Some(_) => {
                    reason = DecisionReason::ConditionsUnmet { scope };
                    None
                }
                None => {
                    reason = DecisionReason::NoEvaluator { scope };
                    None
                }
            },
        };

        if let Some(granted) = granted {
            return Decision::allow(granted, fields_for(request, scopes), at);
        }
    }

    Decision::deny(reason, at)
}

fn fields_for(request: &AccessRequest, scopes: &ResolvedScopes) -> BTreeMap<String, FieldVisibility> {
    let mut fields = scopes
        .field_permissions
        .get(&resource_key(request.resource_type, None))
        .cloned()
        .unwrap_or_default();

    if request.resource_id.is_some() {
        if let Some(specific) = scopes.field_permissions.get(&request.resource_key()) {
            fields.extend(specific.iter().map(|(f, v)| (f.clone(), *v)));
        }
    }
    fields
}
