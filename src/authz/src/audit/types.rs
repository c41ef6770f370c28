//! Audit event types

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::{TenantId, UserId};

/// Events at or above this score are elevations and must be acknowledged
pub const CRITICAL_RISK: f64 = 0.9;

/// Outcome recorded for an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Failure => "failure",
            AuditResult::Denied => "denied",
        }
    }
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk score in `0.0..=1.0`; out-of-range input is clamped, NaN counts as maximal risk
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct RiskScore(f64);

impl RiskScore {
    pub const MIN: RiskScore = RiskScore(0.0);
    pub const MAX: RiskScore = RiskScore(1.0);

    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self::MAX;
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl From<RiskScore> for f64 {
    fn from(score: RiskScore) -> f64 {
        score.0
    }
}

impl From<f64> for RiskScore {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// `None` for events not tied to a tenant (e.g. rate limiting an unknown identifier)
    pub tenant_id: Option<TenantId>,
    pub actor_id: Option<UserId>,
    /// What happened, e.g. `scope.resolve` or `role.assign`
    pub action: String,
    /// Reference to the affected object, e.g. `entity:<id>` or `role:<id>`
    pub resource: Option<String>,
    pub result: AuditResult,
    pub risk_score: RiskScore,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, result: AuditResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: None,
            actor_id: None,
            action: action.into(),
            resource: None,
            result,
            risk_score: RiskScore::MIN,
            details: None,
            created_at: Utc::now(),
        }
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn actor(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn risk(mut self, score: f64) -> Self {
        self.risk_score = RiskScore::new(score);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Denials, failures and elevations; their loss must surface to the caller
    pub fn is_critical(&self) -> bool {
        self.result != AuditResult::Success || self.risk_score.value() >= CRITICAL_RISK
    }
}

/// Physical partition an event lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionKey {
    Month { year: i32, month: u32 },
    /// Catch-all for timestamps with no provisioned month
    Default,
}

impl PartitionKey {
    pub fn month_of(at: DateTime<Utc>) -> Self {
        PartitionKey::Month {
            year: at.year(),
            month: at.month(),
        }
    }

    /// The month after this one; `Default` has no successor
    pub fn next(&self) -> Option<Self> {
        match *self {
            PartitionKey::Month { year, month: 12 } => Some(PartitionKey::Month {
                year: year + 1,
                month: 1,
            }),
            PartitionKey::Month { year, month } => Some(PartitionKey::Month {
                year,
                month: month + 1,
            }),
            PartitionKey::Default => None,
        }
    }

    /// Table name of the partition
    pub fn table_name(&self) -> String {
        match self {
            PartitionKey::Month { year, month } => format!("audit_events_{:04}_{:02}", year, month),
            PartitionKey::Default => "audit_events_default".to_string(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table_name())
    }
}
