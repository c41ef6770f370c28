//! Audit trail guarantees: decisions and mutations are recorded, and a dead
//! sink never turns into silent allows or unrecorded elevations.

mod common;

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;

use common::Harness;
use tessera_authz::audit::{BufferedAuditSink, InMemoryAuditSink, PartitionKey};
use tessera_authz::config::{AuditSection, EngineConfig};
use tessera_authz::roles::NewRole;
use tessera_authz::types::{Action, ResourceType};
use tessera_authz::{AccessRequest, AuditResult, AuditSink, AuthzError};

#[tokio::test]
async fn test_denial_is_audited_with_risk() {
    let h = Harness::new();
    let (tenant, ctx) = h.tenant("acme").await;

    let request = AccessRequest::new(tenant.id, ctx.user_id(), ResourceType::Api, Action::Delete);
    assert!(!h.engine.authorize(&request).await.unwrap().allowed);

    let event = h
        .audit
        .events_for_tenant(tenant.id)
        .into_iter()
        .find(|e| e.action == "access.check")
        .unwrap();
    assert_eq!(event.result, AuditResult::Denied);
    assert_eq!(event.actor_id, Some(ctx.user_id()));
    assert_eq!(event.resource.as_deref(), Some("api"));
    assert!((event.risk_score.value() - 0.6).abs() < f64::EPSILON);
    assert!(event.is_critical());
}

#[tokio::test]
async fn test_unavailable_sink_fails_the_decision() {
    let h = Harness::new();
    let (tenant, ctx) = h.tenant("acme").await;
    let role = h.role_with(&ctx, "viewer", 1, ResourceType::Page, &[Action::Read]).await;
    h.engine.assign_role(&ctx, ctx.user_id(), role.id, None).await.unwrap();

    h.audit.set_available(false);

    let request = AccessRequest::new(tenant.id, ctx.user_id(), ResourceType::Page, Action::Read);
    let err = h.engine.authorize(&request).await.unwrap_err();
    assert!(matches!(err, AuthzError::AuditUnavailable(_)));

    // The boolean form fails closed even though the scope is held
    assert!(
        !h.engine
            .check_permission(tenant.id, ctx.user_id(), ResourceType::Page, None, Action::Read)
            .await
    );
}

#[tokio::test]
async fn test_mutation_reports_unavailable_sink() {
    let h = Harness::new();
    let (_tenant, ctx) = h.tenant("acme").await;

    h.audit.set_available(false);
    let err = h
        .engine
        .create_role(&ctx, NewRole::new("auditor", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::AuditUnavailable(_)));
}

#[tokio::test]
async fn test_superadmin_grant_blocked_without_audit() {
    let h = Harness::new();
    let (tenant, ctx) = h.tenant("acme").await;
    let root = h.user(&tenant, "root@acme.test").await;

    h.audit.set_available(false);
    let err = h
        .engine
        .grant_superadmin(ctx.user_id(), root.id, "break glass")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::AuditUnavailable(_)));

    h.audit.set_available(true);
    assert!(h.engine.superadmin_grant(root.id).is_none());
    assert!(h.engine.resolve_scopes(tenant.id, root.id).await.scopes.is_empty());
}

#[tokio::test]
async fn test_failed_mutation_audited_as_failure() {
    let h = Harness::new();
    let (_tenant, ctx) = h.tenant("acme").await;

    h.engine.create_role(&ctx, NewRole::new("ops", 1)).await.unwrap();
    let err = h.engine.create_role(&ctx, NewRole::new("ops", 1)).await.unwrap_err();
    assert!(matches!(err, AuthzError::Duplicate(_)));

    let failures: Vec<_> = h
        .audit
        .events_for_actor(ctx.user_id())
        .into_iter()
        .filter(|e| e.action == "role.create" && e.result == AuditResult::Failure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].risk_score.value() >= 0.8);
}

#[tokio::test]
async fn test_resolution_failure_is_audited() {
    let h = Harness::new();
    let (tenant, _ctx) = h.tenant("acme").await;
    let stranger = uuid::Uuid::new_v4();

    assert!(h.engine.resolve_scopes(tenant.id, stranger).await.is_fail_secure());

    let event = h
        .audit
        .events_for_actor(stranger)
        .into_iter()
        .find(|e| e.action == "scope.resolve")
        .unwrap();
    assert_eq!(event.result, AuditResult::Failure);
}

#[tokio::test]
async fn test_events_partitioned_by_month() {
    let h = Harness::new();
    let (tenant, _ctx) = h.tenant("acme").await;
    let march = PartitionKey::Month { year: 2026, month: 3 };

    let before = h.audit.partition_len(march);
    assert!(before > 0);

    // Beyond the three provisioned months events land in the default partition
    h.clock.set(Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap());
    h.engine.create_tenant("late", None).await.unwrap();
    assert_eq!(h.audit.partition_len(PartitionKey::Default), 1);

    // Retention drops whole months, never the default partition
    let removed = h.audit.drop_partitions_before(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap());
    assert_eq!(removed, before);
    assert_eq!(h.audit.partition_len(march), 0);
    assert_eq!(h.audit.partition_len(PartitionKey::Default), 1);
    assert!(h.audit.events_for_tenant(tenant.id).is_empty());
}

#[tokio::test]
async fn test_buffered_sink_behind_engine() {
    let store = Arc::new(InMemoryAuditSink::new());
    let buffered = Arc::new(BufferedAuditSink::spawn(
        store.clone() as Arc<dyn AuditSink>,
        &AuditSection::default(),
    ));

    let sink = buffered.clone();
    let h = Harness::build(EngineConfig::default(), move |builder| {
        builder.audit_sink(sink as Arc<dyn AuditSink>)
    });
    let (tenant, ctx) = h.tenant("acme").await;

    let request = AccessRequest::new(tenant.id, ctx.user_id(), ResourceType::Entity, Action::Read);
    assert!(!h.engine.authorize(&request).await.unwrap().allowed);

    buffered.flush().await.unwrap();
    let actions: Vec<String> = store.events().into_iter().map(|e| e.action).collect();
    assert_eq!(actions.first().map(String::as_str), Some("tenant.create"));
    assert_eq!(actions.last().map(String::as_str), Some("access.check"));
    assert_eq!(buffered.dropped(), 0);

    // An outage behind the queue surfaces on the next critical event
    store.set_available(false);
    let err = h.engine.authorize(&request).await.unwrap_err();
    assert!(matches!(err, AuthzError::AuditUnavailable(_)));
    assert!(buffered.failed() >= 1);
}

#[tokio::test]
async fn test_rate_limit_denial_audited_without_identifier() {
    let h = Harness::new();
    let identifier = "mallory@example.test";

    for _ in 0..5 {
        assert!(h.engine.check_rate_limit(identifier, "login").await);
    }
    assert!(!h.engine.check_rate_limit(identifier, "login").await);

    let event = h
        .audit
        .events()
        .into_iter()
        .find(|e| e.action == "rate_limit.exceeded")
        .unwrap();
    assert_eq!(event.result, AuditResult::Denied);
    let details = event.details.unwrap().to_string();
    assert!(!details.contains(identifier));
    assert!(details.contains("identifier_hash"));

    h.clock.advance(Duration::seconds(61));
    assert!(h.engine.check_rate_limit(identifier, "login").await);
}

#[tokio::test]
async fn test_rate_limit_denial_fails_when_unaudited() {
    let h = Harness::new();
    let identifier = "mallory@example.test";

    for _ in 0..5 {
        h.engine.enforce_rate_limit(identifier, "login").await.unwrap();
    }
    let err = h.engine.enforce_rate_limit(identifier, "login").await.unwrap_err();
    assert!(matches!(err, AuthzError::RateLimitExceeded(_)));

    h.audit.set_available(false);
    let err = h.engine.enforce_rate_limit(identifier, "login").await.unwrap_err();
    assert!(matches!(err, AuthzError::AuditUnavailable(_)));
    assert!(!h.engine.check_rate_limit(identifier, "login").await);

    // Allowed attempts write no audit event, so they are unaffected
    assert!(h.engine.check_rate_limit("carol@example.test", "login").await);
}
