//! PostgreSQL audit sink
//!
//! Writes into `audit_events`, a table range-partitioned by `created_at` with
//! one partition per month and a DEFAULT partition for everything else (see
//! `migrations/`). Rows are append-only; a trigger rejects updates.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::sink::AuditSink;
use super::types::{AuditEvent, PartitionKey};
use crate::error::{AuthzError, Result};

/// Audit sink backed by a partitioned PostgreSQL table
pub struct PostgresAuditSink {
    pool: PgPool,
}

impl PostgresAuditSink {
    /// Connect and apply migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| AuthzError::DatabaseError(format!("Failed to connect: {}", e)))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AuthzError::DatabaseError(format!("Migration failed: {}", e)))?;

        info!("PostgreSQL audit sink connected");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create monthly partitions for `count` months starting at `from`
    pub async fn provision_months(&self, from: DateTime<Utc>, count: u32) -> Result<()> {
        let mut key = PartitionKey::month_of(from);
        for _ in 0..count {
            let next = match key.next() {
                Some(next) => next,
                None => break,
            };
            let (start, end) = (month_start(key)?, month_start(next)?);

            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} PARTITION OF audit_events \
                 FOR VALUES FROM ('{}') TO ('{}')",
                key.table_name(),
                start.to_rfc3339(),
                end.to_rfc3339()
            );
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| AuthzError::DatabaseError(e.to_string()))?;

            debug!(partition = %key, "Audit partition provisioned");
            key = next;
        }
        Ok(())
    }

    /// Detach and drop monthly partitions older than `cutoff`'s month
    pub async fn drop_partitions_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = PartitionKey::month_of(cutoff);
        let tables: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT child.relname::text
            FROM pg_inherits
            JOIN pg_class parent ON pg_inherits.inhparent = parent.oid
            JOIN pg_class child ON pg_inherits.inhrelid = child.oid
            WHERE parent.relname = 'audit_events'
              AND child.relname ~ '^audit_events_[0-9]{4}_[0-9]{2}$'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuthzError::DatabaseError(e.to_string()))?;

        let mut dropped = Vec::new();
        for (table,) in tables {
            if table < cutoff.table_name() {
                sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                    .execute(&self.pool)
                    .await
                    .map_err(|e| AuthzError::DatabaseError(e.to_string()))?;
                dropped.push(table);
            }
        }

        info!(cutoff = %cutoff, dropped = dropped.len(), "Audit partitions dropped");
        Ok(dropped)
    }
}

#[async_trait]
impl AuditSink for PostgresAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                id, tenant_id, actor_id, action, resource,
                result, risk_score, details, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(event.actor_id)
        .bind(&event.action)
        .bind(&event.resource)
        .bind(event.result.as_str())
        .bind(event.risk_score.value())
        .bind(&event.details)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::AuditUnavailable(e.to_string()))?;

        Ok(())
    }
}

fn month_start(key: PartitionKey) -> Result<DateTime<Utc>> {
    match key {
        PartitionKey::Month { year, month } => Utc
            .with_ymd_and_hms(year, month, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| AuthzError::Internal(format!("invalid partition month {}-{}", year, month))),
        PartitionKey::Default => Err(AuthzError::Internal("default partition has no range".to_string())),
    }
}
