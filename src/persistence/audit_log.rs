//! Audit log repository

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error};

use super::models::AuditLogRecord;
use super::{DatabaseError, DbPool};
use crate::domain::errors::LedgerError;
use crate::domain::repositories::{AuditEntry, AuditTrail};

pub struct AuditLogRepository {
    pool: DbPool,
}

impl AuditLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append an audit log entry
    pub async fn create(&self, entry: &AuditEntry) -> Result<AuditLogRecord, DatabaseError> {
        let details_json = serde_json::to_string(&entry.details)
            .map_err(|e| DatabaseError::QueryError(format!("Failed to serialize details: {}", e)))?;

        let record = sqlx::query_as::<_, AuditLogRecord>(
            r#"
            INSERT INTO audit_log (event_type, user_id, symbol, details, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING *
            "#,
        )
        .bind(entry.event_type.as_str())
        .bind(&entry.user_id)
        .bind(&entry.symbol)
        .bind(&details_json)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create audit log: {}", e);
            DatabaseError::QueryError(format!("Failed to create audit log: {}", e))
        })?;

        debug!("Audit: {} for user {}", record.event_type, record.user_id);
        Ok(record)
    }

    /// Most recent entries for one user
    pub async fn get_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditLogRecord>, DatabaseError> {
        sqlx::query_as::<_, AuditLogRecord>(
            "SELECT * FROM audit_log WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get audit logs for user {}: {}", user_id, e);
            DatabaseError::QueryError(format!("Failed to get audit logs: {}", e))
        })
    }

    /// Get audit logs by event type
    pub async fn get_by_event_type(
        &self,
        event_type: &str,
        limit: i64,
    ) -> Result<Vec<AuditLogRecord>, DatabaseError> {
        sqlx::query_as::<_, AuditLogRecord>(
            "SELECT * FROM audit_log WHERE event_type = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(event_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get audit logs for event type {}: {}", event_type, e);
            DatabaseError::QueryError(format!("Failed to get audit logs: {}", e))
        })
    }
}

#[async_trait]
impl AuditTrail for AuditLogRepository {
    async fn record(&self, entry: AuditEntry) -> Result<(), LedgerError> {
        self.create(&entry)
            .await
            .map(|_| ())
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }
}
