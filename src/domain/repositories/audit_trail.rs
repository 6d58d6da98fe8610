use crate::domain::errors::LedgerError;
use async_trait::async_trait;
use serde_json::Value;

/// Kinds of events appended to the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    LoopStarted,
    LoopStopped,
    EntrySubmitted,
    EntryConfirmed,
    EntryRejected,
    EntryFailed,
    EntrySkipped,
    ExitSubmitted,
    ExitConfirmed,
    ExitRejected,
    ExitFailed,
    PositionVanished,
    UntrackedPosition,
    LedgerConflict,
    CredentialsRejected,
    UserDeactivated,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LoopStarted => "loop_started",
            AuditEventType::LoopStopped => "loop_stopped",
            AuditEventType::EntrySubmitted => "entry_submitted",
            AuditEventType::EntryConfirmed => "entry_confirmed",
            AuditEventType::EntryRejected => "entry_rejected",
            AuditEventType::EntryFailed => "entry_failed",
            AuditEventType::EntrySkipped => "entry_skipped",
            AuditEventType::ExitSubmitted => "exit_submitted",
            AuditEventType::ExitConfirmed => "exit_confirmed",
            AuditEventType::ExitRejected => "exit_rejected",
            AuditEventType::ExitFailed => "exit_failed",
            AuditEventType::PositionVanished => "position_vanished",
            AuditEventType::UntrackedPosition => "untracked_position",
            AuditEventType::LedgerConflict => "ledger_conflict",
            AuditEventType::CredentialsRejected => "credentials_rejected",
            AuditEventType::UserDeactivated => "user_deactivated",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub event_type: AuditEventType,
    pub user_id: String,
    pub symbol: Option<String>,
    pub details: Value,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType, user_id: &str) -> Self {
        AuditEntry {
            event_type,
            user_id: user_id.to_string(),
            symbol: None,
            details: Value::Null,
        }
    }

    pub fn symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Append-only log of trade attempts and loop lifecycle events
#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), LedgerError>;
}
