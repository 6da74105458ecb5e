use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Inventory,
    Wallet,
    Order,
    Payment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failure,
}

/// Immutable record of a state transition, handed to the audit collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub action: &'static str,
    pub category: AuditCategory,
    pub outcome: AuditOutcome,
    /// User who initiated the transition, when there is one
    pub actor: Option<Uuid>,
    pub subject: Option<Uuid>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &'static str, category: AuditCategory, outcome: AuditOutcome) -> Self {
        Self {
            action,
            category,
            outcome,
            actor: None,
            subject: None,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn actor(mut self, actor: Uuid) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn subject(mut self, subject: Uuid) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

pub type SharedAuditSink = Arc<dyn AuditSink>;

/// Writes audit events as structured log lines under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            action = event.action,
            category = ?event.category,
            outcome = ?event.outcome,
            actor = ?event.actor,
            subject = ?event.subject,
            detail = event.detail.as_deref().unwrap_or(""),
            at = %event.at.to_rfc3339(),
            "audit"
        );
    }
}
