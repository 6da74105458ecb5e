//! Seller withdrawals
//!
//! A request holds its amount against the seller's wallet under the
//! request id. Approval captures the hold, rejection and cancellation
//! release it. A seller has at most one PENDING request.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::entities::withdraw_request::{self, Entity as WithdrawRequestEntity, WithdrawStatus};
use crate::errors::ServiceError;
use crate::events::audit::{AuditCategory, AuditEvent, AuditOutcome, SharedAuditSink};
use crate::events::{Event, EventSender};
use crate::services::holds::{capture_hold_in, hold_for_order_in, place_hold_in, release_hold_in};
use crate::services::wallet::{lock_wallet_in, money};

pub const LAPSED_NOTE: &str = "review window lapsed";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WithdrawInput {
    pub amount: Decimal,
    #[validate(length(min = 1, max = 64, message = "Bank account number is required"))]
    pub bank_account_number: String,
    #[validate(length(min = 1, max = 128, message = "Bank account name is required"))]
    pub bank_account_name: String,
    #[validate(length(min = 1, max = 128, message = "Bank name is required"))]
    pub bank_name: String,
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct WithdrawalSettings {
    pub min_amount: Decimal,
    /// Lifetime of the hold backing a pending request
    pub review_window: Duration,
}

impl From<&AppConfig> for WithdrawalSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            min_amount: config.min_withdrawal_amount,
            review_window: Duration::days(config.withdrawal_review_days as i64),
        }
    }
}

#[derive(Clone)]
pub struct WithdrawalService {
    db: Arc<DatabaseConnection>,
    clock: SharedClock,
    events: EventSender,
    audit: SharedAuditSink,
    settings: WithdrawalSettings,
}

impl WithdrawalService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        clock: SharedClock,
        events: EventSender,
        audit: SharedAuditSink,
        settings: WithdrawalSettings,
    ) -> Self {
        Self {
            db,
            clock,
            events,
            audit,
            settings,
        }
    }

    /// Opens a request and holds its amount. Fails with `InsufficientFunds`
    /// when the wallet's available balance is short.
    #[instrument(skip(self, input), fields(amount = %input.amount))]
    pub async fn request(
        &self,
        user_id: Uuid,
        input: WithdrawInput,
    ) -> Result<withdraw_request::Model, ServiceError> {
        input.validate()?;
        let bank_fields = [
            &input.bank_account_number,
            &input.bank_account_name,
            &input.bank_name,
        ];
        if bank_fields.iter().any(|f| f.trim().is_empty()) {
            return Err(ServiceError::ValidationError(
                "bank account details must not be blank".to_string(),
            ));
        }
        let amount = money(input.amount);
        if amount < self.settings.min_amount {
            return Err(ServiceError::ValidationError(format!(
                "withdrawal amount must be at least {}",
                self.settings.min_amount
            )));
        }

        let now = self.clock.now();
        let txn = self.db.begin().await?;
        // The wallet lock serializes requests of the same seller
        lock_wallet_in(&txn, user_id, now).await?;
        if pending_for_user_in(&txn, user_id).await?.is_some() {
            return Err(ServiceError::InvalidInput(
                "a withdrawal request is already pending".to_string(),
            ));
        }

        let request = withdraw_request::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            amount: Set(amount),
            status: Set(WithdrawStatus::Pending.as_str().to_string()),
            bank_account_number: Set(input.bank_account_number.trim().to_string()),
            bank_account_name: Set(input.bank_account_name.trim().to_string()),
            bank_name: Set(input.bank_name.trim().to_string()),
            note: Set(input.note),
            reviewed_by: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(&txn)
        .await?;

        if let Err(err) = place_hold_in(
            &txn,
            user_id,
            request.id,
            amount,
            now,
            now + self.settings.review_window,
        )
        .await
        {
            txn.rollback().await?;
            warn!(%user_id, %amount, error = %err, "Withdrawal request rejected");
            return Err(err);
        }
        txn.commit().await?;

        counter!("keymart_wallet.withdrawals_requested", 1);
        info!(request_id = %request.id, %user_id, %amount, "Withdrawal requested");
        self.announce(&request, Some(user_id));
        Ok(request)
    }

    /// PENDING -> APPROVED. The held funds leave the wallet.
    #[instrument(skip(self))]
    pub async fn approve(
        &self,
        request_id: Uuid,
        reviewer: Uuid,
    ) -> Result<withdraw_request::Model, ServiceError> {
        self.resolve(request_id, WithdrawStatus::Approved, Some(reviewer), None)
            .await
    }

    /// PENDING -> REJECTED. The held funds become available again.
    #[instrument(skip(self))]
    pub async fn reject(
        &self,
        request_id: Uuid,
        reviewer: Uuid,
        note: Option<String>,
    ) -> Result<withdraw_request::Model, ServiceError> {
        self.resolve(request_id, WithdrawStatus::Rejected, Some(reviewer), note)
            .await
    }

    /// Seller-side withdrawal of a pending request. Requests of other
    /// sellers read as not found.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        request_id: Uuid,
        user_id: Uuid,
    ) -> Result<withdraw_request::Model, ServiceError> {
        let owned = self.get(request_id).await?;
        if owned.user_id != user_id {
            return Err(not_found(request_id));
        }
        self.resolve(request_id, WithdrawStatus::Cancelled, None, None)
            .await
    }

    /// Cancels a request whose hold outlived the review window. Returns
    /// false when `request_id` names no pending request.
    #[instrument(skip(self))]
    pub async fn expire(&self, request_id: Uuid) -> Result<bool, ServiceError> {
        let now = self.clock.now();
        let txn = self.db.begin().await?;
        let Some(request) = WithdrawRequestEntity::find_by_id(request_id)
            .lock_exclusive()
            .one(&txn)
            .await?
        else {
            txn.commit().await?;
            return Ok(false);
        };
        if !request.is_pending() {
            txn.commit().await?;
            return Ok(false);
        }

        let request = close_in(
            &txn,
            request,
            WithdrawStatus::Cancelled,
            None,
            Some(LAPSED_NOTE.to_string()),
            now,
        )
        .await?;
        txn.commit().await?;

        counter!("keymart_wallet.withdrawals_lapsed", 1);
        warn!(%request_id, user_id = %request.user_id, "Withdrawal request lapsed without review");
        self.announce(&request, None);
        Ok(true)
    }

    async fn resolve(
        &self,
        request_id: Uuid,
        status: WithdrawStatus,
        reviewer: Option<Uuid>,
        note: Option<String>,
    ) -> Result<withdraw_request::Model, ServiceError> {
        let now = self.clock.now();
        let txn = self.db.begin().await?;
        let request = WithdrawRequestEntity::find_by_id(request_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| not_found(request_id))?;
        if !request.is_pending() {
            return Err(ServiceError::InvalidInput(format!(
                "withdrawal request {} is already {}",
                request_id, request.status
            )));
        }

        let request = close_in(&txn, request, status, reviewer, note, now).await?;
        txn.commit().await?;

        counter!("keymart_wallet.withdrawals_resolved", 1);
        info!(%request_id, status = status.as_str(), amount = %request.amount, "Withdrawal resolved");
        self.announce(&request, reviewer.or(Some(request.user_id)));
        Ok(request)
    }

    fn announce(&self, request: &withdraw_request::Model, actor: Option<Uuid>) {
        self.events.notify(Event::WithdrawalUpdated {
            request_id: request.id,
            user_id: request.user_id,
            amount: request.amount,
            status: request.status.clone(),
        });
        let mut audit =
            AuditEvent::new("wallet.withdrawal", AuditCategory::Wallet, AuditOutcome::Success)
                .subject(request.id)
                .detail(request.status.clone());
        if let Some(actor) = actor {
            audit = audit.actor(actor);
        }
        self.audit.record(audit);
    }

    pub async fn get(&self, request_id: Uuid) -> Result<withdraw_request::Model, ServiceError> {
        WithdrawRequestEntity::find_by_id(request_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| not_found(request_id))
    }

    /// A seller's requests, newest first.
    pub async fn for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<withdraw_request::Model>, ServiceError> {
        let requests = WithdrawRequestEntity::find()
            .filter(withdraw_request::Column::UserId.eq(user_id))
            .order_by_desc(withdraw_request::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(requests)
    }

    /// Review queue for operators, newest first.
    pub async fn pending(&self, limit: u64) -> Result<Vec<withdraw_request::Model>, ServiceError> {
        let requests = WithdrawRequestEntity::find()
            .filter(withdraw_request::Column::Status.eq(WithdrawStatus::Pending.as_str()))
            .order_by_desc(withdraw_request::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok(requests)
    }
}

fn not_found(request_id: Uuid) -> ServiceError {
    ServiceError::NotFound(format!("Withdrawal request {} not found", request_id))
}

async fn pending_for_user_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<Option<withdraw_request::Model>, ServiceError> {
    let pending = WithdrawRequestEntity::find()
        .filter(withdraw_request::Column::UserId.eq(user_id))
        .filter(withdraw_request::Column::Status.eq(WithdrawStatus::Pending.as_str()))
        .one(conn)
        .await?;
    Ok(pending)
}

/// Settles the request's hold to match `status` and records the outcome.
async fn close_in<C: ConnectionTrait>(
    conn: &C,
    request: withdraw_request::Model,
    status: WithdrawStatus,
    reviewer: Option<Uuid>,
    note: Option<String>,
    now: DateTime<Utc>,
) -> Result<withdraw_request::Model, ServiceError> {
    let hold = hold_for_order_in(conn, request.id).await?.ok_or_else(|| {
        ServiceError::InvalidTransition(format!("withdrawal {} has no hold", request.id))
    })?;
    match status {
        WithdrawStatus::Approved => capture_hold_in(conn, hold.id, now).await?,
        WithdrawStatus::Rejected | WithdrawStatus::Cancelled => {
            release_hold_in(conn, hold.id, now).await?
        }
        WithdrawStatus::Pending => {
            return Err(ServiceError::InvalidTransition(format!(
                "withdrawal {} cannot move back to PENDING",
                request.id
            )))
        }
    }

    let mut active: withdraw_request::ActiveModel = request.into();
    active.status = Set(status.as_str().to_string());
    active.reviewed_by = Set(reviewer);
    if note.is_some() {
        active.note = Set(note);
    }
    active.updated_at = Set(Some(now));
    Ok(active.update(conn).await?)
}
