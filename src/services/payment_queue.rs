//! Internal payment queue for wallet-funded orders.
//!
//! Checkout enqueues one entry per wallet order. A worker, or checkout
//! itself with `confirm_now`, drains it into the same settle transition the
//! gateway callback uses.

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::sea_query::{Expr, LockBehavior, LockType, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::order::SettlementState;
use crate::entities::payment_queue::{self, Entity as PaymentQueueEntity, QueueStatus};
use crate::errors::ServiceError;
use crate::services::settlement::{SettlementCoordinator, TransitionOutcome};

/// Idempotent per order: a second enqueue returns the existing entry.
pub async fn enqueue_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    user_id: Uuid,
    amount: Decimal,
    now: DateTime<Utc>,
) -> Result<payment_queue::Model, ServiceError> {
    let entry = payment_queue::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        user_id: Set(user_id),
        amount: Set(amount),
        status: Set(QueueStatus::Pending.as_str().to_string()),
        error_message: Set(None),
        created_at: Set(now),
        processed_at: Set(None),
    };
    PaymentQueueEntity::insert(entry)
        .on_conflict(
            OnConflict::column(payment_queue::Column::OrderId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    PaymentQueueEntity::find()
        .filter(payment_queue::Column::OrderId.eq(order_id))
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::InternalError(format!("queue entry for {} vanished", order_id)))
}

pub async fn entry_for_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Option<payment_queue::Model>, ServiceError> {
    let entry = PaymentQueueEntity::find()
        .filter(payment_queue::Column::OrderId.eq(order_id))
        .one(conn)
        .await?;
    Ok(entry)
}

/// Moves the order's entry to FAILED if it is still PENDING or PROCESSING.
/// Runs inside the abort transaction so no entry stays open once its order
/// is terminal, including one a crashed worker left in PROCESSING.
pub async fn fail_open_entry_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool, ServiceError> {
    let result = PaymentQueueEntity::update_many()
        .col_expr(
            payment_queue::Column::Status,
            Expr::value(QueueStatus::Failed.as_str()),
        )
        .col_expr(
            payment_queue::Column::ErrorMessage,
            Expr::value(Some(reason.to_string())),
        )
        .col_expr(payment_queue::Column::ProcessedAt, Expr::value(Some(now)))
        .filter(payment_queue::Column::OrderId.eq(order_id))
        .filter(payment_queue::Column::Status.is_in([
            QueueStatus::Pending.as_str(),
            QueueStatus::Processing.as_str(),
        ]))
        .exec(conn)
        .await?;
    if result.rows_affected > 0 {
        debug!(%order_id, reason, "Open queue entry failed with its order");
    }
    Ok(result.rows_affected > 0)
}

/// PENDING -> PROCESSING. Entries locked by another worker are skipped.
async fn claim_entry(
    coordinator: &SettlementCoordinator,
    order_id: Uuid,
) -> Result<Option<payment_queue::Model>, ServiceError> {
    let txn = coordinator.db().begin().await?;
    let entry = PaymentQueueEntity::find()
        .filter(payment_queue::Column::OrderId.eq(order_id))
        .filter(payment_queue::Column::Status.eq(QueueStatus::Pending.as_str()))
        .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
        .one(&txn)
        .await?;

    let Some(entry) = entry else {
        txn.commit().await?;
        return Ok(None);
    };

    let mut active: payment_queue::ActiveModel = entry.into();
    active.status = Set(QueueStatus::Processing.as_str().to_string());
    let entry = active.update(&txn).await?;
    txn.commit().await?;
    Ok(Some(entry))
}

async fn finish_entry(
    coordinator: &SettlementCoordinator,
    entry_id: Uuid,
    status: QueueStatus,
    error_message: Option<String>,
) -> Result<(), ServiceError> {
    let entry = PaymentQueueEntity::find_by_id(entry_id)
        .one(coordinator.db())
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Queue entry {} not found", entry_id)))?;
    let mut active: payment_queue::ActiveModel = entry.into();
    active.status = Set(status.as_str().to_string());
    active.error_message = Set(error_message);
    active.processed_at = Set(Some(coordinator.now()));
    active.update(coordinator.db()).await?;
    Ok(())
}

/// Confirms payment for one wallet order through its queue entry and
/// returns the entry's resulting status. Entries that already left PENDING
/// are reported as they are, so each one is processed exactly once.
#[instrument(skip(coordinator))]
pub async fn process_order(
    coordinator: &SettlementCoordinator,
    order_id: Uuid,
) -> Result<QueueStatus, ServiceError> {
    let Some(entry) = claim_entry(coordinator, order_id).await? else {
        let existing = entry_for_order(coordinator.db(), order_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No payment queue entry for order {}", order_id))
            })?;
        debug!(%order_id, status = %existing.status, "Queue entry not pending, skipping");
        return Ok(existing.queue_status().unwrap_or(QueueStatus::Processing));
    };

    let reference = format!("WALLET:{}", entry.id);
    let (status, message) = match coordinator.settle(order_id, Some(reference)).await {
        Ok(TransitionOutcome::Applied(_)) => (QueueStatus::Completed, None),
        Ok(TransitionOutcome::AlreadyTerminal(view))
            if view.settlement_state == SettlementState::Settled.as_str() =>
        {
            (QueueStatus::Completed, None)
        }
        Ok(TransitionOutcome::AlreadyTerminal(view)) => (
            QueueStatus::Failed,
            Some(format!("order already {}", view.settlement_state)),
        ),
        Err(err) => {
            warn!(%order_id, error = %err, "Wallet payment failed, aborting order");
            if let Err(abort_err) = coordinator
                .abort(order_id, &format!("payment_failed: {}", err))
                .await
            {
                error!(%order_id, error = %abort_err, "Failed to abort order after payment failure");
            }
            (QueueStatus::Failed, Some(err.to_string()))
        }
    };

    finish_entry(coordinator, entry.id, status, message).await?;
    match status {
        QueueStatus::Completed => counter!("keymart_payment_queue.completed", 1),
        _ => counter!("keymart_payment_queue.failed", 1),
    }
    info!(%order_id, status = status.as_str(), "Payment queue entry processed");
    Ok(status)
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DrainReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct PaymentQueueWorker {
    coordinator: Arc<SettlementCoordinator>,
    batch_size: u64,
}

impl PaymentQueueWorker {
    pub fn new(coordinator: Arc<SettlementCoordinator>, batch_size: u64) -> Self {
        Self {
            coordinator,
            batch_size,
        }
    }

    /// Processes up to one batch of PENDING entries, oldest first.
    #[instrument(skip(self))]
    pub async fn drain_once(&self) -> Result<DrainReport, ServiceError> {
        let pending = PaymentQueueEntity::find()
            .filter(payment_queue::Column::Status.eq(QueueStatus::Pending.as_str()))
            .order_by_asc(payment_queue::Column::CreatedAt)
            .limit(self.batch_size)
            .all(self.coordinator.db())
            .await?;

        let mut report = DrainReport::default();
        for entry in pending {
            match process_order(&self.coordinator, entry.order_id).await {
                Ok(QueueStatus::Completed) => report.completed += 1,
                Ok(QueueStatus::Failed) => report.failed += 1,
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    error!(order_id = %entry.order_id, error = %err, "Payment queue entry errored");
                    report.failed += 1;
                }
            }
        }
        if report.completed + report.failed > 0 {
            info!(?report, "Payment queue drained");
        }
        Ok(report)
    }

    /// Polls forever at `interval`.
    pub async fn run(self, interval: Duration) {
        info!(?interval, batch_size = self.batch_size, "Payment queue worker started");
        loop {
            if let Err(e) = self.drain_once().await {
                error!("payment queue worker error: {}", e);
            }
            sleep(interval).await;
        }
    }
}
