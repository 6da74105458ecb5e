//! Hold Manager
//!
//! Time-bounded earmarks of wallet funds against a pending order. Holds
//! never change the confirmed balance; only a capture does.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::entities::wallet_history::EntryType;
use crate::entities::wallet_hold::{self, Entity as WalletHoldEntity, HoldStatus};
use crate::errors::ServiceError;
use crate::services::wallet::{
    active_holds_total_in, append_entry_in, debit_captured_in, lock_wallet_in, money, LedgerEntry,
};

#[derive(Clone)]
pub struct HoldManager {
    db: Arc<DatabaseConnection>,
    clock: SharedClock,
}

impl HoldManager {
    pub fn new(db: Arc<DatabaseConnection>, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    #[instrument(skip(self))]
    pub async fn place_hold(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
        ttl: Duration,
    ) -> Result<Uuid, ServiceError> {
        let now = self.clock.now();
        let txn = self.db.begin().await?;
        let hold = place_hold_in(&txn, user_id, order_id, amount, now, now + ttl).await?;
        txn.commit().await?;
        Ok(hold.id)
    }

    #[instrument(skip(self))]
    pub async fn capture_hold(&self, hold_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        capture_hold_in(&txn, hold_id, self.clock.now()).await?;
        txn.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn release_hold(&self, hold_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        release_hold_in(&txn, hold_id, self.clock.now()).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn get_hold(&self, hold_id: Uuid) -> Result<wallet_hold::Model, ServiceError> {
        WalletHoldEntity::find_by_id(hold_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Hold {} not found", hold_id)))
    }

    /// Active holds whose expiry passed before `now`.
    pub async fn expired_holds(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<wallet_hold::Model>, ServiceError> {
        let holds = WalletHoldEntity::find()
            .filter(wallet_hold::Column::Status.eq(HoldStatus::Active.as_str()))
            .filter(wallet_hold::Column::ExpiresAt.lt(now))
            .order_by_asc(wallet_hold::Column::ExpiresAt)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok(holds)
    }
}

/// Checks availability and records an ACTIVE hold under the wallet row lock.
/// Fails with `InsufficientFunds` when balance minus active holds is short.
pub async fn place_hold_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    order_id: Uuid,
    amount: Decimal,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<wallet_hold::Model, ServiceError> {
    let amount = money(amount);
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "hold amount must be positive".to_string(),
        ));
    }

    let wallet = lock_wallet_in(conn, user_id, now).await?;
    let held = active_holds_total_in(conn, wallet.id).await?;
    let balance = money(wallet.balance);
    let available = balance - held;

    if available < amount {
        counter!("keymart_wallet.hold_rejections", 1);
        warn!(%user_id, %available, %amount, "Insufficient funds for hold");
        return Err(ServiceError::InsufficientFunds(format!(
            "wallet of {} has {} available, {} required",
            user_id, available, amount
        )));
    }

    let hold = wallet_hold::ActiveModel {
        id: Set(Uuid::new_v4()),
        wallet_id: Set(wallet.id),
        user_id: Set(user_id),
        order_id: Set(order_id),
        amount: Set(amount),
        status: Set(HoldStatus::Active.as_str().to_string()),
        expires_at: Set(expires_at),
        created_at: Set(now),
        updated_at: Set(None),
    }
    .insert(conn)
    .await?;

    append_entry_in(
        conn,
        wallet.id,
        LedgerEntry::new(EntryType::Hold, &order_id.to_string(), amount, balance)
            .describe(Some("funds held")),
        now,
    )
    .await?;

    debug!(hold_id = %hold.id, %order_id, %amount, "Hold placed");
    Ok(hold)
}

async fn lock_hold<C: ConnectionTrait>(
    conn: &C,
    hold_id: Uuid,
) -> Result<wallet_hold::Model, ServiceError> {
    WalletHoldEntity::find_by_id(hold_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Hold {} not found", hold_id)))
}

/// ACTIVE -> CAPTURED, debiting the confirmed balance. A retry on an already
/// captured hold succeeds without effect.
pub async fn capture_hold_in<C: ConnectionTrait>(
    conn: &C,
    hold_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    // Wallet first, then hold: the same order place_hold_in uses
    let peek = WalletHoldEntity::find_by_id(hold_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Hold {} not found", hold_id)))?;
    let wallet = lock_wallet_in(conn, peek.user_id, now).await?;
    let hold = lock_hold(conn, hold_id).await?;

    match hold.hold_status() {
        Some(HoldStatus::Captured) => {
            debug!(%hold_id, "Hold already captured");
            return Ok(());
        }
        Some(HoldStatus::Active) => {}
        _ => return Err(ServiceError::HoldNotActive(hold_id)),
    }

    let amount = hold.amount;
    let reference = hold.order_id.to_string();
    let wallet_id = wallet.id;
    let balance = debit_captured_in(conn, wallet, amount, &reference, now).await?;

    let mut active: wallet_hold::ActiveModel = hold.into();
    active.status = Set(HoldStatus::Captured.as_str().to_string());
    active.updated_at = Set(Some(now));
    active.update(conn).await?;

    append_entry_in(
        conn,
        wallet_id,
        LedgerEntry::new(EntryType::Capture, &reference, amount, balance)
            .describe(Some("hold captured")),
        now,
    )
    .await?;

    info!(%hold_id, %amount, "Hold captured");
    Ok(())
}

/// ACTIVE -> RELEASED. No balance change. A retry on an already released
/// hold succeeds without effect.
pub async fn release_hold_in<C: ConnectionTrait>(
    conn: &C,
    hold_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let hold = lock_hold(conn, hold_id).await?;

    match hold.hold_status() {
        Some(HoldStatus::Released) => {
            debug!(%hold_id, "Hold already released");
            return Ok(());
        }
        Some(HoldStatus::Active) => {}
        _ => return Err(ServiceError::HoldNotActive(hold_id)),
    }

    let wallet_id = hold.wallet_id;
    let amount = hold.amount;
    let reference = hold.order_id.to_string();
    let mut active: wallet_hold::ActiveModel = hold.into();
    active.status = Set(HoldStatus::Released.as_str().to_string());
    active.updated_at = Set(Some(now));
    active.update(conn).await?;

    let wallet = crate::entities::wallet::Entity::find_by_id(wallet_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::InternalError(format!("wallet {} missing", wallet_id)))?;

    append_entry_in(
        conn,
        wallet_id,
        LedgerEntry::new(EntryType::Release, &reference, amount, wallet.balance)
            .describe(Some("hold released")),
        now,
    )
    .await?;

    info!(%hold_id, %amount, "Hold released");
    Ok(())
}

/// The most recent hold placed for an order, if any.
pub async fn hold_for_order_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Option<wallet_hold::Model>, ServiceError> {
    let hold = WalletHoldEntity::find()
        .filter(wallet_hold::Column::OrderId.eq(order_id))
        .order_by_desc(wallet_hold::Column::CreatedAt)
        .one(conn)
        .await?;
    Ok(hold)
}
