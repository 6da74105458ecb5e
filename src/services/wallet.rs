//! Wallet Ledger
//!
//! Per-user confirmed balance plus an append-only history. The wallet row is
//! the serialization point for every balance change: all writers lock it with
//! `SELECT ... FOR UPDATE` inside their transaction.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::entities::wallet::{self, Entity as WalletEntity};
use crate::entities::wallet_history::{self, EntryStatus, EntryType, Entity as WalletHistoryEntity};
use crate::entities::wallet_hold::{self, Entity as WalletHoldEntity, HoldStatus};
use crate::errors::ServiceError;

/// Normalizes money to cents.
pub fn money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingOutcome {
    Applied,
    /// An entry with the same reference already exists; nothing changed
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub balance: Decimal,
    pub held: Decimal,
    pub available: Decimal,
    /// Balance replayed from history; always equals `balance`
    pub ledger_balance: Decimal,
}

#[derive(Clone)]
pub struct WalletLedger {
    db: Arc<DatabaseConnection>,
    clock: SharedClock,
}

impl WalletLedger {
    pub fn new(db: Arc<DatabaseConnection>, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    /// Credits a wallet once per `reference_id`. Used for top-ups, seller
    /// payouts and refunds.
    #[instrument(skip(self))]
    pub async fn credit_wallet(
        &self,
        user_id: Uuid,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<PostingOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        let outcome = credit_in(
            &txn,
            user_id,
            amount,
            reference_id,
            Some("wallet credit"),
            self.clock.now(),
        )
        .await?;
        txn.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn snapshot(&self, user_id: Uuid) -> Result<WalletSnapshot, ServiceError> {
        let db = &*self.db;
        let wallet = WalletEntity::find()
            .filter(wallet::Column::UserId.eq(user_id))
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Wallet for user {} not found", user_id)))?;

        let held = active_holds_total_in(db, wallet.id).await?;
        let history = history_in(db, wallet.id).await?;
        let balance = money(wallet.balance);

        Ok(WalletSnapshot {
            user_id,
            wallet_id: wallet.id,
            balance,
            held,
            available: balance - held,
            ledger_balance: money(wallet_history::fold_balance(&history)),
        })
    }

    pub async fn history(&self, user_id: Uuid) -> Result<Vec<wallet_history::Model>, ServiceError> {
        let db = &*self.db;
        let wallet = WalletEntity::find()
            .filter(wallet::Column::UserId.eq(user_id))
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Wallet for user {} not found", user_id)))?;
        history_in(db, wallet.id).await
    }
}

/// Ensures a wallet exists for `user_id` and locks its row for the rest of
/// the transaction.
pub async fn lock_wallet_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<wallet::Model, ServiceError> {
    let fresh = wallet::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        balance: Set(Decimal::ZERO),
        created_at: Set(now),
        updated_at: Set(None),
    };
    WalletEntity::insert(fresh)
        .on_conflict(
            OnConflict::column(wallet::Column::UserId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    WalletEntity::find()
        .filter(wallet::Column::UserId.eq(user_id))
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::InternalError(format!("wallet for {} vanished", user_id)))
}

pub async fn active_holds_total_in<C: ConnectionTrait>(
    conn: &C,
    wallet_id: Uuid,
) -> Result<Decimal, ServiceError> {
    let holds = WalletHoldEntity::find()
        .filter(wallet_hold::Column::WalletId.eq(wallet_id))
        .filter(wallet_hold::Column::Status.eq(HoldStatus::Active.as_str()))
        .all(conn)
        .await?;
    Ok(money(holds.iter().map(|h| h.amount).sum()))
}

pub async fn history_in<C: ConnectionTrait>(
    conn: &C,
    wallet_id: Uuid,
) -> Result<Vec<wallet_history::Model>, ServiceError> {
    let entries = WalletHistoryEntity::find()
        .filter(wallet_history::Column::WalletId.eq(wallet_id))
        .order_by_asc(wallet_history::Column::CreatedAt)
        .all(conn)
        .await?;
    Ok(entries)
}

async fn entry_exists<C: ConnectionTrait>(
    conn: &C,
    wallet_id: Uuid,
    reference_id: &str,
    entry_type: EntryType,
) -> Result<bool, ServiceError> {
    let existing = WalletHistoryEntity::find()
        .filter(wallet_history::Column::WalletId.eq(wallet_id))
        .filter(wallet_history::Column::ReferenceId.eq(reference_id))
        .filter(wallet_history::Column::EntryType.eq(entry_type.as_str()))
        .filter(wallet_history::Column::Status.eq(EntryStatus::Success.as_str()))
        .one(conn)
        .await?;
    Ok(existing.is_some())
}

/// One history row to append.
#[derive(Debug, Clone, Copy)]
pub struct LedgerEntry<'a> {
    pub entry_type: EntryType,
    pub status: EntryStatus,
    pub reference_id: &'a str,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub description: Option<&'a str>,
}

impl<'a> LedgerEntry<'a> {
    /// A SUCCESS entry without description.
    pub fn new(
        entry_type: EntryType,
        reference_id: &'a str,
        amount: Decimal,
        balance_after: Decimal,
    ) -> Self {
        Self {
            entry_type,
            status: EntryStatus::Success,
            reference_id,
            amount,
            balance_after,
            description: None,
        }
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn describe(mut self, description: Option<&'a str>) -> Self {
        self.description = description;
        self
    }
}

/// Appends one ledger row. History is never updated afterwards.
pub async fn append_entry_in<C: ConnectionTrait>(
    conn: &C,
    wallet_id: Uuid,
    entry: LedgerEntry<'_>,
    now: DateTime<Utc>,
) -> Result<wallet_history::Model, ServiceError> {
    let entry = wallet_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        wallet_id: Set(wallet_id),
        entry_type: Set(entry.entry_type.as_str().to_string()),
        status: Set(entry.status.as_str().to_string()),
        reference_id: Set(entry.reference_id.to_string()),
        amount: Set(money(entry.amount)),
        balance_after: Set(money(entry.balance_after)),
        description: Set(entry.description.map(str::to_string)),
        created_at: Set(now),
    }
    .insert(conn)
    .await?;
    Ok(entry)
}

async fn set_balance<C: ConnectionTrait>(
    conn: &C,
    wallet: wallet::Model,
    balance: Decimal,
    now: DateTime<Utc>,
) -> Result<wallet::Model, ServiceError> {
    let mut active: wallet::ActiveModel = wallet.into();
    active.balance = Set(money(balance));
    active.updated_at = Set(Some(now));
    Ok(active.update(conn).await?)
}

/// Idempotent on (wallet, reference_id, CREDIT).
pub async fn credit_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    amount: Decimal,
    reference_id: &str,
    description: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PostingOutcome, ServiceError> {
    let amount = money(amount);
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "credit amount must be positive".to_string(),
        ));
    }

    let wallet = lock_wallet_in(conn, user_id, now).await?;
    if entry_exists(conn, wallet.id, reference_id, EntryType::Credit).await? {
        debug!(%user_id, reference_id, "Duplicate credit ignored");
        return Ok(PostingOutcome::Duplicate);
    }

    let wallet_id = wallet.id;
    let balance = money(wallet.balance) + amount;
    set_balance(conn, wallet, balance, now).await?;
    append_entry_in(
        conn,
        wallet_id,
        LedgerEntry::new(EntryType::Credit, reference_id, amount, balance)
            .describe(description),
        now,
    )
    .await?;

    info!(%user_id, %amount, reference_id, "Wallet credited");
    Ok(PostingOutcome::Applied)
}

/// Direct debit of available funds, idempotent on (wallet, reference_id, DEBIT).
/// Fails with `InsufficientFunds` when balance minus active holds is short.
pub async fn debit_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    amount: Decimal,
    reference_id: &str,
    description: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PostingOutcome, ServiceError> {
    let amount = money(amount);
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "debit amount must be positive".to_string(),
        ));
    }

    let wallet = lock_wallet_in(conn, user_id, now).await?;
    if entry_exists(conn, wallet.id, reference_id, EntryType::Debit).await? {
        debug!(%user_id, reference_id, "Duplicate debit ignored");
        return Ok(PostingOutcome::Duplicate);
    }

    let held = active_holds_total_in(conn, wallet.id).await?;
    let available = money(wallet.balance) - held;
    if available < amount {
        return Err(ServiceError::InsufficientFunds(format!(
            "wallet of {} has {} available, {} required",
            user_id, available, amount
        )));
    }

    let wallet_id = wallet.id;
    let balance = money(wallet.balance) - amount;
    set_balance(conn, wallet, balance, now).await?;
    append_entry_in(
        conn,
        wallet_id,
        LedgerEntry::new(EntryType::Debit, reference_id, amount, balance)
            .describe(description),
        now,
    )
    .await?;

    info!(%user_id, %amount, reference_id, "Wallet debited");
    Ok(PostingOutcome::Applied)
}

/// Decrements the confirmed balance for a captured hold. The hold itself
/// already earmarked these funds, so availability is not re-checked.
pub(crate) async fn debit_captured_in<C: ConnectionTrait>(
    conn: &C,
    wallet: wallet::Model,
    amount: Decimal,
    reference_id: &str,
    now: DateTime<Utc>,
) -> Result<Decimal, ServiceError> {
    let amount = money(amount);
    let balance = money(wallet.balance) - amount;
    if balance < Decimal::ZERO {
        return Err(ServiceError::InvalidTransition(format!(
            "capturing {} would overdraw wallet {}",
            amount, wallet.id
        )));
    }
    let wallet_id = wallet.id;
    set_balance(conn, wallet, balance, now).await?;
    append_entry_in(
        conn,
        wallet_id,
        LedgerEntry::new(EntryType::Debit, reference_id, amount, balance)
            .describe(Some("hold captured")),
        now,
    )
    .await?;
    Ok(balance)
}
