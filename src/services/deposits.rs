//! Gateway-funded wallet deposits
//!
//! Initiating a deposit records a PENDING credit in the wallet history;
//! the provider callback later appends the SUCCESS credit (and moves the
//! balance) or a FAILED marker. History rows are never rewritten.

use chrono::{DateTime, Utc};
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

use crate::clock::SharedClock;
use crate::entities::wallet_deposit::{self, DepositStatus, Entity as WalletDepositEntity};
use crate::entities::wallet_history::{EntryStatus, EntryType};
use crate::errors::ServiceError;
use crate::events::audit::{AuditCategory, AuditEvent, AuditOutcome, SharedAuditSink};
use crate::events::{Event, EventSender};
use crate::services::wallet::{append_entry_in, credit_in, lock_wallet_in, money, LedgerEntry};

/// Deposit codes share the provider's reference field with order codes.
pub const DEPOSIT_CODE_PREFIX: &str = "DP";

pub fn generate_deposit_code(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}{}{}",
        DEPOSIT_CODE_PREFIX,
        now.format("%Y%m%d%H%M%S"),
        &suffix[..8].to_uppercase()
    )
}

pub fn is_deposit_code(reference: &str) -> bool {
    reference.starts_with(DEPOSIT_CODE_PREFIX)
}

fn ledger_reference(code: &str) -> String {
    format!("DEPOSIT:{}", code)
}

/// A provider result for one deposit, already signature-checked.
#[derive(Debug, Clone)]
pub struct DepositResult<'a> {
    pub code: &'a str,
    pub amount: Decimal,
    pub succeeded: bool,
    pub provider_txn: Option<String>,
    pub response_code: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositOutcome {
    Credited,
    Declined,
    /// The deposit already left PENDING; nothing changed
    AlreadyResolved,
}

#[derive(Clone)]
pub struct DepositService {
    db: Arc<DatabaseConnection>,
    clock: SharedClock,
    events: EventSender,
    audit: SharedAuditSink,
}

impl DepositService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        clock: SharedClock,
        events: EventSender,
        audit: SharedAuditSink,
    ) -> Self {
        Self {
            db,
            clock,
            events,
            audit,
        }
    }

    /// Opens a PENDING deposit. The returned code is what the buyer pays
    /// against at the provider.
    #[instrument(skip(self))]
    pub async fn initiate(
        &self,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<wallet_deposit::Model, ServiceError> {
        let amount = money(amount);
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "deposit amount must be positive".to_string(),
            ));
        }

        let now = self.clock.now();
        let code = generate_deposit_code(now);
        let txn = self.db.begin().await?;
        let wallet = lock_wallet_in(&txn, user_id, now).await?;
        let deposit = wallet_deposit::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.clone()),
            user_id: Set(user_id),
            amount: Set(amount),
            status: Set(DepositStatus::Pending.as_str().to_string()),
            provider_txn: Set(None),
            response_code: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(&txn)
        .await?;

        let reference = ledger_reference(&code);
        append_entry_in(
            &txn,
            wallet.id,
            LedgerEntry::new(EntryType::Credit, &reference, amount, wallet.balance)
                .with_status(EntryStatus::Pending)
                .describe(Some("deposit via payment provider")),
            now,
        )
        .await?;
        txn.commit().await?;

        counter!("keymart_wallet.deposits_initiated", 1);
        info!(deposit_id = %deposit.id, code = %deposit.code, %amount, "Deposit initiated");
        Ok(deposit)
    }

    /// Applies a verified provider result. Duplicates and late callbacks for
    /// a resolved deposit are acknowledged without side effects.
    #[instrument(skip(self, result), fields(code = result.code))]
    pub async fn resolve(&self, result: DepositResult<'_>) -> Result<DepositOutcome, ServiceError> {
        let now = self.clock.now();
        let txn = self.db.begin().await?;
        let deposit = WalletDepositEntity::find()
            .filter(wallet_deposit::Column::Code.eq(result.code))
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidInput(format!("unknown deposit reference {}", result.code))
            })?;

        if deposit.deposit_status().map_or(false, |s| s.is_terminal()) {
            txn.commit().await?;
            counter!("keymart_payment.callbacks_duplicate", 1);
            return Ok(DepositOutcome::AlreadyResolved);
        }

        let reference = ledger_reference(&deposit.code);
        let status = if result.succeeded {
            if result.amount != deposit.amount {
                warn!(
                    deposit_id = %deposit.id,
                    expected = %deposit.amount,
                    received = %result.amount,
                    "Deposit callback amount mismatch"
                );
                return Err(ServiceError::InvalidInput(format!(
                    "amount {} does not match deposit amount {}",
                    result.amount, deposit.amount
                )));
            }
            credit_in(
                &txn,
                deposit.user_id,
                deposit.amount,
                &reference,
                Some("deposit via payment provider"),
                now,
            )
            .await?;
            DepositStatus::Success
        } else {
            record_failed_in(&txn, &deposit, &reference, result.response_code, now).await?;
            DepositStatus::Failed
        };

        let mut active: wallet_deposit::ActiveModel = deposit.into();
        active.status = Set(status.as_str().to_string());
        active.provider_txn = Set(result.provider_txn);
        active.response_code = Set(Some(result.response_code.to_string()));
        active.updated_at = Set(Some(now));
        let deposit = active.update(&txn).await?;
        txn.commit().await?;

        info!(deposit_id = %deposit.id, status = status.as_str(), amount = %deposit.amount, "Deposit resolved");
        self.events.notify(Event::DepositResolved {
            deposit_id: deposit.id,
            user_id: deposit.user_id,
            amount: deposit.amount,
            status: deposit.status.clone(),
        });
        let outcome = if status == DepositStatus::Success {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.audit.record(
            AuditEvent::new("wallet.deposit", AuditCategory::Payment, outcome)
                .actor(deposit.user_id)
                .subject(deposit.id),
        );

        Ok(match status {
            DepositStatus::Success => DepositOutcome::Credited,
            _ => DepositOutcome::Declined,
        })
    }

    pub async fn get_by_code(&self, code: &str) -> Result<wallet_deposit::Model, ServiceError> {
        WalletDepositEntity::find()
            .filter(wallet_deposit::Column::Code.eq(code))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Deposit {} not found", code)))
    }

    /// A user's deposits, newest first.
    pub async fn for_user(&self, user_id: Uuid) -> Result<Vec<wallet_deposit::Model>, ServiceError> {
        let deposits = WalletDepositEntity::find()
            .filter(wallet_deposit::Column::UserId.eq(user_id))
            .order_by_desc(wallet_deposit::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(deposits)
    }
}

async fn record_failed_in<C: ConnectionTrait>(
    conn: &C,
    deposit: &wallet_deposit::Model,
    reference: &str,
    response_code: &str,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let wallet = lock_wallet_in(conn, deposit.user_id, now).await?;
    let description = format!("deposit declined by provider ({})", response_code);
    append_entry_in(
        conn,
        wallet.id,
        LedgerEntry::new(EntryType::Credit, reference, deposit.amount, wallet.balance)
            .with_status(EntryStatus::Failed)
            .describe(Some(description.as_str())),
        now,
    )
    .await?;
    counter!("keymart_wallet.deposits_declined", 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn deposit_codes_never_look_like_order_codes() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let code = generate_deposit_code(now);
        assert!(code.starts_with("DP20240601090000"));
        assert_eq!(code.len(), 2 + 14 + 8);
        assert!(is_deposit_code(&code));
        assert!(!is_deposit_code(&crate::services::orders::generate_order_code(now)));
    }
}
