use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ledger entry kinds. Only `Credit` and `Debit` move the confirmed balance;
/// the rest mark hold lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Hold,
    Capture,
    Release,
    Credit,
    Debit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Hold => "HOLD",
            EntryType::Capture => "CAPTURE",
            EntryType::Release => "RELEASE",
            EntryType::Credit => "CREDIT",
            EntryType::Debit => "DEBIT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "HOLD" => Some(EntryType::Hold),
            "CAPTURE" => Some(EntryType::Capture),
            "RELEASE" => Some(EntryType::Release),
            "CREDIT" => Some(EntryType::Credit),
            "DEBIT" => Some(EntryType::Debit),
            _ => None,
        }
    }

    /// Signed effect of an entry of `amount` on the confirmed balance.
    pub fn balance_effect(&self, amount: Decimal) -> Decimal {
        match self {
            EntryType::Credit => amount,
            EntryType::Debit => -amount,
            EntryType::Hold | EntryType::Capture | EntryType::Release => Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    /// Recorded intent, e.g. a deposit awaiting the provider; no balance effect
    Pending,
    Success,
    /// The intent did not complete; no balance effect
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Success => "SUCCESS",
            EntryStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(EntryStatus::Pending),
            "SUCCESS" => Some(EntryStatus::Success),
            "FAILED" => Some(EntryStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only. Rows are inserted, never updated or deleted.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "wallet_histories")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub entry_type: String,
    pub status: String,
    pub reference_id: String,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn kind(&self) -> Option<EntryType> {
        EntryType::from_str(&self.entry_type)
    }

    pub fn entry_status(&self) -> Option<EntryStatus> {
        EntryStatus::from_str(&self.status)
    }
}

/// Replays ledger entries into a balance. Pending and failed entries are
/// skipped.
pub fn fold_balance<'a>(entries: impl IntoIterator<Item = &'a Model>) -> Decimal {
    entries
        .into_iter()
        .filter(|entry| entry.entry_status() == Some(EntryStatus::Success))
        .filter_map(|entry| entry.kind().map(|kind| kind.balance_effect(entry.amount)))
        .sum()
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::wallet::Entity",
        from = "Column::WalletId",
        to = "super::wallet::Column::Id"
    )]
    Wallet,
}

impl Related<super::wallet::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Wallet.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        if !insert {
            return Err(DbErr::Custom(
                "wallet history entries are append-only".to_string(),
            ));
        }

        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.id {
            active_model.id = Set(Uuid::new_v4());
        }
        if !active_model.created_at.is_set() {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}
