use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "wallets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub user_id: Uuid,
    /// Confirmed balance. Holds do not reduce it, captures do.
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::wallet_hold::Entity")]
    WalletHold,
    #[sea_orm(has_many = "super::wallet_history::Entity")]
    WalletHistory,
}

impl Related<super::wallet_hold::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WalletHold.def()
    }
}

impl Related<super::wallet_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WalletHistory.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.id {
                active_model.id = Set(Uuid::new_v4());
            }
            if !active_model.created_at.is_set() {
                active_model.created_at = Set(now);
            }
        }

        // Callers stamp from the service clock; fall back to wall time
        if !active_model.updated_at.is_set() {
            active_model.updated_at = Set(Some(now));
        }
        Ok(active_model)
    }
}
