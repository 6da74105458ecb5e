use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::OrderStatus;

/// One line per claimed warehouse unit. Status evolves independently of
/// the parent order so partial outcomes stay visible.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub warehouse_item_id: Uuid,
    pub seller_id: Uuid,
    pub shop_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_amount: Decimal,
    /// Percent
    pub commission_rate: Decimal,
    pub commission_amount: Decimal,
    pub seller_amount: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn item_status(&self) -> Option<OrderStatus> {
        OrderStatus::from_str(&self.status)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id",
        on_delete = "Cascade"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
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
