use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Condition, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Soft-delete tag for a unit. Deleted units are never physically removed
/// while order history references them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Active,
    Deleted,
}

/// Derived lifecycle position of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Available,
    Claimed,
    Sold,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "warehouse_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub shop_id: Uuid,
    pub stall_id: Uuid,
    pub seller_id: Uuid,
    pub item_type: String,
    /// Opaque credential blob (license key, account login, ...)
    #[serde(skip_serializing)]
    pub payload: String,
    pub locked: bool,
    /// Order currently holding the claim
    pub locked_by: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub sold_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn record_state(&self) -> RecordState {
        if self.is_deleted {
            RecordState::Deleted
        } else {
            RecordState::Active
        }
    }

    pub fn unit_state(&self) -> UnitState {
        match (self.record_state(), self.locked, self.sold_at) {
            (_, true, Some(_)) => UnitState::Sold,
            (_, true, None) => UnitState::Claimed,
            (RecordState::Deleted, false, _) => UnitState::Deleted,
            (RecordState::Active, false, _) => UnitState::Available,
        }
    }

    pub fn is_claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.locked && self.sold_at.is_none() && self.reserved_until.map_or(false, |t| t < now)
    }
}

/// The one place that decides whether a unit may be claimed.
pub fn claimable() -> Condition {
    Condition::all()
        .add(Column::Locked.eq(false))
        .add(Column::IsDeleted.eq(false))
}

/// Claimed (not sold) units whose reservation window has lapsed.
pub fn claim_expired_before(now: DateTime<Utc>) -> Condition {
    Condition::all()
        .add(Column::Locked.eq(true))
        .add(Column::SoldAt.is_null())
        .add(Column::ReservedUntil.lt(now))
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

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

        if !active_model.updated_at.is_set() {
            active_model.updated_at = Set(Some(now));
        }
        Ok(active_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn unit() -> Model {
        let now = Utc::now();
        Model {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            shop_id: Uuid::new_v4(),
            stall_id: Uuid::new_v4(),
            seller_id: Uuid::new_v4(),
            item_type: "LICENSE_KEY".into(),
            payload: "AAAA-BBBB".into(),
            locked: false,
            locked_by: None,
            locked_at: None,
            reserved_until: None,
            sold_at: None,
            is_deleted: false,
            created_at: now,
            updated_at: None,
        }
    }

    #[test]
    fn unit_state_follows_flags() {
        let mut item = unit();
        assert_eq!(item.unit_state(), UnitState::Available);

        item.locked = true;
        item.reserved_until = Some(Utc::now() + Duration::minutes(15));
        assert_eq!(item.unit_state(), UnitState::Claimed);

        item.sold_at = Some(Utc::now());
        item.reserved_until = None;
        assert_eq!(item.unit_state(), UnitState::Sold);

        let mut deleted = unit();
        deleted.is_deleted = true;
        assert_eq!(deleted.unit_state(), UnitState::Deleted);
        assert_eq!(deleted.record_state(), RecordState::Deleted);
    }

    #[test]
    fn claim_expiry_ignores_sold_units() {
        let now = Utc::now();
        let mut item = unit();
        item.locked = true;
        item.reserved_until = Some(now - Duration::minutes(1));
        assert!(item.is_claim_expired(now));

        item.sold_at = Some(now);
        assert!(!item.is_claim_expired(now));
    }
}
