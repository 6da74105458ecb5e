//! Warehouse Store
//!
//! Unique, non-fungible inventory units per product. Claims lock rows with
//! `SELECT ... FOR UPDATE` (blocking, not skip-locked) so concurrent
//! checkouts for the same product serialize and an under-filled claim fails
//! instead of short-allocating.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::entities::warehouse_item::{self, Entity as WarehouseItemEntity, UnitState};
use crate::errors::ServiceError;

/// Seller-side bulk upload of new units for one product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockUnitsInput {
    pub seller_id: Uuid,
    pub shop_id: Uuid,
    pub stall_id: Uuid,
    pub product_id: Uuid,
    pub item_type: String,
    pub payloads: Vec<String>,
}

/// Unit view without the credential payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSummary {
    pub id: Uuid,
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub state: UnitState,
    pub locked_by: Option<Uuid>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub sold_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<warehouse_item::Model> for UnitSummary {
    fn from(model: warehouse_item::Model) -> Self {
        Self {
            state: model.unit_state(),
            id: model.id,
            product_id: model.product_id,
            seller_id: model.seller_id,
            locked_by: model.locked_by,
            reserved_until: model.reserved_until,
            sold_at: model.sold_at,
            created_at: model.created_at,
        }
    }
}

#[derive(Clone)]
pub struct WarehouseStore {
    db: Arc<DatabaseConnection>,
    clock: SharedClock,
}

impl WarehouseStore {
    pub fn new(db: Arc<DatabaseConnection>, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    /// Claims `quantity` units of `product_id` for `claimant` in a transaction
    /// of its own. All-or-nothing.
    #[instrument(skip(self))]
    pub async fn claim_units(
        &self,
        product_id: Uuid,
        quantity: u32,
        reservation_window: Duration,
        claimant: Uuid,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let now = self.clock.now();
        let txn = self.db.begin().await?;
        let units = claim_units_in(
            &txn,
            product_id,
            quantity,
            claimant,
            now,
            now + reservation_window,
        )
        .await?;
        txn.commit().await?;
        Ok(units.into_iter().map(|u| u.id).collect())
    }

    /// Returns claimed units to the pool. Already-available and sold units
    /// are left untouched.
    #[instrument(skip(self, item_ids), fields(count = item_ids.len()))]
    pub async fn release_units(&self, item_ids: &[Uuid]) -> Result<u64, ServiceError> {
        release_units_in(&*self.db, item_ids, self.clock.now()).await
    }

    /// Marks claimed units sold. Irreversible outside the refund path.
    #[instrument(skip(self, item_ids), fields(count = item_ids.len()))]
    pub async fn finalize_sale(&self, claimant: Uuid, item_ids: &[Uuid]) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        finalize_sale_in(&txn, claimant, item_ids, self.clock.now()).await?;
        txn.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, input), fields(product_id = %input.product_id, count = input.payloads.len()))]
    pub async fn stock_units(
        &self,
        input: StockUnitsInput,
    ) -> Result<Vec<UnitSummary>, ServiceError> {
        if input.payloads.is_empty() {
            return Err(ServiceError::ValidationError(
                "at least one unit payload is required".to_string(),
            ));
        }
        if input.payloads.iter().any(|p| p.trim().is_empty()) {
            return Err(ServiceError::ValidationError(
                "unit payloads must not be blank".to_string(),
            ));
        }

        let base = self.clock.now();
        let txn = self.db.begin().await?;
        let mut created = Vec::with_capacity(input.payloads.len());

        // Offsets keep upload order stable for FIFO claims
        for (offset, payload) in input.payloads.iter().enumerate() {
            let unit = warehouse_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                product_id: Set(input.product_id),
                shop_id: Set(input.shop_id),
                stall_id: Set(input.stall_id),
                seller_id: Set(input.seller_id),
                item_type: Set(input.item_type.clone()),
                payload: Set(payload.clone()),
                locked: Set(false),
                locked_by: Set(None),
                locked_at: Set(None),
                reserved_until: Set(None),
                sold_at: Set(None),
                is_deleted: Set(false),
                created_at: Set(base + Duration::microseconds(offset as i64)),
                updated_at: Set(None),
            }
            .insert(&txn)
            .await?;
            created.push(UnitSummary::from(unit));
        }

        txn.commit().await?;
        info!(
            product_id = %input.product_id,
            seller_id = %input.seller_id,
            count = created.len(),
            "Stocked warehouse units"
        );
        Ok(created)
    }

    /// Seller-side removal. Claimed or sold units cannot be removed.
    #[instrument(skip(self))]
    pub async fn soft_delete_unit(
        &self,
        seller_id: Uuid,
        item_id: Uuid,
    ) -> Result<UnitSummary, ServiceError> {
        let txn = self.db.begin().await?;
        let unit = WarehouseItemEntity::find_by_id(item_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .filter(|u| u.seller_id == seller_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Warehouse unit {} not found", item_id)))?;

        if unit.is_deleted {
            txn.commit().await?;
            return Ok(unit.into());
        }
        if unit.locked {
            return Err(ServiceError::InvalidInput(format!(
                "Warehouse unit {} is claimed or sold and cannot be removed",
                item_id
            )));
        }

        let mut active: warehouse_item::ActiveModel = unit.into();
        active.is_deleted = Set(true);
        active.updated_at = Set(Some(self.clock.now()));
        let unit = active.update(&txn).await?;
        txn.commit().await?;
        Ok(unit.into())
    }

    #[instrument(skip(self))]
    pub async fn available_count(&self, product_id: Uuid) -> Result<u64, ServiceError> {
        let count = WarehouseItemEntity::find()
            .filter(warehouse_item::Column::ProductId.eq(product_id))
            .filter(warehouse_item::claimable())
            .count(&*self.db)
            .await?;
        Ok(count)
    }

    pub async fn get_unit(&self, item_id: Uuid) -> Result<UnitSummary, ServiceError> {
        WarehouseItemEntity::find_by_id(item_id)
            .one(&*self.db)
            .await?
            .map(UnitSummary::from)
            .ok_or_else(|| ServiceError::NotFound(format!("Warehouse unit {} not found", item_id)))
    }

    /// Claimed units whose window lapsed before `now`, oldest first.
    pub async fn expired_claims(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<warehouse_item::Model>, ServiceError> {
        let units = WarehouseItemEntity::find()
            .filter(warehouse_item::claim_expired_before(now))
            .order_by_asc(warehouse_item::Column::ReservedUntil)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok(units)
    }
}

/// Claim inside the caller's transaction so the claim commits or rolls
/// back together with the rest of the checkout.
pub async fn claim_units_in<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: u32,
    claimant: Uuid,
    now: DateTime<Utc>,
    reserved_until: DateTime<Utc>,
) -> Result<Vec<warehouse_item::Model>, ServiceError> {
    if quantity == 0 {
        return Err(ServiceError::ValidationError(
            "quantity must be at least 1".to_string(),
        ));
    }

    let candidates = WarehouseItemEntity::find()
        .filter(warehouse_item::Column::ProductId.eq(product_id))
        .filter(warehouse_item::claimable())
        .order_by_asc(warehouse_item::Column::CreatedAt)
        .order_by_asc(warehouse_item::Column::Id)
        .limit(quantity as u64)
        .lock_exclusive()
        .all(conn)
        .await?;

    if candidates.len() < quantity as usize {
        counter!("keymart_warehouse.claim_failures", 1);
        warn!(
            %product_id,
            requested = quantity,
            available = candidates.len(),
            "Insufficient stock for claim"
        );
        return Err(ServiceError::InsufficientStock(format!(
            "product {} has {} of {} requested units available",
            product_id,
            candidates.len(),
            quantity
        )));
    }

    let ids: Vec<Uuid> = candidates.iter().map(|u| u.id).collect();
    let result = WarehouseItemEntity::update_many()
        .col_expr(warehouse_item::Column::Locked, Expr::value(true))
        .col_expr(warehouse_item::Column::LockedBy, Expr::value(Some(claimant)))
        .col_expr(warehouse_item::Column::LockedAt, Expr::value(Some(now)))
        .col_expr(
            warehouse_item::Column::ReservedUntil,
            Expr::value(Some(reserved_until)),
        )
        .col_expr(warehouse_item::Column::UpdatedAt, Expr::value(Some(now)))
        .filter(warehouse_item::Column::Id.is_in(ids.clone()))
        .filter(warehouse_item::claimable())
        .exec(conn)
        .await?;

    if result.rows_affected != ids.len() as u64 {
        counter!("keymart_warehouse.claim_failures", 1);
        return Err(ServiceError::InsufficientStock(format!(
            "product {} units were claimed concurrently",
            product_id
        )));
    }

    counter!("keymart_warehouse.claims", 1);
    debug!(%product_id, %claimant, count = ids.len(), "Claimed units");

    Ok(candidates
        .into_iter()
        .map(|mut unit| {
            unit.locked = true;
            unit.locked_by = Some(claimant);
            unit.locked_at = Some(now);
            unit.reserved_until = Some(reserved_until);
            unit
        })
        .collect())
}

/// Clears claims on the given units. Idempotent; sold units stay sold.
pub async fn release_units_in<C: ConnectionTrait>(
    conn: &C,
    item_ids: &[Uuid],
    now: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    if item_ids.is_empty() {
        return Ok(0);
    }
    let result = WarehouseItemEntity::update_many()
        .col_expr(warehouse_item::Column::Locked, Expr::value(false))
        .col_expr(warehouse_item::Column::LockedBy, Expr::value(Option::<Uuid>::None))
        .col_expr(
            warehouse_item::Column::LockedAt,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(
            warehouse_item::Column::ReservedUntil,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(warehouse_item::Column::UpdatedAt, Expr::value(Some(now)))
        .filter(warehouse_item::Column::Id.is_in(item_ids.to_vec()))
        .filter(warehouse_item::Column::Locked.eq(true))
        .filter(warehouse_item::Column::SoldAt.is_null())
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

/// Releases only the units still claimed by `claimant`, so a late abort can
/// never free a unit that has since been claimed by another order.
pub async fn release_claims_of<C: ConnectionTrait>(
    conn: &C,
    claimant: Uuid,
    now: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    let result = WarehouseItemEntity::update_many()
        .col_expr(warehouse_item::Column::Locked, Expr::value(false))
        .col_expr(warehouse_item::Column::LockedBy, Expr::value(Option::<Uuid>::None))
        .col_expr(
            warehouse_item::Column::LockedAt,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(
            warehouse_item::Column::ReservedUntil,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(warehouse_item::Column::UpdatedAt, Expr::value(Some(now)))
        .filter(warehouse_item::Column::LockedBy.eq(claimant))
        .filter(warehouse_item::Column::Locked.eq(true))
        .filter(warehouse_item::Column::SoldAt.is_null())
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

/// Moves units claimed by `claimant` to sold. Every unit must still be
/// claimed by it; anything else is an integrity violation.
pub async fn finalize_sale_in<C: ConnectionTrait>(
    conn: &C,
    claimant: Uuid,
    item_ids: &[Uuid],
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if item_ids.is_empty() {
        return Ok(());
    }
    let result = WarehouseItemEntity::update_many()
        .col_expr(warehouse_item::Column::SoldAt, Expr::value(Some(now)))
        .col_expr(
            warehouse_item::Column::ReservedUntil,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(warehouse_item::Column::UpdatedAt, Expr::value(Some(now)))
        .filter(warehouse_item::Column::Id.is_in(item_ids.to_vec()))
        .filter(warehouse_item::Column::LockedBy.eq(claimant))
        .filter(warehouse_item::Column::Locked.eq(true))
        .filter(warehouse_item::Column::SoldAt.is_null())
        .exec(conn)
        .await?;

    if result.rows_affected != item_ids.len() as u64 {
        return Err(ServiceError::InvalidTransition(format!(
            "only {} of {} units claimed by {} could be finalized",
            result.rows_affected,
            item_ids.len(),
            claimant
        )));
    }
    Ok(())
}

/// Puts a sold unit back on sale. Only used by refunds when resale is allowed.
pub async fn relist_units_in<C: ConnectionTrait>(
    conn: &C,
    item_ids: &[Uuid],
    now: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    if item_ids.is_empty() {
        return Ok(0);
    }
    let result = WarehouseItemEntity::update_many()
        .col_expr(warehouse_item::Column::Locked, Expr::value(false))
        .col_expr(warehouse_item::Column::LockedBy, Expr::value(Option::<Uuid>::None))
        .col_expr(
            warehouse_item::Column::LockedAt,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(
            warehouse_item::Column::ReservedUntil,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(
            warehouse_item::Column::SoldAt,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(warehouse_item::Column::UpdatedAt, Expr::value(Some(now)))
        .filter(warehouse_item::Column::Id.is_in(item_ids.to_vec()))
        .filter(warehouse_item::Column::IsDeleted.eq(false))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}
