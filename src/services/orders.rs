//! Order Aggregate
//!
//! Orders and their items are written only after the claims and holds they
//! depend on are held. Reads return fully populated value objects; nothing
//! is fetched lazily.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::entities::order::{
    self, Entity as OrderEntity, OrderStatus, PaymentMethod, SettlementState,
};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::warehouse_item::{self, Entity as WarehouseItemEntity};
use crate::errors::ServiceError;
use crate::services::commission::split;
use crate::services::wallet::money;

/// One claimed unit about to become an order item.
#[derive(Debug, Clone)]
pub struct OrderLine {
    pub unit: warehouse_item::Model,
    pub unit_price: Decimal,
    pub commission_rate: Decimal,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: Uuid,
    pub order_code: String,
    pub buyer_id: Uuid,
    pub payment_method: PaymentMethod,
    pub placed_at: DateTime<Utc>,
    pub reserved_until: DateTime<Utc>,
    pub lines: Vec<OrderLine>,
}

/// Order with all of its items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Order item as its buyer sees it. `payload` carries the purchased
/// credential and is only present while the item is COMPLETED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchasedItem {
    #[serde(flatten)]
    pub item: order_item::Model,
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerOrderView {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<PurchasedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusView {
    pub order_id: Uuid,
    pub order_code: String,
    pub status: String,
    pub settlement_state: String,
    pub payment_method: String,
    pub total_amount: Decimal,
    pub abort_reason: Option<String>,
}

impl From<&order::Model> for OrderStatusView {
    fn from(order: &order::Model) -> Self {
        Self {
            order_id: order.id,
            order_code: order.order_code.clone(),
            status: order.status.clone(),
            settlement_state: order.settlement_state.clone(),
            payment_method: order.payment_method.clone(),
            total_amount: order.total_amount,
            abort_reason: order.abort_reason.clone(),
        }
    }
}

/// A settlement-state move plus the order fields that change with it.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub next: SettlementState,
    pub status: Option<OrderStatus>,
    pub payment_reference: Option<String>,
    pub abort_reason: Option<String>,
    pub at: Option<DateTime<Utc>>,
}

impl StateChange {
    pub fn to(next: SettlementState) -> Self {
        Self {
            next,
            status: None,
            payment_reference: None,
            abort_reason: None,
            at: None,
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.at = Some(now);
        self
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_payment_reference(mut self, reference: Option<String>) -> Self {
        self.payment_reference = reference;
        self
    }

    pub fn with_abort_reason(mut self, reason: impl Into<String>) -> Self {
        self.abort_reason = Some(reason.into());
        self
    }
}

/// External order reference: `KM` + UTC timestamp + random suffix.
pub fn generate_order_code(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("KM{}{}", now.format("%Y%m%d%H%M%S"), &suffix[..8].to_uppercase())
}

/// Status the order should carry given its items, or `None` while any
/// item is still in flight. Mixed outcomes never force CANCELLED.
pub fn aggregate_status(items: &[order_item::Model]) -> Option<OrderStatus> {
    if items.is_empty() {
        return None;
    }
    let statuses: Vec<Option<OrderStatus>> = items.iter().map(|i| i.item_status()).collect();
    if statuses.iter().any(|s| matches!(s, None | Some(OrderStatus::Pending))) {
        return None;
    }
    if statuses.iter().all(|s| *s == Some(OrderStatus::Refunded)) {
        return Some(OrderStatus::Refunded);
    }
    if statuses.iter().all(|s| *s == Some(OrderStatus::Cancelled)) {
        return Some(OrderStatus::Cancelled);
    }
    if statuses
        .iter()
        .all(|s| matches!(s, Some(OrderStatus::Completed) | Some(OrderStatus::Refunded)))
    {
        return Some(OrderStatus::Completed);
    }
    None
}

fn check_transition(
    what: &str,
    id: Uuid,
    current: &str,
    next: OrderStatus,
) -> Result<bool, ServiceError> {
    let current_status = OrderStatus::from_str(current).ok_or_else(|| {
        ServiceError::InvalidTransition(format!("{} {} has unknown status {}", what, id, current))
    })?;
    if current_status == next {
        return Ok(false);
    }
    if !current_status.can_transition_to(next) {
        error!(%id, from = current, to = next.as_str(), "Illegal {} status transition", what);
        return Err(ServiceError::InvalidTransition(format!(
            "{} {} cannot move from {} to {}",
            what,
            id,
            current,
            next.as_str()
        )));
    }
    Ok(true)
}

/// Persists the order in PENDING/RESERVED with one item per claimed unit.
pub async fn create_order_in<C: ConnectionTrait>(
    conn: &C,
    new_order: NewOrder,
) -> Result<OrderView, ServiceError> {
    if new_order.lines.is_empty() {
        return Err(ServiceError::ValidationError(
            "an order needs at least one item".to_string(),
        ));
    }

    let mut total = Decimal::ZERO;
    let mut commission = Decimal::ZERO;
    let mut seller_total = Decimal::ZERO;
    let mut splits = Vec::with_capacity(new_order.lines.len());
    for line in &new_order.lines {
        // Sub-cent prices round to zero
        if money(line.unit_price) <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "unit price must be at least 0.01".to_string(),
            ));
        }
        let s = split(line.unit_price, line.commission_rate)?;
        total += s.total;
        commission += s.commission;
        seller_total += s.seller_amount;
        splits.push(s);
    }

    let now = new_order.placed_at;
    let order = order::ActiveModel {
        id: Set(new_order.order_id),
        order_code: Set(new_order.order_code.clone()),
        buyer_id: Set(new_order.buyer_id),
        status: Set(OrderStatus::Pending.as_str().to_string()),
        settlement_state: Set(SettlementState::Reserved.as_str().to_string()),
        payment_method: Set(new_order.payment_method.as_str().to_string()),
        total_amount: Set(money(total)),
        total_commission: Set(money(commission)),
        total_seller_amount: Set(money(seller_total)),
        payment_reference: Set(None),
        abort_reason: Set(None),
        reserved_until: Set(Some(new_order.reserved_until)),
        created_at: Set(now),
        updated_at: Set(None),
    }
    .insert(conn)
    .await?;

    let mut items = Vec::with_capacity(new_order.lines.len());
    for (line, s) in new_order.lines.iter().zip(splits) {
        let item = order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(line.unit.product_id),
            warehouse_item_id: Set(line.unit.id),
            seller_id: Set(line.unit.seller_id),
            shop_id: Set(line.unit.shop_id),
            quantity: Set(1),
            unit_price: Set(s.total),
            total_amount: Set(s.total),
            commission_rate: Set(s.rate),
            commission_amount: Set(s.commission),
            seller_amount: Set(s.seller_amount),
            status: Set(OrderStatus::Pending.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(conn)
        .await?;
        items.push(item);
    }

    debug!(order_id = %order.id, items = items.len(), total = %order.total_amount, "Order created");
    Ok(OrderView { order, items })
}

/// Locks the order row. Every settlement transition goes through here.
pub async fn lock_order_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    OrderEntity::find_by_id(order_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

pub async fn find_by_code_in<C: ConnectionTrait>(
    conn: &C,
    order_code: &str,
) -> Result<Option<order::Model>, ServiceError> {
    let order = OrderEntity::find()
        .filter(order::Column::OrderCode.eq(order_code))
        .one(conn)
        .await?;
    Ok(order)
}

pub async fn items_of_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_item::Model>, ServiceError> {
    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::CreatedAt)
        .order_by_asc(order_item::Column::Id)
        .all(conn)
        .await?;
    Ok(items)
}

/// Applies a settlement-state move, rejecting anything the state machine
/// does not allow.
pub async fn apply_state_change_in<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
    change: StateChange,
) -> Result<order::Model, ServiceError> {
    let current = order.state().ok_or_else(|| {
        ServiceError::InvalidTransition(format!(
            "order {} has unknown settlement state {}",
            order.id, order.settlement_state
        ))
    })?;
    if !current.can_transition_to(change.next) {
        error!(order_id = %order.id, from = current.as_str(), to = change.next.as_str(), "Illegal settlement transition");
        return Err(ServiceError::InvalidTransition(format!(
            "order {} cannot move from {} to {}",
            order.id,
            current.as_str(),
            change.next.as_str()
        )));
    }
    if let Some(status) = change.status {
        check_transition("order", order.id, &order.status, status)?;
    }

    let mut active: order::ActiveModel = order.into();
    active.settlement_state = Set(change.next.as_str().to_string());
    if let Some(status) = change.status {
        active.status = Set(status.as_str().to_string());
    }
    if change.payment_reference.is_some() {
        active.payment_reference = Set(change.payment_reference);
    }
    if change.abort_reason.is_some() {
        active.abort_reason = Set(change.abort_reason);
    }
    if change.next.is_terminal() {
        active.reserved_until = Set(None);
    }
    if let Some(at) = change.at {
        active.updated_at = Set(Some(at));
    }
    Ok(active.update(conn).await?)
}

pub async fn update_item_status_in<C: ConnectionTrait>(
    conn: &C,
    item_id: Uuid,
    status: OrderStatus,
    now: DateTime<Utc>,
) -> Result<order_item::Model, ServiceError> {
    let item = OrderItemEntity::find_by_id(item_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order item {} not found", item_id)))?;

    if !check_transition("order item", item.id, &item.status, status)? {
        return Ok(item);
    }
    let mut active: order_item::ActiveModel = item.into();
    active.status = Set(status.as_str().to_string());
    active.updated_at = Set(Some(now));
    Ok(active.update(conn).await?)
}

pub async fn update_order_status_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    status: OrderStatus,
    now: DateTime<Utc>,
) -> Result<order::Model, ServiceError> {
    let order = lock_order_in(conn, order_id).await?;
    if !check_transition("order", order.id, &order.status, status)? {
        return Ok(order);
    }
    let mut active: order::ActiveModel = order.into();
    active.status = Set(status.as_str().to_string());
    active.updated_at = Set(Some(now));
    Ok(active.update(conn).await?)
}

/// Moves every still-pending item of the order to `status`.
pub async fn settle_pending_items_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    status: OrderStatus,
    now: DateTime<Utc>,
) -> Result<Vec<order_item::Model>, ServiceError> {
    let items = items_of_in(conn, order_id).await?;
    let mut updated = Vec::with_capacity(items.len());
    for item in items {
        if item.item_status() == Some(OrderStatus::Pending) {
            updated.push(update_item_status_in(conn, item.id, status, now).await?);
        } else {
            updated.push(item);
        }
    }
    Ok(updated)
}

/// Brings the order status in line with its items.
pub async fn recompute_order_status_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    now: DateTime<Utc>,
) -> Result<order::Model, ServiceError> {
    let items = items_of_in(conn, order_id).await?;
    match aggregate_status(&items) {
        Some(status) => update_order_status_in(conn, order_id, status, now).await,
        None => lock_order_in(conn, order_id).await,
    }
}

#[derive(Clone)]
pub struct OrderAggregate {
    db: Arc<DatabaseConnection>,
    clock: SharedClock,
}

impl OrderAggregate {
    pub fn new(db: Arc<DatabaseConnection>, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    #[instrument(skip(self, new_order), fields(order_id = %new_order.order_id, buyer_id = %new_order.buyer_id))]
    pub async fn create_order(&self, new_order: NewOrder) -> Result<OrderView, ServiceError> {
        let txn = self.db.begin().await?;
        let view = create_order_in(&txn, new_order).await?;
        txn.commit().await?;
        info!(order_id = %view.order.id, "Order persisted");
        Ok(view)
    }

    #[instrument(skip(self))]
    pub async fn update_item_status(
        &self,
        item_id: Uuid,
        status: OrderStatus,
    ) -> Result<order_item::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let item = update_item_status_in(&txn, item_id, status, self.clock.now()).await?;
        txn.commit().await?;
        Ok(item)
    }

    #[instrument(skip(self))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let order = update_order_status_in(&txn, order_id, status, self.clock.now()).await?;
        txn.commit().await?;
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn get_order_with_items(&self, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let db = &*self.db;
        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let items = items_of_in(db, order_id).await?;
        Ok(OrderView { order, items })
    }

    pub async fn get_order_by_code(&self, order_code: &str) -> Result<OrderView, ServiceError> {
        let db = &*self.db;
        let order = find_by_code_in(db, order_code)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_code)))?;
        let items = items_of_in(db, order.id).await?;
        Ok(OrderView { order, items })
    }

    /// The order as `buyer_id` sees it, with the payload of every COMPLETED
    /// unit. Orders of other buyers read as not found.
    #[instrument(skip(self))]
    pub async fn get_buyer_view(
        &self,
        order_id: Uuid,
        buyer_id: Uuid,
    ) -> Result<BuyerOrderView, ServiceError> {
        let db = &*self.db;
        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await?
            .filter(|o| o.buyer_id == buyer_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let items = items_of_in(db, order_id).await?;

        let delivered: Vec<Uuid> = items
            .iter()
            .filter(|i| i.item_status() == Some(OrderStatus::Completed))
            .map(|i| i.warehouse_item_id)
            .collect();
        let mut payloads = HashMap::new();
        if !delivered.is_empty() {
            let units = WarehouseItemEntity::find()
                .filter(warehouse_item::Column::Id.is_in(delivered))
                .all(db)
                .await?;
            payloads.extend(units.into_iter().map(|u| (u.id, u.payload)));
        }

        let items = items
            .into_iter()
            .map(|item| {
                let payload = if item.item_status() == Some(OrderStatus::Completed) {
                    payloads.get(&item.warehouse_item_id).cloned()
                } else {
                    None
                };
                PurchasedItem { item, payload }
            })
            .collect();
        Ok(BuyerOrderView { order, items })
    }
}
