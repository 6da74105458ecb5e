//! Settlement Coordinator
//!
//! Drives an order through `INITIATED -> RESERVED -> AWAITING_PAYMENT ->
//! SETTLED | ABORTED`. Every transition runs in one transaction that starts
//! by locking the order row, so callback, reaper and cancellation for the
//! same order are totally ordered and the loser observes a terminal state.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, DatabaseTransaction, EntityTrait, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::entities::order::{self, OrderStatus, PaymentMethod, SettlementState};
use crate::errors::ServiceError;
use crate::events::audit::{AuditCategory, AuditEvent, AuditOutcome, SharedAuditSink};
use crate::events::{Event, EventSender};
use crate::services::commission::SharedCommissionRates;
use crate::services::holds::{capture_hold_in, hold_for_order_in, place_hold_in, release_hold_in};
use crate::services::orders::{
    apply_state_change_in, create_order_in, generate_order_code, items_of_in,
    lock_order_in, recompute_order_status_in, settle_pending_items_in, update_item_status_in,
    NewOrder, OrderLine, OrderStatusView, StateChange,
};
use crate::services::payment_queue;
use crate::services::wallet::{credit_in, debit_in, lock_wallet_in, money};
use crate::services::warehouse::{
    claim_units_in, finalize_sale_in, release_claims_of, relist_units_in,
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutLine {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 100, message = "Quantity must be between 1 and 100"))]
    pub quantity: u32,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutRequest {
    #[validate(length(min = 1, message = "At least one line is required"))]
    pub lines: Vec<CheckoutLine>,
    pub payment_method: PaymentMethod,
    /// Settle a wallet order immediately instead of leaving it to the queue worker
    #[serde(default)]
    pub confirm_now: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutReceipt {
    pub order_id: Uuid,
    pub order_code: String,
    pub status: String,
    pub settlement_state: String,
    pub total_amount: Decimal,
    pub reserved_until: Option<DateTime<Utc>>,
}

impl From<&order::Model> for CheckoutReceipt {
    fn from(order: &order::Model) -> Self {
        Self {
            order_id: order.id,
            order_code: order.order_code.clone(),
            status: order.status.clone(),
            settlement_state: order.settlement_state.clone(),
            total_amount: order.total_amount,
            reserved_until: order.reserved_until,
        }
    }
}

/// Result of a settle/abort signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "order", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied(OrderStatusView),
    /// The order was already SETTLED or ABORTED; nothing changed
    AlreadyTerminal(OrderStatusView),
}

impl TransitionOutcome {
    pub fn order(&self) -> &OrderStatusView {
        match self {
            TransitionOutcome::Applied(view) | TransitionOutcome::AlreadyTerminal(view) => view,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SettlementSettings {
    /// Claim window and hold ttl; always the same value
    pub reservation_window: Duration,
    pub platform_user_id: Uuid,
    pub allow_resale_after_refund: bool,
}

impl From<&AppConfig> for SettlementSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            reservation_window: Duration::seconds(config.reservation_window_secs as i64),
            platform_user_id: config.platform_user_id,
            allow_resale_after_refund: config.allow_resale_after_refund,
        }
    }
}

#[derive(Clone)]
pub struct SettlementCoordinator {
    db: Arc<DatabaseConnection>,
    clock: SharedClock,
    rates: SharedCommissionRates,
    events: EventSender,
    audit: SharedAuditSink,
    settings: SettlementSettings,
}

impl SettlementCoordinator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        clock: SharedClock,
        rates: SharedCommissionRates,
        events: EventSender,
        audit: SharedAuditSink,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            db,
            clock,
            rates,
            events,
            audit,
            settings,
        }
    }

    pub fn settings(&self) -> &SettlementSettings {
        &self.settings
    }

    pub(crate) fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Claims every line, creates the order and, for wallet orders, holds
    /// the total. Any failure rolls the whole attempt back: no claim or hold
    /// from a failed checkout survives.
    #[instrument(skip(self, request), fields(lines = request.lines.len(), method = request.payment_method.as_str()))]
    pub async fn checkout(
        &self,
        buyer_id: Uuid,
        request: CheckoutRequest,
    ) -> Result<CheckoutReceipt, ServiceError> {
        request.validate()?;
        for line in &request.lines {
            line.validate()?;
        }
        if request.lines.iter().any(|l| money(l.unit_price) <= Decimal::ZERO) {
            return Err(ServiceError::ValidationError(
                "unit price must be at least 0.01".to_string(),
            ));
        }

        let mut rates = HashMap::new();
        for line in &request.lines {
            if !rates.contains_key(&line.product_id) {
                let rate = self.rates.rate_for(line.product_id).await?;
                rates.insert(line.product_id, rate);
            }
        }

        let now = self.clock.now();
        let reserved_until = now + self.settings.reservation_window;
        let order_id = Uuid::new_v4();
        let order_code = generate_order_code(now);

        let txn = self.db.begin().await?;
        let result = self
            .reserve_in(&txn, buyer_id, order_id, order_code, &request, &rates, now, reserved_until)
            .await;

        let order = match result {
            Ok(order) => {
                txn.commit().await?;
                order
            }
            Err(err) => {
                txn.rollback().await?;
                counter!("keymart_settlement.checkout_failures", 1);
                warn!(%buyer_id, error = %err, "Checkout failed, nothing reserved");
                self.audit.record(
                    AuditEvent::new("order.checkout", AuditCategory::Order, AuditOutcome::Rejected)
                        .actor(buyer_id)
                        .detail(err.to_string()),
                );
                return Err(err);
            }
        };

        counter!("keymart_settlement.checkouts", 1);
        info!(order_id = %order.id, order_code = %order.order_code, total = %order.total_amount, "Order reserved");
        self.events.notify(Event::OrderReserved {
            order_id: order.id,
            buyer_id,
            total_amount: order.total_amount,
            reserved_until,
        });
        self.audit.record(
            AuditEvent::new("order.reserve", AuditCategory::Order, AuditOutcome::Success)
                .actor(buyer_id)
                .subject(order.id),
        );

        if request.confirm_now && order.method() == Some(PaymentMethod::Wallet) {
            payment_queue::process_order(self, order.id).await?;
            let refreshed = order::Entity::find_by_id(order.id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order.id)))?;
            return Ok(CheckoutReceipt::from(&refreshed));
        }

        Ok(CheckoutReceipt::from(&order))
    }

    #[allow(clippy::too_many_arguments)]
    async fn reserve_in(
        &self,
        txn: &DatabaseTransaction,
        buyer_id: Uuid,
        order_id: Uuid,
        order_code: String,
        request: &CheckoutRequest,
        rates: &HashMap<Uuid, Decimal>,
        now: DateTime<Utc>,
        reserved_until: DateTime<Utc>,
    ) -> Result<order::Model, ServiceError> {
        // INITIATED -> RESERVED: every line or nothing
        let mut lines = Vec::new();
        for (index, line) in request.lines.iter().enumerate() {
            let units = match claim_units_in(
                txn,
                line.product_id,
                line.quantity,
                order_id,
                now,
                reserved_until,
            )
            .await
            {
                Ok(units) => units,
                Err(err) if index > 0 && err.is_capacity() => {
                    return Err(ServiceError::CheckoutAborted(format!(
                        "line {} could not be reserved: {}",
                        index + 1,
                        err
                    )));
                }
                Err(err) => return Err(err),
            };
            let rate = rates.get(&line.product_id).copied().unwrap_or_default();
            lines.extend(units.into_iter().map(|unit| OrderLine {
                unit,
                unit_price: line.unit_price,
                commission_rate: rate,
            }));
        }

        let view = create_order_in(
            txn,
            NewOrder {
                order_id,
                order_code,
                buyer_id,
                payment_method: request.payment_method,
                placed_at: now,
                reserved_until,
                lines,
            },
        )
        .await?;
        let order = view.order;

        // RESERVED -> AWAITING_PAYMENT
        if request.payment_method == PaymentMethod::Wallet {
            place_hold_in(txn, buyer_id, order.id, order.total_amount, now, reserved_until).await?;
            payment_queue::enqueue_in(txn, order.id, buyer_id, order.total_amount, now).await?;
        }
        apply_state_change_in(
            txn,
            order,
            StateChange::to(SettlementState::AwaitingPayment).at(now),
        )
        .await
    }

    /// AWAITING_PAYMENT -> SETTLED. Captures the hold (wallet orders),
    /// finalizes the units, completes order and items and pays out sellers
    /// and the platform, all in one transaction.
    #[instrument(skip(self))]
    pub async fn settle(
        &self,
        order_id: Uuid,
        payment_reference: Option<String>,
    ) -> Result<TransitionOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        let order = lock_order_in(&txn, order_id).await?;

        if let Some(state) = order.state().filter(SettlementState::is_terminal) {
            txn.commit().await?;
            debug!(%order_id, state = state.as_str(), "Settle on terminal order ignored");
            return Ok(TransitionOutcome::AlreadyTerminal(OrderStatusView::from(&order)));
        }

        let settled = match self.settle_locked(&txn, order, payment_reference).await {
            Ok(order) => order,
            Err(err) => {
                txn.rollback().await?;
                if err.is_integrity_violation() {
                    error!(%order_id, error = %err, "Settlement integrity violation");
                }
                self.audit.record(
                    AuditEvent::new("order.settle", AuditCategory::Payment, AuditOutcome::Failure)
                        .subject(order_id)
                        .detail(err.to_string()),
                );
                return Err(err);
            }
        };
        txn.commit().await?;

        counter!("keymart_settlement.settled", 1);
        info!(%order_id, total = %settled.total_amount, "Order settled");
        self.events.notify(Event::OrderSettled {
            order_id,
            buyer_id: settled.buyer_id,
            total_amount: settled.total_amount,
        });
        self.audit.record(
            AuditEvent::new("order.settle", AuditCategory::Payment, AuditOutcome::Success)
                .actor(settled.buyer_id)
                .subject(order_id),
        );
        Ok(TransitionOutcome::Applied(OrderStatusView::from(&settled)))
    }

    async fn settle_locked(
        &self,
        txn: &DatabaseTransaction,
        order: order::Model,
        payment_reference: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let now = self.clock.now();
        let items = items_of_in(txn, order.id).await?;

        // Seller payouts grouped per seller; platform takes the commission
        let mut payouts: BTreeMap<Uuid, Decimal> = BTreeMap::new();
        for item in items.iter().filter(|i| i.item_status() == Some(OrderStatus::Pending)) {
            *payouts.entry(item.seller_id).or_default() += item.seller_amount;
        }
        let mut wallets: BTreeSet<Uuid> = payouts.keys().copied().collect();
        wallets.insert(order.buyer_id);
        if order.total_commission > Decimal::ZERO {
            wallets.insert(self.settings.platform_user_id);
        }
        for user_id in &wallets {
            lock_wallet_in(txn, *user_id, now).await?;
        }

        if order.method() == Some(PaymentMethod::Wallet) {
            let hold = hold_for_order_in(txn, order.id).await?.ok_or_else(|| {
                ServiceError::InvalidTransition(format!("wallet order {} has no hold", order.id))
            })?;
            capture_hold_in(txn, hold.id, now).await?;
        }

        let unit_ids: Vec<Uuid> = items
            .iter()
            .filter(|i| i.item_status() == Some(OrderStatus::Pending))
            .map(|i| i.warehouse_item_id)
            .collect();
        finalize_sale_in(txn, order.id, &unit_ids, now).await?;
        settle_pending_items_in(txn, order.id, OrderStatus::Completed, now).await?;

        let order_code = order.order_code.clone();
        let commission = order.total_commission;
        let settled = apply_state_change_in(
            txn,
            order,
            StateChange::to(SettlementState::Settled)
                .with_status(OrderStatus::Completed)
                .with_payment_reference(payment_reference)
                .at(now),
        )
        .await?;

        let payout_reference = format!("PAYOUT:{}", order_code);
        for (seller_id, amount) in payouts {
            if amount > Decimal::ZERO {
                credit_in(txn, seller_id, amount, &payout_reference, Some("seller payout"), now)
                    .await?;
            }
        }
        if commission > Decimal::ZERO {
            credit_in(
                txn,
                self.settings.platform_user_id,
                commission,
                &format!("COMMISSION:{}", order_code),
                Some("platform commission"),
                now,
            )
            .await?;
        }

        Ok(settled)
    }

    /// AWAITING_PAYMENT -> ABORTED. Releases the hold and the units claimed
    /// by this order together, never one without the other.
    #[instrument(skip(self))]
    pub async fn abort(
        &self,
        order_id: Uuid,
        reason: &str,
    ) -> Result<TransitionOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        let order = lock_order_in(&txn, order_id).await?;

        if order.state().map_or(false, |s| s.is_terminal()) {
            txn.commit().await?;
            debug!(%order_id, state = %order.settlement_state, "Abort on terminal order ignored");
            return Ok(TransitionOutcome::AlreadyTerminal(OrderStatusView::from(&order)));
        }

        let aborted = self.abort_locked(&txn, order, reason).await?;
        txn.commit().await?;
        self.after_abort(&aborted, reason, None);
        Ok(TransitionOutcome::Applied(OrderStatusView::from(&aborted)))
    }

    /// Buyer-initiated cancellation. Fails with `AlreadySettled` once the
    /// order has settled; cancelling an aborted order is a no-op.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        requested_by: Uuid,
    ) -> Result<TransitionOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        let order = lock_order_in(&txn, order_id).await?;

        if order.buyer_id != requested_by {
            return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
        }
        match order.state() {
            Some(SettlementState::Settled) => {
                txn.commit().await?;
                return Err(ServiceError::AlreadySettled(order_id));
            }
            Some(SettlementState::Aborted) => {
                txn.commit().await?;
                return Ok(TransitionOutcome::AlreadyTerminal(OrderStatusView::from(&order)));
            }
            _ => {}
        }

        let reason = "cancelled_by_buyer";
        let aborted = self.abort_locked(&txn, order, reason).await?;
        txn.commit().await?;
        self.after_abort(&aborted, reason, Some(requested_by));
        Ok(TransitionOutcome::Applied(OrderStatusView::from(&aborted)))
    }

    async fn abort_locked(
        &self,
        txn: &DatabaseTransaction,
        order: order::Model,
        reason: &str,
    ) -> Result<order::Model, ServiceError> {
        let now = self.clock.now();
        if let Some(hold) = hold_for_order_in(txn, order.id).await? {
            if hold.is_active() {
                release_hold_in(txn, hold.id, now).await?;
            }
        }
        let released = release_claims_of(txn, order.id, now).await?;
        settle_pending_items_in(txn, order.id, OrderStatus::Cancelled, now).await?;
        payment_queue::fail_open_entry_in(txn, order.id, reason, now).await?;
        let aborted = apply_state_change_in(
            txn,
            order,
            StateChange::to(SettlementState::Aborted)
                .with_status(OrderStatus::Cancelled)
                .with_abort_reason(reason)
                .at(now),
        )
        .await?;
        debug!(order_id = %aborted.id, released, "Claims released");
        Ok(aborted)
    }

    fn after_abort(&self, order: &order::Model, reason: &str, actor: Option<Uuid>) {
        counter!("keymart_settlement.aborted", 1);
        info!(order_id = %order.id, reason, "Order aborted");
        self.events.notify(Event::OrderAborted {
            order_id: order.id,
            buyer_id: order.buyer_id,
            reason: reason.to_string(),
        });
        let mut audit = AuditEvent::new("order.abort", AuditCategory::Order, AuditOutcome::Success)
            .subject(order.id)
            .detail(reason);
        if let Some(actor) = actor {
            audit = audit.actor(actor);
        }
        self.audit.record(audit);
    }

    /// Reverses one completed item of a settled order: the seller and the
    /// platform give back their shares and the buyer is credited the item
    /// total. Retrying a finished refund is a no-op.
    #[instrument(skip(self))]
    pub async fn refund_item(
        &self,
        order_id: Uuid,
        item_id: Uuid,
        requested_by: Uuid,
    ) -> Result<OrderStatusView, ServiceError> {
        let txn = self.db.begin().await?;
        let order = lock_order_in(&txn, order_id).await?;
        if order.state() != Some(SettlementState::Settled) {
            return Err(ServiceError::InvalidInput(format!(
                "order {} is not settled and cannot be refunded",
                order_id
            )));
        }

        let items = items_of_in(&txn, order_id).await?;
        let item = items
            .into_iter()
            .find(|i| i.id == item_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order item {} not found", item_id)))?;

        match item.item_status() {
            Some(OrderStatus::Refunded) => {
                txn.commit().await?;
                return Ok(OrderStatusView::from(&order));
            }
            Some(OrderStatus::Completed) => {}
            _ => {
                return Err(ServiceError::InvalidInput(format!(
                    "order item {} is not completed",
                    item_id
                )))
            }
        }

        let now = self.clock.now();
        let platform = self.settings.platform_user_id;
        let wallets: BTreeSet<Uuid> = [order.buyer_id, item.seller_id, platform].into_iter().collect();
        for user_id in &wallets {
            lock_wallet_in(&txn, *user_id, now).await?;
        }

        if item.seller_amount > Decimal::ZERO {
            debit_in(
                &txn,
                item.seller_id,
                item.seller_amount,
                &format!("REFUND:{}:SELLER", item.id),
                Some("refund reversal"),
                now,
            )
            .await?;
        }
        if item.commission_amount > Decimal::ZERO {
            debit_in(
                &txn,
                platform,
                item.commission_amount,
                &format!("REFUND:{}:PLATFORM", item.id),
                Some("commission reversal"),
                now,
            )
            .await?;
        }
        credit_in(
            &txn,
            order.buyer_id,
            item.total_amount,
            &format!("REFUND:{}", item.id),
            Some("order item refund"),
            now,
        )
        .await?;

        update_item_status_in(&txn, item.id, OrderStatus::Refunded, now).await?;
        // Without resale the unit stays sold to the refunded buyer
        if self.settings.allow_resale_after_refund {
            relist_units_in(&txn, &[item.warehouse_item_id], now).await?;
        }
        let order = recompute_order_status_in(&txn, order_id, now).await?;
        txn.commit().await?;

        counter!("keymart_settlement.refunds", 1);
        info!(%order_id, %item_id, amount = %item.total_amount, "Order item refunded");
        self.events.notify(Event::OrderItemRefunded {
            order_id,
            order_item_id: item_id,
            amount: item.total_amount,
        });
        self.audit.record(
            AuditEvent::new("order.refund_item", AuditCategory::Wallet, AuditOutcome::Success)
                .actor(requested_by)
                .subject(item_id),
        );
        Ok(OrderStatusView::from(&order))
    }

    pub async fn get_status(&self, order_id: Uuid) -> Result<OrderStatusView, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        Ok(OrderStatusView::from(&order))
    }
}
