use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Customer-facing order status. Transitions are monotonic: nothing
/// re-enters `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(OrderStatus::Pending),
            "COMPLETED" => Some(OrderStatus::Completed),
            "CANCELLED" | "CANCELED" => Some(OrderStatus::Cancelled),
            "REFUNDED" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }

    /// Shared by orders and order items.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Completed) | (Pending, Cancelled) | (Pending, Refunded) | (Completed, Refunded)
        )
    }
}

/// Per-order settlement state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    Initiated,
    Reserved,
    AwaitingPayment,
    Settled,
    Aborted,
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Initiated => "INITIATED",
            SettlementState::Reserved => "RESERVED",
            SettlementState::AwaitingPayment => "AWAITING_PAYMENT",
            SettlementState::Settled => "SETTLED",
            SettlementState::Aborted => "ABORTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INITIATED" => Some(SettlementState::Initiated),
            "RESERVED" => Some(SettlementState::Reserved),
            "AWAITING_PAYMENT" => Some(SettlementState::AwaitingPayment),
            "SETTLED" => Some(SettlementState::Settled),
            "ABORTED" => Some(SettlementState::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementState::Settled | SettlementState::Aborted)
    }

    pub fn can_transition_to(&self, next: SettlementState) -> bool {
        use SettlementState::*;
        matches!(
            (self, next),
            (Initiated, Reserved)
                | (Reserved, AwaitingPayment)
                | (AwaitingPayment, Settled)
                | (AwaitingPayment, Aborted)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    /// Funded from the buyer's wallet balance under a hold
    Wallet,
    /// Funded by an external payment provider callback
    Gateway,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Wallet => "WALLET",
            PaymentMethod::Gateway => "GATEWAY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WALLET" => Some(PaymentMethod::Wallet),
            "GATEWAY" => Some(PaymentMethod::Gateway),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// External-facing idempotency key, also the provider transaction reference
    #[sea_orm(unique)]
    pub order_code: String,
    pub buyer_id: Uuid,
    pub status: String,
    pub settlement_state: String,
    pub payment_method: String,
    pub total_amount: Decimal,
    pub total_commission: Decimal,
    pub total_seller_amount: Decimal,
    pub payment_reference: Option<String>,
    pub abort_reason: Option<String>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn order_status(&self) -> Option<OrderStatus> {
        OrderStatus::from_str(&self.status)
    }

    pub fn state(&self) -> Option<SettlementState> {
        SettlementState::from_str(&self.settlement_state)
    }

    pub fn method(&self) -> Option<PaymentMethod> {
        PaymentMethod::from_str(&self.payment_method)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
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

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(OrderStatus::Pending, OrderStatus::Completed, true ; "pending completes")]
    #[test_case(OrderStatus::Pending, OrderStatus::Cancelled, true ; "pending cancels")]
    #[test_case(OrderStatus::Completed, OrderStatus::Refunded, true ; "completed refunds")]
    #[test_case(OrderStatus::Completed, OrderStatus::Pending, false ; "never back to pending")]
    #[test_case(OrderStatus::Cancelled, OrderStatus::Completed, false ; "cancelled is final")]
    #[test_case(OrderStatus::Refunded, OrderStatus::Completed, false ; "refunded is final")]
    fn order_status_transitions(from: OrderStatus, to: OrderStatus, allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn settlement_terminal_states_accept_nothing() {
        use SettlementState::*;
        for terminal in [Settled, Aborted] {
            assert!(terminal.is_terminal());
            for next in [Initiated, Reserved, AwaitingPayment, Settled, Aborted] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(AwaitingPayment.can_transition_to(Settled));
        assert!(!Reserved.can_transition_to(Settled));
    }

    #[test]
    fn status_strings_round_trip_through_storage_form() {
        assert_eq!(OrderStatus::from_str("canceled"), Some(OrderStatus::Cancelled));
        assert_eq!(
            SettlementState::from_str(SettlementState::AwaitingPayment.as_str()),
            Some(SettlementState::AwaitingPayment)
        );
        assert_eq!(PaymentMethod::from_str("CARD"), None);
    }
}
