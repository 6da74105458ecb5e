//! Payment Reconciliation Gateway
//!
//! Turns provider callbacks into settle/abort signals, or into deposit
//! results when the reference is a deposit code. The signature is checked
//! before any lookup or write; callbacks for orders that already reached a
//! terminal state are acknowledged without side effects.

use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::order::{PaymentMethod, SettlementState};
use crate::entities::payment_queue::QueueStatus;
use crate::errors::ServiceError;
use crate::events::audit::{AuditCategory, AuditEvent, AuditOutcome, SharedAuditSink};
use crate::events::{Event, EventSender};
use crate::services::callback_signature::SharedCallbackVerifier;
use crate::services::deposits::{is_deposit_code, DepositOutcome, DepositResult, DepositService};
use crate::services::orders::find_by_code_in;
use crate::services::payment_queue;
use crate::services::settlement::{SettlementCoordinator, TransitionOutcome};

pub const TXN_REF_FIELD: &str = "vnp_TxnRef";
pub const TRANSACTION_NO_FIELD: &str = "vnp_TransactionNo";
pub const AMOUNT_FIELD: &str = "vnp_Amount";
pub const RESPONSE_CODE_FIELD: &str = "vnp_ResponseCode";
pub const SUCCESS_CODE: &str = "00";

/// The fields of a verified callback the settlement path cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub order_code: String,
    pub provider_txn: Option<String>,
    /// Major units; the provider sends minor units (x100)
    pub amount: Decimal,
    pub response_code: String,
}

impl CallbackPayload {
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self, ServiceError> {
        let field = |name: &str| {
            params
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ServiceError::InvalidInput(format!("missing {}", name)))
        };

        let minor_units: i64 = field(AMOUNT_FIELD)?
            .parse()
            .map_err(|_| ServiceError::InvalidInput(format!("{} is not an integer", AMOUNT_FIELD)))?;
        if minor_units < 0 {
            return Err(ServiceError::InvalidInput(format!(
                "{} must not be negative",
                AMOUNT_FIELD
            )));
        }

        Ok(Self {
            order_code: field(TXN_REF_FIELD)?.to_string(),
            provider_txn: field(TRANSACTION_NO_FIELD).ok().map(str::to_string),
            amount: Decimal::new(minor_units, 2),
            response_code: field(RESPONSE_CODE_FIELD)?.to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == SUCCESS_CODE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAck {
    Settled,
    Aborted,
    /// Duplicate or late callback for an order already SETTLED/ABORTED,
    /// or a deposit already resolved
    AlreadyTerminal,
    Deposited,
    DepositDeclined,
}

impl From<DepositOutcome> for CallbackAck {
    fn from(outcome: DepositOutcome) -> Self {
        match outcome {
            DepositOutcome::Credited => CallbackAck::Deposited,
            DepositOutcome::Declined => CallbackAck::DepositDeclined,
            DepositOutcome::AlreadyResolved => CallbackAck::AlreadyTerminal,
        }
    }
}

#[derive(Clone)]
pub struct PaymentGateway {
    coordinator: Arc<SettlementCoordinator>,
    deposits: DepositService,
    verifier: SharedCallbackVerifier,
    events: EventSender,
    audit: SharedAuditSink,
}

impl PaymentGateway {
    pub fn new(
        coordinator: Arc<SettlementCoordinator>,
        deposits: DepositService,
        verifier: SharedCallbackVerifier,
        events: EventSender,
        audit: SharedAuditSink,
    ) -> Self {
        Self {
            coordinator,
            deposits,
            verifier,
            events,
            audit,
        }
    }

    #[instrument(skip(self, params), fields(order_code = params.get(TXN_REF_FIELD).map(String::as_str).unwrap_or("")))]
    pub async fn handle_callback(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<CallbackAck, ServiceError> {
        if let Err(err) = self.verifier.verify(params) {
            let order_code = params.get(TXN_REF_FIELD).cloned();
            counter!("keymart_payment.callbacks_rejected", 1);
            warn!(target: "security", order_code = ?order_code, "Rejected payment callback with invalid signature");
            self.events.notify(Event::CallbackRejected {
                reason: err.to_string(),
                order_code,
            });
            self.audit.record(
                AuditEvent::new("payment.callback", AuditCategory::Payment, AuditOutcome::Rejected)
                    .detail("invalid signature"),
            );
            return Err(err);
        }

        let payload = CallbackPayload::from_params(params)?;
        if is_deposit_code(&payload.order_code) {
            let outcome = self
                .deposits
                .resolve(DepositResult {
                    code: &payload.order_code,
                    amount: payload.amount,
                    succeeded: payload.is_success(),
                    provider_txn: payload.provider_txn.clone(),
                    response_code: &payload.response_code,
                })
                .await?;
            counter!("keymart_payment.callbacks_applied", 1);
            return Ok(CallbackAck::from(outcome));
        }

        // Provider callbacks are answered with 200 or 400 only
        let order = find_by_code_in(self.coordinator.db(), &payload.order_code)
            .await?
            .ok_or_else(|| {
                warn!(order_code = %payload.order_code, "Callback for unknown order reference");
                ServiceError::InvalidInput(format!(
                    "unknown order reference {}",
                    payload.order_code
                ))
            })?;

        if order.state().map_or(false, |s| s.is_terminal()) {
            info!(order_id = %order.id, state = %order.settlement_state, "Callback for terminal order acknowledged");
            counter!("keymart_payment.callbacks_duplicate", 1);
            return Ok(CallbackAck::AlreadyTerminal);
        }
        if order.method() != Some(PaymentMethod::Gateway) {
            return Err(ServiceError::InvalidInput(format!(
                "order {} is not gateway-funded",
                payload.order_code
            )));
        }

        let outcome = if payload.is_success() {
            if payload.amount != order.total_amount {
                warn!(
                    order_id = %order.id,
                    expected = %order.total_amount,
                    received = %payload.amount,
                    "Callback amount mismatch"
                );
                return Err(ServiceError::InvalidInput(format!(
                    "amount {} does not match order total {}",
                    payload.amount, order.total_amount
                )));
            }
            self.coordinator
                .settle(order.id, payload.provider_txn.clone())
                .await?
        } else {
            // Declines abort whatever amount they report
            self.coordinator
                .abort(order.id, &format!("gateway:{}", payload.response_code))
                .await?
        };

        counter!("keymart_payment.callbacks_applied", 1);
        Ok(ack_for(&outcome))
    }

    /// Internal confirmation for wallet orders, through the payment queue.
    #[instrument(skip(self))]
    pub async fn confirm_internal(&self, order_id: Uuid) -> Result<QueueStatus, ServiceError> {
        payment_queue::process_order(&self.coordinator, order_id).await
    }
}

fn ack_for(outcome: &TransitionOutcome) -> CallbackAck {
    match outcome {
        TransitionOutcome::AlreadyTerminal(_) => CallbackAck::AlreadyTerminal,
        TransitionOutcome::Applied(view)
            if view.settlement_state == SettlementState::Settled.as_str() =>
        {
            CallbackAck::Settled
        }
        TransitionOutcome::Applied(_) => CallbackAck::Aborted,
    }
}
