use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod audit;

/// Outbound notification hooks. Delivery is fire-and-forget: a full or
/// closed channel is logged and never fails the caller.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, waiting for channel capacity
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Enqueues without waiting. Used after commits so a slow consumer
    /// never holds up settlement.
    pub fn notify(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping notification event: {}", e);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderReserved {
        order_id: Uuid,
        buyer_id: Uuid,
        total_amount: Decimal,
        reserved_until: DateTime<Utc>,
    },
    OrderSettled {
        order_id: Uuid,
        buyer_id: Uuid,
        total_amount: Decimal,
    },
    OrderAborted {
        order_id: Uuid,
        buyer_id: Uuid,
        reason: String,
    },
    OrderItemRefunded {
        order_id: Uuid,
        order_item_id: Uuid,
        amount: Decimal,
    },
    CallbackRejected {
        reason: String,
        order_code: Option<String>,
    },
    WithdrawalUpdated {
        request_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        status: String,
    },
    DepositResolved {
        deposit_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        status: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderReserved { .. } => "order.reserved",
            Event::OrderSettled { .. } => "order.settled",
            Event::OrderAborted { .. } => "order.aborted",
            Event::OrderItemRefunded { .. } => "order.item_refunded",
            Event::CallbackRejected { .. } => "payment.callback_rejected",
            Event::WithdrawalUpdated { .. } => "wallet.withdrawal_updated",
            Event::DepositResolved { .. } => "wallet.deposit_resolved",
        }
    }
}

// Handlers implementing this trait process events asynchronously (email, activity log, ...).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Logs every event. Default handler when no other collaborator is wired.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        let payload = serde_json::to_string(event).map_err(|e| e.to_string())?;
        info!(event = event.name(), %payload, "notification");
        Ok(())
    }
}

/// Drains the channel and hands each event to every handler. Handler
/// failures are logged and do not stop the loop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(event = event.name(), "dispatching event");
        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!(event = event.name(), error = %e, "event handler failed");
            }
        }
    }

    info!("Event channel closed; event processing loop stopped");
}
