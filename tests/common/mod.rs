#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use chrono::{TimeZone, Utc};
use keymart_settlement::{
    clock::{ManualClock, SharedClock},
    config::AppConfig,
    db,
    entities::order::PaymentMethod,
    events::{self, audit::TracingAuditSink, EventHandler, EventSender, LoggingEventHandler},
    handlers::USER_ID_HEADER,
    services::{
        callback_signature::{VnpaySignature, SECURE_HASH_FIELD},
        settlement::{CheckoutLine, CheckoutReceipt, CheckoutRequest},
        warehouse::StockUnitsInput,
        AppServices,
    },
    AppState,
};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_HASH_SECRET: &str = "test-provider-hash-secret-0001";

/// Application state over a private in-memory SQLite database and a clock
/// the test drives by hand.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub platform_user: Uuid,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Construct a test application, letting the caller tweak the config
    /// before services are wired.
    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // One connection keeps every query on the same in-memory database
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment_hash_secret = TEST_HASH_SECRET.to_string();
        cfg.platform_user_id = Uuid::new_v4();
        tweak(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(LoggingEventHandler)];
        let event_task = tokio::spawn(events::process_events(event_rx, handlers));

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let shared_clock: SharedClock = clock.clone();

        let services = AppServices::new(
            db_arc.clone(),
            &cfg,
            shared_clock,
            event_sender.clone(),
            Arc::new(TracingAuditSink),
        )
        .expect("services for tests");

        let platform_user = cfg.platform_user_id;
        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
        };
        let router = keymart_settlement::build_router(state.clone());

        Self {
            router,
            state,
            clock,
            platform_user,
            _event_task: event_task,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    /// Stocks `count` fresh units of a new product and returns the product id.
    pub async fn seed_product(&self, seller_id: Uuid, count: usize) -> Uuid {
        let product_id = Uuid::new_v4();
        self.seed_units(seller_id, product_id, count).await;
        product_id
    }

    pub async fn seed_units(&self, seller_id: Uuid, product_id: Uuid, count: usize) -> Vec<Uuid> {
        let payloads = (0..count)
            .map(|i| format!("KEY-{}-{:04}", product_id.simple(), i))
            .collect();
        self.services()
            .warehouse
            .stock_units(StockUnitsInput {
                seller_id,
                shop_id: Uuid::new_v4(),
                stall_id: Uuid::new_v4(),
                product_id,
                item_type: "license_key".to_string(),
                payloads,
            })
            .await
            .expect("seed units")
            .into_iter()
            .map(|u| u.id)
            .collect()
    }

    pub async fn fund(&self, user_id: Uuid, amount: Decimal) {
        self.services()
            .wallet
            .credit_wallet(user_id, amount, &format!("TOPUP:{}", Uuid::new_v4()))
            .await
            .expect("fund wallet");
    }

    pub async fn balance(&self, user_id: Uuid) -> Decimal {
        self.services()
            .wallet
            .snapshot(user_id)
            .await
            .map(|s| s.balance)
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn available_funds(&self, user_id: Uuid) -> Decimal {
        self.services()
            .wallet
            .snapshot(user_id)
            .await
            .expect("wallet snapshot")
            .available
    }

    pub async fn checkout(
        &self,
        buyer_id: Uuid,
        lines: Vec<(Uuid, u32, Decimal)>,
        method: PaymentMethod,
    ) -> Result<CheckoutReceipt, keymart_settlement::errors::ServiceError> {
        self.services()
            .settlement
            .checkout(buyer_id, checkout_request(lines, method))
            .await
    }

    /// Provider callback parameters signed with the test secret.
    pub fn signed_callback(&self, order_code: &str, amount: Decimal, response_code: &str) -> BTreeMap<String, String> {
        let minor = (amount * Decimal::from(100)).trunc();
        let mut params = BTreeMap::new();
        params.insert("vnp_TxnRef".to_string(), order_code.to_string());
        params.insert("vnp_Amount".to_string(), minor.to_string());
        params.insert("vnp_ResponseCode".to_string(), response_code.to_string());
        params.insert("vnp_TransactionNo".to_string(), "14422574".to_string());
        params.insert("vnp_OrderInfo".to_string(), format!("Thanh toan don hang {}", order_code));
        let signature = VnpaySignature::new(TEST_HASH_SECRET)
            .sign(&params)
            .expect("sign callback");
        params.insert(SECURE_HASH_FIELD.to_string(), signature);
        params
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user: Option<Uuid>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user {
            builder = builder.header(USER_ID_HEADER, user_id.to_string());
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub fn checkout_request(lines: Vec<(Uuid, u32, Decimal)>, method: PaymentMethod) -> CheckoutRequest {
    CheckoutRequest {
        lines: lines
            .into_iter()
            .map(|(product_id, quantity, unit_price)| CheckoutLine {
                product_id,
                quantity,
                unit_price,
            })
            .collect(),
        payment_method: method,
        confirm_now: false,
    }
}

pub async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("response is json")
}
