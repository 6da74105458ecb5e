mod common;

use assert_matches::assert_matches;
use chrono::Duration;
use common::{checkout_request, TestApp};
use keymart_settlement::{
    clock::Clock,
    entities::{
        order::{OrderStatus, PaymentMethod},
        payment_queue::{self, QueueStatus},
        wallet,
        wallet_hold::{self, HoldStatus},
        warehouse_item::{self, UnitState},
    },
    errors::ServiceError,
    services::{
        holds::hold_for_order_in,
        orders::{generate_order_code, NewOrder, OrderLine},
        payment_gateway::CallbackAck,
        payment_queue::entry_for_order,
        reaper::EXPIRY_REASON,
        settlement::TransitionOutcome,
    },
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

#[tokio::test]
async fn reaper_aborts_expired_reservation_and_frees_the_unit() {
    let app = TestApp::new().await;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let product = app.seed_product(seller, 1).await;
    app.fund(buyer, dec!(100000)).await;

    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(100000))], PaymentMethod::Wallet)
        .await
        .unwrap();

    // Still inside the window: nothing to reap
    app.clock.advance(Duration::minutes(10));
    let early = app.services().reaper.sweep().await.unwrap();
    assert_eq!(early.orders_aborted, 0);

    app.clock.advance(Duration::minutes(6));
    let report = app.services().reaper.sweep().await.unwrap();
    assert_eq!(report.orders_aborted, 1);
    assert_eq!(report.errors, 0);

    let status = app.services().settlement.get_status(receipt.order_id).await.unwrap();
    assert_eq!(status.settlement_state, "ABORTED");
    assert_eq!(status.status, "CANCELLED");
    assert_eq!(status.abort_reason.as_deref(), Some(EXPIRY_REASON));
    assert_eq!(app.services().warehouse.available_count(product).await.unwrap(), 1);
    assert_eq!(app.available_funds(buyer).await, dec!(100000));

    // A second sweep finds nothing left
    let again = app.services().reaper.sweep().await.unwrap();
    assert_eq!(again.orders_aborted, 0);
    assert_eq!(again.expired_claims, 0);
}

#[tokio::test]
async fn callback_after_expiry_is_a_no_op() {
    let app = TestApp::new().await;
    let seller = Uuid::new_v4();
    let product = app.seed_product(seller, 1).await;

    let receipt = app
        .checkout(Uuid::new_v4(), vec![(product, 1, dec!(100000))], PaymentMethod::Gateway)
        .await
        .unwrap();
    app.clock.advance(Duration::minutes(16));
    app.services().reaper.sweep().await.unwrap();

    let params = app.signed_callback(&receipt.order_code, dec!(100000), "00");
    let ack = app.services().gateway.handle_callback(&params).await.unwrap();
    assert_eq!(ack, CallbackAck::AlreadyTerminal);

    let view = app
        .services()
        .orders
        .get_order_with_items(receipt.order_id)
        .await
        .unwrap();
    assert_eq!(view.order.settlement_state, "ABORTED");
    let unit = app
        .services()
        .warehouse
        .get_unit(view.items[0].warehouse_item_id)
        .await
        .unwrap();
    assert_eq!(unit.state, UnitState::Available);
    assert_eq!(app.balance(seller).await, Decimal::ZERO);
}

#[tokio::test]
async fn successful_callback_settles_once() {
    let app = TestApp::new().await;
    let seller = Uuid::new_v4();
    let product = app.seed_product(seller, 1).await;

    let receipt = app
        .checkout(Uuid::new_v4(), vec![(product, 1, dec!(100000))], PaymentMethod::Gateway)
        .await
        .unwrap();
    let params = app.signed_callback(&receipt.order_code, dec!(100000), "00");

    let first = app.services().gateway.handle_callback(&params).await.unwrap();
    let replay = app.services().gateway.handle_callback(&params).await.unwrap();
    assert_eq!(first, CallbackAck::Settled);
    assert_eq!(replay, CallbackAck::AlreadyTerminal);

    let view = app
        .services()
        .orders
        .get_order_with_items(receipt.order_id)
        .await
        .unwrap();
    assert_eq!(view.order.settlement_state, "SETTLED");
    assert_eq!(view.order.status, "COMPLETED");
    assert_eq!(view.order.payment_reference.as_deref(), Some("14422574"));
    assert!(view.order.reserved_until.is_none());
    assert!(view.items.iter().all(|i| i.status == "COMPLETED"));

    assert_eq!(app.balance(seller).await, dec!(95000));
    assert_eq!(app.balance(app.platform_user).await, dec!(5000));
    let unit = app
        .services()
        .warehouse
        .get_unit(view.items[0].warehouse_item_id)
        .await
        .unwrap();
    assert_eq!(unit.state, UnitState::Sold);
}

#[tokio::test]
async fn declined_callback_aborts_and_releases() {
    let app = TestApp::new().await;
    let product = app.seed_product(Uuid::new_v4(), 1).await;

    let receipt = app
        .checkout(Uuid::new_v4(), vec![(product, 1, dec!(300))], PaymentMethod::Gateway)
        .await
        .unwrap();
    let params = app.signed_callback(&receipt.order_code, dec!(300), "24");

    let ack = app.services().gateway.handle_callback(&params).await.unwrap();
    assert_eq!(ack, CallbackAck::Aborted);
    let status = app.services().settlement.get_status(receipt.order_id).await.unwrap();
    assert_eq!(status.settlement_state, "ABORTED");
    assert_eq!(status.abort_reason.as_deref(), Some("gateway:24"));
    assert_eq!(app.services().warehouse.available_count(product).await.unwrap(), 1);
}

#[tokio::test]
async fn callback_with_wrong_amount_changes_nothing() {
    let app = TestApp::new().await;
    let product = app.seed_product(Uuid::new_v4(), 1).await;

    let receipt = app
        .checkout(Uuid::new_v4(), vec![(product, 1, dec!(300))], PaymentMethod::Gateway)
        .await
        .unwrap();
    let params = app.signed_callback(&receipt.order_code, dec!(3), "00");

    let result = app.services().gateway.handle_callback(&params).await;
    assert_matches!(result, Err(ServiceError::InvalidInput(_)));
    let status = app.services().settlement.get_status(receipt.order_id).await.unwrap();
    assert_eq!(status.settlement_state, "AWAITING_PAYMENT");
}

#[tokio::test]
async fn tampered_callback_is_rejected() {
    let app = TestApp::new().await;
    let product = app.seed_product(Uuid::new_v4(), 1).await;

    let receipt = app
        .checkout(Uuid::new_v4(), vec![(product, 1, dec!(300))], PaymentMethod::Gateway)
        .await
        .unwrap();
    let mut params = app.signed_callback(&receipt.order_code, dec!(300), "00");
    params.insert("vnp_Amount".to_string(), "100".to_string());

    let result = app.services().gateway.handle_callback(&params).await;
    assert_matches!(result, Err(ServiceError::InvalidSignature));
    let status = app.services().settlement.get_status(receipt.order_id).await.unwrap();
    assert_eq!(status.settlement_state, "AWAITING_PAYMENT");
}

#[tokio::test]
async fn payment_queue_settles_wallet_orders() {
    let app = TestApp::new().await;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let product = app.seed_product(seller, 1).await;
    app.fund(buyer, dec!(100000)).await;

    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(100000))], PaymentMethod::Wallet)
        .await
        .unwrap();
    assert_eq!(receipt.settlement_state, "AWAITING_PAYMENT");

    let report = app.services().payment_queue.drain_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let status = app.services().settlement.get_status(receipt.order_id).await.unwrap();
    assert_eq!(status.settlement_state, "SETTLED");
    assert_eq!(app.balance(buyer).await, Decimal::ZERO);
    assert_eq!(app.balance(seller).await, dec!(95000));
    assert_eq!(app.balance(app.platform_user).await, dec!(5000));

    let entry = entry_for_order(app.state.db.as_ref(), receipt.order_id)
        .await
        .unwrap()
        .expect("queue entry");
    assert_eq!(entry.queue_status(), Some(QueueStatus::Completed));

    // Nothing left for the next pass
    let idle = app.services().payment_queue.drain_once().await.unwrap();
    assert_eq!(idle.completed + idle.failed, 0);
}

#[tokio::test]
async fn queue_entry_for_an_expired_order_fails() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), 1).await;
    app.fund(buyer, dec!(40)).await;

    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(40))], PaymentMethod::Wallet)
        .await
        .unwrap();
    app.clock.advance(Duration::minutes(16));
    app.services().reaper.sweep().await.unwrap();

    // The abort closes the entry; the worker has nothing left to pick up
    let entry = entry_for_order(app.state.db.as_ref(), receipt.order_id)
        .await
        .unwrap()
        .expect("queue entry");
    assert_eq!(entry.queue_status(), Some(QueueStatus::Failed));
    assert_eq!(entry.error_message.as_deref(), Some(EXPIRY_REASON));
    let report = app.services().payment_queue.drain_once().await.unwrap();
    assert_eq!(report.completed + report.failed, 0);
    assert_eq!(app.balance(buyer).await, dec!(40));
    assert_eq!(app.available_funds(buyer).await, dec!(40));
}

#[tokio::test]
async fn entry_left_processing_fails_when_its_order_expires() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), 1).await;
    app.fund(buyer, dec!(40)).await;

    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(40))], PaymentMethod::Wallet)
        .await
        .unwrap();

    // A worker claimed the entry and died before finishing it
    let db = app.state.db.as_ref();
    let entry = entry_for_order(db, receipt.order_id).await.unwrap().expect("queue entry");
    let mut active: payment_queue::ActiveModel = entry.into();
    active.status = Set(QueueStatus::Processing.as_str().to_string());
    active.update(db).await.unwrap();

    app.clock.advance(Duration::minutes(16));
    let report = app.services().reaper.sweep().await.unwrap();
    assert_eq!(report.orders_aborted, 1);

    let entry = entry_for_order(db, receipt.order_id).await.unwrap().expect("queue entry");
    assert_eq!(entry.queue_status(), Some(QueueStatus::Failed));
    assert_eq!(entry.processed_at, Some(app.clock.now()));
    let status = app
        .services()
        .gateway
        .confirm_internal(receipt.order_id)
        .await
        .unwrap();
    assert_eq!(status, QueueStatus::Failed);
    assert_eq!(app.available_funds(buyer).await, dec!(40));
}

#[tokio::test]
async fn confirm_now_settles_during_checkout() {
    let app = TestApp::new().await;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let product = app.seed_product(seller, 2).await;
    app.fund(buyer, dec!(10)).await;

    let mut request = checkout_request(vec![(product, 2, dec!(2.50))], PaymentMethod::Wallet);
    request.confirm_now = true;
    let receipt = app
        .services()
        .settlement
        .checkout(buyer, request)
        .await
        .unwrap();

    assert_eq!(receipt.settlement_state, "SETTLED");
    assert_eq!(receipt.total_amount, dec!(5.00));
    assert_eq!(app.balance(buyer).await, dec!(5.00));
    // 2 x (2.37 seller + 0.13 commission)
    assert_eq!(app.balance(seller).await, dec!(4.74));
    assert_eq!(app.balance(app.platform_user).await, dec!(0.26));
}

#[tokio::test]
async fn payouts_are_split_per_seller() {
    let app = TestApp::new().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let from_alice = app.seed_product(alice, 1).await;
    let from_bob = app.seed_product(bob, 2).await;
    app.fund(buyer, dec!(400)).await;

    let receipt = app
        .checkout(
            buyer,
            vec![(from_alice, 1, dec!(200)), (from_bob, 2, dec!(100))],
            PaymentMethod::Wallet,
        )
        .await
        .unwrap();
    app.services()
        .gateway
        .confirm_internal(receipt.order_id)
        .await
        .unwrap();

    assert_eq!(app.balance(alice).await, dec!(190));
    assert_eq!(app.balance(bob).await, dec!(190));
    assert_eq!(app.balance(app.platform_user).await, dec!(20));
    assert_eq!(app.balance(buyer).await, Decimal::ZERO);
}

#[tokio::test]
async fn cancel_before_payment_releases_everything() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), 1).await;
    app.fund(buyer, dec!(50)).await;

    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(50))], PaymentMethod::Wallet)
        .await
        .unwrap();

    // Someone else's order looks absent
    let stranger = app
        .services()
        .settlement
        .cancel_order(receipt.order_id, Uuid::new_v4())
        .await;
    assert_matches!(stranger, Err(ServiceError::NotFound(_)));

    let outcome = app
        .services()
        .settlement
        .cancel_order(receipt.order_id, buyer)
        .await
        .unwrap();
    assert!(outcome.was_applied());
    assert_eq!(outcome.order().abort_reason.as_deref(), Some("cancelled_by_buyer"));
    assert_eq!(app.available_funds(buyer).await, dec!(50));
    assert_eq!(app.services().warehouse.available_count(product).await.unwrap(), 1);

    let again = app
        .services()
        .settlement
        .cancel_order(receipt.order_id, buyer)
        .await
        .unwrap();
    assert_matches!(again, TransitionOutcome::AlreadyTerminal(_));
}

#[tokio::test]
async fn settled_orders_cannot_be_cancelled_or_aborted() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), 1).await;
    app.fund(buyer, dec!(50)).await;

    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(50))], PaymentMethod::Wallet)
        .await
        .unwrap();
    app.services().payment_queue.drain_once().await.unwrap();

    let cancel = app
        .services()
        .settlement
        .cancel_order(receipt.order_id, buyer)
        .await;
    assert_matches!(cancel, Err(ServiceError::AlreadySettled(id)) if id == receipt.order_id);

    let abort = app
        .services()
        .settlement
        .abort(receipt.order_id, EXPIRY_REASON)
        .await
        .unwrap();
    assert_matches!(abort, TransitionOutcome::AlreadyTerminal(view) if view.settlement_state == "SETTLED");

    // The reaper leaves settled orders alone even long after the window
    app.clock.advance(Duration::hours(2));
    let report = app.services().reaper.sweep().await.unwrap();
    assert_eq!(report.orders_aborted, 0);
    assert_eq!(app.balance(buyer).await, Decimal::ZERO);
}

#[tokio::test]
async fn refunds_reverse_one_item_at_a_time() {
    let app = TestApp::new().await;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let product = app.seed_product(seller, 2).await;
    app.fund(buyer, dec!(100000)).await;

    let receipt = app
        .checkout(buyer, vec![(product, 2, dec!(50000))], PaymentMethod::Wallet)
        .await
        .unwrap();
    app.services().payment_queue.drain_once().await.unwrap();
    assert_eq!(app.balance(seller).await, dec!(95000));

    let view = app
        .services()
        .orders
        .get_order_with_items(receipt.order_id)
        .await
        .unwrap();
    let (first, second) = (view.items[0].id, view.items[1].id);
    let settlement = &app.services().settlement;

    let after_first = settlement
        .refund_item(receipt.order_id, first, seller)
        .await
        .unwrap();
    assert_eq!(after_first.status, "COMPLETED");
    assert_eq!(app.balance(buyer).await, dec!(50000));
    assert_eq!(app.balance(seller).await, dec!(47500));
    assert_eq!(app.balance(app.platform_user).await, dec!(2500));

    // Retrying the same refund moves nothing
    settlement
        .refund_item(receipt.order_id, first, seller)
        .await
        .unwrap();
    assert_eq!(app.balance(buyer).await, dec!(50000));

    let after_second = settlement
        .refund_item(receipt.order_id, second, seller)
        .await
        .unwrap();
    assert_eq!(after_second.status, "REFUNDED");
    assert_eq!(after_second.settlement_state, "SETTLED");
    assert_eq!(app.balance(buyer).await, dec!(100000));
    assert_eq!(app.balance(seller).await, Decimal::ZERO);
    assert_eq!(app.balance(app.platform_user).await, Decimal::ZERO);

    // Without resale the refunded units stay off the shelf
    assert_eq!(app.services().warehouse.available_count(product).await.unwrap(), 0);
}

#[tokio::test]
async fn refunded_units_return_to_sale_when_resale_is_allowed() {
    let app = TestApp::with_config(|cfg| cfg.allow_resale_after_refund = true).await;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let product = app.seed_product(seller, 1).await;
    app.fund(buyer, dec!(20)).await;

    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(20))], PaymentMethod::Wallet)
        .await
        .unwrap();
    app.services().payment_queue.drain_once().await.unwrap();
    let view = app
        .services()
        .orders
        .get_order_with_items(receipt.order_id)
        .await
        .unwrap();

    app.services()
        .settlement
        .refund_item(receipt.order_id, view.items[0].id, app.platform_user)
        .await
        .unwrap();
    assert_eq!(app.services().warehouse.available_count(product).await.unwrap(), 1);
}

#[tokio::test]
async fn refund_requires_a_settled_order() {
    let app = TestApp::new().await;
    let product = app.seed_product(Uuid::new_v4(), 1).await;
    let receipt = app
        .checkout(Uuid::new_v4(), vec![(product, 1, dec!(20))], PaymentMethod::Gateway)
        .await
        .unwrap();
    let view = app
        .services()
        .orders
        .get_order_with_items(receipt.order_id)
        .await
        .unwrap();

    let result = app
        .services()
        .settlement
        .refund_item(receipt.order_id, view.items[0].id, app.platform_user)
        .await;
    assert_matches!(result, Err(ServiceError::InvalidInput(_)));
}

#[tokio::test]
async fn sub_cent_prices_are_rejected() {
    let app = TestApp::new().await;
    let product = app.seed_product(Uuid::new_v4(), 1).await;

    let result = app
        .checkout(Uuid::new_v4(), vec![(product, 1, dec!(0.004))], PaymentMethod::Gateway)
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(msg)) if msg.contains("0.01"));
    assert_eq!(app.services().warehouse.available_count(product).await.unwrap(), 1);

    // One cent is the smallest sellable price
    let receipt = app
        .checkout(Uuid::new_v4(), vec![(product, 1, dec!(0.01))], PaymentMethod::Gateway)
        .await
        .unwrap();
    assert_eq!(receipt.total_amount, dec!(0.01));
}

#[tokio::test]
async fn declined_callback_aborts_even_with_a_different_amount() {
    let app = TestApp::new().await;
    let product = app.seed_product(Uuid::new_v4(), 1).await;

    let receipt = app
        .checkout(Uuid::new_v4(), vec![(product, 1, dec!(300))], PaymentMethod::Gateway)
        .await
        .unwrap();
    let params = app.signed_callback(&receipt.order_code, Decimal::ZERO, "24");

    let ack = app.services().gateway.handle_callback(&params).await.unwrap();
    assert_eq!(ack, CallbackAck::Aborted);
    let status = app.services().settlement.get_status(receipt.order_id).await.unwrap();
    assert_eq!(status.settlement_state, "ABORTED");
    assert_eq!(status.abort_reason.as_deref(), Some("gateway:24"));
    assert_eq!(app.services().warehouse.available_count(product).await.unwrap(), 1);
}

#[tokio::test]
async fn buyer_sees_the_key_only_while_the_item_is_completed() {
    let app = TestApp::new().await;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let product = app.seed_product(seller, 1).await;
    let orders = &app.services().orders;

    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(120))], PaymentMethod::Gateway)
        .await
        .unwrap();
    let pending = orders.get_buyer_view(receipt.order_id, buyer).await.unwrap();
    assert_eq!(pending.items.len(), 1);
    assert!(pending.items[0].payload.is_none());

    let stranger = orders.get_buyer_view(receipt.order_id, Uuid::new_v4()).await;
    assert_matches!(stranger, Err(ServiceError::NotFound(_)));

    let params = app.signed_callback(&receipt.order_code, dec!(120), "00");
    app.services().gateway.handle_callback(&params).await.unwrap();
    let delivered = orders.get_buyer_view(receipt.order_id, buyer).await.unwrap();
    let key = delivered.items[0].payload.as_deref().expect("delivered key");
    assert_eq!(key, format!("KEY-{}-0000", product.simple()));

    app.services()
        .settlement
        .refund_item(receipt.order_id, delivered.items[0].item.id, seller)
        .await
        .unwrap();
    let refunded = orders.get_buyer_view(receipt.order_id, buyer).await.unwrap();
    assert_eq!(refunded.items[0].item.status, "REFUNDED");
    assert!(refunded.items[0].payload.is_none());
}

#[tokio::test]
async fn aborted_orders_never_expose_keys() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), 1).await;

    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(120))], PaymentMethod::Gateway)
        .await
        .unwrap();
    app.clock.advance(Duration::minutes(16));
    app.services().reaper.sweep().await.unwrap();

    let view = app
        .services()
        .orders
        .get_buyer_view(receipt.order_id, buyer)
        .await
        .unwrap();
    assert_eq!(view.items[0].item.status, "CANCELLED");
    assert!(view.items[0].payload.is_none());
}

#[tokio::test]
async fn reaper_and_callback_race_to_one_outcome() {
    let app = TestApp::new().await;
    let seller = Uuid::new_v4();
    let product = app.seed_product(seller, 1).await;

    let receipt = app
        .checkout(Uuid::new_v4(), vec![(product, 1, dec!(100000))], PaymentMethod::Gateway)
        .await
        .unwrap();
    app.clock.advance(Duration::minutes(16));
    let params = app.signed_callback(&receipt.order_code, dec!(100000), "00");

    let (swept, ack) = tokio::join!(
        app.services().reaper.sweep(),
        app.services().gateway.handle_callback(&params),
    );
    let swept = swept.unwrap();
    let ack = ack.unwrap();

    let settled = ack == CallbackAck::Settled;
    let aborted = swept.orders_aborted == 1;
    assert!(settled ^ aborted, "exactly one side must win: {:?} / {:?}", ack, swept);
    if aborted {
        assert_eq!(ack, CallbackAck::AlreadyTerminal);
    }

    let status = app.services().settlement.get_status(receipt.order_id).await.unwrap();
    let expected_state = if settled { "SETTLED" } else { "ABORTED" };
    assert_eq!(status.settlement_state, expected_state);

    // At most one payout, and only for the settled outcome
    let payouts = app
        .services()
        .wallet
        .history(seller)
        .await
        .map(|h| h.iter().filter(|e| e.reference_id.starts_with("PAYOUT:")).count())
        .unwrap_or(0);
    assert_eq!(payouts, usize::from(settled));
    let expected_balance = if settled { dec!(95000) } else { Decimal::ZERO };
    assert_eq!(app.balance(seller).await, expected_balance);

    // A sold unit is never back on the shelf
    let shelf = app.services().warehouse.available_count(product).await.unwrap();
    assert_eq!(shelf, if settled { 0 } else { 1 });
    let again = app.services().reaper.sweep().await.unwrap();
    assert_eq!(again.orders_aborted, 0);
    assert_eq!(app.balance(seller).await, expected_balance);
}

#[tokio::test]
async fn sweep_survives_an_owner_it_cannot_release() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), 1).await;
    app.fund(buyer, dec!(40)).await;
    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(40))], PaymentMethod::Wallet)
        .await
        .unwrap();

    // An ownerless hold pointing at a wallet that does not exist. The nil
    // owner sorts first, so the sweep meets it before the real order.
    let now = app.clock.now();
    wallet_hold::ActiveModel {
        id: Set(Uuid::new_v4()),
        wallet_id: Set(Uuid::new_v4()),
        user_id: Set(Uuid::new_v4()),
        order_id: Set(Uuid::nil()),
        amount: Set(dec!(5)),
        status: Set(HoldStatus::Active.as_str().to_string()),
        expires_at: Set(now + Duration::minutes(15)),
        created_at: Set(now),
        updated_at: Set(None),
    }
    .insert(app.state.db.as_ref())
    .await
    .unwrap();

    app.clock.advance(Duration::minutes(16));
    let report = app.services().reaper.sweep().await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.orders_aborted, 1);

    let status = app.services().settlement.get_status(receipt.order_id).await.unwrap();
    assert_eq!(status.settlement_state, "ABORTED");
    assert_eq!(app.available_funds(buyer).await, dec!(40));
}

#[tokio::test]
async fn holds_and_units_are_stamped_with_the_service_clock() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), 1).await;
    app.fund(buyer, dec!(40)).await;
    let db = app.state.db.as_ref();

    let funded_at = app.clock.now();
    let buyer_wallet = wallet::Entity::find()
        .filter(wallet::Column::UserId.eq(buyer))
        .one(db)
        .await
        .unwrap()
        .expect("wallet");
    assert_eq!(buyer_wallet.updated_at, Some(funded_at));

    app.clock.advance(Duration::minutes(3));
    let placed_at = app.clock.now();
    let receipt = app
        .checkout(buyer, vec![(product, 1, dec!(40))], PaymentMethod::Wallet)
        .await
        .unwrap();
    let hold = hold_for_order_in(db, receipt.order_id).await.unwrap().expect("hold");
    assert_eq!(hold.created_at, placed_at);
    assert_eq!(hold.expires_at, placed_at + Duration::minutes(15));
    let order = app
        .services()
        .orders
        .get_order_with_items(receipt.order_id)
        .await
        .unwrap();
    assert_eq!(order.order.created_at, placed_at);

    app.clock.advance(Duration::minutes(2));
    let cancelled_at = app.clock.now();
    app.services()
        .settlement
        .cancel_order(receipt.order_id, buyer)
        .await
        .unwrap();

    let hold = hold_for_order_in(db, receipt.order_id).await.unwrap().expect("hold");
    assert_eq!(hold.hold_status(), Some(HoldStatus::Released));
    assert_eq!(hold.updated_at, Some(cancelled_at));
    let unit = warehouse_item::Entity::find_by_id(order.items[0].warehouse_item_id)
        .one(db)
        .await
        .unwrap()
        .expect("unit");
    assert!(!unit.locked);
    assert_eq!(unit.updated_at, Some(cancelled_at));
    let order = app
        .services()
        .orders
        .get_order_with_items(receipt.order_id)
        .await
        .unwrap();
    assert_eq!(order.order.updated_at, Some(cancelled_at));
}

/// Claims `count` units of a fresh product for `claimant` and loads them.
async fn claimed_units(app: &TestApp, claimant: Uuid, count: u32) -> Vec<warehouse_item::Model> {
    let product = app.seed_product(Uuid::new_v4(), count as usize).await;
    let ids = app
        .services()
        .warehouse
        .claim_units(product, count, Duration::minutes(15), claimant)
        .await
        .unwrap();
    warehouse_item::Entity::find()
        .filter(warehouse_item::Column::Id.is_in(ids))
        .all(app.state.db.as_ref())
        .await
        .unwrap()
}

fn new_order(app: &TestApp, order_id: Uuid, units: Vec<warehouse_item::Model>) -> NewOrder {
    let now = app.clock.now();
    NewOrder {
        order_id,
        order_code: generate_order_code(now),
        buyer_id: Uuid::new_v4(),
        payment_method: PaymentMethod::Gateway,
        placed_at: now,
        reserved_until: now + Duration::minutes(15),
        lines: units
            .into_iter()
            .map(|unit| OrderLine {
                unit,
                unit_price: dec!(100),
                commission_rate: dec!(0.05),
            })
            .collect(),
    }
}

#[tokio::test]
async fn order_aggregate_persists_orders_with_their_items() {
    let app = TestApp::new().await;
    let order_id = Uuid::new_v4();
    let units = claimed_units(&app, order_id, 2).await;
    let orders = &app.services().orders;

    let created = orders.create_order(new_order(&app, order_id, units)).await.unwrap();
    assert_eq!(created.order.status, "PENDING");
    assert_eq!(created.order.settlement_state, "RESERVED");
    assert_eq!(created.order.total_amount, dec!(200));
    assert_eq!(created.order.total_commission, dec!(10));
    assert_eq!(created.order.total_seller_amount, dec!(190));
    assert_eq!(created.items.len(), 2);
    assert!(created.items.iter().all(|i| i.status == "PENDING"));

    let loaded = orders.get_order_by_code(&created.order.order_code).await.unwrap();
    assert_eq!(loaded.order.id, order_id);
    assert_eq!(loaded.items.len(), 2);
}

#[tokio::test]
async fn order_aggregate_rejects_empty_orders() {
    let app = TestApp::new().await;
    let result = app
        .services()
        .orders
        .create_order(new_order(&app, Uuid::new_v4(), Vec::new()))
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn item_statuses_only_move_forward() {
    let app = TestApp::new().await;
    let order_id = Uuid::new_v4();
    let units = claimed_units(&app, order_id, 2).await;
    let orders = &app.services().orders;
    let created = orders.create_order(new_order(&app, order_id, units)).await.unwrap();
    let (delivered, dropped) = (created.items[0].id, created.items[1].id);

    let item = orders
        .update_item_status(delivered, OrderStatus::Completed)
        .await
        .unwrap();
    assert_eq!(item.status, "COMPLETED");
    // Same status again is a no-op
    orders
        .update_item_status(delivered, OrderStatus::Completed)
        .await
        .unwrap();
    assert_matches!(
        orders.update_item_status(delivered, OrderStatus::Pending).await,
        Err(ServiceError::InvalidTransition(_))
    );

    orders
        .update_item_status(dropped, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert_matches!(
        orders.update_item_status(dropped, OrderStatus::Completed).await,
        Err(ServiceError::InvalidTransition(_))
    );

    let view = orders.get_order_with_items(order_id).await.unwrap();
    let statuses: Vec<&str> = view.items.iter().map(|i| i.status.as_str()).collect();
    assert!(statuses.contains(&"COMPLETED"));
    assert!(statuses.contains(&"CANCELLED"));
}

#[tokio::test]
async fn order_statuses_only_move_forward() {
    let app = TestApp::new().await;
    let orders = &app.services().orders;

    let completed_id = Uuid::new_v4();
    let units = claimed_units(&app, completed_id, 1).await;
    orders.create_order(new_order(&app, completed_id, units)).await.unwrap();
    let order = orders
        .update_order_status(completed_id, OrderStatus::Completed)
        .await
        .unwrap();
    assert_eq!(order.status, "COMPLETED");
    assert_matches!(
        orders.update_order_status(completed_id, OrderStatus::Pending).await,
        Err(ServiceError::InvalidTransition(_))
    );
    let refunded = orders
        .update_order_status(completed_id, OrderStatus::Refunded)
        .await
        .unwrap();
    assert_eq!(refunded.status, "REFUNDED");

    let cancelled_id = Uuid::new_v4();
    let units = claimed_units(&app, cancelled_id, 1).await;
    orders.create_order(new_order(&app, cancelled_id, units)).await.unwrap();
    orders
        .update_order_status(cancelled_id, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert_matches!(
        orders.update_order_status(cancelled_id, OrderStatus::Completed).await,
        Err(ServiceError::InvalidTransition(_))
    );
    let view = orders.get_order_with_items(cancelled_id).await.unwrap();
    assert_eq!(view.order.status, "CANCELLED");

    assert_matches!(
        orders.update_order_status(Uuid::new_v4(), OrderStatus::Completed).await,
        Err(ServiceError::NotFound(_))
    );
}
