mod common;

use axum::http::{Method, StatusCode};
use common::{response_json, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

fn query_string(params: &std::collections::BTreeMap<String, String>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}

#[tokio::test]
async fn health_reports_database_up() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["checks"]["database"]["status"], "up");
}

#[tokio::test]
async fn requests_without_a_user_are_unauthorized() {
    let app = TestApp::new().await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "lines": [], "payment_method": "GATEWAY" })),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn checkout_then_gateway_callback_over_http() {
    let app = TestApp::new().await;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let product = app.seed_product(seller, 1).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "lines": [{ "product_id": product, "quantity": 1, "unit_price": "1500" }],
                "payment_method": "GATEWAY"
            })),
            Some(buyer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["settlement_state"], "AWAITING_PAYMENT");
    let order_id = body["data"]["order_id"].as_str().unwrap().to_string();
    let order_code = body["data"]["order_code"].as_str().unwrap().to_string();

    let params = app.signed_callback(&order_code, dec!(1500), "00");
    let uri = format!("/api/v1/payments/callback?{}", query_string(&params));
    let response = app.request(Method::GET, &uri, None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack = response_json(response).await;
    assert_eq!(ack["RspCode"], "00");
    assert_eq!(ack["result"], "settled");

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}/status", order_id),
            None,
            Some(buyer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let status = response_json(response).await;
    assert_eq!(status["data"]["settlement_state"], "SETTLED");
    assert_eq!(status["data"]["status"], "COMPLETED");
}

#[tokio::test]
async fn forged_callback_is_a_bad_request() {
    let app = TestApp::new().await;
    let product = app.seed_product(Uuid::new_v4(), 1).await;
    let receipt = app
        .checkout(
            Uuid::new_v4(),
            vec![(product, 1, dec!(80))],
            keymart_settlement::entities::order::PaymentMethod::Gateway,
        )
        .await
        .unwrap();

    let mut params = app.signed_callback(&receipt.order_code, dec!(80), "00");
    params.insert("vnp_SecureHash".to_string(), "00".repeat(64));
    let uri = format!("/api/v1/payments/callback?{}", query_string(&params));
    let response = app.request(Method::GET, &uri, None, None).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let status = app.services().settlement.get_status(receipt.order_id).await.unwrap();
    assert_eq!(status.settlement_state, "AWAITING_PAYMENT");
}

#[tokio::test]
async fn orders_are_private_to_their_buyer() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), 1).await;
    let receipt = app
        .checkout(
            buyer,
            vec![(product, 1, dec!(80))],
            keymart_settlement::entities::order::PaymentMethod::Gateway,
        )
        .await
        .unwrap();
    let uri = format!("/api/v1/orders/{}", receipt.order_id);

    let own = app.request(Method::GET, &uri, None, Some(buyer)).await;
    assert_eq!(own.status(), StatusCode::OK);
    let body = response_json(own).await;
    assert_eq!(body["data"]["items"].as_array().map(Vec::len), Some(1));

    let other = app.request(Method::GET, &uri, None, Some(Uuid::new_v4())).await;
    assert_eq!(other.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn wallet_checkout_without_funds_is_payment_required() {
    let app = TestApp::new().await;
    let product = app.seed_product(Uuid::new_v4(), 1).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "lines": [{ "product_id": product, "quantity": 1, "unit_price": "10" }],
                "payment_method": "WALLET"
            })),
            Some(Uuid::new_v4()),
        )
        .await;

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(app.services().warehouse.available_count(product).await.unwrap(), 1);
}

#[tokio::test]
async fn operator_credits_and_confirms_a_wallet_order() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), 1).await;

    let credit_uri = format!("/api/v1/wallets/{}/credits", buyer);
    let credit = json!({ "amount": "25", "reference_id": "bank-7781" });

    let denied = app
        .request(Method::POST, &credit_uri, Some(credit.clone()), Some(buyer))
        .await;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let granted = app
        .request(Method::POST, &credit_uri, Some(credit.clone()), Some(app.platform_user))
        .await;
    assert_eq!(granted.status(), StatusCode::OK);
    let body = response_json(granted).await;
    assert_eq!(body["data"]["outcome"], "applied");

    let replay = app
        .request(Method::POST, &credit_uri, Some(credit), Some(app.platform_user))
        .await;
    let body = response_json(replay).await;
    assert_eq!(body["data"]["outcome"], "duplicate");
    assert_eq!(app.balance(buyer).await, dec!(25));

    let receipt = app
        .checkout(
            buyer,
            vec![(product, 1, dec!(25))],
            keymart_settlement::entities::order::PaymentMethod::Wallet,
        )
        .await
        .unwrap();
    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/confirm", receipt.order_id),
            None,
            Some(buyer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["settlement_state"], "SETTLED");

    let wallet = app
        .request(Method::GET, &format!("/api/v1/wallets/{}", buyer), None, Some(buyer))
        .await;
    assert_eq!(wallet.status(), StatusCode::OK);
    let other = app
        .request(
            Method::GET,
            &format!("/api/v1/wallets/{}", buyer),
            None,
            Some(Uuid::new_v4()),
        )
        .await;
    assert_eq!(other.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sellers_stock_units_over_http() {
    let app = TestApp::new().await;
    let seller = Uuid::new_v4();
    let product = Uuid::new_v4();

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/warehouse/products/{}/units", product),
            Some(json!({
                "shop_id": Uuid::new_v4(),
                "stall_id": Uuid::new_v4(),
                "item_type": "license_key",
                "payloads": ["AAAA-1111", "BBBB-2222"]
            })),
            Some(seller),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    let units = body["data"].as_array().unwrap();
    assert_eq!(units.len(), 2);
    assert!(units[0].get("payload").is_none());

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/warehouse/products/{}/available", product),
            None,
            None,
        )
        .await;
    let body = response_json(response).await;
    assert_eq!(body["data"]["available"], 2);

    let unit_id = units[0]["id"].as_str().unwrap();
    let response = app
        .request(
            Method::DELETE,
            &format!("/api/v1/warehouse/units/{}", unit_id),
            None,
            Some(seller),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.services().warehouse.available_count(product).await.unwrap(), 1);
}

#[tokio::test]
async fn callback_for_an_unknown_order_is_a_bad_request() {
    let app = TestApp::new().await;

    let params = app.signed_callback("KM20240601090000NOPE0000", dec!(80), "00");
    let uri = format!("/api/v1/payments/callback?{}", query_string(&params));
    let response = app.request(Method::GET, &uri, None, None).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"], "Bad Request");
}

#[tokio::test]
async fn delivered_keys_show_up_in_the_buyer_order() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), 1).await;
    let receipt = app
        .checkout(
            buyer,
            vec![(product, 1, dec!(80))],
            keymart_settlement::entities::order::PaymentMethod::Gateway,
        )
        .await
        .unwrap();
    let uri = format!("/api/v1/orders/{}", receipt.order_id);

    let before = response_json(app.request(Method::GET, &uri, None, Some(buyer)).await).await;
    assert!(before["data"]["items"][0]["payload"].is_null());

    let params = app.signed_callback(&receipt.order_code, dec!(80), "00");
    let callback = format!("/api/v1/payments/callback?{}", query_string(&params));
    app.request(Method::GET, &callback, None, None).await;

    let after = response_json(app.request(Method::GET, &uri, None, Some(buyer)).await).await;
    assert_eq!(after["data"]["items"][0]["status"], "COMPLETED");
    assert_eq!(
        after["data"]["items"][0]["payload"],
        format!("KEY-{}-0000", product.simple())
    );
}

#[tokio::test]
async fn deposit_is_credited_by_the_provider_callback() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();

    let response = app
        .request(
            Method::POST,
            "/api/v1/deposits",
            Some(json!({ "amount": "150000" })),
            Some(user),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["data"]["status"], "PENDING");
    let code = body["data"]["code"].as_str().unwrap().to_string();

    let params = app.signed_callback(&code, dec!(150000), "00");
    let uri = format!("/api/v1/payments/callback?{}", query_string(&params));
    let response = app.request(Method::GET, &uri, None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.balance(user).await, dec!(150000));

    let own = app
        .request(Method::GET, &format!("/api/v1/deposits/{}", code), None, Some(user))
        .await;
    assert_eq!(own.status(), StatusCode::OK);
    assert_eq!(response_json(own).await["data"]["status"], "SUCCESS");
    let other = app
        .request(
            Method::GET,
            &format!("/api/v1/deposits/{}", code),
            None,
            Some(Uuid::new_v4()),
        )
        .await;
    assert_eq!(other.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn withdrawal_review_over_http() {
    let app = TestApp::with_config(|cfg| cfg.min_withdrawal_amount = dec!(100)).await;
    let seller = Uuid::new_v4();
    app.fund(seller, dec!(500)).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/withdrawals",
            Some(json!({
                "amount": "300",
                "bank_account_number": "0123456789",
                "bank_account_name": "NGUYEN VAN A",
                "bank_name": "Vietcombank"
            })),
            Some(seller),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["data"]["status"], "PENDING");
    let request_id = body["data"]["id"].as_str().unwrap().to_string();

    let queue = app
        .request(Method::GET, "/api/v1/admin/withdrawals", None, Some(seller))
        .await;
    assert_eq!(queue.status(), StatusCode::UNAUTHORIZED);
    let queue = app
        .request(Method::GET, "/api/v1/admin/withdrawals", None, Some(app.platform_user))
        .await;
    let body = response_json(queue).await;
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));

    let approve = format!("/api/v1/admin/withdrawals/{}/approve", request_id);
    let response = app
        .request(Method::POST, &approve, None, Some(app.platform_user))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["data"]["status"], "APPROVED");
    assert_eq!(app.balance(seller).await, dec!(200));

    // A resolved request cannot be cancelled
    let cancel = format!("/api/v1/withdrawals/{}/cancel", request_id);
    let response = app.request(Method::POST, &cancel, None, Some(seller)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
