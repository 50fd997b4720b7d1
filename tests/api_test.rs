//! HTTP surface tests against the in-memory router

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use trustfulfill::api::{create_router, AppState};
use trustfulfill::fulfillment::DryRunGateway;
use trustfulfill::reconciler::TimeoutReconciler;
use trustfulfill::webhook::{HmacSignatureVerifier, SIGNATURE_HEADER};
use trustfulfill::{ManualClock, Store};

const SECRET: &str = "api-test-secret";

struct TestApp {
    router: Router,
    store: Arc<Store>,
    clock: Arc<ManualClock>,
}

fn app() -> TestApp {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
    ));
    let state = Arc::new(AppState::new(
        store.clone(),
        Arc::new(DryRunGateway),
        Arc::new(HmacSignatureVerifier::new(SECRET)),
        clock.clone(),
    ));
    TestApp {
        router: create_router(state),
        store,
        clock,
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn webhook(&self, body: &str, signature: Option<String>) -> (StatusCode, Value) {
        let mut request = Request::post("/webhooks/orders/fulfilled")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        self.send(request.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn register_shop(&self, id: &str) {
        let (status, _) = self
            .post_json(
                "/api/shops",
                json!({ "id": id, "externalStoreRef": "acme.myshopify.com" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    /// Ingest an order and return its internal id
    async fn ingest(&self, shop_id: &str, external_ref: &str, country_code: &str) -> String {
        let (status, body) = self
            .post_json(
                &format!("/api/shops/{}/orders", shop_id),
                json!({
                    "externalOrderRef": external_ref,
                    "orderNumber": format!("#{}", external_ref),
                    "email": "ada@example.com",
                    "shippingAddress": {
                        "firstName": "Ada",
                        "lastName": "Lovelace",
                        "address1": "1 Main St",
                        "city": "Springfield",
                        "zip": "12345",
                        "countryCode": country_code
                    }
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["order"]["id"].as_str().unwrap().to_string()
    }
}

fn sign(body: &str) -> String {
    HmacSignatureVerifier::new(SECRET).sign(body.as_bytes())
}

#[tokio::test]
async fn test_health_and_status() {
    let app = app();
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".into()));

    app.register_shop("shop-1").await;
    let (status, body) = app.get("/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shopCount"], 1);
    assert_eq!(body["orderCount"], 0);
    assert_eq!(body["interventionCount"], 0);
}

#[tokio::test]
async fn test_register_shop_defaults() {
    let app = app();
    let (status, body) = app
        .post_json("/api/shops", json!({ "externalStoreRef": "acme.myshopify.com" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(!body["id"].as_str().unwrap().is_empty());
    assert_eq!(body["totalInterventions"], 0);
    assert_eq!(body["domesticCountries"], json!(["US", "CA", "PR"]));

    let (status, _) = app
        .post_json("/api/shops", json!({ "externalStoreRef": "  " }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_duplicate_shop_id_conflicts() {
    let app = app();
    app.register_shop("shop-1").await;
    let (status, body) = app
        .post_json(
            "/api/shops",
            json!({ "id": "shop-1", "externalStoreRef": "other.myshopify.com" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_ingest_then_reingest_appends_notes() {
    let app = app();
    app.register_shop("shop-1").await;
    let order_id = app.ingest("shop-1", "1001", "US").await;

    let (status, body) = app
        .post_json(
            "/api/shops/shop-1/orders",
            json!({
                "externalOrderRef": "1001",
                "orderNumber": "#1001",
                "note": "Leave at the back door"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "updated");
    assert_eq!(body["notesAdded"], 1);
    assert_eq!(body["order"]["id"], order_id.as_str());
    assert_eq!(body["order"]["flowfixStatus"], "awaiting_action");
    assert_eq!(body["order"]["notes"], json!(["Leave at the back door"]));
}

#[tokio::test]
async fn test_ingest_for_unknown_shop_is_not_found() {
    let app = app();
    let (status, _) = app
        .post_json(
            "/api/shops/missing/orders",
            json!({ "externalOrderRef": "1", "orderNumber": "#1" }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature_and_payload() {
    let app = app();
    let body = r#"{"order_id": 1001, "fulfillment_status": "fulfilled"}"#;

    let (status, response) = app.webhook(body, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "Invalid signature");

    let forged = HmacSignatureVerifier::new("not-the-secret").sign(body.as_bytes());
    let (status, _) = app.webhook(body, Some(forged)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let garbage = "{not json";
    let (status, _) = app.webhook(garbage, Some(sign(garbage))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ship_then_webhook_confirms() {
    let app = app();
    app.register_shop("shop-1").await;
    let order_id = app.ingest("shop-1", "1001", "US").await;

    let (status, body) = app
        .post_json(&format!("/api/orders/{}/ship", order_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], true);
    assert_eq!(body["order"]["flowfixStatus"], "shipping_in_progress");
    assert_eq!(body["order"]["lastSyncStatus"], "success");

    app.clock.advance(Duration::seconds(30));
    let event = r#"{"order_id": 1001, "fulfillment_status": "fulfilled"}"#;
    let (status, body) = app.webhook(event, Some(sign(event))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "confirmed");
    assert_eq!(body["orderId"], order_id.as_str());

    // Duplicate delivery is acknowledged without effect
    let (status, body) = app.webhook(event, Some(sign(event))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "ignored");

    let (_, order) = app.get(&format!("/api/orders/{}", order_id)).await;
    assert_eq!(order["flowfixStatus"], "shipped");
    assert_eq!(order["lastSyncStatus"], "webhook_confirmed");
}

#[tokio::test]
async fn test_ship_twice_is_not_applied() {
    let app = app();
    app.register_shop("shop-1").await;
    let order_id = app.ingest("shop-1", "1001", "US").await;

    app.post_json(&format!("/api/orders/{}/ship", order_id), json!({}))
        .await;
    let (status, body) = app
        .post_json(&format!("/api/orders/{}/ship", order_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], false);
    assert_eq!(body["order"]["flowfixStatus"], "shipping_in_progress");
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn test_ship_accepts_optional_tracking() {
    let app = app();
    app.register_shop("shop-1").await;
    let tracked = app.ingest("shop-1", "1001", "US").await;
    let bare = app.ingest("shop-1", "1002", "US").await;

    let (status, body) = app
        .post_json(
            &format!("/api/orders/{}/ship", tracked),
            json!({ "tracking": { "number": "1Z999AA10123456784", "company": "UPS" } }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], true);
    assert_eq!(body["order"]["flowfixStatus"], "shipping_in_progress");

    let (status, body) = app
        .send(
            Request::post(format!("/api/orders/{}/ship", bare))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order"]["flowfixStatus"], "shipping_in_progress");
}

#[tokio::test]
async fn test_malformed_ship_body_leaves_order_untouched() {
    let app = app();
    app.register_shop("shop-1").await;
    let order_id = app.ingest("shop-1", "1001", "US").await;

    let (status, _) = app
        .post_json(
            &format!("/api/orders/{}/ship", order_id),
            json!({ "tracking": "not an object" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, order) = app.get(&format!("/api/orders/{}", order_id)).await;
    assert_eq!(order["flowfixStatus"], "awaiting_action");
}

#[tokio::test]
async fn test_sync_endpoint_reports_pass() {
    let app = app();
    app.register_shop("shop-1").await;

    let (status, body) = app.post_json("/api/shops/shop-1/sync", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shops"], 1);
    assert_eq!(body["created"], 0);
    assert_eq!(body["failedShops"], json!([]));

    let (status, _) = app.post_json("/api/shops/nope/sync", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_timeout_shows_in_today_view_and_trust() {
    let app = app();
    app.register_shop("shop-1").await;
    let domestic = app.ingest("shop-1", "1001", "US").await;
    let _international = app.ingest("shop-1", "1002", "FR").await;
    let late = app.ingest("shop-1", "1003", "CA").await;

    app.post_json(&format!("/api/orders/{}/ship", late), json!({}))
        .await;
    app.clock.advance(Duration::minutes(6));
    let reconciler = TimeoutReconciler::new(
        app.store.clone(),
        app.clock.clone(),
        Duration::minutes(5),
    );
    assert_eq!(reconciler.run_once().unwrap().timed_out, 1);

    let (status, view) = app.get("/api/shops/shop-1/orders/today").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["domestic"].as_array().unwrap().len(), 1);
    assert_eq!(view["domestic"][0]["id"], domestic.as_str());
    assert_eq!(view["international"].as_array().unwrap().len(), 1);
    assert_eq!(view["needsVerification"].as_array().unwrap().len(), 1);
    assert_eq!(view["needsVerification"][0]["id"], late.as_str());

    let (status, metric) = app.get("/api/shops/shop-1/trust").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metric["streakHours"], 0.0);
    assert_eq!(metric["totalInterventions"], 1);

    let (status, ledger) = app.get("/api/shops/shop-1/interventions?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    let ledger = ledger.as_array().unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0]["orderId"], late.as_str());
    assert_eq!(ledger[0]["orderNumber"], "#1003");

    // Operator verifies the parked order
    let (status, body) = app
        .post_json(&format!("/api/orders/{}/verify", late), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], true);
    assert_eq!(body["order"]["flowfixStatus"], "shipped");
    assert_eq!(body["order"]["lastSyncStatus"], "manual_override");
}

#[tokio::test]
async fn test_verify_awaiting_order_is_not_applied() {
    let app = app();
    app.register_shop("shop-1").await;
    let order_id = app.ingest("shop-1", "1001", "US").await;

    let (status, body) = app
        .post_json(&format!("/api/orders/{}/verify", order_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], false);
    assert_eq!(body["order"]["flowfixStatus"], "awaiting_action");
}

#[tokio::test]
async fn test_unknown_order_and_shop_are_not_found() {
    let app = app();
    let (status, body) = app.get("/api/orders/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = app
        .post_json("/api/orders/nope/ship", json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.get("/api/shops/nope/trust").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
