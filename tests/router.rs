mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use pettag_backend::{SubscriptionType, init_router, subscription};
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{seed_codes, seed_pet, seed_user, state};

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_is_ok() {
    let (state, _) = state();
    let app = init_router(state);

    let resp = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn unknown_code_is_404_with_request_id() {
    let (state, _) = state();
    let app = init_router(state);

    let (status, body) = send(&app, Method::GET, "/qr/NOPE/scan", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
    assert!(body["request_id"].as_str().is_some_and(|id| !id.is_empty()));
}

#[tokio::test]
async fn lifetime_checkout_then_public_scan() {
    let (state, _) = state();
    let user = seed_user(&state, 1, 0).await;
    let pet = seed_pet(&state, user.id, "Rex").await;
    let codes = seed_codes(&state, &["QR-0001"]).await;
    let app = init_router(state);

    let (status, body) = send(
        &app,
        Method::POST,
        "/subscriptions/checkout",
        Some(json!({ "user_id": user.id, "qr_code_id": codes[0].id, "plan": "lifetime" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["amount"], 9900);
    assert!(body["meta"]["request_id"].is_string());
    let intent = body["data"]["payment_intent_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        Method::POST,
        "/subscriptions/confirm",
        Some(json!({
            "user_id": user.id,
            "qr_code_id": codes[0].id,
            "plan": "lifetime",
            "payment_intent_id": intent,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["verification"]["status"], "verified");
    assert_eq!(body["data"]["subscription"]["type"], "lifetime");

    let (status, body) = send(&app, Method::GET, "/qr/QR-0001/scan", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["action"], "public_profile");
    assert_eq!(body["data"]["pet_id"], json!(pet.id));

    let (status, body) = send(&app, Method::GET, &format!("/users/{}/coverage", user.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["active"], true);
    assert_eq!(body["data"]["verified_count"], 1);
}

#[tokio::test]
async fn confirm_with_a_different_plan_is_rejected() {
    let (state, _) = state();
    let user = seed_user(&state, 1, 0).await;
    let codes = seed_codes(&state, &["QR-0001"]).await;
    let store = state.store.clone();
    let app = init_router(state);

    let (status, body) = send(
        &app,
        Method::POST,
        "/subscriptions/checkout",
        Some(json!({ "user_id": user.id, "qr_code_id": codes[0].id, "plan": "monthly" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app,
        Method::POST,
        "/subscriptions/confirm",
        Some(json!({
            "user_id": user.id,
            "qr_code_id": codes[0].id,
            "plan": "lifetime",
            "payment_intent_id": body["data"]["payment_intent_id"],
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");
    assert!(store.list_subscriptions_for_user(user.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn limit_exceeded_reports_count_and_max() {
    let (state, _) = state();
    let user = seed_user(&state, 1, 0).await;
    subscription::record_payment(
        state.store.as_ref(),
        subscription::PaymentRecord {
            user_id: user.id,
            qr_code_id: None,
            plan: SubscriptionType::Monthly,
            amount: 275,
            currency: "gbp".into(),
            payment_ref: subscription::PaymentRef::OneTime("pi_1".into()),
        },
    )
    .await
    .unwrap();
    let codes = seed_codes(
        &state,
        &["QR-0001", "QR-0002", "QR-0003", "QR-0004", "QR-0005", "QR-0006"],
    )
    .await;
    let app = init_router(state);

    for qr in &codes[..5] {
        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/qr/{}/verify", qr.id),
            Some(json!({ "user_id": user.id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/qr/{}/verify", codes[5].id),
        Some(json!({ "user_id": user.id })),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "QR_LIMIT_EXCEEDED");
    assert_eq!(body["details"], json!({ "current": 5, "max": 5 }));
}

#[tokio::test]
async fn verify_without_coverage_asks_for_payment() {
    let (state, _) = state();
    let user = seed_user(&state, 1, 0).await;
    let codes = seed_codes(&state, &["QR-0001"]).await;
    let app = init_router(state);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/qr/{}/verify", codes[0].id),
        Some(json!({ "user_id": user.id })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "payment required");
    assert_eq!(body["data"]["status"], "payment_required");
    assert_eq!(body["data"]["qr"]["status"], "assigned");
}

#[tokio::test]
async fn points_and_redemption_transitions() {
    let (state, _) = state();
    let user = seed_user(&state, 1, 950).await;
    let app = init_router(state);
    let points_uri = format!("/users/{}/points", user.id);

    let (status, body) = send(
        &app,
        Method::POST,
        &points_uri,
        Some(json!({ "points": -2000, "mode": "add" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");

    let (status, body) = send(
        &app,
        Method::POST,
        &points_uri,
        Some(json!({ "points": 50, "mode": "add" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["redemption"]["reward_tier"], 1);
    let redemption_uri = format!(
        "/redemptions/{}",
        body["data"]["redemption"]["id"].as_str().unwrap()
    );

    let (status, body) = send(
        &app,
        Method::PATCH,
        &redemption_uri,
        Some(json!({ "status": "shipped" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "shipped");

    let (status, body) = send(
        &app,
        Method::PATCH,
        &redemption_uri,
        Some(json!({ "status": "pending" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE");

    let (status, body) = send(&app, Method::GET, &format!("/users/{}/rewards", user.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["current_reward"]["tier"], 1);
    assert_eq!(body["data"]["next_reward"]["points_needed"], 1000);
}

#[tokio::test]
async fn batch_and_export() {
    let (state, _) = state();
    let app = init_router(state);

    let (status, body) = send(&app, Method::POST, "/qr/batch", Some(json!({ "count": 3 }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let codes = body["data"].as_array().unwrap();
    assert_eq!(codes.len(), 3);
    assert!(codes.iter().all(|c| {
        let code = c["code"].as_str().unwrap();
        code.starts_with("PT-") && code.len() == 11
    }));

    let (status, body) = send(&app, Method::POST, "/qr/export", Some(json!({ "limit": 2 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert!(body["data"][0]["is_downloaded"].as_bool().unwrap());

    let (_, body) = send(&app, Method::POST, "/qr/export", Some(json!({ "limit": 10 }))).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::POST, "/qr/batch", Some(json!({ "count": 0 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn order_is_created_and_provisioned() {
    let (state, payments) = state();
    let user = seed_user(&state, 1, 0).await;
    seed_codes(&state, &["QR-0001"]).await;
    let app = init_router(state);

    let (status, body) = send(
        &app,
        Method::POST,
        "/orders",
        Some(json!({ "user_id": user.id, "order_type": "pet_tag_order", "pet_name": "Bella" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["order"]["payment_status"], "pending");
    assert_eq!(payments.created(), vec![(1499, "gbp".to_string())]);
    let order_id = body["data"]["order"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::POST, &format!("/orders/{order_id}/confirm"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["order"]["payment_status"], "paid");
    assert_eq!(body["data"]["provisioning"]["kind"], "standard");
    assert_eq!(body["data"]["provisioning"]["pet"]["pet_name"], "Bella");
    assert_eq!(body["data"]["provisioning"]["qr"]["code"], "QR-0001");
}

#[tokio::test]
async fn failed_order_payment_is_recorded() {
    let (state, payments) = state();
    let user = seed_user(&state, 1, 0).await;
    let app = init_router(state);

    let (_, body) = send(
        &app,
        Method::POST,
        "/orders",
        Some(json!({ "user_id": user.id, "order_type": "user_pet_tag_order", "pet_name": "Bella" })),
    )
    .await;
    let order_id = body["data"]["order"]["id"].as_str().unwrap().to_string();
    payments.fail(body["data"]["order"]["payment_intent_id"].as_str().unwrap());

    let (status, body) = send(&app, Method::POST, &format!("/orders/{order_id}/confirm"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "order payment failed");
    assert_eq!(body["data"]["order"]["payment_status"], "failed");
    assert!(body["data"]["provisioning"].is_null());
}

#[tokio::test]
async fn contact_without_messaging_is_bad_gateway() {
    let (state, _) = state();
    let user = seed_user(&state, 1, 0).await;
    let pet = seed_pet(&state, user.id, "Rex").await;
    let codes = seed_codes(&state, &["QR-0001"]).await;
    common::seed_assigned(&state, &codes[0], user.id, pet.id).await;
    let app = init_router(state);

    let (status, body) = send(
        &app,
        Method::POST,
        "/qr/QR-0001/contact",
        Some(json!({ "message": "Found your dog in the park" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "UPSTREAM_FAILURE");
}

#[tokio::test]
async fn account_deletion_releases_codes() {
    let (state, _) = state();
    let user = seed_user(&state, 1, 0).await;
    let pet = seed_pet(&state, user.id, "Rex").await;
    let codes = seed_codes(&state, &["QR-0001", "QR-0002"]).await;
    common::seed_assigned(&state, &codes[0], user.id, pet.id).await;
    let store = state.store.clone();
    let app = init_router(state);

    let (status, body) = send(&app, Method::DELETE, &format!("/users/{}/qr-codes", user.id), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["released"], 1);
    assert!(store.list_qr_for_user(user.id).await.unwrap().is_empty());
}
