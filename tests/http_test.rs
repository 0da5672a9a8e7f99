//! HTTP surface tests driving the router with `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use purser::verifier::test::MockVerifier;
use purser::{Config, Engine, ReceiptVerifier, StaticTenantResolver, Tenant, VerifyFailure};
use serde_json::{json, Value};
use tower::ServiceExt;

const API_KEY: &str = "pk_test_demo";

fn router_with(config: Config, verifier: Arc<dyn ReceiptVerifier>) -> Router {
    let tenants = Arc::new(StaticTenantResolver::new());
    tenants.register(API_KEY, Tenant::new("app_1", "Demo"));

    Engine::builder(config)
        .with_tenants(tenants)
        .with_verifier(verifier)
        .build()
        .router()
}

fn router() -> Router {
    router_with(Config::default(), Arc::new(MockVerifier::accepting()))
}

fn authed(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_needs_no_credentials() {
    let response = router()
        .oneshot(
            Request::builder()
                .uri("/v1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn missing_and_invalid_api_keys_are_distinct() {
    let app = router();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/subscribers/u1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "missing_api_key");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/subscribers/u1")
                .header("x-api-key", "pk_wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"], "invalid_api_key");
}

#[tokio::test]
async fn unrouted_v1_paths_answer_501() {
    let response = router()
        .oneshot(authed("GET", "/v1/offerings", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body_json(response).await["error"], "not_implemented");
}

#[tokio::test]
async fn receipt_submission_returns_the_sdk_envelope() {
    let response = router()
        .oneshot(authed(
            "POST",
            "/v1/receipts",
            json!({
                "app_user_id": "u1",
                "product_id": "pro_monthly",
                "store": "app_store",
                "receipt_data": "base64-blob"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert!(body["request_date"].is_string());
    assert!(body["request_date_ms"].is_i64());
    let subscriber = &body["subscriber"];
    assert_eq!(subscriber["original_app_user_id"], "u1");
    assert_eq!(subscriber["subscriptions"]["pro_monthly"]["is_active"], true);
    assert_eq!(subscriber["entitlements"]["pro_monthly"]["is_active"], true);
    assert_eq!(
        subscriber["subscriptions"]["pro_monthly"]["ownership_type"],
        "PURCHASED"
    );
    assert!(subscriber["management_url"].is_null());
}

#[tokio::test]
async fn malformed_receipt_bodies_are_invalid_payload() {
    let response = router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/receipts")
                .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_payload");
}

#[tokio::test]
async fn rejected_receipts_surface_the_failure_reason() {
    let app = router_with(
        Config::default(),
        Arc::new(MockVerifier::rejecting(VerifyFailure::StoreRejected {
            status: 21003,
        })),
    );

    let response = app
        .oneshot(authed(
            "POST",
            "/v1/receipts",
            json!({"app_user_id": "u1", "product_id": "pro_monthly", "receipt_data": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error"], "receipt_validation_failed");
    assert!(body["details"].as_str().unwrap().contains("21003"));
}

#[tokio::test]
async fn missing_store_credentials_are_a_server_error() {
    let app = router_with(
        Config::default(),
        Arc::new(MockVerifier::rejecting(VerifyFailure::MissingSharedSecret)),
    );

    let response = app
        .oneshot(authed(
            "POST",
            "/v1/receipts",
            json!({"app_user_id": "u1", "product_id": "pro_monthly", "receipt_data": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["error"], "store_not_configured");
}

#[tokio::test]
async fn subscriber_read_reflects_webhook_mutations() {
    let app = router();

    app.clone()
        .oneshot(authed(
            "POST",
            "/v1/receipts",
            json!({"app_user_id": "u1", "product_id": "pro_monthly", "receipt_data": "x"}),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/v1/webhooks",
            json!({"type": "cancellation", "app_user_id": "u1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    let response = app
        .oneshot(authed("GET", "/v1/subscribers/u1", json!({})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(
        body["subscriber"]["subscriptions"]["pro_monthly"]["is_active"],
        false
    );
}

#[tokio::test]
async fn renewal_webhook_without_product_is_a_client_error() {
    let response = router()
        .oneshot(authed(
            "POST",
            "/v1/webhooks",
            json!({"type": "renewal", "app_user_id": "u1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "missing_product_id");
}

#[tokio::test]
async fn attributes_merge_answers_no_content() {
    let response = router()
        .oneshot(authed(
            "POST",
            "/v1/subscribers/u1/attributes",
            json!({"attributes": {"plan": "pro"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn identify_distinguishes_created_from_existing() {
    let app = router();

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/v1/subscribers/identify",
            json!({"app_user_id": "anon_1", "new_app_user_id": "u42"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["subscriber"]["original_app_user_id"], "u42");

    let response = app
        .oneshot(authed(
            "POST",
            "/v1/subscribers/identify",
            json!({"app_user_id": "anon_2", "new_app_user_id": "u42"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_requires_a_configured_password() {
    let response = router()
        .oneshot(
            Request::builder()
                .uri("/admin/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(response).await["error"],
        "basic_auth_not_configured"
    );
}

#[tokio::test]
async fn admin_basic_auth_accepts_only_the_right_password() {
    let mut config = Config::default();
    config.admin_password = Some("hunter2".to_string().into());
    let app = router_with(config, Arc::new(MockVerifier::accepting()));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/health")
                .header(
                    header::AUTHORIZATION,
                    format!("Basic {}", BASE64_STANDARD.encode("admin:wrong")),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/health")
                .header(
                    header::AUTHORIZATION,
                    format!("Basic {}", BASE64_STANDARD.encode("admin:hunter2")),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
