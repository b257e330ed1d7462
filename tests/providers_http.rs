#![cfg(all(feature = "provider-ideogram", feature = "provider-stripe"))]

use std::time::Duration;

use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use metered_ledger::utils::test_support::loopback_blocked;
use metered_ledger::{
    CreditPlan, GenerationInput, GenerationProvider, IdeogramClient, LedgerError,
    PaymentVerifier, Secret, StripeClient, VerifyError,
};
use serde_json::json;

fn request() -> metered_ledger::GenerationRequest {
    GenerationInput {
        prompt: "neon koi".to_string(),
        aspect_ratio: "ASPECT_16_9".to_string(),
        model: "V_2".to_string(),
        magic_prompt_option: "AUTO".to_string(),
        style: "RENDER_3D".to_string(),
        is_public: false,
    }
    .validate()
    .expect("valid")
}

fn ideogram(server: &MockServer) -> IdeogramClient {
    IdeogramClient::new(Some(Secret::new("ideo-key")), Duration::from_secs(5))
        .expect("client")
        .with_base_url(server.base_url())
}

fn stripe(server: &MockServer) -> StripeClient {
    StripeClient::new(Secret::new("sk_test_123"), Duration::from_secs(5))
        .expect("client")
        .with_base_url(server.base_url())
}

#[tokio::test]
async fn ideogram_sends_wire_names_and_returns_urls() {
    if loopback_blocked() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/generate")
                .header("Api-Key", "ideo-key")
                .json_body(json!({
                    "image_request": {
                        "model": "V_2",
                        "magic_prompt_option": "AUTO",
                        "aspect_ratio": "ASPECT_16_9",
                        "prompt": "neon koi",
                        "style": "RENDER_3D"
                    }
                }));
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "created": "2024-07-01T00:00:00Z",
                    "data": [
                        { "url": "https://ideogram.ai/api/images/a.png", "seed": 1 },
                        { "url": "https://ideogram.ai/api/images/b.png", "seed": 2 }
                    ]
                }));
        })
        .await;

    let items = ideogram(&server)
        .generate(&request())
        .await
        .expect("generate");
    mock.assert_async().await;
    let uris: Vec<_> = items.iter().map(|item| item.uri.as_str()).collect();
    assert_eq!(
        uris,
        vec![
            "https://ideogram.ai/api/images/a.png",
            "https://ideogram.ai/api/images/b.png"
        ]
    );
}

#[tokio::test]
async fn ideogram_error_status_becomes_upstream_error() {
    if loopback_blocked() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/generate");
            then.status(422).body("prompt failed safety check");
        })
        .await;

    let err = ideogram(&server)
        .generate(&request())
        .await
        .expect_err("upstream error");
    assert_eq!(err.status, Some(422));
    assert!(err.message.contains("prompt failed safety check"));

    let ledger_err: LedgerError = err.into();
    assert_eq!(ledger_err.status_code(), 422);
}

#[tokio::test]
async fn ideogram_without_key_fails_before_sending() {
    let client = IdeogramClient::new(None, Duration::from_secs(5)).expect("client");
    let err = client.generate(&request()).await.expect_err("no key");
    assert_eq!(err.status, None);
}

#[tokio::test]
async fn stripe_paid_session_maps_to_completed_status() {
    if loopback_blocked() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/checkout/sessions/cs_test_paid")
                .header("authorization", "Bearer sk_test_123");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "cs_test_paid",
                    "object": "checkout.session",
                    "payment_status": "paid",
                    "client_reference_id": "alice@example.com",
                    "amount_total": 2999,
                    "metadata": { "credits": "310", "plan": "premiere" }
                }));
        })
        .await;

    let status = stripe(&server)
        .verify_payment("cs_test_paid")
        .await
        .expect("verify");
    mock.assert_async().await;
    assert!(status.completed);
    assert_eq!(status.account_id.as_deref(), Some("alice@example.com"));
    assert_eq!(status.amount, 2999);
    assert_eq!(status.credits, 310);
}

#[tokio::test]
async fn stripe_unpaid_and_missing_sessions() {
    if loopback_blocked() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/checkout/sessions/cs_test_open");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "cs_test_open",
                    "payment_status": "unpaid",
                    "client_reference_id": "bob",
                    "metadata": {}
                }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/checkout/sessions/cs_test_gone");
            then.status(404)
                .json_body(json!({ "error": { "code": "resource_missing" } }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/checkout/sessions/cs_test_down");
            then.status(503).body("maintenance");
        })
        .await;

    let client = stripe(&server);
    let open = client.verify_payment("cs_test_open").await.expect("open");
    assert!(!open.completed);
    assert_eq!(open.credits, 0);

    let gone = client.verify_payment("cs_test_gone").await;
    assert!(matches!(gone, Err(VerifyError::InvalidReference(_))));

    let down = client.verify_payment("cs_test_down").await;
    assert!(matches!(down, Err(VerifyError::Transport(_))));
}

#[tokio::test]
async fn stripe_checkout_session_carries_plan_metadata() {
    if loopback_blocked() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/checkout/sessions")
                .header("authorization", "Bearer sk_test_123")
                .form_urlencoded_tuple("mode", "payment")
                .form_urlencoded_tuple("client_reference_id", "carol")
                .form_urlencoded_tuple("metadata[credits]", "100")
                .form_urlencoded_tuple("metadata[plan]", "pro")
                .form_urlencoded_tuple("line_items[0][price_data][unit_amount]", "999");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "cs_test_new",
                    "url": "https://checkout.stripe.com/c/pay/cs_test_new"
                }));
        })
        .await;

    let session = stripe(&server)
        .create_checkout_session(
            &CreditPlan::new("pro", 999, 100),
            "carol",
            "https://app.example/payment-success?session_id={CHECKOUT_SESSION_ID}",
            "https://app.example/pricing",
        )
        .await
        .expect("checkout");
    mock.assert_async().await;
    assert_eq!(session.id, "cs_test_new");
    assert_eq!(
        session.url.as_deref(),
        Some("https://checkout.stripe.com/c/pay/cs_test_new")
    );
}
