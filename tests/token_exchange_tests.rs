//! Service-account token exchange against a mocked OAuth2 endpoint.

use std::sync::Arc;
use std::time::Duration;

use httpmock::Method::POST;
use httpmock::MockServer;

use vertex_relay::auth::cache::{ServiceAccountFetcher, TokenCache, TokenFetcher};
use vertex_relay::auth::exchange::TokenExchanger;
use vertex_relay::auth::signer::CredentialSigner;
use vertex_relay::auth::AuthError;
use vertex_relay::metrics::Metrics;

const PRIVATE_KEY: &str = include_str!("fixtures/service_account_key_pkcs8.pem");
const ENCODED_GRANT: &str = "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer";

fn exchanger(server: &MockServer) -> TokenExchanger {
    TokenExchanger::new(reqwest::Client::new(), server.url("/token"))
}

#[tokio::test]
async fn test_exchange_success() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .body_contains(ENCODED_GRANT)
                .body_contains("assertion=header.claims.sig");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"ya29.abc","expires_in":1800,"token_type":"Bearer"}"#);
        })
        .await;

    let token = exchanger(&server)
        .exchange("header.claims.sig")
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(token.secret(), "ya29.abc");
    assert!(token.remaining() <= Duration::from_secs(1800));
    assert!(token.remaining() > Duration::from_secs(1700));
}

#[tokio::test]
async fn test_missing_expiry_defaults_to_one_hour() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/token");
            then.status(200).body(r#"{"access_token":"ya29.abc"}"#);
        })
        .await;

    let token = exchanger(&server).exchange("a.b.c").await.unwrap();
    assert!(token.remaining() > Duration::from_secs(3500));
}

#[tokio::test]
async fn test_rejected_exchange_carries_status_and_body() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/token");
            then.status(400)
                .body(r#"{"error":"invalid_grant","error_description":"Invalid JWT Signature."}"#);
        })
        .await;

    match exchanger(&server).exchange("a.b.c").await {
        Err(AuthError::TokenExchange { status, body }) => {
            assert_eq!(status, 400);
            assert!(body.contains("invalid_grant"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_responses() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/not-json");
            then.status(200).body("<html>oops</html>");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/no-field");
            then.status(200).body(r#"{"token_type":"Bearer"}"#);
        })
        .await;

    for path in ["/not-json", "/no-field"] {
        let exchanger = TokenExchanger::new(reqwest::Client::new(), server.url(path));
        assert!(matches!(
            exchanger.exchange("a.b.c").await,
            Err(AuthError::MalformedResponse(_))
        ));
    }
}

#[tokio::test]
async fn test_transport_failure() {
    let exchanger = TokenExchanger::new(reqwest::Client::new(), "http://127.0.0.1:1/token");
    assert!(matches!(
        exchanger.exchange("a.b.c").await,
        Err(AuthError::Transport(_))
    ));
}

#[tokio::test]
async fn test_service_account_fetch_populates_cache() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains(ENCODED_GRANT)
                .body_contains("assertion=eyJ");
            then.status(200)
                .body(r#"{"access_token":"ya29.fresh","expires_in":3599}"#);
        })
        .await;

    let token_url = server.url("/token");
    let signer = CredentialSigner::new(
        "relay@proj.iam.gserviceaccount.com",
        PRIVATE_KEY,
        "kid-1",
        &token_url,
    )
    .unwrap();
    let exchanger = TokenExchanger::new(reqwest::Client::new(), token_url);
    let fetcher = ServiceAccountFetcher::new(signer, exchanger);

    let token = fetcher.fetch().await.unwrap();
    assert_eq!(token.secret(), "ya29.fresh");

    let metrics = Metrics::new().unwrap();
    let cache = TokenCache::initialize(
        Arc::new(fetcher),
        Duration::from_secs(300),
        Some(metrics.clone()),
    )
    .await
    .unwrap();
    assert_eq!(cache.bearer().await.unwrap(), "ya29.fresh");

    assert_eq!(mock.hits_async().await, 2);
    assert!(metrics
        .encode()
        .unwrap()
        .contains(r#"relay_token_fetches_total{result="ok"} 1"#));
}
