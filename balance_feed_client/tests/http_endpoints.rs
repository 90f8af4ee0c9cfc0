//! The HTTP side of the client: token refresh and hub negotiation, against a mock server.
use balance_feed_client::{hub::negotiate::negotiate, HttpTokenRefresher};
use balance_feed_engine::{test_utils::prepare_test_env, RefreshError, TokenPair, TokenRefresher, TransportError};
use bf_common::Secret;
use reqwest::Client;
use serde_json::json;
use url::Url;
use wiremock::{
    matchers::{body_json, header, method, path, query_param},
    Mock,
    MockServer,
    ResponseTemplate,
};

async fn refresher(server: &MockServer) -> HttpTokenRefresher {
    prepare_test_env();
    let url = Url::parse(&format!("{}/auth/refresh", server.uri())).unwrap();
    HttpTokenRefresher::new(url).unwrap()
}

async fn mount_refresh_response(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST")).and(path("/auth/refresh")).respond_with(response).mount(server).await;
}

#[tokio::test]
async fn refresh_posts_the_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(header("accept", "application/json"))
        .and(body_json(json!({"refreshToken": "r0"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "a1", "refreshToken": "r1"})))
        .expect(1)
        .mount(&server)
        .await;
    let pair = refresher(&server).await.refresh("r0").await.unwrap();
    assert_eq!(pair, TokenPair::new("a1", "r1"));
}

#[tokio::test]
async fn refresh_accepts_other_response_shapes() {
    let server = MockServer::start().await;
    mount_refresh_response(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({"access_token": "a2", "refresh_token": "r2"})),
    )
    .await;
    let pair = refresher(&server).await.refresh("r1").await.unwrap();
    assert_eq!(pair, TokenPair::new("a2", "r2"));

    let server = MockServer::start().await;
    mount_refresh_response(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({"data": {"accessToken": "a3", "refreshToken": "r3"}})),
    )
    .await;
    let pair = refresher(&server).await.refresh("r2").await.unwrap();
    assert_eq!(pair, TokenPair::new("a3", "r3"));
}

#[tokio::test]
async fn rejected_refresh_tokens() {
    for status in [400, 401, 403] {
        let server = MockServer::start().await;
        mount_refresh_response(&server, ResponseTemplate::new(status).set_body_string("token expired")).await;
        let err = refresher(&server).await.refresh("r0").await.unwrap_err();
        assert!(matches!(err, RefreshError::Rejected(ref msg) if msg.contains("token expired")), "{status}: {err:?}");
    }
}

#[tokio::test]
async fn server_errors_are_network_failures() {
    let server = MockServer::start().await;
    mount_refresh_response(&server, ResponseTemplate::new(503)).await;
    let err = refresher(&server).await.refresh("r0").await.unwrap_err();
    assert!(matches!(err, RefreshError::Network(_)), "{err:?}");
}

#[tokio::test]
async fn garbage_refresh_response() {
    let server = MockServer::start().await;
    mount_refresh_response(&server, ResponseTemplate::new(200).set_body_string("<html>maintenance</html>")).await;
    let err = refresher(&server).await.refresh("r0").await.unwrap_err();
    assert!(matches!(err, RefreshError::InvalidResponse(_)), "{err:?}");

    let server = MockServer::start().await;
    mount_refresh_response(&server, ResponseTemplate::new(200).set_body_json(json!({"accessToken": "a1"}))).await;
    let err = refresher(&server).await.refresh("r0").await.unwrap_err();
    assert!(matches!(err, RefreshError::InvalidResponse(_)), "{err:?}");
}

fn hub_url(server: &MockServer, hub: &str) -> Url {
    Url::parse(&format!("{}{hub}", server.uri())).unwrap()
}

#[tokio::test]
async fn negotiate_returns_the_connection_token() {
    prepare_test_env();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hubs/balance/negotiate"))
        .and(query_param("negotiateVersion", "1"))
        .and(header("authorization", "Bearer access-0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "negotiateVersion": 1,
            "connectionId": "conn-1",
            "connectionToken": "token-1",
            "availableTransports": [{"transport": "WebSockets", "transferFormats": ["Text", "Binary"]}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    let url = hub_url(&server, "/hubs/balance");
    let negotiated = negotiate(&Client::new(), &url, Secret::from("access-0")).await.unwrap();
    assert_eq!(negotiated.url, url);
    assert_eq!(negotiated.connection_token.as_deref(), Some("token-1"));
    assert_eq!(negotiated.access_token.reveal(), "access-0");
}

#[tokio::test]
async fn negotiate_follows_one_redirect() {
    prepare_test_env();
    let server = MockServer::start().await;
    let redirected = hub_url(&server, "/service/client");
    Mock::given(method("POST"))
        .and(path("/hubs/balance/negotiate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"url": redirected.as_str(), "accessToken": "service-token"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/service/client/negotiate"))
        .and(header("authorization", "Bearer service-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"connectionId": "conn-2"})))
        .expect(1)
        .mount(&server)
        .await;
    let url = hub_url(&server, "/hubs/balance");
    let negotiated = negotiate(&Client::new(), &url, Secret::from("access-0")).await.unwrap();
    assert_eq!(negotiated.url, redirected);
    assert_eq!(negotiated.connection_token.as_deref(), Some("conn-2"));
    assert_eq!(negotiated.access_token.reveal(), "service-token");
}

#[tokio::test]
async fn negotiate_refuses_a_second_redirect() {
    prepare_test_env();
    let server = MockServer::start().await;
    let loop_url = hub_url(&server, "/hubs/balance");
    Mock::given(method("POST"))
        .and(path("/hubs/balance/negotiate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"url": loop_url.as_str()})))
        .expect(2)
        .mount(&server)
        .await;
    let err = negotiate(&Client::new(), &loop_url, Secret::from("access-0")).await.unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)), "{err:?}");
}

#[tokio::test]
async fn negotiate_maps_auth_failures() {
    prepare_test_env();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hubs/balance/negotiate"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let url = hub_url(&server, "/hubs/balance");
    let err = negotiate(&Client::new(), &url, Secret::from("stale")).await.unwrap_err();
    assert_eq!(err, TransportError::Unauthorized(401));
    assert!(err.is_auth_error());
}

#[tokio::test]
async fn negotiate_reports_server_errors() {
    prepare_test_env();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hubs/balance/negotiate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "Hub is at capacity"})))
        .mount(&server)
        .await;
    let url = hub_url(&server, "/hubs/balance");
    let err = negotiate(&Client::new(), &url, Secret::from("access-0")).await.unwrap_err();
    assert!(matches!(err, TransportError::Protocol(ref msg) if msg.contains("capacity")), "{err:?}");
}
