use futures_util::future::join_all;
use secrecy::SecretString;
use std::time::Duration;
use tuya_scale_client::ScaleError;
use tuya_scale_client::http_client::ReqwestScaleClient;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn token_body(token: &str, expire_time: i64, refresh: &str) -> serde_json::Value {
    serde_json::json!({
        "success": true,
        "t": 1_700_000_000_000i64,
        "result": {
            "access_token": token,
            "expire_time": expire_time,
            "refresh_token": refresh,
            "uid": "bay1700000000000"
        }
    })
}

fn client(server: &MockServer) -> ReqwestScaleClient {
    ReqwestScaleClient::new(&server.uri(), "client-id", SecretString::new("secret".into()))
        .expect("client")
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token"))
        .and(query_param("grant_type", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("tok-1", 7200, "ref-1"))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let tokens = client.tokens();
    let results = join_all((0..16).map(|_| tokens.get_valid_token())).await;

    for result in &results {
        assert_eq!(result.as_ref().expect("token").secret(), "tok-1");
    }
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn token_call_is_signed_without_access_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-1", 7200, "ref-1")))
        .mount(&server)
        .await;

    client(&server).validate_credentials().await.expect("valid");

    let received = server.received_requests().await.unwrap();
    let headers = &received[0].headers;
    assert_eq!(headers.get("client_id").unwrap(), "client-id");
    assert_eq!(headers.get("sign_method").unwrap(), "HMAC-SHA256");
    assert!(headers.get("t").is_some());
    assert!(headers.get("nonce").is_some());
    assert!(headers.get("access_token").is_none());
    let sign = headers.get("sign").unwrap().to_str().unwrap();
    assert_eq!(sign.len(), 64);
    assert!(sign.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
}

#[tokio::test]
async fn fresh_token_is_reused() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-1", 7200, "ref-1")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let first = client.tokens().get_valid_token().await.unwrap();
    let second = client.tokens().get_valid_token().await.unwrap();
    assert_eq!(first.secret(), second.secret());
}

#[tokio::test]
async fn token_inside_margin_is_refreshed_with_refresh_token() {
    let server = MockServer::start().await;
    // 30 s lifetime is already inside the 60 s margin.
    Mock::given(method("GET"))
        .and(path("/v1.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-1", 30, "ref-1")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token/ref-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-2", 7200, "ref-2")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    assert_eq!(client.tokens().get_valid_token().await.unwrap().secret(), "tok-1");
    assert_eq!(client.tokens().get_valid_token().await.unwrap().secret(), "tok-2");
}

#[tokio::test]
async fn rejected_refresh_token_falls_back_to_a_new_grant() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-1", 30, "ref-1")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-3", 7200, "ref-3")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token/ref-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "code": 1010,
            "msg": "token invalid"
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    client.tokens().get_valid_token().await.unwrap();
    let token = client.tokens().get_valid_token().await.unwrap();
    assert_eq!(token.secret(), "tok-3");
}

#[tokio::test]
async fn failed_refresh_reaches_every_waiter_as_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({
                    "success": false,
                    "code": 1100,
                    "msg": "param is empty"
                }))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let tokens = client.tokens();
    let results = join_all((0..4).map(|_| tokens.get_valid_token())).await;
    for result in results {
        assert!(matches!(result, Err(ScaleError::Auth(_))), "{result:?}");
    }
}

#[tokio::test]
async fn rejected_credentials_are_reported_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "code": 1004,
            "msg": "sign invalid"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).validate_credentials().await.unwrap_err();
    assert_eq!(err, ScaleError::InvalidCredentials("sign invalid".into()));
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh_of_an_expiring_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-1", 30, "ref-1")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/token/ref-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("tok-2", 7200, "ref-2"))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let tokens = client.tokens();
    assert_eq!(tokens.get_valid_token().await.unwrap().secret(), "tok-1");

    let results = join_all((0..16).map(|_| tokens.get_valid_token())).await;
    for result in &results {
        assert_eq!(result.as_ref().expect("token").secret(), "tok-2");
    }
    let refreshes = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/v1.0/token/ref-1")
        .count();
    assert_eq!(refreshes, 1);
}
