//! HTTP surface tests: auth, health, index page and event streaming.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use axum_test::TestServer;
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use syncdb_core::{Hub, HubConfig, HubHandle};
use syncdb_proto::{payload_from_value, Notification, Operation, Source};
use syncdb_server::{
    auth::encode_basic, create_router, state::AppState, Credentials, ServerConfig,
    SourceRegistry,
};

struct TestContext {
    hub: HubHandle,
    app: Router,
    _index_dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        let index_dir = tempfile::tempdir().unwrap();
        let index_file = index_dir.path().join("index.html");
        std::fs::write(&index_file, "<html><body>syncdb</body></html>").unwrap();

        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.index_file = index_file;
        config.credentials = Credentials {
            user: "ops".to_string(),
            password: "s3cret".to_string(),
        };

        let (hub, _task) = Hub::start(HubConfig::default());
        let state = AppState::new(hub.clone(), Arc::new(SourceRegistry::new()), &config);

        Self {
            hub,
            app: create_router(state),
            _index_dir: index_dir,
        }
    }

    async fn wait_for_subscribers(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.hub.stats().subscribers() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count never reached");
    }

    fn stream_request(&self, authorization: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().uri("/stream");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }
}

fn order_update() -> Notification {
    Notification::new(
        Source::Relational,
        "orders",
        Operation::Update,
        payload_from_value(json!({"id": 5, "status": "shipped"})).unwrap(),
    )
}

#[tokio::test]
async fn test_health_reports_hub_counters() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.app.clone()).unwrap();

    let response = server.get("/health").await;
    response.assert_status(StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["hub"]["subscribers"], 0);
    assert_eq!(body["hub"]["published"], 0);
    assert_eq!(body["sources"], json!([]));
}

#[tokio::test]
async fn test_index_page_is_served() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.app.clone()).unwrap();

    let response = server.get("/").await;
    response.assert_status(StatusCode::OK);
    assert!(response.text().contains("syncdb"));
}

#[tokio::test]
async fn test_stream_requires_credentials() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.app.clone()).unwrap();

    let response = server.get("/stream").await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    let challenge = response.header(header::WWW_AUTHENTICATE);
    assert!(challenge.to_str().unwrap().starts_with("Basic realm="));

    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    assert_eq!(ctx.hub.stats().subscribers(), 0);
}

#[tokio::test]
async fn test_stream_rejects_wrong_password() {
    let ctx = TestContext::new();

    let response = ctx
        .app
        .clone()
        .oneshot(ctx.stream_request(Some(encode_basic("ops", "wrong"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Default credentials are not accepted once others are configured.
    let response = ctx
        .app
        .clone()
        .oneshot(ctx.stream_request(Some(encode_basic("admin", "admin"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_stream_delivers_message_events() {
    let ctx = TestContext::new();

    let response = ctx
        .app
        .clone()
        .oneshot(ctx.stream_request(Some(encode_basic("ops", "s3cret"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers[header::CONNECTION], "keep-alive");

    ctx.wait_for_subscribers(1).await;
    ctx.hub.publish(order_update()).await.unwrap();

    let mut body = response.into_body().into_data_stream();
    let mut text = String::new();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !text.contains("\n\n") {
            let chunk = body.next().await.expect("stream ended").unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .expect("no event received");

    assert!(text.contains("event: message\n"));
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .expect("no data line");
    let frame: Value = serde_json::from_str(data).unwrap();
    assert_eq!(frame["source"], "relational");
    assert_eq!(frame["collection"], "orders");
    assert_eq!(frame["operation"], "update");
    assert_eq!(frame["payload"]["id"], 5);
    assert_eq!(frame["payload"]["status"], "shipped");

    // Closing the connection releases the session.
    drop(body);
    ctx.wait_for_subscribers(0).await;
}

#[tokio::test]
async fn test_each_connection_gets_every_event() {
    let ctx = TestContext::new();
    let credentials = encode_basic("ops", "s3cret");

    let mut bodies = Vec::new();
    for _ in 0..3 {
        let response = ctx
            .app
            .clone()
            .oneshot(ctx.stream_request(Some(credentials.clone())))
            .await
            .unwrap();
        bodies.push(response.into_body().into_data_stream());
    }
    ctx.wait_for_subscribers(3).await;

    ctx.hub.publish(order_update()).await.unwrap();

    for body in &mut bodies {
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&chunk).contains("\"collection\":\"orders\""));
    }
}
