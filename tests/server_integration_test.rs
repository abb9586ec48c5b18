// ABOUTME: Integration tests for the HTTP router against a live PostgreSQL database
// ABOUTME: Covers GET array framing, empty reads and POST batches end to end

use std::env;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::json;
use sql_entity_bridge::server::{router, DEFAULT_MAX_BODY_BYTES};
use sql_entity_bridge::{BridgeConfig, Registry};
use tower::ServiceExt;

/// Helper to get the test database URL from the environment
fn get_test_url() -> String {
    env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set")
}

/// Create a unique test table name to avoid conflicts
fn test_table_name(prefix: &str) -> String {
    format!("server_{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, Option<String>, String) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_read_and_write_over_http() {
    let table = test_table_name("widgets");
    let config = BridgeConfig::from_json_str(
        &json!({"test": {
            "url": get_test_url(),
            "max-connections": 2,
            "sources": {"widgets": {"table": table, "primary-key": "id", "updated-column": "updated_at"}},
            "sinks": {"widgets": {"table": table}}
        }})
        .to_string(),
    )
    .expect("invalid test configuration");

    let setup = sql_entity_bridge::postgres::build_pool("setup", &config.systems["test"]).unwrap();
    setup
        .get()
        .await
        .unwrap()
        .batch_execute(&format!(
            r#"CREATE TABLE "public"."{table}" (id INTEGER PRIMARY KEY, color TEXT, updated_at DATE NOT NULL);
               INSERT INTO "public"."{table}" VALUES (1, 'red', '2023-12-31'), (2, 'blue', '2024-01-02')"#
        ))
        .await
        .expect("Failed to create test table");

    let registry = Arc::new(Registry::configure(&config).await.unwrap());
    let app = router(registry.clone(), DEFAULT_MAX_BODY_BYTES);

    let (status, content_type, body) = send(&app, "GET", "/test/widgets", "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.is_some_and(|c| c.starts_with("application/json")));
    assert_eq!(
        body,
        concat!(
            r#"[{"id":1,"color":"red","updated_at":"~t2023-12-31","_id":"1","_updated":"2023-12-31"},"#,
            r#"{"id":2,"color":"blue","updated_at":"~t2024-01-02","_id":"2","_updated":"2024-01-02"}]"#
        )
    );

    // Nothing newer than the cursor is still a well-formed array
    let (status, _, body) = send(&app, "GET", "/test/widgets?since=2024-01-02", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "[]");

    let (status, _, body) = send(
        &app,
        "POST",
        "/test/widgets",
        r#"[{"id": 3, "color": "green", "updated_at": "~t2024-03-01"}, {"id": 1, "_deleted": true}]"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    let (_, _, body) = send(&app, "GET", "/test/widgets?since=2024-01-02", "").await;
    assert_eq!(
        body,
        r#"[{"id":3,"color":"green","updated_at":"~t2024-03-01","_id":"3","_updated":"2024-03-01"}]"#
    );
    let (_, _, body) = send(&app, "GET", "/test/widgets", "").await;
    assert!(!body.contains(r#""_id":"1""#));

    registry.close();
    let _ = setup
        .get()
        .await
        .unwrap()
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#, table))
        .await;
}
