//! End-to-end exercises of the HTTP surface against a mock sink.

mod common;

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt as _;

use crate::common::{app_state, spawn_sink};

fn post(uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(token) = token {
        builder = builder.header("X-Warp10-Token", token);
    }
    builder.body(Body::from(body.to_owned())).expect("request")
}

#[tokio::test]
async fn graphite_http_line_reaches_the_sink() {
    let (sink, mut hits) = spawn_sink(StatusCode::OK, "").await;
    let app = catalyst::make_http_service(app_state(sink));

    let response = app
        .oneshot(post("/graphite/api/v1/sink", Some("tkn"), "cpu.load 0.5 1700000000\n"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);

    let hit = hits.recv().await.expect("sink hit");
    assert_eq!(hit.token, "tkn");
    assert!(!hit.txn.is_empty());
    assert!(hit.body.starts_with("#\r\n"), "missing priming bytes: {}", hit.body);
    assert!(
        hit.body.contains("1700000000000000// cpu.load{0=cpu,1=load} 0.500000\r\n"),
        "unexpected sink body: {}",
        hit.body
    );
}

#[tokio::test]
async fn opentsdb_array_is_normalized() {
    let (sink, mut hits) = spawn_sink(StatusCode::OK, "").await;
    let app = catalyst::make_http_service(app_state(sink));

    let body = r#"[{"metric":"m","timestamp":1700000000,"value":7,"tags":{"h":"x"}},{"metric":"n","timestamp":1700000000000,"value":1.5,"tags":{}}]"#;
    let response = app
        .oneshot(post("/opentsdb", Some("tkn"), body))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let hit = hits.recv().await.expect("sink hit");
    assert!(hit.body.contains("1700000000000000// m{h=x} 7\r\n"));
    assert!(hit.body.contains("1700000000000000// n{} 1.500000\r\n"));
}

#[tokio::test]
async fn influxdb_fields_fan_out() {
    let (sink, mut hits) = spawn_sink(StatusCode::OK, "").await;
    let app = catalyst::make_http_service(app_state(sink));

    let response = app
        .oneshot(post(
            "/influxdb/write?precision=ms",
            Some("tkn"),
            "w,loc=us t=82,b=98 1465839830100\n",
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let hit = hits.recv().await.expect("sink hit");
    assert!(hit.body.contains("1465839830100000// w.t{loc=us} 82.000000\r\n"));
    assert!(hit.body.contains("1465839830100000// w.b{loc=us} 98.000000\r\n"));
}

#[tokio::test]
async fn sink_invalid_token_banishes_and_slow_rejects() {
    let (sink, _hits) = spawn_sink(
        StatusCode::INTERNAL_SERVER_ERROR,
        "io.warp10.script.WarpScriptException: Invalid token",
    )
    .await;
    let app = catalyst::make_http_service(app_state(sink));

    let response = app
        .clone()
        .oneshot(post("/graphite/api/v1/sink", Some("bad-token-e2e"), "cpu.load 1 1700\n"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(catalyst::token::is_banned("bad-token-e2e"));

    // once banned, the middleware answers 401 after the configured delay
    let started = Instant::now();
    let response = app
        .oneshot(post("/graphite/api/v1/sink", Some("bad-token-e2e"), "cpu.load 1 1700\n"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn missing_credentials_are_rejected_without_touching_the_sink() {
    let (sink, mut hits) = spawn_sink(StatusCode::OK, "").await;
    let app = catalyst::make_http_service(app_state(sink));

    let response = app
        .oneshot(post("/opentsdb", None, "{}"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(hits.try_recv().is_err());
}

#[tokio::test]
async fn prometheus_odd_label_path_is_a_bad_request() {
    let (sink, _hits) = spawn_sink(StatusCode::OK, "").await;
    let app = catalyst::make_http_service(app_state(sink));

    let response = app
        .oneshot(post("/prometheus/only-a-key", Some("tkn"), "up 1\n"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn influx_parse_failures_answer_json() {
    let (sink, _hits) = spawn_sink(StatusCode::OK, "").await;
    let app = catalyst::make_http_service(app_state(sink));

    let response = app
        .oneshot(post("/influxdb/write", Some("tkn"), "broken\n"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let body = String::from_utf8_lossy(&body);
    assert!(body.starts_with("{\"error\":"), "unexpected body: {body}");
}

#[tokio::test]
async fn influx_ping_advertises_the_supported_version() {
    let (sink, _hits) = spawn_sink(StatusCode::OK, "").await;
    let app = catalyst::make_http_service(app_state(sink));

    let request = Request::builder()
        .method("GET")
        .uri("/influxdb/ping")
        .header("X-Warp10-Token", "tkn")
        .body(Body::empty())
        .expect("request");

    let response = app.oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("X-Influxdb-Version")
            .and_then(|value| value.to_str().ok()),
        Some("1.4.x")
    );
}

#[tokio::test]
async fn unknown_methods_are_rejected() {
    let (sink, _hits) = spawn_sink(StatusCode::OK, "").await;
    let app = catalyst::make_http_service(app_state(sink));

    let request = Request::builder()
        .method("GET")
        .uri("/opentsdb")
        .header("X-Warp10-Token", "tkn")
        .body(Body::empty())
        .expect("request");

    let response = app.oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn gzipped_bodies_are_transparently_decoded() {
    use async_compression::tokio::bufread::GzipEncoder;
    use tokio::io::AsyncReadExt as _;

    let mut encoder = GzipEncoder::new(&b"cpu.load 0.5 1700000000\n"[..]);
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed).await.expect("compress");

    let (sink, mut hits) = spawn_sink(StatusCode::OK, "").await;
    let app = catalyst::make_http_service(app_state(sink));

    let request = Request::builder()
        .method("POST")
        .uri("/graphite/api/v1/sink")
        .header("X-Warp10-Token", "tkn")
        .header("Content-Encoding", "gzip")
        .body(Body::from(compressed))
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let hit = hits.recv().await.expect("sink hit");
    assert!(hit.body.contains("1700000000000000// cpu.load{0=cpu,1=load} 0.500000\r\n"));
}

#[tokio::test]
async fn warp_passthrough_forwards_raw_lines() {
    let (sink, mut hits) = spawn_sink(StatusCode::OK, "").await;
    let app = catalyst::make_http_service(app_state(sink));

    let response = app
        .oneshot(post(
            "/warp/api/v0/update",
            Some("tkn"),
            "1700000000000000// m{} 1\n1700000000000001// m{} 2\n",
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);

    let hit = hits.recv().await.expect("sink hit");
    assert!(hit.body.contains("1700000000000000// m{} 1\r\n1700000000000001// m{} 2\r\n"));
}
