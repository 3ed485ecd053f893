//! The Graphite TCP intake against a mock sink.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use catalyst::graphite::GraphiteListener;
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;

use crate::common::{app_state, spawn_sink};

async fn start_listener(sink: std::net::SocketAddr, parse: bool) -> std::net::SocketAddr {
    let state = app_state(sink);
    let listener = GraphiteListener::bind("127.0.0.1:0".parse().expect("addr"), parse, state.warp.clone())
        .await
        .expect("bind graphite listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(listener.run());
    addr
}

#[tokio::test]
async fn the_first_line_carries_the_token_and_a_metric() {
    let (sink, mut hits) = spawn_sink(StatusCode::OK, "").await;
    let addr = start_listener(sink, true).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"secret@.cpu.load 1 1700\nsecret@.mem.used 2 1700\n")
        .await
        .expect("write");
    stream.shutdown().await.expect("shutdown");

    let hit = tokio::time::timeout(Duration::from_secs(5), hits.recv())
        .await
        .expect("sink hit in time")
        .expect("sink hit");

    assert_eq!(hit.token, "secret");
    assert!(hit.body.starts_with("#\r\n"));
    assert!(
        hit.body.contains("1700000000// cpu.load{0=cpu,1=load} 1\r\n"),
        "unexpected sink body: {}",
        hit.body
    );
    assert!(hit.body.contains("1700000000// mem.used{0=mem,1=used} 2\r\n"));
}

#[tokio::test]
async fn lines_not_matching_the_token_prefix_length_are_skipped() {
    let (sink, mut hits) = spawn_sink(StatusCode::OK, "").await;
    let addr = start_listener(sink, false).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    // second line is shorter than the token prefix, third is unparsable
    stream
        .write_all(b"secret@.cpu.load 1 1700\nshort\nsecret@.not enough parts here no ts\nsecret@.ok 2 1700\n")
        .await
        .expect("write");
    stream.shutdown().await.expect("shutdown");

    let hit = tokio::time::timeout(Duration::from_secs(5), hits.recv())
        .await
        .expect("sink hit in time")
        .expect("sink hit");

    assert!(hit.body.contains("1700000000// cpu.load{} 1\r\n"));
    assert!(hit.body.contains("1700000000// ok{} 2\r\n"));
    assert!(!hit.body.contains("short"));
}

#[tokio::test]
async fn connections_without_a_token_are_dropped_before_the_sink() {
    let (sink, mut hits) = spawn_sink(StatusCode::OK, "").await;
    let addr = start_listener(sink, true).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(b"cpu.load 1 1700\n").await.expect("write");
    stream.shutdown().await.expect("shutdown");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(hits.try_recv().is_err());
}
