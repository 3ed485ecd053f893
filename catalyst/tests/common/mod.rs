#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::routing::post;
use catalyst::AppState;
use catalyst::config::{Conf, ConnectionConf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// What the mock sink observed for one update session.
pub struct SinkHit {
    pub token: String,
    pub txn: String,
    pub body: String,
}

#[derive(Clone)]
struct SinkState {
    tx: mpsc::UnboundedSender<SinkHit>,
    status: StatusCode,
    body: &'static str,
}

async fn update(State(state): State<SinkState>, request: Request) -> (StatusCode, &'static str) {
    let (token, txn) = {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned()
        };
        (header("X-Warp10-Token"), header("Txn"))
    };

    let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    let _ = state.tx.send(SinkHit {
        token,
        txn,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    });

    (state.status, state.body)
}

/// Mock sink answering every `/api/v0/update` with the given status and
/// body, reporting each observed session on the returned channel.
pub async fn spawn_sink(status: StatusCode, body: &'static str) -> (SocketAddr, mpsc::UnboundedReceiver<SinkHit>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let app = Router::new()
        .route("/api/v0/update", post(update))
        .with_state(SinkState { tx, status, body });

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock sink");
    let addr = listener.local_addr().expect("mock sink address");

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (addr, rx)
}

pub fn test_conf(sink: SocketAddr) -> Conf {
    Conf {
        listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        metrics_listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        warp_endpoint: format!("http://{sink}").parse().expect("sink url"),
        warp_endpoint_delete: format!("http://{sink}").parse().expect("sink url"),
        connection: ConnectionConf {
            timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(1),
            tls_timeout: Duration::from_secs(1),
            keep_alive_timeout: Duration::from_secs(5),
            idle_max: 10,
        },
        bannishment_duration: Duration::from_millis(100),
        graphite_listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        graphite_parse: true,
        dryrun: false,
        hostname: "test-host".to_owned(),
        log_directive: None,
    }
}

pub fn app_state(sink: SocketAddr) -> AppState {
    AppState::new(Arc::new(test_conf(sink))).expect("app state")
}
