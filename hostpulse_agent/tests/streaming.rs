//! End-to-end: live frames over WebSocket, history and cleanup over HTTP.
//! Runs the real router on an ephemeral port with a scripted metrics source.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use hostpulse_agent::config::IntervalBounds;
use hostpulse_agent::error::AcquisitionError;
use hostpulse_agent::sampler::{MetricsSource, RawReading, Sampler};
use hostpulse_agent::session::SessionManager;
use hostpulse_agent::store::Store;
use hostpulse_agent::{serve, AppState};
use reqwest::Method;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message};

struct FixedLoad {
    calls: AtomicUsize,
}

impl MetricsSource for FixedLoad {
    fn acquire(&self) -> Result<RawReading, AcquisitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RawReading {
            cpu_brand: Some("Test CPU".into()),
            cpu_total_load: Some(42.5),
            per_core_load: vec![Some(40.0), Some(45.0)],
            mem_used: Some(1.0),
            mem_total: Some(4.0),
            ..Default::default()
        })
    }
}

struct Agent {
    addr: SocketAddr,
    sessions: SessionManager,
    stop: Option<oneshot::Sender<()>>,
    _dir: tempfile::TempDir,
}

async fn start_agent() -> Agent {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().join("metrics.db")).await.expect("store");
    let sampler = Sampler::new(FixedLoad {
        calls: AtomicUsize::new(0),
    });
    let sessions = SessionManager::new(sampler, store.clone(), IntervalBounds::new(10, 1_000, 20));
    let state = AppState::new(sessions.clone(), store);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(serve(listener, state, async move {
        let _ = stopped.await;
    }));
    Agent {
        addr,
        sessions,
        stop: Some(stop),
        _dir: dir,
    }
}

async fn http(addr: SocketAddr, method: Method, path: &str) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .request(method, format!("http://{addr}{path}"))
        .send()
        .await
        .expect("http request");
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("ws message");
        if let Message::Text(t) = msg {
            return serde_json::from_str(&t).expect("json frame");
        }
    }
}

async fn wait_for_clients(addr: SocketAddr, want: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, body) = http(addr, Method::GET, "/health").await;
        assert_eq!(status, 200);
        if body["clients"].as_u64() == Some(want) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "clients never reached {want}: {body}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn stream_persist_and_query_history() {
    let mut agent = start_agent().await;
    let url = format!("ws://{}/ws?interval=20", agent.addr);
    let (mut ws, _) = connect_async(url.as_str()).await.expect("ws connect");

    for expected_seq in 0..3u64 {
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "metrics");
        assert_eq!(frame["version"], 1);
        assert_eq!(frame["seq"], expected_seq);
        assert!(frame["timestamp"].as_i64().unwrap() > 0);
        assert_eq!(frame["data"]["cpu"]["loadPercent"], 42.5);
        assert_eq!(frame["data"]["cpu"]["info"]["brand"], "Test CPU");
        assert_eq!(frame["data"]["cpu"]["perCore"][1]["loadPercent"], 45.0);
        assert_eq!(frame["data"]["memory"]["usagePercent"], 25.0);
        assert_eq!(frame["data"]["sensors"]["fans"][0]["rpm"], 0.0);
    }

    wait_for_clients(agent.addr, 1).await;
    ws.close(None).await.expect("close");
    drop(ws);
    wait_for_clients(agent.addr, 0).await;

    let (status, body) = http(agent.addr, Method::GET, "/history?since=0&column=cpu_load&limit=2000").await;
    assert_eq!(status, 200);
    let points = body.as_array().expect("array of points");
    assert!(points.len() >= 3, "expected persisted rows, got {body}");
    assert!(points.iter().all(|p| p["value"] == 42.5));
    let ts: Vec<i64> = points.iter().map(|p| p["timestamp"].as_i64().unwrap()).collect();
    assert!(ts.windows(2).all(|w| w[0] <= w[1]));

    let (status, body) = http(agent.addr, Method::GET, "/history?since=0&limit=1&metric=memUsage").await;
    assert_eq!(status, 200);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["value"], 25.0);

    let (status, body) = http(agent.addr, Method::GET, "/history?column=drop%20table").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Invalid column parameter");
    assert_eq!(body["allowedColumns"].as_array().unwrap().len(), 11);

    let (status, _) = http(agent.addr, Method::GET, "/history?since=5000&until=1000").await;
    assert_eq!(status, 400);

    // a slightly future `since` is an empty window, not an error
    let future = hostpulse_agent::types::now_ms() + 60_000;
    let (status, body) = http(agent.addr, Method::GET, &format!("/history?since={future}")).await;
    assert_eq!(status, 200);
    assert_eq!(body, Value::Array(vec![]));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let (status, body) = http(agent.addr, Method::DELETE, "/metrics?maxAge=1").await;
    assert_eq!(status, 200);
    // a tick already in flight at close may land one more row
    assert!(body["deleted"].as_u64().unwrap() >= points.len() as u64);
    assert!(body["before"].as_str().unwrap().ends_with('Z'));
    assert!(body["beforeMs"].as_i64().unwrap() > 0);

    let (_, body) = http(agent.addr, Method::GET, "/history?since=0").await;
    assert_eq!(body, Value::Array(vec![]));

    let (status, body) = http(agent.addr, Method::GET, "/nope").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "Endpoint not found");

    let _ = agent.stop.take().map(|s| s.send(()));
}

#[tokio::test]
async fn shutdown_closes_live_streams_and_refuses_new_ones() {
    let mut agent = start_agent().await;
    let url = format!("ws://{}/ws?interval=20&persist=0", agent.addr);
    let (mut ws, _) = connect_async(url.as_str()).await.expect("ws connect");
    assert_eq!(next_json(&mut ws).await["type"], "metrics");

    agent.sessions.shutdown(Duration::from_secs(2)).await;

    // the server sends Close (or just drops); either way the stream ends
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "stream did not end after shutdown");

    assert!(connect_async(url.as_str()).await.is_err());
    let (_, body) = http(agent.addr, Method::GET, "/health").await;
    assert_eq!(body["clients"], 0);
    assert_eq!(body["status"], "OK");

    let _ = agent.stop.take().map(|s| s.send(()));
}
