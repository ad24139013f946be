use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use rehab_coach::api::{ApiConfig, ApiHandle, ApiServer, REQUEST_READ_TIMEOUT};
use rehab_coach::frame::LatestFrame;
use rehab_coach::storage::{shared, InMemoryMetricStore, NewMetric, SharedStore};
use rehab_coach::{CoachState, SessionConfig, TaskRegistry};

fn start() -> (ApiHandle, Arc<CoachState>, SharedStore) {
    let state = Arc::new(CoachState::new(TaskRegistry::builtin(), SessionConfig::default()));
    let store = shared(InMemoryMetricStore::new());
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        state.clone(),
        store.clone(),
    )
    .spawn()
    .expect("spawn api");
    (handle, state, store)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn call(addr: SocketAddr, method: &str, path: &str, body: Option<Value>) -> (u16, Value) {
    let mut stream = connect(addr);
    let body = body.map(|b| b.to_string()).unwrap_or_default();
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();
    let (head, payload) = raw.split_once("\r\n\r\n").expect("response head");
    assert!(head.contains("Access-Control-Allow-Origin: *"));
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    let json = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(payload).expect("json body")
    };
    (status, json)
}

#[test]
fn health_and_task_selection() {
    let (handle, state, _store) = start();
    let addr = handle.addr;

    assert_eq!(call(addr, "GET", "/health", None), (200, json!({"status": "ok"})));

    let (status, body) = call(
        addr,
        "POST",
        "/active-task",
        Some(json!({"task": "hold_mouth", "seconds": 2.5})),
    );
    assert_eq!(status, 200);
    assert_eq!(body, json!({"ok": true, "active_task": "hold_at_mouth"}));
    assert_eq!(state.active_task().unwrap().as_deref(), Some("hold_at_mouth"));

    let (status, body) = call(addr, "POST", "/active-task", Some(json!({"task": "somersault"})));
    assert_eq!(status, 400);
    assert_eq!(body["ok"], false);
    assert_eq!(body["code"], "unknown_task");
    assert_eq!(state.active_task().unwrap().as_deref(), Some("hold_at_mouth"));

    let (status, body) = call(addr, "POST", "/active-task", Some(json!({"task": "reach", "seconds": -1})));
    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_params");

    let (_, body) = call(addr, "GET", "/active-task", None);
    assert_eq!(body["active_task"], "hold_at_mouth");

    let (status, body) = call(addr, "POST", "/calibrate", None);
    assert_eq!(status, 400);
    assert_eq!(body["code"], "calibration_unavailable");

    let (status, _) = call(addr, "OPTIONS", "/active-task", None);
    assert_eq!(status, 204);

    handle.stop().unwrap();
}

#[test]
fn session_debug_and_metrics() {
    let (handle, state, store) = start();
    let addr = handle.addr;

    let (status, body) = call(
        addr,
        "POST",
        "/session-config",
        Some(json!({"dominant": "l", "target_mode": "head"})),
    );
    assert_eq!(status, 200);
    assert_eq!(body["session"], json!({"dominant": "left", "target_mode": "head"}));
    assert_eq!(state.session().target_mode.as_str(), "head");

    let (status, body) = call(addr, "POST", "/debug-overlay", Some(json!({"enabled": true})));
    assert_eq!(status, 200);
    assert_eq!(body["debug_overlay"], true);
    let (_, body) = call(addr, "GET", "/debug-overlay", None);
    assert_eq!(body["debug_overlay"], true);

    {
        let mut store = store.lock().unwrap();
        for n in 0..3 {
            store
                .append(&NewMetric::now("local", "progress", json!({"progress": n})))
                .unwrap();
        }
    }
    let (status, body) = call(addr, "GET", "/metrics?limit=2", None);
    assert_eq!(status, 200);
    assert_eq!(body["count"], 2);
    assert_eq!(body["samples"][0]["value"]["progress"], 2);

    assert_eq!(call(addr, "GET", "/nowhere", None).0, 404);
    handle.stop().unwrap();
}

#[test]
fn live_channel_streams_broadcasts() {
    let (handle, state, _store) = start();
    let mut stream = connect(handle.addr);
    stream
        .write_all(b"GET /live HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while state.broadcaster().is_empty() {
        assert!(Instant::now() < deadline, "live client never subscribed");
        thread::sleep(Duration::from_millis(10));
    }
    state
        .broadcaster()
        .broadcast(&json!({"active_task": "reach", "passed": true}))
        .unwrap();

    let mut reader = BufReader::new(stream);
    let mut saw_event_stream = false;
    let mut line = String::new();
    loop {
        line.clear();
        assert!(reader.read_line(&mut line).unwrap() > 0, "stream closed early");
        if line.starts_with("Content-Type: text/event-stream") {
            saw_event_stream = true;
        }
        if let Some(data) = line.strip_prefix("data: ") {
            let payload: Value = serde_json::from_str(data.trim()).unwrap();
            assert_eq!(payload["active_task"], "reach");
            break;
        }
    }
    assert!(saw_event_stream);
    handle.stop().unwrap();
}

#[test]
fn mjpeg_serves_latest_frame() {
    let (handle, state, _store) = start();
    state.frames().publish(LatestFrame {
        jpeg: Arc::new(vec![0xFF, 0xD8, 0xFF, 0xD9]),
        sequence: 1,
        hud: "no task".to_string(),
        rendered_at: Instant::now(),
    });

    let mut stream = connect(handle.addr);
    stream
        .write_all(b"GET /mjpeg HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut seen = Vec::new();
    let mut buf = [0u8; 512];
    while !String::from_utf8_lossy(&seen).contains("Content-Type: image/jpeg") {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "stream closed early");
        seen.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&seen);
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("--frame\r\n"));
    handle.stop().unwrap();
}

#[test]
fn stalled_client_does_not_block_other_requests() {
    let (handle, _state, _store) = start();
    let mut stalled = connect(handle.addr);
    stalled.write_all(b"GET /hea").unwrap();
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    assert_eq!(call(handle.addr, "GET", "/health", None), (200, json!({"status": "ok"})));
    assert!(
        started.elapsed() < REQUEST_READ_TIMEOUT + Duration::from_secs(2),
        "health took {:?}",
        started.elapsed()
    );

    let mut raw = String::new();
    stalled.read_to_string(&mut raw).unwrap();
    assert!(raw.starts_with("HTTP/1.1 400"), "stalled client got {:?}", raw);
    handle.stop().unwrap();
}
