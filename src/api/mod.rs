//! Local HTTP control surface.
//!
//! Short JSON requests are served inline on the acceptor thread. `/live`
//! (server-sent events) and `/mjpeg` get a thread each for as long as the
//! client stays connected.

mod stream;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};

use crate::control::CoachState;
use crate::error::ControlError;
use crate::evaluator::TaskParams;
use crate::session::{SessionConfig, SessionUpdate};
use crate::storage::{SharedStore, MAX_RECENT};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
/// A client that stalls mid-request holds the acceptor for at most this long.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_METRICS_LIMIT: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, signal streaming clients to finish, and join the acceptor.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: Arc<CoachState>,
    store: SharedStore,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: Arc<CoachState>, store: SharedStore) -> Self {
        Self { cfg, state, store }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = thread::Builder::new()
            .name("coach-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, self.state, self.store, shutdown_thread) {
                    log::error!("control api stopped: {:#}", err);
                }
            })
            .context("spawn api thread")?;
        log::info!("control api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    state: Arc<CoachState>,
    store: SharedStore,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &state, &store, &shutdown) {
                    log::warn!("control api request rejected: {:#}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    state: &Arc<CoachState>,
    store: &SharedStore,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_response(&mut stream, &Response::error(403, "forbidden", "forbidden"))?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_response(
                &mut stream,
                &Response::error(400, "bad_request", &format!("{:#}", err)),
            )?;
            return Err(err);
        }
    };
    log::debug!(
        "{} {} from {} ({})",
        request.method,
        request.path,
        peer,
        request.headers.get("user-agent").map_or("-", String::as_str)
    );

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/live") => stream::spawn_live(stream, state.clone(), shutdown.clone()),
        ("GET", "/mjpeg") => stream::spawn_mjpeg(stream, state.clone(), shutdown.clone()),
        _ => {
            let response = route(&request, state, store);
            write_response(&mut stream, &response)
        }
    }
}

/// Dispatch a short request to its handler.
fn route(request: &HttpRequest, state: &CoachState, store: &SharedStore) -> Response {
    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => Response::no_content(),
        ("GET", "/health") => Response::json(200, json!({ "status": "ok" })),
        ("GET", "/tasks") => Response::json(200, json!({ "ok": true, "tasks": state.registry().ids() })),
        ("GET", "/active-task") => control(state.active_task().map(|task| {
            json!({ "ok": true, "active_task": task })
        })),
        ("POST", "/active-task") => control(select_task(state, &request.body)),
        ("GET", "/session-config") => {
            Response::json(200, json!({ "ok": true, "session": session_json(&state.session()) }))
        }
        ("POST", "/session-config") => control(update_session(state, &request.body)),
        ("GET", "/debug-overlay") => Response::json(
            200,
            json!({ "ok": true, "debug_overlay": state.debug_overlay() }),
        ),
        ("POST", "/debug-overlay") => control(set_debug_overlay(state, &request.body)),
        ("POST", "/calibrate") => control(state.calibrate().map(|(task, mouth_scale)| {
            json!({ "ok": true, "active_task": task, "mouth_scale": mouth_scale })
        })),
        ("GET", "/metrics") => metrics(request, store),
        (_, "/health" | "/tasks" | "/active-task" | "/session-config" | "/debug-overlay"
        | "/calibrate" | "/metrics" | "/live" | "/mjpeg") => {
            Response::error(405, "method_not_allowed", "method not allowed")
        }
        _ => Response::error(404, "not_found", "not found"),
    }
}

fn control(outcome: Result<Value, ControlError>) -> Response {
    match outcome {
        Ok(body) => Response::json(200, body),
        Err(err) => {
            let status = if err.is_client_error() { 400 } else { 500 };
            log::warn!("control request failed: {}", err);
            Response::error(status, err.code(), &err.to_string())
        }
    }
}

fn parse_body(body: &[u8]) -> Result<Value, ControlError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| ControlError::InvalidParams(format!("body is not valid JSON: {}", e)))
}

fn select_task(state: &CoachState, body: &[u8]) -> Result<Value, ControlError> {
    let body = parse_body(body)?;
    let name = match body.get("task") {
        Some(Value::String(name)) => name.clone(),
        Some(Value::Null) => String::new(),
        Some(_) => return Err(ControlError::InvalidParams("'task' must be a string".into())),
        None => return Err(ControlError::InvalidParams("missing 'task'".into())),
    };
    let params: TaskParams = serde_json::from_value(body)
        .map_err(|e| ControlError::InvalidParams(e.to_string()))?;
    let active = state.select_task(&name, &params)?;
    Ok(json!({ "ok": true, "active_task": active }))
}

fn update_session(state: &CoachState, body: &[u8]) -> Result<Value, ControlError> {
    let update: SessionUpdate = serde_json::from_value(parse_body(body)?)
        .map_err(|e| ControlError::InvalidSession(e.to_string()))?;
    let session = state.update_session(&update)?;
    Ok(json!({ "ok": true, "session": session_json(&session) }))
}

fn set_debug_overlay(state: &CoachState, body: &[u8]) -> Result<Value, ControlError> {
    let enabled = parse_body(body)?
        .get("enabled")
        .and_then(Value::as_bool)
        .ok_or_else(|| ControlError::InvalidParams("'enabled' must be a boolean".into()))?;
    Ok(json!({ "ok": true, "debug_overlay": state.set_debug_overlay(enabled) }))
}

fn session_json(session: &SessionConfig) -> Value {
    json!({
        "dominant": session.dominant_hand.as_str(),
        "target_mode": session.target_mode.as_str(),
    })
}

fn metrics(request: &HttpRequest, store: &SharedStore) -> Response {
    let limit = match request.query.get("limit") {
        None => DEFAULT_METRICS_LIMIT,
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) => n.min(MAX_RECENT),
            Err(_) => {
                return Response::error(400, "invalid_params", "limit must be a non-negative integer")
            }
        },
    };
    let session = request.query.get("session").map(String::as_str);
    let result = store
        .lock()
        .map_err(|_| anyhow!("metric store lock poisoned"))
        .and_then(|mut store| store.recent(limit, session));
    match result {
        Ok(samples) => Response::json(
            200,
            json!({ "ok": true, "count": samples.len(), "samples": samples }),
        ),
        Err(err) => {
            log::warn!("metrics read failed: {:#}", err);
            Response::error(500, "internal", "metric store unavailable")
        }
    }
}

#[derive(Debug, PartialEq)]
struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
        }
    }

    fn error(status: u16, code: &str, message: &str) -> Self {
        Self::json(status, json!({ "ok": false, "error": message, "code": code }))
    }

    fn no_content() -> Self {
        Self {
            status: 204,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\n\
Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
Access-Control-Allow-Headers: Content-Type\r\n";

fn write_response<W: Write>(stream: &mut W, response: &Response) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n{cors}Connection: close\r\n\r\n",
        status_line = status_line(response.status),
        content_type = response.content_type,
        len = response.body.len(),
        cors = CORS_HEADERS,
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

/// Headers for a response that streams until the client goes away.
fn write_stream_header<W: Write>(stream: &mut W, content_type: &str) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nCache-Control: no-store\r\n{cors}Connection: keep-alive\r\n\r\n",
        content_type = content_type,
        cors = CORS_HEADERS,
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug, Default)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

fn read_request<R: Read>(stream: &mut R) -> Result<HttpRequest> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-request"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", v))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        query: parse_query(query),
        headers,
        body,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskRegistry;
    use crate::storage::{shared, InMemoryMetricStore, NewMetric};
    use std::io::Cursor;

    fn state() -> CoachState {
        CoachState::new(TaskRegistry::builtin(), SessionConfig::default())
    }

    fn request(method: &str, path: &str, body: &str) -> HttpRequest {
        let raw = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        read_request(&mut Cursor::new(raw.into_bytes())).unwrap()
    }

    fn body(response: &Response) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn reads_body_by_content_length() {
        let req = request("post", "/active-task?x=1", r#"{"task":"reach"}"#);
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/active-task");
        assert_eq!(req.query.get("x").map(String::as_str), Some("1"));
        assert_eq!(req.body, br#"{"task":"reach"}"#);
        assert_eq!(req.headers.get("host").map(String::as_str), Some("localhost"));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc".to_vec();
        assert!(read_request(&mut Cursor::new(raw)).is_err());
    }

    #[test]
    fn select_and_clear_task() {
        let state = state();
        let store = shared(InMemoryMetricStore::new());
        let res = route(
            &request("POST", "/active-task", r#"{"task":"hold_cup","seconds":3}"#),
            &state,
            &store,
        );
        assert_eq!(res.status, 200);
        assert_eq!(body(&res)["active_task"], "grab_hold");

        let res = route(&request("POST", "/active-task", r#"{"task":null}"#), &state, &store);
        assert_eq!(body(&res)["active_task"], Value::Null);
        assert_eq!(state.active_task().unwrap(), None);
    }

    #[test]
    fn unknown_task_is_400_and_keeps_state() {
        let state = state();
        let store = shared(InMemoryMetricStore::new());
        state.select_task("reach", &TaskParams::default()).unwrap();
        let res = route(&request("POST", "/active-task", r#"{"task":"juggle"}"#), &state, &store);
        assert_eq!(res.status, 400);
        let b = body(&res);
        assert_eq!(b["ok"], false);
        assert_eq!(b["code"], "unknown_task");
        assert_eq!(state.active_task().unwrap().as_deref(), Some("reach"));
    }

    #[test]
    fn session_config_round_trip() {
        let state = state();
        let store = shared(InMemoryMetricStore::new());
        let res = route(
            &request("POST", "/session-config", r#"{"dominant":"L","target_mode":"head"}"#),
            &state,
            &store,
        );
        assert_eq!(res.status, 200);
        let res = route(&request("GET", "/session-config", ""), &state, &store);
        assert_eq!(body(&res)["session"], json!({"dominant": "left", "target_mode": "head"}));

        let res = route(
            &request("POST", "/session-config", r#"{"dominant":"middle"}"#),
            &state,
            &store,
        );
        assert_eq!(res.status, 400);
        assert_eq!(body(&res)["code"], "invalid_session");
    }

    #[test]
    fn debug_overlay_requires_boolean() {
        let state = state();
        let store = shared(InMemoryMetricStore::new());
        let res = route(&request("POST", "/debug-overlay", r#"{"enabled":"yes"}"#), &state, &store);
        assert_eq!(res.status, 400);
        let res = route(&request("POST", "/debug-overlay", r#"{"enabled":true}"#), &state, &store);
        assert_eq!(body(&res)["debug_overlay"], true);
        assert!(state.debug_overlay());
    }

    #[test]
    fn calibrate_reports_why_it_cannot() {
        let state = state();
        let store = shared(InMemoryMetricStore::new());
        let res = route(&request("POST", "/calibrate", ""), &state, &store);
        assert_eq!(res.status, 400);
        assert_eq!(body(&res)["code"], "no_active_task");

        state.select_task("hold_at_mouth", &TaskParams::default()).unwrap();
        let res = route(&request("POST", "/calibrate", ""), &state, &store);
        assert_eq!(res.status, 400);
        assert_eq!(body(&res)["code"], "calibration_unavailable");
    }

    #[test]
    fn metrics_limit_and_session_filter() {
        let state = state();
        let store = shared(InMemoryMetricStore::new());
        {
            let mut s = store.lock().unwrap();
            for n in 0..4 {
                s.append(&NewMetric::now("a", "progress", json!({ "n": n }))).unwrap();
            }
            s.append(&NewMetric::now("b", "progress", json!({ "n": 9 }))).unwrap();
        }
        let res = route(&request("GET", "/metrics?limit=2&session=a", ""), &state, &store);
        let b = body(&res);
        assert_eq!(b["count"], 2);
        assert_eq!(b["samples"][0]["value"]["n"], 3);
        assert_eq!(b["samples"][0]["type"], "progress");

        let res = route(&request("GET", "/metrics?limit=abc", ""), &state, &store);
        assert_eq!(res.status, 400);
        let res = route(&request("GET", "/metrics", ""), &state, &store);
        assert_eq!(body(&res)["count"], 5);
    }

    #[test]
    fn unknown_routes_and_methods() {
        let state = state();
        let store = shared(InMemoryMetricStore::new());
        assert_eq!(route(&request("GET", "/nope", ""), &state, &store).status, 404);
        assert_eq!(route(&request("DELETE", "/health", ""), &state, &store).status, 405);
        assert_eq!(route(&request("GET", "/calibrate", ""), &state, &store).status, 405);
        assert_eq!(route(&request("OPTIONS", "/active-task", ""), &state, &store).status, 204);
    }

    #[test]
    fn responses_carry_cors_header() {
        let mut out = Vec::new();
        write_response(&mut out, &Response::json(200, json!({"status": "ok"}))).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.ends_with(r#"{"status":"ok"}"#));
    }
}
