//! HTTP dashboard.
//!
//! A small HTTP/1.1 server over the shared `Supervisor`. Every connection is
//! handled on its own task and carries exactly one request (`Connection:
//! close`). Routes:
//!
//! - `GET /` - the embedded HTML page
//! - `GET /status`, `GET /status/{name}` - snapshots as JSON
//! - `POST /start/{name}`, `/stop/{name}`, `/restart/{name}` - actions
//! - `GET /logs/{name}?lines=N` - tail of the project's log file
//! - `OPTIONS *` - CORS preflight

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::output;
use crate::supervisor::Supervisor;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7777;

const DASHBOARD_HTML: &str = include_str!("../assets/dashboard.html");
const DEFAULT_LOG_LINES: usize = 100;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// A parsed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
}

impl Request {
    pub fn new(method: &str, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), parse_query_map(query)),
            None => (target.to_string(), BTreeMap::new()),
        };
        Self {
            method: method.to_ascii_uppercase(),
            path,
            query,
        }
    }
}

/// A response ready to be written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json(status: u16, payload: &Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            // Serializing a `Value` cannot fail.
            body: serde_json::to_vec(payload).unwrap_or_default(),
        }
    }

    fn html(body: &str) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }

    fn no_content() -> Self {
        Self {
            status: 204,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, &json!({ "error": message.into() }))
    }

    fn from_error(err: &SupervisorError) -> Self {
        Self::error(err.http_status(), err.to_string())
    }
}

/// The dashboard listener bound to its address.
pub struct DashboardServer {
    listener: TcpListener,
    supervisor: Arc<Supervisor>,
}

impl DashboardServer {
    /// Binds `host:port`. A port already in use is an error, which also keeps
    /// a second dashboard from managing the same projects.
    pub async fn bind(host: &str, port: u16, supervisor: Arc<Supervisor>) -> SupervisorResult<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self {
            listener,
            supervisor,
        })
    }

    pub fn local_addr(&self) -> SupervisorResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> SupervisorResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(addr = %self.local_addr()?, "dashboard listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let supervisor = self.supervisor.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, &supervisor).await {
                            debug!(%peer, error = %err, "connection failed");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("dashboard shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(mut stream: TcpStream, supervisor: &Supervisor) -> SupervisorResult<()> {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(err)) => {
            let response = Response::error(400, err.to_string());
            return write_response(&mut stream, &response).await;
        }
        Err(_) => {
            let response = Response::error(408, "request timed out");
            return write_response(&mut stream, &response).await;
        }
    };
    let response = route(supervisor, &request).await;
    debug!(method = %request.method, path = %request.path, status = response.status, "request");
    write_response(&mut stream, &response).await
}

/// Reads one request; `None` when the peer closed without sending anything.
pub async fn read_request<S>(stream: &mut S) -> SupervisorResult<Option<Request>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos;
        }
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(bad_request("request missing header delimiter"));
        }
        buf.extend_from_slice(&chunk[..read]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(bad_request("request headers too large"));
        }
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = header_text.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| bad_request("request missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| bad_request("request missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| bad_request("request missing target"))?;
    let request = Request::new(method, target);

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(bad_request("request body too large"));
    }
    // No route reads a body, but it has to be drained before responding.
    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(bad_request("request ended before full body was received"));
        }
        buf.extend_from_slice(&chunk[..read]);
    }
    Ok(Some(request))
}

fn bad_request(message: &str) -> SupervisorError {
    SupervisorError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

fn parse_query_map(query: &str) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    for pair in query.split('&') {
        if pair.trim().is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            result.insert(key.to_string(), value.to_string());
        } else {
            result.insert(pair.to_string(), String::new());
        }
    }
    result
}

pub async fn write_response<S>(stream: &mut S, response: &Response) -> SupervisorResult<()>
where
    S: AsyncWrite + Unpin,
{
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nAccess-Control-Allow-Headers: *\r\nConnection: close\r\n\r\n",
        response.status,
        status_text(response.status),
        response.content_type,
        response.body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await?;
    Ok(())
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        _ => "OK",
    }
}

/// Maps a request to a response.
pub async fn route(supervisor: &Supervisor, request: &Request) -> Response {
    if request.method == "OPTIONS" {
        return Response::no_content();
    }
    let segments: Vec<&str> = request
        .path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    let method = request.method.as_str();

    match (segments.as_slice(), method) {
        ([], "GET") => Response::html(DASHBOARD_HTML),
        (["status"], "GET") => match serde_json::to_value(supervisor.status_all()) {
            Ok(value) => Response::json(200, &value),
            Err(err) => Response::error(500, err.to_string()),
        },
        (["status", name], "GET") => snapshot_response(supervisor.status(name)),
        (["start", name], "POST") => match supervisor.start(name).await {
            Ok(outcome) => action_response("start", outcome.label(), outcome.snapshot()),
            Err(err) => Response::from_error(&err),
        },
        (["stop", name], "POST") => match supervisor.stop(name).await {
            Ok(snapshot) => action_response("stop", "stopped", &snapshot),
            Err(err) => Response::from_error(&err),
        },
        (["restart", name], "POST") => match supervisor.restart(name).await {
            Ok(outcome) => action_response("restart", "restarted", outcome.snapshot()),
            Err(err) => Response::from_error(&err),
        },
        (["logs", name], "GET") => logs_response(supervisor, name, request).await,
        ([] | ["status"] | ["status", _] | ["logs", _], _)
        | (["start" | "stop" | "restart", _], _) => {
            Response::error(405, format!("{} not allowed on {}", method, request.path))
        }
        _ => Response::error(404, format!("no route for {}", request.path)),
    }
}

fn snapshot_response<T: serde::Serialize>(result: SupervisorResult<T>) -> Response {
    match result.and_then(|snapshot| Ok(serde_json::to_value(snapshot)?)) {
        Ok(value) => Response::json(200, &value),
        Err(err) => Response::from_error(&err),
    }
}

fn action_response<T: serde::Serialize>(action: &str, outcome: &str, snapshot: &T) -> Response {
    Response::json(
        200,
        &json!({ "action": action, "outcome": outcome, "snapshot": snapshot }),
    )
}

async fn logs_response(supervisor: &Supervisor, name: &str, request: &Request) -> Response {
    let lines = match request.query.get("lines") {
        None => DEFAULT_LOG_LINES,
        Some(raw) => match raw.parse::<usize>() {
            Ok(lines) => lines.min(output::MAX_TAIL_LINES),
            Err(_) => return Response::error(400, format!("invalid lines value '{}'", raw)),
        },
    };
    let path = match supervisor.log_path(name) {
        Ok(path) => path,
        Err(err) => return Response::from_error(&err),
    };
    let tail = tokio::task::spawn_blocking(move || output::read_tail(&path, lines, true)).await;
    match tail {
        Ok(Ok(lines)) => Response::json(200, &json!({ "name": name, "lines": lines })),
        Ok(Err(err)) => Response::from_error(&err),
        Err(err) => Response::error(500, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ProjectConfig};
    use crate::registry::ProjectRegistry;
    use crate::state::{InstanceLock, StateStore};
    use crate::supervisor::SupervisorSettings;
    use crate::runner::ShutdownConfig;

    fn body(response: &Response) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    fn supervisor(dir: &std::path::Path) -> Arc<Supervisor> {
        let config = Config {
            projects: ["web", "api"]
                .iter()
                .map(|name| ProjectConfig {
                    name: name.to_string(),
                    command: Some("sleep 100".into()),
                    workdir: Some(".".into()),
                    ..ProjectConfig::default()
                })
                .collect(),
            ..Config::default()
        };
        let registry = ProjectRegistry::from_config(&config, dir).unwrap();
        let state_dir = dir.join("state");
        let lock = InstanceLock::acquire(&state_dir).unwrap();
        let settings = SupervisorSettings {
            shutdown: ShutdownConfig::new(0, 500),
            ready_timeout: Duration::from_secs(2),
            start_settle: Duration::from_millis(50),
        };
        Arc::new(Supervisor::new(
            registry,
            settings,
            StateStore::new(state_dir),
            Some(lock),
        ))
    }

    #[test]
    fn request_splits_query() {
        let request = Request::new("get", "/logs/web?lines=20&raw");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/logs/web");
        assert_eq!(request.query["lines"], "20");
        assert_eq!(request.query["raw"], "");
    }

    #[tokio::test]
    async fn parses_request_with_body() {
        let raw = b"POST /start/web HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\n{}";
        let mut reader: &[u8] = raw;
        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/start/web");

        let mut empty: &[u8] = b"";
        assert!(read_request(&mut empty).await.unwrap().is_none());
        let mut truncated: &[u8] = b"GET / HTTP/1.1\r\n";
        assert!(read_request(&mut truncated).await.is_err());
    }

    #[tokio::test]
    async fn responses_carry_cors_header() {
        let mut out = Vec::new();
        write_response(&mut out, &Response::error(404, "nope")).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.ends_with(r#"{"error":"nope"}"#));
    }

    #[tokio::test]
    async fn routes_errors_and_methods() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());

        let unknown = route(&sup, &Request::new("GET", "/status/ghost")).await;
        assert_eq!(unknown.status, 404);
        assert!(body(&unknown)["error"]
            .as_str()
            .unwrap()
            .contains("ghost"));

        assert_eq!(route(&sup, &Request::new("GET", "/start/web")).await.status, 405);
        assert_eq!(route(&sup, &Request::new("GET", "/nope")).await.status, 404);
        assert_eq!(route(&sup, &Request::new("OPTIONS", "/status")).await.status, 204);
        let not_running = route(&sup, &Request::new("POST", "/stop/web")).await;
        assert_eq!(not_running.status, 500);
        assert_eq!(body(&not_running)["error"], "project 'web' is not running");
        assert_eq!(
            route(&sup, &Request::new("GET", "/logs/web?lines=abc")).await.status,
            400
        );

        let index = route(&sup, &Request::new("GET", "/")).await;
        assert_eq!(index.status, 200);
        assert!(index.content_type.starts_with("text/html"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn serves_status_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let server = DashboardServer::bind("127.0.0.1", 0, sup.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve(async {
            let _ = stop_rx.await;
        }));

        let client = reqwest::Client::new();
        let base = format!("http://{}", addr);
        let started: Value = client
            .post(format!("{}/start/web", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(started["action"], "start");
        assert_eq!(started["outcome"], "started");
        assert_eq!(started["snapshot"]["state"], "running");

        let response = client.get(format!("{}/status", base)).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
        let status: Value = response.json().await.unwrap();
        let entries = status.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["name"], "web");
        assert_eq!(entries[0]["state"], "running");
        assert_eq!(entries[1]["name"], "api");
        assert_eq!(entries[1]["state"], "stopped");

        let missing = client
            .post(format!("{}/start/ghost", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        let logs: Value = client
            .get(format!("{}/logs/web?lines=5", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(logs["name"], "web");
        assert!(logs["lines"][0].as_str().unwrap().contains("pmctl: starting"));

        let stopped: Value = client
            .post(format!("{}/stop/web", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stopped["snapshot"]["state"], "stopped");

        let _ = stop_tx.send(());
        serving.await.unwrap().unwrap();
    }
}
