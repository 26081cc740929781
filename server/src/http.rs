//! HTTPS control plane and WebSocket upgrade.
//!
//! A TLS TCP listener serves the small JSON control plane (`GET /` health
//! with the pinned certificate hash, `GET /rooms`, `POST /rooms`, CORS on
//! everything) and upgrades `/join` requests to the WebSocket transport.
//! One request per connection; routing is a plain function over a parsed
//! request so the control plane is testable without sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::admission::{self, JoinParams};
use crate::error::ServerError;
use crate::registry::Registry;
use crate::session::Session;

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;

/// A parsed HTTP/1.1 request. Header names are lower-cased.
#[derive(Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpRequest {
    fn wants_websocket(&self) -> bool {
        self.headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}

/// A JSON response ready to be written back.
#[derive(Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    fn json(status: u16, value: serde_json::Value) -> HttpResponse {
        HttpResponse {
            status,
            body: value.to_string(),
        }
    }

    fn error(status: u16, message: &str) -> HttpResponse {
        Self::json(status, json!({ "error": message }))
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
             Access-Control-Allow-Headers: Content-Type\r\n\
             Connection: close\r\n\
             \r\n{}",
            self.status,
            status_text(self.status),
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        _ => "Internal Server Error",
    }
}

pub struct ControlPlane {
    registry: Arc<Registry>,
    cert_hash: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateRoomBody {
    name: String,
    key: String,
}

impl ControlPlane {
    pub fn new(registry: Arc<Registry>, cert_hash: String) -> Arc<ControlPlane> {
        Arc::new(ControlPlane {
            registry,
            cert_hash,
        })
    }

    /// Accept loop; one task per connection.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
    ) -> Result<(), ServerError> {
        info!(
            "control plane listening on https://{}",
            listener.local_addr()?
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = Arc::clone(&self);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer, acceptor).await {
                    debug!("http connection from {} ended: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: TlsAcceptor,
    ) -> Result<(), ServerError> {
        let mut tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| ServerError::Transport(format!("tls accept: {}", e)))?;

        let request = read_request(&mut tls).await?;
        debug!("{} {} from {}", request.method, request.path, peer);

        if request.path == "/join" && request.wants_websocket() {
            return self.join_websocket(tls, request, peer).await;
        }

        let response = self.route(&request);
        tls.write_all(&response.to_bytes()).await?;
        let _ = tls.shutdown().await;
        Ok(())
    }

    /// The control-plane router. Pure over the parsed request.
    pub fn route(&self, request: &HttpRequest) -> HttpResponse {
        match (request.method.as_str(), request.path.as_str()) {
            ("OPTIONS", _) => HttpResponse {
                status: 200,
                body: String::new(),
            },

            ("GET", "/") => HttpResponse::json(
                200,
                json!({
                    "status": "ok",
                    "message": "Lockstep server core is running",
                    "hash": self.cert_hash,
                    "endpoints": {
                        "health": "GET /",
                        "list_rooms": "GET /rooms",
                        "create_room": "POST /rooms",
                        "join_room": "/join?roomid={roomID}&key={value}&wt={true|false}",
                    },
                }),
            ),

            ("GET", "/rooms") => HttpResponse::json(200, json!({ "rooms": self.registry.list() })),

            ("POST", "/rooms") => {
                let body: CreateRoomBody = serde_json::from_str(&request.body).unwrap_or_default();
                match self.registry.create(&body.name, &body.key) {
                    Ok(room) => HttpResponse::json(201, json!({ "room_id": room.shared.id })),
                    Err(e) => HttpResponse::error(
                        e.http_status(),
                        &format!("failed to create room: {}", e),
                    ),
                }
            }

            (_, "/rooms") => HttpResponse::error(405, "method not allowed"),

            (_, "/join") => HttpResponse::error(400, "websocket upgrade required"),

            _ => HttpResponse::error(404, "not found"),
        }
    }

    /// Validates the join, performs the WebSocket handshake and hands the
    /// session to the room. Failures are reported as plain JSON before the
    /// upgrade.
    async fn join_websocket(
        self: Arc<Self>,
        mut tls: TlsStream<TcpStream>,
        request: HttpRequest,
        peer: SocketAddr,
    ) -> Result<(), ServerError> {
        if request.query.get("wt").map(String::as_str) == Some("true") {
            let resp =
                HttpResponse::error(400, "datagram transport joins go to the QUIC endpoint");
            tls.write_all(&resp.to_bytes()).await?;
            let _ = tls.shutdown().await;
            return Ok(());
        }

        let params = JoinParams {
            room_id: request
                .query
                .get("roomid")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            key: request.query.get("key").cloned().unwrap_or_default(),
            reconnect_token: request
                .query
                .get("reconnect_token")
                .cloned()
                .unwrap_or_default(),
        };

        let admitted = match admission::authorize(&self.registry, &params).await {
            Ok(admitted) => admitted,
            Err(e) => {
                info!("join from {} refused: {}", peer, e);
                let resp = HttpResponse::error(e.http_status(), &e.to_string());
                tls.write_all(&resp.to_bytes()).await?;
                let _ = tls.shutdown().await;
                return Ok(());
            }
        };

        let ws_key = match request.headers.get("sec-websocket-key") {
            Some(key) => key.clone(),
            None => {
                admission::abort(admitted);
                let resp = HttpResponse::error(400, "missing Sec-WebSocket-Key");
                tls.write_all(&resp.to_bytes()).await?;
                let _ = tls.shutdown().await;
                return Ok(());
            }
        };

        let handshake = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             \r\n",
            derive_accept_key(ws_key.as_bytes())
        );
        if let Err(e) = tls.write_all(handshake.as_bytes()).await {
            admission::abort(admitted);
            return Err(e.into());
        }

        let ws = WebSocketStream::from_raw_socket(tls, Role::Server, None).await;
        let session = Session::from_ws(ws, peer);
        if let Err(e) = admission::attach(admitted, session) {
            warn!("websocket join from {} failed to attach: {}", peer, e);
        }
        Ok(())
    }
}

/// Reads and parses one HTTP/1.1 request (head plus Content-Length body).
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<HttpRequest, ServerError> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ServerError::Transport("request head too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::Transport("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| ServerError::Transport("empty request".into()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ServerError::Transport("bad request line".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| ServerError::Transport("bad request line".into()))?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target.to_string(), HashMap::new()),
    };

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(ServerError::Transport("request body too large".into()));
    }

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::Transport("connection closed mid-body".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(HttpRequest {
        method,
        path,
        query,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::world::DefaultWorld;
    use serde_json::Value;

    fn control_plane() -> Arc<ControlPlane> {
        let registry = Registry::new(Config::default(), DefaultWorld::factory());
        ControlPlane::new(registry, "ab".repeat(32))
    }

    fn get(path: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            path: path.into(),
            ..HttpRequest::default()
        }
    }

    fn post(path: &str, body: &str) -> HttpRequest {
        HttpRequest {
            method: "POST".into(),
            path: path.into(),
            body: body.into(),
            ..HttpRequest::default()
        }
    }

    #[tokio::test]
    async fn health_reports_cert_hash_and_endpoints() {
        let cp = control_plane();
        let resp = cp.route(&get("/"));
        assert_eq!(resp.status, 200);

        let value: Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["hash"], "ab".repeat(32));
        assert!(value["endpoints"]["join_room"].is_string());
    }

    #[tokio::test]
    async fn rooms_lifecycle_over_the_control_plane() {
        let cp = control_plane();

        let resp = cp.route(&get("/rooms"));
        assert_eq!(resp.status, 200);
        let value: Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(value["rooms"], json!([]));

        let resp = cp.route(&post("/rooms", r#"{"name":"x","key":""}"#));
        assert_eq!(resp.status, 201);
        let value: Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(value["room_id"], 1);

        let resp = cp.route(&get("/rooms"));
        let value: Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(value["rooms"], json!([1]));
    }

    #[tokio::test]
    async fn create_room_with_garbage_body_still_works() {
        let cp = control_plane();
        let resp = cp.route(&post("/rooms", "not json at all"));
        assert_eq!(resp.status, 201);
    }

    #[tokio::test]
    async fn unknown_path_is_404_and_wrong_method_405() {
        let cp = control_plane();
        assert_eq!(cp.route(&get("/nope")).status, 404);

        let req = HttpRequest {
            method: "DELETE".into(),
            path: "/rooms".into(),
            ..HttpRequest::default()
        };
        assert_eq!(cp.route(&req).status, 405);
    }

    #[tokio::test]
    async fn join_without_upgrade_is_a_client_error() {
        let cp = control_plane();
        assert_eq!(cp.route(&get("/join")).status, 400);
    }

    #[tokio::test]
    async fn request_parsing_handles_query_and_body() {
        let raw = b"POST /rooms?x=1&flag HTTP/1.1\r\n\
                    Host: localhost\r\n\
                    Content-Length: 4\r\n\
                    \r\nabcd";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let req = read_request(&mut cursor).await.unwrap();

        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/rooms");
        assert_eq!(req.query.get("x").map(String::as_str), Some("1"));
        assert_eq!(req.query.get("flag").map(String::as_str), Some(""));
        assert_eq!(req.headers.get("host").map(String::as_str), Some("localhost"));
        assert_eq!(req.body, "abcd");
    }

    #[test]
    fn response_bytes_carry_cors_headers() {
        let resp = HttpResponse::json(200, json!({"ok": true}));
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *"));
        assert!(text.contains("Access-Control-Allow-Methods: GET, POST, OPTIONS"));
        assert!(text.contains("Content-Type: application/json"));
    }
}
