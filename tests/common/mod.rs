//! Loopback HTTP/1.1 backend for integration tests.
//!
//! Routes are matched on exact method and path. Each route holds a queue of
//! replies; the last reply of a queue is reused for every further request
//! until a new reply is routed, which then takes its place.
//! Every request is recorded so tests can assert what was (not) sent.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use career_chat::{ApiClient, ClientConfig, MemoryCredentials, StreamSessionController};

pub const TEST_TOKEN: &str = "test-token";

#[derive(Debug, Clone)]
pub enum Reply {
    Json { status: u16, body: String },
    /// Chunked `text/event-stream` body written one chunk at a time.
    Sse {
        chunks: Vec<Vec<u8>>,
        delay: Duration,
        end: SseEnd,
    },
    /// Read the request and never answer, not even with headers.
    Stall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseEnd {
    /// Terminating zero-length chunk.
    Clean,
    /// Drop the socket mid-body.
    Sever,
    /// Keep the connection open and silent.
    Hang,
}

impl Reply {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Reply::Json {
            status,
            body: body.into(),
        }
    }

    pub fn sse<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Reply::Sse {
            chunks: frames.into_iter().map(|f| f.as_ref().to_vec()).collect(),
            delay: Duration::from_millis(5),
            end: SseEnd::Clean,
        }
    }

    pub fn ending(self, end: SseEnd) -> Self {
        match self {
            Reply::Sse { chunks, delay, .. } => Reply::Sse { chunks, delay, end },
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Default)]
struct Queue {
    replies: VecDeque<Reply>,
    /// The only remaining reply has been served at least once.
    sticky_served: bool,
}

type Routes = Arc<Mutex<HashMap<(String, String), Queue>>>;

pub struct MockServer {
    addr: SocketAddr,
    routes: Routes,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Routes = Arc::default();
        let requests: Arc<Mutex<Vec<Recorded>>> = Arc::default();

        let (r, q) = (routes.clone(), requests.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream, r.clone(), q.clone()));
            }
        });

        Self {
            addr,
            routes,
            requests,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn route(&self, method: &str, path: &str, reply: Reply) {
        let mut routes = self.routes.lock().unwrap();
        let queue = routes.entry((method.to_string(), path.to_string())).or_default();
        if queue.sticky_served {
            queue.replies.clear();
            queue.sticky_served = false;
        }
        queue.replies.push_back(reply);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.url());
        config.idle_timeout = Duration::from_secs(5);
        config.request_timeout = Duration::from_secs(5);
        config
    }

    pub fn api(&self) -> ApiClient {
        self.api_with(self.config())
    }

    pub fn api_with(&self, config: ClientConfig) -> ApiClient {
        ApiClient::new(config, Arc::new(MemoryCredentials::with_token(TEST_TOKEN))).unwrap()
    }

    pub fn controller(&self) -> StreamSessionController {
        StreamSessionController::new(self.api())
    }
}

async fn handle(mut stream: TcpStream, routes: Routes, requests: Arc<Mutex<Vec<Recorded>>>) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    let key = (request.method.clone(), request.path.clone());
    requests.lock().unwrap().push(request);

    let reply = {
        let mut routes = routes.lock().unwrap();
        match routes.get_mut(&key) {
            Some(queue) if queue.replies.len() > 1 => queue.replies.pop_front(),
            Some(queue) => {
                queue.sticky_served = true;
                queue.replies.front().cloned()
            }
            None => None,
        }
    };

    match reply {
        Some(Reply::Json { status, body }) => write_json(&mut stream, status, &body).await,
        Some(Reply::Sse { chunks, delay, end }) => write_sse(stream, chunks, delay, end).await,
        Some(Reply::Stall) => {
            let _open = stream;
            std::future::pending::<()>().await;
        }
        None => write_json(&mut stream, 404, r#"{"detail":"Not Found"}"#).await,
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Recorded> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        if let Ok(httparse::Status::Complete(head_len)) = req.parse(&buf) {
            let method = req.method?.to_string();
            let path = req.path?.to_string();
            let headers: Vec<(String, String)> = req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            let length = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);

            while buf.len() < head_len + length {
                let n = stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = buf[head_len..head_len + length].to_vec();
            return Some(Recorded {
                method,
                path,
                headers,
                body,
            });
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

async fn write_json(stream: &mut TcpStream, status: u16, body: &str) {
    let response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        reason(status),
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn write_sse(mut stream: TcpStream, chunks: Vec<Vec<u8>>, delay: Duration, end: SseEnd) {
    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
    if stream.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    for data in chunks {
        tokio::time::sleep(delay).await;
        let mut frame = format!("{:x}\r\n", data.len()).into_bytes();
        frame.extend_from_slice(&data);
        frame.extend_from_slice(b"\r\n");
        if stream.write_all(&frame).await.is_err() {
            return;
        }
        let _ = stream.flush().await;
    }
    match end {
        SseEnd::Clean => {
            let _ = stream.write_all(b"0\r\n\r\n").await;
            let _ = stream.shutdown().await;
        }
        SseEnd::Sever => drop(stream),
        SseEnd::Hang => {
            std::future::pending::<()>().await;
        }
    }
}

// -- JSON fixtures ----------------------------------------------------------

/// `(id, role, content)` triples, roles as the backend spells them.
pub fn session_json(id: u64, title: &str, messages: &[(i64, &str, &str)]) -> String {
    let messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|(mid, role, content)| {
            serde_json::json!({
                "id": mid,
                "role": role,
                "content": content,
                "session_id": id,
                "timestamp": "2024-05-01T10:00:00",
            })
        })
        .collect();
    serde_json::json!({
        "id": id,
        "title": title,
        "created_at": "2024-05-01T10:00:00",
        "messages": messages,
    })
    .to_string()
}

pub fn token_frame(token: &str) -> String {
    format!("data: {}\n\n", serde_json::json!({ "token": token }))
}
