//! # Direct Delivery RPC
//!
//! JSON-RPC 2.0 over plain HTTP POST, one method:
//!
//! ```text
//! receiveMessage(sender, message, timestamp[, kind]) -> true
//! ```
//!
//! Params may be named (an object) or positional (an array in that order).
//! The client always sends named params.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use geochat_core::types::PeerAddress;
use geochat_core::wire::DirectMessage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::RpcError;

/// The only method served
pub const RECEIVE_MESSAGE_METHOD: &str = "receiveMessage";

/// Requests larger than this are dropped
const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// RPC endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Interface to listen on
    pub bind_address: String,

    /// Listen port, also advertised in announcements
    pub port: u16,

    /// IP to advertise instead of the detected one
    pub advertise_ip: Option<String>,

    /// Deadline for one outgoing call
    pub request_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            advertise_ip: None,
            request_timeout: Duration::from_millis(3000),
        }
    }
}

impl RpcConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Outgoing direct delivery to a peer's endpoint
#[async_trait]
pub trait DirectDelivery: Send + Sync {
    /// Deliver one message. Succeeds only when the peer acknowledged it.
    async fn deliver(&self, address: &PeerAddress, message: &DirectMessage) -> Result<(), RpcError>;
}

/// Receiving side of `receiveMessage`
pub trait MessageSink: Send + Sync {
    /// Accept an incoming message, returning the acknowledgement sent back
    fn receive_message(&self, message: DirectMessage) -> bool;
}

/// HTTP JSON-RPC client
pub struct JsonRpcClient {
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RpcError::Protocol(e.to_string()))?;

        Ok(Self {
            http,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl DirectDelivery for JsonRpcClient {
    async fn deliver(&self, address: &PeerAddress, message: &DirectMessage) -> Result<(), RpcError> {
        let url = address.rpc_url();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "method": RECEIVE_MESSAGE_METHOD,
            "params": message,
            "id": id,
        });

        tracing::debug!("{} -> {} ({})", RECEIVE_MESSAGE_METHOD, url, message.sender);

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify(address, e))?;

        if !response.status().is_success() {
            return Err(RpcError::Rejected(format!("HTTP {}", response.status())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RpcError::Protocol(e.to_string()))?;

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(RpcError::Rejected(message.to_string()));
        }

        match body.get("result") {
            Some(Value::Bool(true)) => Ok(()),
            other => Err(RpcError::Rejected(format!("unexpected result: {other:?}"))),
        }
    }
}

fn classify(address: &PeerAddress, e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout(address.to_string())
    } else if e.is_connect() || e.is_request() {
        RpcError::Unreachable(address.to_string())
    } else {
        RpcError::Protocol(e.to_string())
    }
}

/// Server statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RpcServerStats {
    pub total_requests: u64,
    pub accepted_messages: u64,
    pub failed_requests: u64,
}

/// Minimal HTTP/1.1 JSON-RPC server
pub struct RpcServer {
    listener: TcpListener,
    sink: Arc<dyn MessageSink>,
    stats: Arc<RwLock<RpcServerStats>>,
}

impl RpcServer {
    pub async fn bind(addr: &str, sink: Arc<dyn MessageSink>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            sink,
            stats: Arc::new(RwLock::new(RpcServerStats::default())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> RpcServerStats {
        self.stats.read().clone()
    }

    /// Accept connections until the task is dropped
    pub async fn run(&self) -> std::io::Result<()> {
        tracing::info!("RPC server listening on {}", self.local_addr()?);

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let sink = self.sink.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, sink, stats.clone()).await {
                    stats.write().failed_requests += 1;
                    tracing::debug!("RPC connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    sink: Arc<dyn MessageSink>,
    stats: Arc<RwLock<RpcServerStats>>,
) -> std::io::Result<()> {
    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };
    stats.write().total_requests += 1;

    let response = if request.method == "POST" {
        let (body, accepted) = handle_json_rpc(&request.body, sink.as_ref());
        if accepted {
            stats.write().accepted_messages += 1;
        }
        format!(
            "HTTP/1.1 200 OK\r\n\
            Content-Type: application/json\r\n\
            Content-Length: {}\r\n\
            Connection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

struct HttpRequest {
    method: String,
    body: String,
}

/// Read headers, then as much body as Content-Length announces
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<HttpRequest>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request headers too large",
            ));
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let method = head.split_whitespace().next().unwrap_or("").to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0)
        .min(MAX_REQUEST_BYTES);

    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body_end = buf.len().min(body_start + content_length);
    let body = String::from_utf8_lossy(&buf[body_start..body_end]).to_string();
    Ok(Some(HttpRequest { method, body }))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Dispatch one JSON-RPC request body.
///
/// Returns the response body and whether a message reached the sink.
pub fn handle_json_rpc(body: &str, sink: &dyn MessageSink) -> (String, bool) {
    let request: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => return (error_response(Value::Null, -32700, &format!("Parse error: {e}")), false),
    };

    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    if method != RECEIVE_MESSAGE_METHOD {
        return (
            error_response(id, -32601, &format!("Method not found: {method}")),
            false,
        );
    }

    let params = request.get("params").cloned().unwrap_or(Value::Null);
    let message = match parse_params(params) {
        Ok(message) => message,
        Err(reason) => return (error_response(id, -32602, &format!("Invalid params: {reason}")), false),
    };

    let accepted = sink.receive_message(message);
    let response = json!({
        "jsonrpc": "2.0",
        "result": accepted,
        "id": id,
    });
    (response.to_string(), accepted)
}

fn parse_params(params: Value) -> Result<DirectMessage, String> {
    match params {
        Value::Object(_) => serde_json::from_value(params).map_err(|e| e.to_string()),
        Value::Array(items) => {
            let text = |i: usize| items.get(i).and_then(Value::as_str).map(str::to_string);
            let (Some(sender), Some(message), Some(timestamp)) = (text(0), text(1), text(2)) else {
                return Err("expected [sender, message, timestamp, kind?]".to_string());
            };
            let kind = match items.get(3) {
                Some(Value::Null) | None => None,
                Some(value) => Some(serde_json::from_value(value.clone()).map_err(|e| e.to_string())?),
            };
            Ok(DirectMessage {
                sender,
                message,
                timestamp,
                kind,
            })
        }
        _ => Err("params must be an object or an array".to_string()),
    }
}

fn error_response(id: Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message,
        },
        "id": id,
    })
    .to_string()
}
