//! Reverse HTTP tunnel multiplexer.
//!
//! Browsers reach dev servers running inside agent worktrees through the
//! control server: the server pushes `http_request` frames over the relay
//! socket, the hub forwards them to the agent's local port, and the
//! response travels back enveloped as `http_response`. Redirects are
//! returned to the browser, not followed; hop-by-hop headers are stripped
//! both ways.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::sync::Semaphore;

use crate::constants::{TUNNEL_MAX_IN_FLIGHT, TUNNEL_PORT_RANGE, TUNNEL_REQUEST_TIMEOUT};
use crate::server::SessionKey;

/// Request headers never forwarded to the local server.
const STRIPPED_REQUEST_HEADERS: &[&str] = &["host", "connection", "keep-alive", "upgrade"];

/// Hop-by-hop (and transport-managed) headers never returned to the
/// browser.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "content-length",
];

/// A forwarded HTTP request from the server.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    /// Echoed in the response.
    pub request_id: String,
    /// Target agent.
    pub session_key: SessionKey,
    /// HTTP method.
    pub method: String,
    /// Path including query string.
    pub path: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Base64 body, absent when empty.
    pub body_b64: Option<String>,
}

/// The enveloped response sent back to the server.
#[derive(Debug, Clone)]
pub struct TunnelResponse {
    /// Echoed request id.
    pub request_id: String,
    /// Status code.
    pub status: u16,
    /// Status text.
    pub status_text: String,
    /// Response headers, hop-by-hop stripped.
    pub headers: HashMap<String, String>,
    /// Base64 body, absent when empty.
    pub body_b64: Option<String>,
}

impl TunnelResponse {
    fn error(request_id: &str, status: u16, status_text: &str, body: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            status,
            status_text: status_text.to_string(),
            headers: HashMap::from([(
                "content-type".to_string(),
                "text/plain".to_string(),
            )]),
            body_b64: Some(BASE64.encode(body)),
        }
    }
}

/// Per-agent port registry plus the forwarding pool.
///
/// Port allocation is guarded by one mutex held only during allocation;
/// once assigned, a port belongs to its agent until unregistered. Each
/// tunnel admits at most [`TUNNEL_MAX_IN_FLIGHT`] concurrent requests;
/// excess acquisitions queue FIFO on the semaphore.
pub struct TunnelMultiplexer {
    inner: Arc<Mutex<Registry>>,
    client: reqwest::Client,
}

#[derive(Default)]
struct Registry {
    ports: HashMap<SessionKey, u16>,
    limiters: HashMap<SessionKey, Arc<Semaphore>>,
}

impl std::fmt::Debug for TunnelMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered = self.inner.lock().map(|r| r.ports.len()).unwrap_or(0);
        f.debug_struct("TunnelMultiplexer")
            .field("registered", &registered)
            .finish_non_exhaustive()
    }
}

impl Default for TunnelMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelMultiplexer {
    /// Create an empty multiplexer.
    #[must_use]
    pub fn new() -> Self {
        // Redirects go back to the browser so OAuth flows can leave the
        // tunnel; reqwest must not follow them.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            client,
        }
    }

    /// Allocate a free port in the tunnel range, skipping ports already
    /// owned by live agents. Returns `None` when the range is exhausted.
    #[must_use]
    pub fn allocate_port(&self) -> Option<u16> {
        let registry = self.inner.lock().unwrap();
        let taken: Vec<u16> = registry.ports.values().copied().collect();
        drop(registry);

        for port in TUNNEL_PORT_RANGE {
            if taken.contains(&port) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Some(port);
            }
        }
        None
    }

    /// Bind `session_key` to `port`.
    pub fn register(&self, session_key: SessionKey, port: u16) {
        let mut registry = self.inner.lock().unwrap();
        registry
            .limiters
            .insert(session_key.clone(), Arc::new(Semaphore::new(TUNNEL_MAX_IN_FLIGHT)));
        registry.ports.insert(session_key, port);
    }

    /// Drop the binding when an agent ends.
    pub fn unregister(&self, session_key: &SessionKey) {
        let mut registry = self.inner.lock().unwrap();
        registry.ports.remove(session_key);
        registry.limiters.remove(session_key);
    }

    /// The port bound to an agent, if any.
    #[must_use]
    pub fn port_of(&self, session_key: &SessionKey) -> Option<u16> {
        self.inner.lock().unwrap().ports.get(session_key).copied()
    }

    /// Forward one request to the agent's local server.
    ///
    /// 502 when the tunnel is unregistered or the local server refuses;
    /// 504 on the 30 s deadline.
    pub async fn handle_request(&self, request: TunnelRequest) -> TunnelResponse {
        let (port, limiter) = {
            let registry = self.inner.lock().unwrap();
            let Some(port) = registry.ports.get(&request.session_key).copied() else {
                log::warn!("[tunnel] {} not registered", request.session_key);
                return TunnelResponse::error(
                    &request.request_id,
                    502,
                    "Bad Gateway",
                    "tunnel not registered",
                );
            };
            let limiter = registry
                .limiters
                .get(&request.session_key)
                .cloned()
                .unwrap_or_else(|| Arc::new(Semaphore::new(TUNNEL_MAX_IN_FLIGHT)));
            (port, limiter)
        };

        // FIFO admission; the permit is held for the whole forward.
        let _permit = match limiter.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return TunnelResponse::error(
                    &request.request_id,
                    502,
                    "Bad Gateway",
                    "tunnel closed",
                )
            }
        };

        self.forward(port, request).await
    }

    async fn forward(&self, port: u16, request: TunnelRequest) -> TunnelResponse {
        let url = format!("http://127.0.0.1:{}{}", port, request.path);

        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return TunnelResponse::error(
                    &request.request_id,
                    400,
                    "Bad Request",
                    "invalid method",
                )
            }
        };

        let mut req = self.client.request(method, &url);
        for (key, value) in &request.headers {
            if STRIPPED_REQUEST_HEADERS.contains(&key.to_lowercase().as_str()) {
                continue;
            }
            req = req.header(key, value);
        }

        if let Some(body_b64) = &request.body_b64 {
            match BASE64.decode(body_b64) {
                Ok(body) if !body.is_empty() => req = req.body(body),
                Ok(_) => {}
                Err(_) => {
                    return TunnelResponse::error(
                        &request.request_id,
                        400,
                        "Bad Request",
                        "invalid body encoding",
                    )
                }
            }
        }

        let sent = tokio::time::timeout(TUNNEL_REQUEST_TIMEOUT, req.send()).await;

        match sent {
            Err(_) => {
                log::warn!("[tunnel] request {} timed out", request.request_id);
                TunnelResponse::error(
                    &request.request_id,
                    504,
                    "Gateway Timeout",
                    "local server did not respond in time",
                )
            }
            Ok(Err(e)) => {
                log::warn!("[tunnel] forward to port {} failed: {}", port, e);
                TunnelResponse::error(
                    &request.request_id,
                    502,
                    "Bad Gateway",
                    &format!("failed to connect to local server on port {port}"),
                )
            }
            Ok(Ok(response)) => {
                let status = response.status();
                let headers: HashMap<String, String> = response
                    .headers()
                    .iter()
                    .filter(|(name, _)| {
                        !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str())
                    })
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.to_string(), v.to_string()))
                    })
                    .collect();

                let body = match tokio::time::timeout(
                    TUNNEL_REQUEST_TIMEOUT,
                    response.bytes(),
                )
                .await
                {
                    Ok(Ok(bytes)) => bytes,
                    _ => {
                        return TunnelResponse::error(
                            &request.request_id,
                            504,
                            "Gateway Timeout",
                            "local server body read timed out",
                        )
                    }
                };

                TunnelResponse {
                    request_id: request.request_id,
                    status: status.as_u16(),
                    status_text: status
                        .canonical_reason()
                        .unwrap_or("Unknown")
                        .to_string(),
                    headers,
                    body_b64: if body.is_empty() {
                        None
                    } else {
                        Some(BASE64.encode(&body))
                    },
                }
            }
        }
    }
}

impl Clone for TunnelMultiplexer {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            client: self.client.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> SessionKey {
        SessionKey::from_raw(raw)
    }

    fn request(session_key: &SessionKey) -> TunnelRequest {
        TunnelRequest {
            request_id: "r1".into(),
            session_key: session_key.clone(),
            method: "GET".into(),
            path: "/".into(),
            headers: HashMap::new(),
            body_b64: None,
        }
    }

    #[test]
    fn test_allocate_port_in_range() {
        let mux = TunnelMultiplexer::new();
        let port = mux.allocate_port().expect("a free port in 4001..5000");
        assert!(TUNNEL_PORT_RANGE.contains(&port));
    }

    #[test]
    fn test_registered_ports_are_unique() {
        let mux = TunnelMultiplexer::new();
        let a = mux.allocate_port().unwrap();
        mux.register(key("agent-a"), a);
        let b = mux.allocate_port().unwrap();
        assert_ne!(a, b);

        mux.register(key("agent-b"), b);
        assert_eq!(mux.port_of(&key("agent-a")), Some(a));
        assert_eq!(mux.port_of(&key("agent-b")), Some(b));

        mux.unregister(&key("agent-a"));
        assert_eq!(mux.port_of(&key("agent-a")), None);
    }

    #[tokio::test]
    async fn test_unregistered_tunnel_returns_502() {
        let mux = TunnelMultiplexer::new();
        let response = mux.handle_request(request(&key("ghost"))).await;
        assert_eq!(response.status, 502);
        assert_eq!(response.request_id, "r1");
        let body = BASE64.decode(response.body_b64.unwrap()).unwrap();
        assert_eq!(body, b"tunnel not registered");
    }

    #[tokio::test]
    async fn test_roundtrip_against_local_server() {
        use std::io::{Read, Write};

        // Trivial blocking HTTP server on an allocated port.
        let mux = TunnelMultiplexer::new();
        let port = mux.allocate_port().unwrap();
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\nX-Custom: yes\r\n\r\nok",
                );
            }
        });

        let session = key("acme-demo-42");
        mux.register(session.clone(), port);

        let response = mux.handle_request(request(&session)).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.status_text, "OK");
        let body = BASE64.decode(response.body_b64.unwrap()).unwrap();
        assert_eq!(body, b"ok");

        // Hop-by-hop headers are gone, app headers survive.
        assert!(!response.headers.contains_key("connection"));
        assert!(!response.headers.contains_key("transfer-encoding"));
        assert_eq!(response.headers.get("x-custom").map(String::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn test_connection_refused_returns_502() {
        let mux = TunnelMultiplexer::new();
        let port = mux.allocate_port().unwrap();
        // Register but never listen.
        let session = key("dead-server");
        mux.register(session.clone(), port);

        let response = mux.handle_request(request(&session)).await;
        assert_eq!(response.status, 502);
    }
}
