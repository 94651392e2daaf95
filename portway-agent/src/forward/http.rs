//! HTTP local forwarder.
//!
//! Replays each `DataForward` against the local service and produces exactly
//! one `DataResponse` — local failures become synthetic 502/500 responses,
//! never link-level errors.

use portway_common::constants::LOCAL_HTTP_TIMEOUT_SECS;
use portway_common::{AgentError, Result};
use portway_protocol::{DataForward, DataResponse};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct HttpForwarder {
    tunnel_id: String,
    local_port: u16,
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(tunnel_id: String, local_port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LOCAL_HTTP_TIMEOUT_SECS))
            .no_proxy()
            .build()
            .map_err(|e| AgentError::Connection(format!("local http client: {e}")))?;
        Ok(Self {
            tunnel_id,
            local_port,
            client,
        })
    }

    /// Execute one forwarded request. Infallible by design: every outcome is
    /// expressed as a `DataResponse`.
    pub async fn handle(&self, request: &DataForward) -> DataResponse {
        let started = Instant::now();

        let path = if request.path.is_empty() {
            "/"
        } else {
            request.path.as_str()
        };
        let url = format!("http://127.0.0.1:{}{}", self.local_port, path);

        let Ok(method) = reqwest::Method::from_bytes(request.method.as_bytes()) else {
            return error_response(request, 500, "Failed to create request");
        };
        let Some(headers) = self.build_headers(request) else {
            return error_response(request, 500, "Failed to create request");
        };

        let response = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(request.data.to_vec())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                warn!(
                    tunnel_id = %self.tunnel_id,
                    request_id = %request.request_id,
                    local_port = self.local_port,
                    error = %e,
                    "local service unreachable"
                );
                return error_response(request, 502, "Failed to connect to local service");
            }
            Err(e) => {
                warn!(
                    tunnel_id = %self.tunnel_id,
                    request_id = %request.request_id,
                    error = %e,
                    "local request failed"
                );
                return error_response(request, 500, "Failed to read response");
            }
        };

        let status_code = response.status().as_u16();
        // First value per header name; later duplicates are dropped.
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(canonical_header_name(name.as_str()))
                .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    tunnel_id = %self.tunnel_id,
                    request_id = %request.request_id,
                    error = %e,
                    "failed to read local response body"
                );
                return error_response(request, 500, "Failed to read response");
            }
        };

        debug!(
            tunnel_id = %self.tunnel_id,
            request_id = %request.request_id,
            connection_id = %request.connection_id,
            status_code,
            duration_ms = started.elapsed().as_millis() as u64,
            response_size = body.len(),
            "local request completed"
        );

        DataResponse {
            connection_id: request.connection_id.clone(),
            request_id: request.request_id.clone(),
            data: body,
            status_code,
            headers,
        }
    }

    /// Verbatim copy of the forwarded headers plus the standard forwarding
    /// set. `None` when a header pair cannot be represented.
    fn build_headers(&self, request: &DataForward) -> Option<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
            let value = HeaderValue::from_str(value).ok()?;
            headers.insert(name, value);
        }

        headers.insert("x-forwarded-for", HeaderValue::from_static("127.0.0.1"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        if let Some(host) = request.headers.get("Host") {
            headers.insert("x-forwarded-host", HeaderValue::from_str(host).ok()?);
        }
        headers.insert("x-tunnel-id", HeaderValue::from_str(&self.tunnel_id).ok()?);
        Some(headers)
    }
}

/// Synthetic response for a local failure, mirroring the server-visible
/// JSON shape `{"error":"...","status":NNN}`.
fn error_response(request: &DataForward, status: u16, message: &str) -> DataResponse {
    DataResponse {
        connection_id: request.connection_id.clone(),
        request_id: request.request_id.clone(),
        data: format!("{{\"error\":\"{message}\",\"status\":{status}}}").into_bytes().into(),
        status_code: status,
        headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
    }
}

/// Canonical MIME header casing (`content-type` -> `Content-Type`), the form
/// the server emits and expects.
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for ch in name.chars() {
        if upper_next {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
        upper_next = ch == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn forward(port_path: &str, method: &str) -> DataForward {
        DataForward {
            connection_id: "conn-123".into(),
            request_id: "req-456".into(),
            data: Bytes::new(),
            headers: HashMap::from([("Host".to_string(), "t.example".to_string())]),
            method: method.into(),
            path: port_path.into(),
        }
    }

    /// Minimal local HTTP service answering every request with a fixed body.
    async fn start_local_service(body: &'static str, content_type: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_happy_path_returns_local_response() {
        let port = start_local_service("{\"message\":\"Hello, World!\"}", "application/json").await;
        let forwarder = HttpForwarder::new("tun_http".into(), port).unwrap();

        let response = forwarder.handle(&forward("/api/test", "GET")).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.request_id, "req-456");
        assert_eq!(response.connection_id, "conn-123");
        assert_eq!(response.data, Bytes::from_static(b"{\"message\":\"Hello, World!\"}"));
        assert_eq!(
            response.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn test_local_service_down_yields_502() {
        // Bind then drop to get a port with no listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let forwarder = HttpForwarder::new("tun_http".into(), port).unwrap();
        let response = forwarder.handle(&forward("/api/test", "GET")).await;

        assert_eq!(response.status_code, 502);
        assert_eq!(
            response.data,
            Bytes::from_static(b"{\"error\":\"Failed to connect to local service\",\"status\":502}")
        );
        assert_eq!(
            response.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn test_invalid_method_yields_500() {
        let forwarder = HttpForwarder::new("tun_http".into(), 1).unwrap();
        let response = forwarder.handle(&forward("/", "NOT A METHOD")).await;
        assert_eq!(response.status_code, 500);
        assert!(String::from_utf8_lossy(&response.data).contains("Failed to create request"));
    }

    #[tokio::test]
    async fn test_empty_path_defaults_to_root() {
        let port = start_local_service("ok", "text/plain").await;
        let forwarder = HttpForwarder::new("tun_http".into(), port).unwrap();
        let response = forwarder.handle(&forward("", "GET")).await;
        assert_eq!(response.status_code, 200);
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header_name("etag"), "Etag");
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(&forward("/", "GET"), 502, "Failed to connect to local service");
        let parsed: serde_json::Value = serde_json::from_slice(&response.data).unwrap();
        assert_eq!(parsed["status"], 502);
        assert_eq!(parsed["error"], "Failed to connect to local service");
    }
}
