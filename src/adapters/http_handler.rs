//! Request dispatcher: resolves each inbound request against the current
//! routing snapshot, picks a backend, and forwards.
//!
//! Resolution failures become error responses here; they are never retried
//! and a request is never forwarded once resolution or selection has failed.
//! WebSocket upgrades follow the identical resolution path before the
//! connection is handed to the raw byte tunnel.
use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body as AxumBody,
    http::{HeaderMap, StatusCode, header},
};
use hyper::{Request, Response, header::HeaderValue};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use uuid::Uuid;

use crate::{
    core::{
        resolver::{Resolved, ResolveError, resolve},
        selector::{SelectError, TargetSelector},
        sync::SharedRoutes,
    },
    ports::http_client::HttpClient,
};

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Per-listener request handler. Cheap to clone behind an `Arc`; one
/// instance serves every listener, with the listener's port passed per call.
pub struct HttpHandler {
    routes: SharedRoutes,
    selector: Arc<dyn TargetSelector>,
    http_client: Arc<dyn HttpClient>,
}

impl HttpHandler {
    pub fn new(
        routes: SharedRoutes,
        selector: Arc<dyn TargetSelector>,
        http_client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            routes,
            selector,
            http_client,
        }
    }

    /// Dispatch one request arriving on `port` from `client_addr`.
    pub async fn handle_request(
        &self,
        mut req: Request<AxumBody>,
        client_addr: SocketAddr,
        port: u16,
        is_tls: bool,
    ) -> Response<AxumBody> {
        let Some(hostname) = extract_hostname(req.headers()) else {
            return error_response(StatusCode::BAD_REQUEST, "missing or invalid Host header");
        };

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        tracing::debug!(
            hostname,
            port,
            method = %req.method(),
            uri = %req.uri(),
            request_id,
            "incoming request"
        );

        // One snapshot per resolution; updates land in later loads.
        let tree = self.routes.load();
        let resolved = match resolve(&tree, &hostname, port) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::info!(hostname, port, error = %e, "resolution failed");
                return resolve_error_response(&e);
            }
        };

        let targets = match resolved {
            Resolved::Redirect(location) => return redirect_response(&location),
            Resolved::Targets(targets) => targets,
        };

        let backend = match self.selector.select(client_addr.ip(), &targets) {
            Ok(backend) => backend,
            Err(SelectError::NoTarget) => {
                tracing::warn!(hostname, port, "target set is empty or weightless");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "no backend available");
            }
        };

        set_forwarded_headers(
            req.headers_mut(),
            client_addr,
            is_tls,
            &request_id,
        );

        if is_upgrade_request(&req) {
            return self.tunnel_upgrade(req, &backend, &hostname, &request_id).await;
        }
        self.forward(req, &backend, &hostname).await
    }

    /// Rewrite the URI to the selected backend and forward through the
    /// HTTP client port.
    async fn forward(
        &self,
        mut req: Request<AxumBody>,
        backend: &str,
        hostname: &str,
    ) -> Response<AxumBody> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let backend_uri = format!("http://{backend}{path_and_query}");

        match backend_uri.parse() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => {
                tracing::error!(hostname, backend, error = %e, "invalid backend address");
                return error_response(StatusCode::BAD_GATEWAY, "invalid backend address");
            }
        }

        match self.http_client.send_request(req).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(hostname, backend, error = %e, "failed to forward request");
                error_response(StatusCode::BAD_GATEWAY, "failed to reach backend")
            }
        }
    }

    /// Tunnel a WebSocket (or other) upgrade: replay the upgrade request to
    /// the backend over TCP, relay its 101, then copy bytes both ways.
    async fn tunnel_upgrade(
        &self,
        req: Request<AxumBody>,
        backend: &str,
        hostname: &str,
        request_id: &str,
    ) -> Response<AxumBody> {
        let raw_request = build_upgrade_request(&req);

        let backend_addr = with_default_port(backend, 80);
        let mut backend_stream = match TcpStream::connect(&backend_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(hostname, backend, error = %e, "failed to connect for upgrade");
                return error_response(StatusCode::BAD_GATEWAY, "failed to reach backend");
            }
        };

        if let Err(e) = backend_stream.write_all(&raw_request).await {
            tracing::error!(hostname, backend, error = %e, "failed to send upgrade request");
            return error_response(StatusCode::BAD_GATEWAY, "failed to reach backend");
        }

        let mut response_buf = vec![0u8; 4096];
        let n = match backend_stream.read(&mut response_buf).await {
            Ok(n) if n > 0 => n,
            Ok(_) => {
                tracing::error!(hostname, backend, "backend closed before upgrade response");
                return error_response(StatusCode::BAD_GATEWAY, "backend closed connection");
            }
            Err(e) => {
                tracing::error!(hostname, backend, error = %e, "failed reading upgrade response");
                return error_response(StatusCode::BAD_GATEWAY, "failed to reach backend");
            }
        };

        let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
            tracing::error!(hostname, backend, "unparseable upgrade response from backend");
            return error_response(StatusCode::BAD_GATEWAY, "invalid backend response");
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            tracing::info!(hostname, backend, %status, "backend declined upgrade");
            let mut builder = Response::builder().status(status);
            for (name, value) in &response_headers {
                if let Ok(hv) = HeaderValue::from_str(value) {
                    builder = builder.header(name.as_str(), hv);
                }
            }
            return builder
                .body(AxumBody::empty())
                .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "invalid response"));
        }

        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &response_headers {
            let lowered = name.to_ascii_lowercase();
            if lowered == "content-length" || lowered == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                builder = builder.header(name.as_str(), hv);
            }
        }
        let response = builder
            .body(AxumBody::empty())
            .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "invalid response"));

        let hostname = hostname.to_string();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client_io = hyper_util::rt::TokioIo::new(upgraded);
                    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_stream).await
                    {
                        Ok((sent, received)) => {
                            tracing::debug!(
                                hostname,
                                request_id,
                                sent,
                                received,
                                "tunnel closed"
                            );
                        }
                        Err(e) => {
                            tracing::debug!(hostname, request_id, error = %e, "tunnel error");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(hostname, request_id, error = %e, "client upgrade failed");
                }
            }
        });

        response
    }
}

fn extract_hostname(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Reject anything outside the hostname alphabet; this also keeps
            // log lines injection-free.
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

/// Overwrite forwarded headers rather than appending; this proxy is the
/// first trusted hop and client-supplied values cannot be trusted.
fn set_forwarded_headers(
    headers: &mut HeaderMap,
    client_addr: SocketAddr,
    is_tls: bool,
    request_id: &str,
) {
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
}

/// Check if a request is a WebSocket/HTTP upgrade request
fn is_upgrade_request(req: &Request<AxumBody>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(header::UPGRADE)
}

/// Build the raw HTTP/1.1 upgrade request to replay to the backend. The
/// original Host header is preserved so virtual-hosted backends keep working.
fn build_upgrade_request(req: &Request<AxumBody>) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's upgrade response head: status plus headers.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    parts.next()?;
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Append a default port to a backend address that lacks one.
fn with_default_port(backend: &str, default: u16) -> String {
    match backend.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => backend.to_string(),
        _ => format!("{backend}:{default}"),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<AxumBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(AxumBody::from(message.to_string()))
        .unwrap_or_else(|_| Response::new(AxumBody::from("internal error")))
}

fn redirect_response(location: &str) -> Response<AxumBody> {
    match HeaderValue::from_str(location) {
        Ok(value) => Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, value)
            .body(AxumBody::empty())
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "bad redirect")),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "bad redirect target"),
    }
}

fn resolve_error_response(error: &ResolveError) -> Response<AxumBody> {
    match error {
        ResolveError::AliasCycle(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "routing misconfigured")
        }
        ResolveError::DomainNotConfigured(_)
        | ResolveError::SubdomainNotConfigured(_)
        | ResolveError::NoMatch { .. }
        | ResolveError::EmptyRecord(_) => {
            error_response(StatusCode::NOT_FOUND, "no route for host")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::SelectionStrategy,
        core::{selector::SelectorFactory, sync::shared_routes, tree::ConfigTree},
        ports::http_client::HttpClientResult,
    };

    /// Client double that records the forwarded request.
    #[derive(Default)]
    struct RecordingClient {
        seen: Mutex<Option<(hyper::Uri, HeaderMap)>>,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_request(
            &self,
            req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            *self.seen.lock().unwrap() = Some((req.uri().clone(), req.headers().clone()));
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(AxumBody::empty())
                .unwrap())
        }
    }

    fn handler_with(tree: ConfigTree) -> (HttpHandler, Arc<RecordingClient>) {
        let routes = shared_routes();
        routes.store(Arc::new(tree));
        let client = Arc::new(RecordingClient::default());
        let handler = HttpHandler::new(
            routes,
            Arc::from(SelectorFactory::create_strategy(SelectionStrategy::IpHash)),
            client.clone(),
        );
        (handler, client)
    }

    fn request(host: &str) -> Request<AxumBody> {
        Request::builder()
            .uri("/some/path?q=1")
            .header(header::HOST, host)
            .body(AxumBody::empty())
            .unwrap()
    }

    fn client_addr() -> SocketAddr {
        "203.0.113.9:55555".parse().unwrap()
    }

    #[test]
    fn hostname_extraction_rules() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("Example.COM:8080"));
        assert_eq!(extract_hostname(&headers).as_deref(), Some("example.com"));

        headers.insert(header::HOST, HeaderValue::from_static("bad host!"));
        assert_eq!(extract_hostname(&headers), None);

        headers.remove(header::HOST);
        assert_eq!(extract_hostname(&headers), None);
    }

    #[test]
    fn upgrade_detection_needs_both_headers() {
        let mut req = request("example.com");
        assert!(!is_upgrade_request(&req));

        req.headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        req.headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&req));
    }

    #[test]
    fn default_port_is_appended_when_missing() {
        assert_eq!(with_default_port("10.0.0.1", 80), "10.0.0.1:80");
        assert_eq!(with_default_port("10.0.0.1:3000", 80), "10.0.0.1:3000");
    }

    #[tokio::test]
    async fn missing_host_header_is_bad_request() {
        let (handler, _) = handler_with(ConfigTree::default());
        let req = Request::builder()
            .uri("/")
            .body(AxumBody::empty())
            .unwrap();
        let response = handler.handle_request(req, client_addr(), 80, false).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_domain_is_not_found() {
        let (handler, client) = handler_with(ConfigTree::default());
        let response = handler
            .handle_request(request("example.com"), client_addr(), 80, false)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(client.seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn redirect_record_returns_found() {
        let mut tree = ConfigTree::default();
        tree.set("domains/example.com/redirect", "https://elsewhere.example/");
        let (handler, client) = handler_with(tree);

        let response = handler
            .handle_request(request("example.com"), client_addr(), 80, false)
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://elsewhere.example/"
        );
        assert!(client.seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_target_set_is_service_unavailable() {
        let mut tree = ConfigTree::default();
        tree.mkdir("domains/example.com/ports/80/targets");
        let (handler, client) = handler_with(tree);

        let response = handler
            .handle_request(request("example.com"), client_addr(), 80, false)
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(client.seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn forwards_with_rewritten_uri_and_headers() {
        let mut tree = ConfigTree::default();
        tree.set("domains/example.com/ports/80/targets/10.0.0.1:3000", "1");
        let (handler, client) = handler_with(tree);

        let response = handler
            .handle_request(request("example.com"), client_addr(), 80, false)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let seen = client.seen.lock().unwrap();
        let (uri, headers) = seen.as_ref().expect("request should be forwarded");
        assert_eq!(uri.to_string(), "http://10.0.0.1:3000/some/path?q=1");
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "203.0.113.9");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert!(headers.contains_key(X_REQUEST_ID));
    }

    #[test]
    fn parses_upgrade_response_head() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers.iter().any(|(n, v)| n == "Upgrade" && v == "websocket"));
    }
}
