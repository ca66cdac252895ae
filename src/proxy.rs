//! Proxy server implementation
//! Forwards every request to a single fixed backend origin, rewriting HTML
//! responses so the backend's absolute URLs point at the public hostname

use crate::headers;
use crate::rewrite::RewriteRules;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures_util::{future, TryStreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyDataStream, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{
    HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use url::Url;

/// Backend origin used when none is configured
pub const DEFAULT_BACKEND_ORIGIN: &str = "https://backend.example";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body served to clients: buffered for rewritten HTML, streamed
/// for everything else
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Proxy server configuration
#[derive(Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub backend: Url,
    pub set_referer: bool,
    pub connect_timeout: Duration,
    pub dispatch_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            backend: Url::parse(DEFAULT_BACKEND_ORIGIN).expect("default backend origin parses"),
            set_referer: true,
            connect_timeout: Duration::from_secs(10),
            dispatch_timeout: Duration::from_secs(30),
        }
    }
}

/// Why a request could not be answered from the backend. Every variant
/// carries the target that was being attempted, for the error response.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid target URL: {source}")]
    Resolve {
        target: String,
        #[source]
        source: url::ParseError,
    },
    #[error("backend request failed: {source}")]
    Transport {
        target: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("backend did not respond within {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("failed to read backend response body: {source}")]
    Body {
        target: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode backend response body: {source}")]
    Decode {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    /// The target URL the proxy was attempting when it failed
    pub fn target(&self) -> &str {
        match self {
            Self::Resolve { target, .. }
            | Self::Transport { target, .. }
            | Self::Timeout { target, .. }
            | Self::Body { target, .. }
            | Self::Decode { target, .. } => target,
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    client: reqwest::Client,
    rules: RewriteRules,
}

impl ProxyServer {
    /// Create a new proxy server for the configured backend
    pub fn new(config: ProxyConfig) -> Result<Self> {
        if config.backend.host_str().is_none() {
            return Err(anyhow!("backend URL {} has no host", config.backend));
        }

        // Redirects from the backend are followed here, transparently;
        // clients only ever see the final response
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to build outbound HTTP client")?;

        let rules = RewriteRules::new(&config.backend)?;

        Ok(Self {
            config,
            client,
            rules,
        })
    }

    /// Start the proxy server
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port).parse()?;

        info!("Proxy server starting on HTTP:{}", self.config.port);
        info!("Forwarding all requests to {}", self.config.backend);

        let listener = TcpListener::bind(addr).await?;
        info!("HTTP server listening on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let server = self.clone();

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request; the connection never dies on an error
    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        match self.process_request(req, remote_addr).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Request error: {} (target: {})", e, e.target());
                Ok(Self::failure_response(&e))
            }
        }
    }

    /// Process request
    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let method = req.method().clone();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        debug!("{} {} from {}", method, path_and_query, remote_addr);

        // The origin clients addressed; the rewrite target for HTML
        let public_origin = match Self::public_origin(&req) {
            Some(origin) => origin,
            None => {
                return Ok(Self::text_response(
                    StatusCode::BAD_REQUEST,
                    "Missing or invalid Host header",
                ))
            }
        };

        let target = self.resolve_target(&path_and_query)?;

        if Self::is_websocket_upgrade(&req) {
            return self.handle_websocket_proxy(req, target).await;
        }

        let (parts, body) = req.into_parts();
        let outbound_headers = headers::outbound_request_headers(
            &parts.headers,
            &self.config.backend,
            self.config.set_referer,
        );

        let mut outbound = self
            .client
            .request(parts.method, target.clone())
            .headers(outbound_headers);

        if !body.is_end_stream() {
            outbound = outbound.body(reqwest::Body::wrap_stream(BodyDataStream::new(body)));
        }

        let response = self.dispatch(outbound, target.as_str()).await?;

        if !response.status().is_success() && response.status() != StatusCode::NOT_MODIFIED {
            warn!("{} {} answered {}", method, target, response.status());
        }

        if Self::is_html_response(&response) {
            self.rewrite_html_response(response, &public_origin, target.as_str())
                .await
        } else {
            self.stream_response(response)
        }
    }

    /// Join the backend origin with the inbound path-and-query
    fn resolve_target(&self, path_and_query: &str) -> Result<Url, ProxyError> {
        // Plain concatenation survives for diagnostics even when the join fails
        let attempted = format!(
            "{}{}",
            headers::origin_string(&self.config.backend),
            path_and_query
        );

        self.config
            .backend
            .join(path_and_query)
            .map_err(move |source| ProxyError::Resolve {
                target: attempted,
                source,
            })
    }

    /// Derive the origin clients addressed, from forwarded-proto hints and Host
    fn public_origin<T>(req: &Request<T>) -> Option<String> {
        let scheme = if Self::is_https_request(req) {
            "https"
        } else {
            "http"
        };
        let host = req.headers().get(HOST)?.to_str().ok()?;
        let url = Url::parse(&format!("{}://{}", scheme, host)).ok()?;
        url.host_str()?;
        Some(headers::origin_string(&url))
    }

    /// Check if request arrived over HTTPS (via fronting-proxy headers)
    fn is_https_request<T>(req: &Request<T>) -> bool {
        let header_is = |name: &str, expected: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case(expected))
                .unwrap_or(false)
        };

        header_is("x-forwarded-proto", "https")
            || header_is("x-forwarded-ssl", "on")
            || header_is("front-end-https", "on")
    }

    /// Check if request is a WebSocket upgrade
    fn is_websocket_upgrade<T>(req: &Request<T>) -> bool {
        req.headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Send the outbound request: one attempt, bounded by the dispatch timeout
    async fn dispatch(
        &self,
        outbound: reqwest::RequestBuilder,
        target: &str,
    ) -> Result<reqwest::Response, ProxyError> {
        match tokio::time::timeout(self.config.dispatch_timeout, outbound.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(ProxyError::Transport {
                target: target.to_string(),
                source,
            }),
            Err(_) => Err(ProxyError::Timeout {
                target: target.to_string(),
                timeout: self.config.dispatch_timeout,
            }),
        }
    }

    /// HTML responses get rewritten; everything else streams through as-is
    fn is_html_response(response: &reqwest::Response) -> bool {
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false)
    }

    /// Buffer, decode, and rewrite an HTML response
    async fn rewrite_html_response(
        &self,
        response: reqwest::Response,
        public_origin: &str,
        target: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let status = response.status();
        let upstream_headers = response.headers().clone();
        let encoding = upstream_headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        let body = response.bytes().await.map_err(|source| ProxyError::Body {
            target: target.to_string(),
            source,
        })?;

        let decoded =
            Self::decode_body(body, encoding.as_deref()).map_err(|source| ProxyError::Decode {
                target: target.to_string(),
                source,
            })?;

        let html = String::from_utf8_lossy(&decoded);
        let rewritten = Bytes::from(self.rules.rewrite_html(&html, public_origin));

        let mut headers =
            headers::rewrite_response_headers(&upstream_headers, &self.config.backend, true);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));

        let mut out = Response::new(Self::full_body(rewritten));
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }

    /// Decode a body the backend compressed anyway; Accept-Encoding is
    /// stripped on the way out, but a backend may not honor that
    fn decode_body(body: Bytes, encoding: Option<&str>) -> std::io::Result<Bytes> {
        match encoding.unwrap_or("") {
            "" | "identity" => Ok(body),
            "gzip" => {
                let mut decoded = Vec::new();
                flate2::read::GzDecoder::new(&body[..]).read_to_end(&mut decoded)?;
                Ok(Bytes::from(decoded))
            }
            "deflate" => {
                let mut decoded = Vec::new();
                flate2::read::ZlibDecoder::new(&body[..]).read_to_end(&mut decoded)?;
                Ok(Bytes::from(decoded))
            }
            "br" => {
                let mut decoded = Vec::new();
                brotli::Decompressor::new(&body[..], 4096).read_to_end(&mut decoded)?;
                Ok(Bytes::from(decoded))
            }
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported content-encoding: {}", other),
            )),
        }
    }

    /// Stream an opaque response through without buffering
    fn stream_response(
        &self,
        response: reqwest::Response,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let status = response.status();
        let headers =
            headers::rewrite_response_headers(response.headers(), &self.config.backend, false);

        let stream = response
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);

        let mut out = Response::new(StreamBody::new(stream).boxed());
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }

    /// Proxy a WebSocket upgrade and splice the two streams together.
    /// Frames are not inspected; both directions are copied until either
    /// side closes.
    async fn handle_websocket_proxy(
        &self,
        req: Request<Incoming>,
        target: Url,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        debug!("WebSocket proxying to: {}", target);

        let (parts, _body) = req.into_parts();
        let outbound_headers = headers::websocket_request_headers(&parts.headers);

        let outbound = self
            .client
            .request(parts.method.clone(), target.clone())
            .headers(outbound_headers);

        let upstream = self.dispatch(outbound, target.as_str()).await?;

        if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
            warn!(
                "WebSocket upgrade refused by backend: {}",
                upstream.status()
            );
            return self.stream_response(upstream);
        }

        // Mirror the negotiated handshake headers back to the client
        let mut response = Response::new(Self::empty_body());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        for (name, value) in upstream.headers() {
            if name.as_str().starts_with("sec-websocket-") {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        response
            .headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("websocket"));
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("Upgrade"));

        // Wait for both sides to finish upgrading, then tunnel
        let inbound = Request::from_parts(parts, ());
        tokio::spawn(async move {
            let upgrades = future::try_join(
                async { hyper::upgrade::on(inbound).await.map_err(BoxError::from) },
                async { upstream.upgrade().await.map_err(BoxError::from) },
            );

            match upgrades.await {
                Ok((client, mut backend)) => {
                    let mut client = TokioIo::new(client);
                    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut backend).await
                    {
                        debug!("WebSocket tunnel closed: {}", e);
                    }
                }
                Err(e) => warn!("WebSocket upgrade failed: {}", e),
            }
        });

        Ok(response)
    }

    /// Uniform error response: always identifies itself as proxy-generated
    /// and names the target it was attempting
    fn failure_response(error: &ProxyError) -> Response<ProxyBody> {
        let message = error.to_string();
        let body = format!("Proxy Error: {}\n\nTarget: {}", message, error.target());

        let mut response = Self::text_response(StatusCode::INTERNAL_SERVER_ERROR, &body);
        // Header values cannot carry CR/LF
        let sanitized = message.replace(['\r', '\n'], " ");
        if let Ok(value) = HeaderValue::from_str(&sanitized) {
            response.headers_mut().insert("x-error", value);
        }
        response
    }

    /// Create text response
    fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/plain")
            .body(Self::full_body(Bytes::from(body.to_string())))
            .unwrap()
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> ProxyBody {
        Full::new(bytes).map_err(|never| match never {}).boxed()
    }

    /// Create empty body
    fn empty_body() -> ProxyBody {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    }
}
