use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use reqwest::Url;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::body::RelayBody;
use crate::intercept::{InterceptState, Interceptor, Registry, ResponseHead, UpstreamRequest};
use crate::ProxyError;

/// Transparent reverse proxy with per-endpoint interceptors.
///
/// Every inbound request is cloned towards the configured upstream with
/// forwarding headers set, dispatched through the interceptor hooks in
/// order, and its response relayed back either buffered or chunk by chunk
/// depending on the upstream's transfer encoding.
pub struct ProxyEngine {
    upstream: Url,
    client: reqwest::Client,
    registry: Registry,
    port: u16,
}

impl ProxyEngine {
    pub fn new(upstream_url: &str, port: u16, upstream_timeout: Duration) -> anyhow::Result<Self> {
        let upstream = Url::parse(upstream_url).context("invalid upstream URL")?;
        anyhow::ensure!(
            upstream.host_str().is_some(),
            "upstream URL must include a host"
        );

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .timeout(upstream_timeout)
            .build()
            .context("failed to build upstream client")?;

        info!(port, upstream = %upstream, "server configuration");

        Ok(Self {
            upstream,
            client,
            registry: Registry::new(),
            port,
        })
    }

    /// Registers an interceptor for `(endpoint, method)`; `*` matches any
    /// method not covered by an exact registration.
    pub fn register(&self, endpoint: &str, method: &str, interceptor: Arc<dyn Interceptor>) {
        self.registry.register(endpoint, method, interceptor);
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(handle).with_state(self)
    }

    /// Binds the configured port and serves until `shutdown` resolves.
    pub async fn serve(
        self: Arc<Self>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("failed to bind port {}", self.port))?;
        self.serve_on(listener, shutdown).await
    }

    pub async fn serve_on(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("proxy server error")
    }

    async fn proxy(&self, req: axum::extract::Request, remote: String) -> Response {
        let started_at = Instant::now();
        let (parts, body) = req.into_parts();
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().map(str::to_string);
        let original_host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.host().map(str::to_string))
            .unwrap_or_default();

        let interceptor = self.registry.lookup(&path, method.as_str());
        let mut state = interceptor.as_ref().map(|i| i.create_state());

        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "error reading request body");
                let completion = RequestCompletion {
                    interceptor,
                    state,
                    status: StatusCode::BAD_GATEWAY,
                    method,
                    path,
                    remote,
                    started_at,
                };
                completion.finish(Some(ProxyError::Body(err.to_string())));
                return (StatusCode::BAD_GATEWAY, "Upstream error").into_response();
            }
        };

        let mut headers = parts.headers.clone();
        headers.remove(HOST);
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        if let Ok(value) = HeaderValue::from_str(&original_host) {
            headers.insert("x-forwarded-host", value);
        }
        if let Ok(value) = HeaderValue::from_str(&remote) {
            headers.insert("x-forwarded-for", value);
        }

        let mut upstream_request = UpstreamRequest {
            method: method.clone(),
            path: path.clone(),
            headers,
            body,
            host: upstream_authority(&self.upstream),
        };

        if let (Some(interceptor), Some(state)) = (interceptor.as_ref(), state.as_mut()) {
            if let Err(err) = interceptor.intercept_request(&mut upstream_request, state) {
                warn!(interceptor = %interceptor.name(), error = ?err, "error intercepting request");
            }
        }

        let mut url = self.upstream.clone();
        url.set_path(&upstream_request.path);
        url.set_query(query.as_deref());
        debug!(url = %url, "forwarding request upstream");

        // The upstream client frames the body itself.
        let mut send_headers = upstream_request.headers.clone();
        send_headers.remove(CONTENT_LENGTH);
        send_headers.remove(TRANSFER_ENCODING);

        let result = self
            .client
            .request(upstream_request.method.clone(), url)
            .headers(send_headers)
            .body(upstream_request.body.clone())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "upstream request failed");
                let completion = RequestCompletion {
                    interceptor,
                    state,
                    status: StatusCode::BAD_GATEWAY,
                    method,
                    path,
                    remote,
                    started_at,
                };
                completion.finish(Some(ProxyError::Transport(err)));
                return (StatusCode::BAD_GATEWAY, "Upstream error").into_response();
            }
        };

        let status = response.status();
        let head = ResponseHead {
            status,
            headers: response.headers().clone(),
        };

        if let (Some(interceptor), Some(state)) = (interceptor.as_ref(), state.as_mut()) {
            if let Err(err) = interceptor.intercept_response(&head, state) {
                warn!(interceptor = %interceptor.name(), error = ?err, "error intercepting response");
            }
        }

        // The client-facing connection is framed by this server, not by the
        // upstream's transfer encoding.
        let mut response_headers = head.headers.clone();
        response_headers.remove(TRANSFER_ENCODING);

        let mut completion = RequestCompletion {
            interceptor,
            state,
            status,
            method,
            path,
            remote,
            started_at,
        };

        if is_chunked(&head.headers) {
            response_headers.remove(CONTENT_LENGTH);
            let relay = RelayBody::new(response.bytes_stream().boxed(), completion);
            build_response(status, response_headers, Body::from_stream(relay))
        } else {
            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %err, "error reading upstream body");
                    completion.finish(Some(ProxyError::Body(err.to_string())));
                    response_headers.remove(CONTENT_LENGTH);
                    return build_response(status, response_headers, Body::empty());
                }
            };

            let body = completion.apply_content_hook(bytes);
            response_headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            completion.finish(None);
            build_response(status, response_headers, Body::from(body))
        }
    }
}

/// Everything needed to close out one proxied request: the access-log line
/// and the interceptor's terminal hook, dispatched off the wire path.
pub(crate) struct RequestCompletion {
    pub(crate) interceptor: Option<Arc<dyn Interceptor>>,
    pub(crate) state: Option<InterceptState>,
    pub(crate) status: StatusCode,
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) remote: String,
    pub(crate) started_at: Instant,
}

impl RequestCompletion {
    pub(crate) fn apply_chunk_hook(&mut self, chunk: Bytes) -> Bytes {
        let (Some(interceptor), Some(state)) = (self.interceptor.as_ref(), self.state.as_mut())
        else {
            return chunk;
        };
        match interceptor.intercept_chunk(chunk.clone(), state) {
            Ok(replaced) => replaced,
            Err(err) => {
                warn!(interceptor = %interceptor.name(), error = ?err, "error intercepting chunk");
                chunk
            }
        }
    }

    pub(crate) fn apply_content_hook(&mut self, content: Bytes) -> Bytes {
        let (Some(interceptor), Some(state)) = (self.interceptor.as_ref(), self.state.as_mut())
        else {
            return content;
        };
        match interceptor.intercept_content(content.clone(), state) {
            Ok(replaced) => replaced,
            Err(err) => {
                warn!(interceptor = %interceptor.name(), error = ?err, "error intercepting content");
                content
            }
        }
    }

    /// Emits the access-log record and fires exactly one terminal hook on a
    /// detached task, so a slow store never holds the client connection.
    pub(crate) fn finish(mut self, error: Option<ProxyError>) {
        let error = error.or_else(|| {
            (self.status.as_u16() >= 400).then(|| ProxyError::UpstreamStatus(self.status.as_u16()))
        });

        info!(
            method = %self.method,
            path = %self.path,
            status = self.status.as_u16(),
            duration = ?self.started_at.elapsed(),
            remote = %self.remote,
            "HTTP request"
        );

        if let (Some(interceptor), Some(state)) = (self.interceptor.take(), self.state.take()) {
            tokio::spawn(async move {
                match error {
                    None => interceptor.on_complete(state).await,
                    Some(error) => {
                        warn!(interceptor = %interceptor.name(), error = %error, "request failed");
                        interceptor.on_error(state, &error).await;
                    }
                }
            });
        }
    }
}

async fn handle(
    State(engine): State<Arc<ProxyEngine>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
) -> Response {
    engine.proxy(req, remote.to_string()).await
}

/// The streaming path is taken iff the first element of the upstream's
/// transfer-encoding list is `chunked`; everything else is buffered, even
/// SSE bodies sent with a content length.
fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|first| first.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn upstream_authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_is_chunked_first_element() {
        let mut fixture = HeaderMap::new();
        fixture.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        assert!(is_chunked(&fixture));
    }

    #[test]
    fn test_is_chunked_ignores_later_elements() {
        let mut fixture = HeaderMap::new();
        fixture.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip, chunked"));

        assert!(!is_chunked(&fixture));
    }

    #[test]
    fn test_is_chunked_absent() {
        assert!(!is_chunked(&HeaderMap::new()));
    }

    #[test]
    fn test_upstream_authority_with_port() {
        let fixture = Url::parse("http://localhost:11434").unwrap();

        assert_eq!(upstream_authority(&fixture), "localhost:11434");
    }

    #[test]
    fn test_upstream_authority_default_port() {
        let fixture = Url::parse("https://api.openai.com").unwrap();

        assert_eq!(upstream_authority(&fixture), "api.openai.com");
    }
}
