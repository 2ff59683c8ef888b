use std::any::Any;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::ProxyError;

mod custom;
mod logging;
pub mod ollama;
pub mod openai;
mod registry;
mod saving;
mod simple;

pub use custom::CustomInterceptor;
pub use logging::LoggingInterceptor;
pub use registry::{Registry, METHOD_ANY};
pub use saving::SavingSupport;
pub use simple::SimpleInterceptor;

/// Opaque per-request state. Produced fresh by [`Interceptor::create_state`]
/// and threaded through every other hook of the same request; never shared
/// between requests.
pub type InterceptState = Box<dyn Any + Send>;

/// The upstream-bound request as the interceptor sees it. The body has
/// already been read off the client connection, so hooks may inspect or
/// replace it freely and the proxy forwards whatever is left here.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Authority of the upstream the request is about to be sent to.
    pub host: String,
}

impl UpstreamRequest {
    /// The client address recorded by the proxy in `X-Forwarded-For`.
    pub fn client_host(&self) -> Option<String> {
        self.headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// Upstream response headers and status, seen before any body byte.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

pub(crate) fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

pub(crate) fn nonzero_i32(value: i32) -> Option<i32> {
    (value != 0).then_some(value)
}

pub(crate) fn nonzero_i64(value: i64) -> Option<i64> {
    (value != 0).then_some(value)
}

/// A pluggable per-endpoint handler observing one request/response pair
/// through five ordered hooks plus a terminal completion or error callback.
///
/// Hook errors are non-fatal: the proxy logs them and continues with the
/// original bytes. For any one request the hooks run sequentially on the
/// same logical task, and exactly one of `on_complete`/`on_error` fires
/// after the body has been fully handled.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    fn create_state(&self) -> InterceptState;

    fn intercept_request(
        &self,
        _req: &mut UpstreamRequest,
        _state: &mut InterceptState,
    ) -> Result<()> {
        Ok(())
    }

    fn intercept_response(
        &self,
        _head: &ResponseHead,
        _state: &mut InterceptState,
    ) -> Result<()> {
        Ok(())
    }

    /// Called exactly once with the whole body of a non-streamed response.
    /// The returned bytes replace the body sent to the client.
    fn intercept_content(&self, content: Bytes, _state: &mut InterceptState) -> Result<Bytes> {
        Ok(content)
    }

    /// Called once per chunk of a streamed response, inline on the
    /// forwarding path. The returned bytes replace the chunk.
    fn intercept_chunk(&self, chunk: Bytes, _state: &mut InterceptState) -> Result<Bytes> {
        Ok(chunk)
    }

    async fn on_complete(&self, _state: InterceptState) {}

    async fn on_error(&self, _state: InterceptState, _error: &ProxyError) {}
}
