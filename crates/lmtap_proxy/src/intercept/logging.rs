use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use super::{InterceptState, Interceptor, ResponseHead, UpstreamRequest};
use crate::ProxyError;

/// Logs every hook invocation without touching the traffic.
pub struct LoggingInterceptor {
    name: String,
}

impl LoggingInterceptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_state(&self) -> InterceptState {
        Box::new(())
    }

    fn intercept_request(
        &self,
        req: &mut UpstreamRequest,
        _state: &mut InterceptState,
    ) -> Result<()> {
        info!(interceptor = %self.name, method = %req.method, path = %req.path, "logging request");
        Ok(())
    }

    fn intercept_response(&self, head: &ResponseHead, _state: &mut InterceptState) -> Result<()> {
        info!(interceptor = %self.name, status = head.status.as_u16(), "logging response");
        Ok(())
    }

    fn intercept_content(&self, content: Bytes, _state: &mut InterceptState) -> Result<Bytes> {
        info!(interceptor = %self.name, bytes = content.len(), "logging content");
        Ok(content)
    }

    fn intercept_chunk(&self, chunk: Bytes, _state: &mut InterceptState) -> Result<Bytes> {
        info!(interceptor = %self.name, bytes = chunk.len(), "logging chunk");
        Ok(chunk)
    }

    async fn on_complete(&self, _state: InterceptState) {
        info!(interceptor = %self.name, "request completed");
    }

    async fn on_error(&self, _state: InterceptState, error: &ProxyError) {
        info!(interceptor = %self.name, error = %error, "request failed");
    }
}
