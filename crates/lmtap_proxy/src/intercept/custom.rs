use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use super::{InterceptState, Interceptor, UpstreamRequest};

/// Demonstrates a stateful interceptor: counts streamed chunks and rewrites
/// buffered bodies.
pub struct CustomInterceptor {
    name: String,
}

#[derive(Default)]
struct CustomState {
    chunk_count: usize,
    total_bytes: usize,
}

impl CustomInterceptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Interceptor for CustomInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_state(&self) -> InterceptState {
        Box::new(CustomState::default())
    }

    fn intercept_request(
        &self,
        req: &mut UpstreamRequest,
        _state: &mut InterceptState,
    ) -> Result<()> {
        req.headers
            .insert("x-intercepted-by", http::HeaderValue::from_str(&self.name)?);
        Ok(())
    }

    fn intercept_content(&self, content: Bytes, _state: &mut InterceptState) -> Result<Bytes> {
        let rewritten = String::from_utf8_lossy(&content).replace("Hello", "Hi");
        Ok(Bytes::from(rewritten))
    }

    fn intercept_chunk(&self, chunk: Bytes, state: &mut InterceptState) -> Result<Bytes> {
        if let Some(state) = state.downcast_mut::<CustomState>() {
            state.chunk_count += 1;
            state.total_bytes += chunk.len();
        }
        Ok(chunk)
    }

    async fn on_complete(&self, state: InterceptState) {
        if let Ok(state) = state.downcast::<CustomState>() {
            info!(
                interceptor = %self.name,
                total_chunks = state.chunk_count,
                total_bytes = state.total_bytes,
                "response complete"
            );
        }
    }
}
