use anyhow::Result;
use async_trait::async_trait;
use http::HeaderValue;
use tracing::debug;

use super::{InterceptState, Interceptor, ResponseHead, UpstreamRequest};

/// Tags upstream-bound requests with a marker header.
pub struct SimpleInterceptor {
    name: String,
}

impl SimpleInterceptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Interceptor for SimpleInterceptor {
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
        let value = HeaderValue::from_str(&self.name)?;
        req.headers.insert("x-simple-interceptor", value);
        Ok(())
    }

    fn intercept_response(&self, head: &ResponseHead, _state: &mut InterceptState) -> Result<()> {
        debug!(interceptor = %self.name, status = head.status.as_u16(), "simple response");
        Ok(())
    }
}
