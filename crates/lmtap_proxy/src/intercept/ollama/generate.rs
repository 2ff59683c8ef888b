use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use lmtap_domain::{ConversationStore, SimpleMessage};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::intercept::{
    non_empty, nonzero_i32, nonzero_i64, InterceptState, Interceptor, ResponseHead,
    SavingSupport, UpstreamRequest,
};
use crate::ProxyError;

/// Records `/api/generate` traffic against an Ollama-style upstream.
///
/// The persisted history is a single user message holding the prompt; the
/// assistant reply is the concatenation of the streamed `response` fields.
pub struct OllamaGenerateInterceptor {
    saving: SavingSupport,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    prompt: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: i32,
    #[serde(default)]
    prompt_eval_duration: i64,
    #[serde(default)]
    eval_count: i32,
    #[serde(default)]
    eval_duration: i64,
}

#[derive(Default)]
struct GenerateState {
    request: GenerateRequest,
    response: GenerateResponse,
    status_code: u16,
    client_host: Option<String>,
    upstream_host: Option<String>,
}

impl OllamaGenerateInterceptor {
    pub fn new(
        name: impl Into<String>,
        store: Option<Arc<dyn ConversationStore>>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            saving: SavingSupport::new(name, store, storage_timeout),
        }
    }

    async fn save(&self, state: GenerateState) {
        let mut prompt = SimpleMessage::new("user", &state.request.prompt);
        prompt.model = non_empty(state.request.model.clone());
        prompt.client_host = state.client_host.clone();

        let mut assistant = SimpleMessage::new("assistant", &state.response.response);
        assistant.model = non_empty(state.response.model);
        assistant.prompt_tokens = nonzero_i32(state.response.prompt_eval_count);
        assistant.completion_tokens = nonzero_i32(state.response.eval_count);
        assistant.prompt_eval_duration = nonzero_i64(state.response.prompt_eval_duration);
        assistant.eval_duration = nonzero_i64(state.response.eval_duration);
        assistant.upstream_host = state.upstream_host;

        self.saving
            .save_exchange(vec![prompt], assistant, state.status_code, "generate")
            .await;
    }
}

#[async_trait]
impl Interceptor for OllamaGenerateInterceptor {
    fn name(&self) -> &str {
        self.saving.name()
    }

    fn create_state(&self) -> InterceptState {
        Box::new(GenerateState::default())
    }

    fn intercept_request(
        &self,
        req: &mut UpstreamRequest,
        state: &mut InterceptState,
    ) -> Result<()> {
        let Some(state) = state.downcast_mut::<GenerateState>() else {
            return Ok(());
        };

        debug!(interceptor = %self.name(), path = %req.path, "intercepting request");
        state.upstream_host = non_empty(req.host.clone());
        state.client_host = req.client_host();

        match serde_json::from_slice::<GenerateRequest>(&req.body) {
            Ok(parsed) => state.request = parsed,
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not parse generate request body")
            }
        }
        Ok(())
    }

    fn intercept_response(&self, head: &ResponseHead, state: &mut InterceptState) -> Result<()> {
        if let Some(state) = state.downcast_mut::<GenerateState>() {
            state.status_code = head.status.as_u16();
        }
        Ok(())
    }

    fn intercept_content(&self, content: Bytes, state: &mut InterceptState) -> Result<Bytes> {
        let Some(state) = state.downcast_mut::<GenerateState>() else {
            return Ok(content);
        };

        match serde_json::from_slice::<GenerateResponse>(&content) {
            Ok(parsed) => state.response = parsed,
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not parse generate response body")
            }
        }
        Ok(content)
    }

    fn intercept_chunk(&self, chunk: Bytes, state: &mut InterceptState) -> Result<Bytes> {
        let Some(state) = state.downcast_mut::<GenerateState>() else {
            return Ok(chunk);
        };

        match serde_json::from_slice::<GenerateResponse>(&chunk) {
            Ok(parsed) => {
                let merged = format!("{}{}", state.response.response, parsed.response);
                if parsed.done {
                    state.response = parsed;
                }
                state.response.response = merged;
            }
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not parse generate response chunk")
            }
        }
        Ok(chunk)
    }

    async fn on_complete(&self, state: InterceptState) {
        let Ok(state) = state.downcast::<GenerateState>() else {
            return;
        };
        debug!(interceptor = %self.name(), model = %state.response.model, "request completed");
        self.save(*state).await;
    }

    async fn on_error(&self, state: InterceptState, error: &ProxyError) {
        let Ok(state) = state.downcast::<GenerateState>() else {
            return;
        };
        warn!(interceptor = %self.name(), error = %error, "error occurred");
        self.save(*state).await;
    }
}
