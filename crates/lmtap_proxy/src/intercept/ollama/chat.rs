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

/// Records `/api/chat` traffic against an Ollama-style upstream.
///
/// The upstream emits one JSON object per chunk; assistant content is
/// concatenated across chunks and the final `done` object carries the
/// authoritative token counts and durations.
pub struct OllamaChatInterceptor {
    saving: SavingSupport,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    message: ChatMessage,
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
struct ChatState {
    request: ChatRequest,
    response: ChatResponse,
    status_code: u16,
    client_host: Option<String>,
    upstream_host: Option<String>,
}

impl OllamaChatInterceptor {
    pub fn new(
        name: impl Into<String>,
        store: Option<Arc<dyn ConversationStore>>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            saving: SavingSupport::new(name, store, storage_timeout),
        }
    }

    async fn save(&self, state: ChatState) {
        let history = state
            .request
            .messages
            .iter()
            .map(|m| {
                let mut message = SimpleMessage::new(&m.role, &m.content);
                message.model = non_empty(state.request.model.clone());
                message.client_host = state.client_host.clone();
                message
            })
            .collect();

        let mut assistant = SimpleMessage::new(
            &state.response.message.role,
            &state.response.message.content,
        );
        assistant.model = non_empty(state.response.model);
        assistant.prompt_tokens = nonzero_i32(state.response.prompt_eval_count);
        assistant.completion_tokens = nonzero_i32(state.response.eval_count);
        assistant.prompt_eval_duration = nonzero_i64(state.response.prompt_eval_duration);
        assistant.eval_duration = nonzero_i64(state.response.eval_duration);
        assistant.upstream_host = state.upstream_host;

        self.saving
            .save_exchange(history, assistant, state.status_code, "chat")
            .await;
    }
}

#[async_trait]
impl Interceptor for OllamaChatInterceptor {
    fn name(&self) -> &str {
        self.saving.name()
    }

    fn create_state(&self) -> InterceptState {
        Box::new(ChatState::default())
    }

    fn intercept_request(
        &self,
        req: &mut UpstreamRequest,
        state: &mut InterceptState,
    ) -> Result<()> {
        let Some(state) = state.downcast_mut::<ChatState>() else {
            return Ok(());
        };

        debug!(interceptor = %self.name(), path = %req.path, "intercepting request");
        state.upstream_host = non_empty(req.host.clone());
        state.client_host = req.client_host();

        match serde_json::from_slice::<ChatRequest>(&req.body) {
            Ok(parsed) => state.request = parsed,
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not parse chat request body")
            }
        }
        Ok(())
    }

    fn intercept_response(&self, head: &ResponseHead, state: &mut InterceptState) -> Result<()> {
        if let Some(state) = state.downcast_mut::<ChatState>() {
            state.status_code = head.status.as_u16();
        }
        Ok(())
    }

    fn intercept_content(&self, content: Bytes, state: &mut InterceptState) -> Result<Bytes> {
        let Some(state) = state.downcast_mut::<ChatState>() else {
            return Ok(content);
        };

        match serde_json::from_slice::<ChatResponse>(&content) {
            Ok(parsed) => state.response = parsed,
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not parse chat response body")
            }
        }
        Ok(content)
    }

    fn intercept_chunk(&self, chunk: Bytes, state: &mut InterceptState) -> Result<Bytes> {
        let Some(state) = state.downcast_mut::<ChatState>() else {
            return Ok(chunk);
        };

        // Each chunk is assumed to be one complete JSON object; Ollama does
        // not split records across chunk boundaries.
        match serde_json::from_slice::<ChatResponse>(&chunk) {
            Ok(parsed) => {
                let merged = format!(
                    "{}{}",
                    state.response.message.content, parsed.message.content
                );
                if parsed.done {
                    state.response = parsed;
                }
                state.response.message.content = merged;
            }
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not parse chat response chunk")
            }
        }
        Ok(chunk)
    }

    async fn on_complete(&self, state: InterceptState) {
        let Ok(state) = state.downcast::<ChatState>() else {
            return;
        };
        debug!(interceptor = %self.name(), model = %state.response.model, "request completed");
        self.save(*state).await;
    }

    async fn on_error(&self, state: InterceptState, error: &ProxyError) {
        let Ok(state) = state.downcast::<ChatState>() else {
            return;
        };
        warn!(interceptor = %self.name(), error = %error, "error occurred");
        self.save(*state).await;
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, Method};
    use pretty_assertions::assert_eq;

    use super::*;

    fn interceptor() -> OllamaChatInterceptor {
        OllamaChatInterceptor::new("OllamaChatInterceptor", None, Duration::from_secs(5))
    }

    fn request(body: &str) -> UpstreamRequest {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.9:51000".parse().unwrap());
        UpstreamRequest {
            method: Method::POST,
            path: "/api/chat".to_string(),
            headers,
            body: Bytes::from(body.to_string()),
            host: "localhost:11434".to_string(),
        }
    }

    #[test]
    fn test_request_capture() {
        let fixture = interceptor();
        let mut state = fixture.create_state();
        let mut req = request(
            r#"{"model":"llama3","messages":[{"role":"user","content":"Hello"}],"stream":true}"#,
        );

        fixture.intercept_request(&mut req, &mut state).unwrap();

        let state = state.downcast_ref::<ChatState>().unwrap();
        assert_eq!(state.request.model, "llama3");
        assert_eq!(state.request.messages.len(), 1);
        assert_eq!(state.client_host.as_deref(), Some("10.0.0.9:51000"));
        assert_eq!(state.upstream_host.as_deref(), Some("localhost:11434"));
    }

    #[test]
    fn test_request_body_passes_through_unchanged() {
        let fixture = interceptor();
        let mut state = fixture.create_state();
        let body = r#"{"model":"llama3","messages":[],"stream":false}"#;
        let mut req = request(body);

        fixture.intercept_request(&mut req, &mut state).unwrap();

        assert_eq!(req.body, Bytes::from(body));
    }

    #[test]
    fn test_chunk_accumulation_with_done_metadata() {
        let fixture = interceptor();
        let mut state = fixture.create_state();

        let chunks = [
            r#"{"model":"llama3","message":{"role":"assistant","content":"Hel"},"done":false}"#,
            r#"{"model":"llama3","message":{"role":"assistant","content":"lo!"},"done":false}"#,
            r#"{"model":"llama3","message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":12,"eval_count":7,"prompt_eval_duration":1000,"eval_duration":2000}"#,
        ];
        for chunk in chunks {
            let out = fixture
                .intercept_chunk(Bytes::from(chunk.to_string()), &mut state)
                .unwrap();
            assert_eq!(out, Bytes::from(chunk.to_string()));
        }

        let state = state.downcast_ref::<ChatState>().unwrap();
        assert_eq!(state.response.message.content, "Hello!");
        assert!(state.response.done);
        assert_eq!(state.response.prompt_eval_count, 12);
        assert_eq!(state.response.eval_count, 7);
        assert_eq!(state.response.eval_duration, 2000);
    }

    #[test]
    fn test_unparseable_chunk_is_skipped() {
        let fixture = interceptor();
        let mut state = fixture.create_state();

        fixture
            .intercept_chunk(
                Bytes::from(r#"{"message":{"content":"Hi"},"done":false}"#),
                &mut state,
            )
            .unwrap();
        fixture
            .intercept_chunk(Bytes::from_static(b"not json"), &mut state)
            .unwrap();

        let state = state.downcast_ref::<ChatState>().unwrap();
        assert_eq!(state.response.message.content, "Hi");
    }

    #[test]
    fn test_buffered_response_capture() {
        let fixture = interceptor();
        let mut state = fixture.create_state();
        let body = r#"{"model":"llama3","message":{"role":"assistant","content":"Hi there!"},"done":true,"eval_count":3}"#;

        let out = fixture
            .intercept_content(Bytes::from(body.to_string()), &mut state)
            .unwrap();

        assert_eq!(out, Bytes::from(body.to_string()));
        let state = state.downcast_ref::<ChatState>().unwrap();
        assert_eq!(state.response.message.content, "Hi there!");
        assert_eq!(state.response.eval_count, 3);
    }
}
