use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::HeaderValue;
use lmtap_domain::{ConversationStore, SimpleMessage, ToolCallRecord};
use serde::Deserialize;
use tracing::{debug, warn};

use super::sse::SseLineBuffer;
use crate::intercept::{
    non_empty, nonzero_i32, nonzero_i64, InterceptState, Interceptor, ResponseHead,
    SavingSupport, UpstreamRequest,
};
use crate::ProxyError;

const DONE_FRAME: &str = "data: [DONE]";
const DATA_PREFIX: &str = "data: ";

/// Records `/v1/chat/completions` traffic against an OpenAI-style upstream.
///
/// The request body is parsed twice: into a generic JSON value so every
/// field — known or not — survives the single mutation this proxy performs
/// (forcing `stream_options.include_usage` on streamed requests, so the
/// upstream emits its final usage block), and into a typed structure for
/// state tracking. Streamed responses arrive as SSE frames whose deltas are
/// folded into one assistant message, including tool calls whose argument
/// JSON trickles in as string fragments.
pub struct OpenAiChatInterceptor {
    saving: SavingSupport,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<RequestMessage>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct RequestMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    tool_call_id: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    object: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    message: DeltaMessage,
    #[serde(default)]
    delta: DeltaMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct DeltaMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    function: DeltaFunction,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    // Only the first event typically carries the function name; the
    // arguments arrive as a byte-level stream of string fragments.
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i32,
    #[serde(default)]
    completion_tokens: i32,
    #[serde(default)]
    total_tokens: i32,
}

/// The single logical response reconstructed from deltas.
#[derive(Debug, Default)]
struct AccumulatedResponse {
    id: String,
    object: String,
    created: i64,
    model: String,
    choices: Vec<AccumulatedChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Default)]
struct AccumulatedChoice {
    role: String,
    content: String,
    tool_calls: Vec<ToolCallRecord>,
    finish_reason: Option<String>,
}

impl AccumulatedResponse {
    fn absorb_delta(&mut self, delta: ChatResponse) {
        if self.id.is_empty() && !delta.id.is_empty() {
            self.id = delta.id;
            self.model = delta.model;
            self.created = delta.created;
            self.object = delta.object;
        }

        for choice in delta.choices {
            if self.choices.len() <= choice.index {
                self.choices
                    .resize_with(choice.index + 1, AccumulatedChoice::default);
            }
            let slot = &mut self.choices[choice.index];

            slot.content
                .push_str(choice.delta.content.as_deref().unwrap_or(""));
            if let Some(role) = choice.delta.role.filter(|r| !r.is_empty()) {
                slot.role = role;
            }

            for tool_call in choice.delta.tool_calls.unwrap_or_default() {
                if slot.tool_calls.len() <= tool_call.index {
                    slot.tool_calls
                        .resize_with(tool_call.index + 1, ToolCallRecord::default);
                }
                let entry = &mut slot.tool_calls[tool_call.index];
                if let Some(id) = tool_call.id.filter(|v| !v.is_empty()) {
                    entry.id = id;
                }
                if let Some(kind) = tool_call.kind.filter(|v| !v.is_empty()) {
                    entry.kind = kind;
                }
                if let Some(name) = tool_call.function.name.filter(|v| !v.is_empty()) {
                    entry.function.name = name;
                }
                entry.function.arguments.push_str(&tool_call.function.arguments);
            }

            if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
                slot.finish_reason = Some(reason);
            }
        }

        if let Some(usage) = delta.usage {
            if usage.total_tokens > 0 {
                self.usage = Some(usage);
            }
        }
    }

    fn absorb_whole(&mut self, response: ChatResponse) {
        self.id = response.id;
        self.object = response.object;
        self.created = response.created;
        self.model = response.model;
        self.choices = response
            .choices
            .into_iter()
            .map(|choice| AccumulatedChoice {
                role: choice.message.role.unwrap_or_default(),
                content: choice.message.content.unwrap_or_default(),
                tool_calls: choice
                    .message
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .map(|tool_call| ToolCallRecord {
                        id: tool_call.id.unwrap_or_default(),
                        kind: tool_call.kind.unwrap_or_default(),
                        function: lmtap_domain::FunctionCallRecord {
                            name: tool_call.function.name.unwrap_or_default(),
                            arguments: tool_call.function.arguments,
                        },
                    })
                    .collect(),
                finish_reason: choice.finish_reason,
            })
            .collect();
        if let Some(usage) = response.usage {
            if usage.total_tokens > 0 {
                self.usage = Some(usage);
            }
        }
    }
}

struct ChatState {
    request: ChatRequest,
    response: AccumulatedResponse,
    sse: SseLineBuffer,
    started_at: Instant,
    status_code: u16,
    client_host: Option<String>,
    upstream_host: Option<String>,
}

impl ChatState {
    fn new() -> Self {
        Self {
            request: ChatRequest::default(),
            response: AccumulatedResponse::default(),
            sse: SseLineBuffer::default(),
            started_at: Instant::now(),
            status_code: 0,
            client_host: None,
            upstream_host: None,
        }
    }
}

impl OpenAiChatInterceptor {
    pub fn new(
        name: impl Into<String>,
        store: Option<Arc<dyn ConversationStore>>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            saving: SavingSupport::new(name, store, storage_timeout),
        }
    }

    /// Forces `stream_options.include_usage = true` on streamed requests,
    /// leaving every other field of the JSON value untouched. Returns the
    /// re-encoded body when a mutation happened.
    fn inject_stream_options(&self, body: &[u8]) -> Option<Bytes> {
        let mut value: serde_json::Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not parse request body as JSON");
                return None;
            }
        };

        let streaming = value
            .get("stream")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !streaming {
            return None;
        }

        let object = value.as_object_mut()?;
        let options = object
            .entry("stream_options")
            .or_insert_with(|| serde_json::json!({}));
        match options.as_object_mut() {
            Some(options) => {
                options.insert("include_usage".to_string(), true.into());
            }
            None => *options = serde_json::json!({ "include_usage": true }),
        }

        match serde_json::to_vec(&value) {
            Ok(encoded) => Some(Bytes::from(encoded)),
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not re-encode request body");
                None
            }
        }
    }

    fn absorb_line(&self, response: &mut AccumulatedResponse, line: &str) {
        if line.is_empty() || line == DONE_FRAME {
            return;
        }
        let Some(data) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        match serde_json::from_str::<ChatResponse>(data) {
            Ok(delta) => response.absorb_delta(delta),
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not parse response chunk")
            }
        }
    }

    async fn save(&self, mut state: ChatState) {
        if let Some(line) = state.sse.finish() {
            self.absorb_line(&mut state.response, &line);
        }

        let history = state
            .request
            .messages
            .iter()
            .map(|m| {
                let mut message =
                    SimpleMessage::new(&m.role, m.content.clone().unwrap_or_default());
                message.model = non_empty(state.request.model.clone());
                message.client_host = state.client_host.clone();
                message.tool_calls = m.tool_calls.clone();
                message.tool_call_id = m.tool_call_id.clone().filter(|v| !v.is_empty());
                message
            })
            .collect();

        let mut assistant = SimpleMessage::default();
        if let Some(choice) = state.response.choices.first() {
            assistant.role = if choice.role.is_empty() {
                "assistant".to_string()
            } else {
                choice.role.clone()
            };
            assistant.content = choice.content.clone();
            assistant.model = non_empty(state.response.model.clone());
            if let Some(usage) = state.response.usage {
                assistant.prompt_tokens = nonzero_i32(usage.prompt_tokens);
                assistant.completion_tokens = nonzero_i32(usage.completion_tokens);
            }
            assistant.eval_duration = i64::try_from(state.started_at.elapsed().as_nanos())
                .ok()
                .and_then(nonzero_i64);
            assistant.upstream_host = state.upstream_host.clone();
            assistant.tool_calls = choice.tool_calls.clone();
        }

        self.saving
            .save_exchange(history, assistant, state.status_code, "chat")
            .await;
    }
}

#[async_trait]
impl Interceptor for OpenAiChatInterceptor {
    fn name(&self) -> &str {
        self.saving.name()
    }

    fn create_state(&self) -> InterceptState {
        Box::new(ChatState::new())
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

        if let Some(rewritten) = self.inject_stream_options(&req.body) {
            req.headers
                .insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
            req.body = rewritten;
        }

        match serde_json::from_slice::<ChatRequest>(&req.body) {
            Ok(parsed) => state.request = parsed,
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not parse request body into struct")
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
            Ok(parsed) => state.response.absorb_whole(parsed),
            Err(err) => {
                warn!(interceptor = %self.name(), error = %err, "could not parse response body")
            }
        }
        Ok(content)
    }

    fn intercept_chunk(&self, chunk: Bytes, state: &mut InterceptState) -> Result<Bytes> {
        let Some(state) = state.downcast_mut::<ChatState>() else {
            return Ok(chunk);
        };

        let lines = state.sse.push(&chunk);
        for line in lines {
            self.absorb_line(&mut state.response, &line);
        }
        Ok(chunk)
    }

    async fn on_complete(&self, state: InterceptState) {
        let Ok(state) = state.downcast::<ChatState>() else {
            return;
        };
        debug!(interceptor = %self.name(), model = %state.request.model, "request completed");
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

    fn interceptor() -> OpenAiChatInterceptor {
        OpenAiChatInterceptor::new("OpenAIChatInterceptor", None, Duration::from_secs(5))
    }

    fn request(body: &str) -> UpstreamRequest {
        UpstreamRequest {
            method: Method::POST,
            path: "/v1/chat/completions".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
            host: "api.openai.com".to_string(),
        }
    }

    fn body_json(req: &UpstreamRequest) -> serde_json::Value {
        serde_json::from_slice(&req.body).unwrap()
    }

    #[test]
    fn test_stream_options_injected_for_streamed_requests() {
        let fixture = interceptor();
        let mut state = fixture.create_state();
        let mut req = request(
            r#"{"model":"gpt-3.5-turbo","messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
        );

        fixture.intercept_request(&mut req, &mut state).unwrap();

        let actual = body_json(&req);
        let expected = serde_json::json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        assert_eq!(actual, expected);
        assert_eq!(
            req.headers.get(CONTENT_LENGTH).unwrap(),
            &HeaderValue::from(req.body.len())
        );
    }

    #[test]
    fn test_non_streamed_request_is_byte_identical() {
        let fixture = interceptor();
        let mut state = fixture.create_state();
        let body = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"Hi"}],"stream":false}"#;
        let mut req = request(body);

        fixture.intercept_request(&mut req, &mut state).unwrap();

        assert_eq!(req.body, Bytes::from(body));
    }

    #[test]
    fn test_unknown_fields_are_preserved() {
        let fixture = interceptor();
        let mut state = fixture.create_state();
        let mut req = request(
            r#"{
                "model": "gpt-3.5-turbo",
                "messages": [{"role": "user", "content": "Hello"}],
                "unknown_field": "some_value",
                "nested_unknown": {"key": "value"},
                "temperature": 0.2,
                "tools": [{"type": "function", "function": {"name": "get_weather"}}],
                "tool_choice": "auto",
                "stream": true
            }"#,
        );

        fixture.intercept_request(&mut req, &mut state).unwrap();

        let actual = body_json(&req);
        assert_eq!(actual["unknown_field"], "some_value");
        assert_eq!(actual["nested_unknown"]["key"], "value");
        assert_eq!(actual["temperature"], 0.2);
        assert_eq!(actual["tool_choice"], "auto");
        assert_eq!(actual["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(actual["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_injection_is_idempotent() {
        let fixture = interceptor();
        let mut state = fixture.create_state();
        let mut req = request(
            r#"{"model":"gpt-3.5-turbo","messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
        );

        fixture.intercept_request(&mut req, &mut state).unwrap();
        let first = body_json(&req);
        fixture.intercept_request(&mut req, &mut state).unwrap();
        let second = body_json(&req);

        assert_eq!(first, second);
    }

    #[test]
    fn test_existing_stream_options_are_extended() {
        let fixture = interceptor();
        let mut state = fixture.create_state();
        let mut req = request(
            r#"{"model":"gpt-4o","messages":[],"stream":true,"stream_options":{"other":1}}"#,
        );

        fixture.intercept_request(&mut req, &mut state).unwrap();

        let actual = body_json(&req);
        assert_eq!(actual["stream_options"]["include_usage"], true);
        assert_eq!(actual["stream_options"]["other"], 1);
    }

    #[test]
    fn test_tool_call_reassembly_across_frames() {
        let fixture = interceptor();
        let mut state = fixture.create_state();

        let frames = [
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_abc\",\"type\":\"function\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"location\\\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\": \\\"Boston\\\"}\"}}]}}]}\n",
            "data: [DONE]\n",
        ];
        for frame in frames {
            fixture
                .intercept_chunk(Bytes::from(frame.to_string()), &mut state)
                .unwrap();
        }

        let state = state.downcast_ref::<ChatState>().unwrap();
        let tool_call = &state.response.choices[0].tool_calls[0];
        assert_eq!(tool_call.id, "call_abc");
        assert_eq!(tool_call.kind, "function");
        assert_eq!(tool_call.function.name, "get_weather");
        assert_eq!(tool_call.function.arguments, r#"{"location": "Boston"}"#);
    }

    #[test]
    fn test_accumulation_is_invariant_under_rechunking() {
        let stream = concat!(
            "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
            "data: {\"id\":\"chatcmpl-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo there\"}}]}\n\n",
            "data: {\"id\":\"chatcmpl-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"!\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"chatcmpl-1\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":3,\"total_tokens\":8}}\n\n",
            "data: [DONE]\n\n",
        );

        let mut reference: Option<(String, String, Option<String>)> = None;
        for window in [1, 3, 10, 64, stream.len()] {
            let fixture = interceptor();
            let mut state = fixture.create_state();
            for chunk in stream.as_bytes().chunks(window) {
                fixture
                    .intercept_chunk(Bytes::copy_from_slice(chunk), &mut state)
                    .unwrap();
            }
            let state = state.downcast_ref::<ChatState>().unwrap();
            let choice = &state.response.choices[0];
            let snapshot = (
                choice.content.clone(),
                choice.role.clone(),
                choice.finish_reason.clone(),
            );
            assert_eq!(state.response.usage.map(|u| u.total_tokens), Some(8));
            match &reference {
                None => reference = Some(snapshot),
                Some(expected) => assert_eq!(&snapshot, expected, "chunk window {window}"),
            }
        }

        let (content, role, finish_reason) = reference.unwrap();
        assert_eq!(content, "Hello there!");
        assert_eq!(role, "assistant");
        assert_eq!(finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_identity_recorded_from_first_non_empty_id() {
        let fixture = interceptor();
        let mut state = fixture.create_state();

        let frames = [
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {\"id\":\"chatcmpl-7\",\"object\":\"chat.completion.chunk\",\"created\":1700000000,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"b\"}}]}\n",
            "data: {\"id\":\"chatcmpl-other\",\"model\":\"ignored\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"c\"}}]}\n",
        ];
        for frame in frames {
            fixture
                .intercept_chunk(Bytes::from(frame.to_string()), &mut state)
                .unwrap();
        }

        let state = state.downcast_ref::<ChatState>().unwrap();
        assert_eq!(state.response.id, "chatcmpl-7");
        assert_eq!(state.response.model, "gpt-4o-mini");
        assert_eq!(state.response.created, 1700000000);
        assert_eq!(state.response.choices[0].content, "abc");
    }

    #[test]
    fn test_choice_vector_grows_to_index() {
        let fixture = interceptor();
        let mut state = fixture.create_state();

        fixture
            .intercept_chunk(
                Bytes::from(
                    "data: {\"id\":\"x\",\"choices\":[{\"index\":1,\"delta\":{\"content\":\"second\"}}]}\n"
                        .to_string(),
                ),
                &mut state,
            )
            .unwrap();

        let state = state.downcast_ref::<ChatState>().unwrap();
        assert_eq!(state.response.choices.len(), 2);
        assert_eq!(state.response.choices[0].content, "");
        assert_eq!(state.response.choices[1].content, "second");
    }

    #[test]
    fn test_buffered_response_with_tool_calls() {
        let fixture = interceptor();
        let mut state = fixture.create_state();
        let body = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1677652288,
            "model": "gpt-3.5-turbo-0613",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc123",
                        "type": "function",
                        "function": {"name": "get_current_weather", "arguments": "{\"location\": \"Boston, MA\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 81, "completion_tokens": 12, "total_tokens": 93}
        }"#;

        fixture
            .intercept_content(Bytes::from(body.to_string()), &mut state)
            .unwrap();

        let state = state.downcast_ref::<ChatState>().unwrap();
        let choice = &state.response.choices[0];
        assert_eq!(choice.tool_calls[0].id, "call_abc123");
        assert_eq!(choice.tool_calls[0].function.name, "get_current_weather");
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(state.response.usage.map(|u| u.prompt_tokens), Some(81));
    }

    #[test]
    fn test_request_tool_metadata_captured_for_history() {
        let fixture = interceptor();
        let mut state = fixture.create_state();
        let mut req = request(
            r#"{
                "model": "gpt-4o",
                "messages": [
                    {"role": "user", "content": "What's the weather?"},
                    {"role": "assistant", "content": null, "tool_calls": [{"id": "call_9", "type": "function", "function": {"name": "get_weather", "arguments": "{}"}}]},
                    {"role": "tool", "content": "sunny", "tool_call_id": "call_9"}
                ],
                "stream": false
            }"#,
        );

        fixture.intercept_request(&mut req, &mut state).unwrap();

        let state = state.downcast_ref::<ChatState>().unwrap();
        assert_eq!(state.request.messages.len(), 3);
        assert_eq!(state.request.messages[1].tool_calls[0].id, "call_9");
        assert_eq!(
            state.request.messages[2].tool_call_id.as_deref(),
            Some("call_9")
        );
        // Null content deserializes as empty.
        assert_eq!(state.request.messages[1].content, None);
    }
}
