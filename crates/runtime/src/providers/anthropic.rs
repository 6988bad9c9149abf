//! Anthropic API backend with server-sent-event streaming.

use crate::model::{
    Backend, EventStream, FinishReason, Message, ModelError, ModelRequest, Part, Role,
    StreamEvent, ToolCall, ToolSpec, ToolStatus, Usage,
};
use futures::StreamExt;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

// Beta features needed for interleaved thinking between tool rounds.
const THINKING_BETA_HEADER: &str = "interleaved-thinking-2025-05-14";

// Claude Code OAuth constants
const CLAUDE_CODE_VERSION: &str = "2.1.2";
const OAUTH_BETA_HEADER: &str = "claude-code-20250219,oauth-2025-04-20,fine-grained-tool-streaming-2025-05-14,interleaved-thinking-2025-05-14";
const OAUTH_SYSTEM_PREFIX: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

/// Authentication mode for Anthropic API.
#[derive(Debug, Clone)]
pub enum AnthropicAuth {
    /// Standard API key authentication.
    ApiKey(String),
    /// Claude Code OAuth token authentication.
    ClaudeCodeOauth(String),
}

impl std::fmt::Display for AnthropicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => write!(f, "api_key"),
            Self::ClaudeCodeOauth(_) => write!(f, "claude_code_oauth"),
        }
    }
}

impl AnthropicAuth {
    fn apply_headers(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            Self::ApiKey(key) => req.header("x-api-key", key),
            Self::ClaudeCodeOauth(token) => req
                .header("anthropic-dangerous-direct-browser-access", "true")
                .header("Authorization", format!("Bearer {token}"))
                .header("anthropic-beta", OAUTH_BETA_HEADER)
                .header(
                    "user-agent",
                    format!("claude-cli/{CLAUDE_CODE_VERSION} (external, cli)"),
                )
                .header("x-app", "cli"),
        }
    }

    fn build_system(&self, system: Option<&str>) -> Option<ApiSystemPrompt> {
        match self {
            Self::ApiKey(_) => system.map(|s| ApiSystemPrompt::Simple(s.to_string())),
            Self::ClaudeCodeOauth(_) => {
                let mut blocks = vec![ApiSystemBlock {
                    block_type: "text",
                    text: OAUTH_SYSTEM_PREFIX.to_string(),
                    cache_control: ApiCacheControl {
                        control_type: "ephemeral",
                    },
                }];
                if let Some(s) = system {
                    blocks.push(ApiSystemBlock {
                        block_type: "text",
                        text: s.to_string(),
                        cache_control: ApiCacheControl {
                            control_type: "ephemeral",
                        },
                    });
                }
                Some(ApiSystemPrompt::Blocks(blocks))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types — request
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<ApiSystemPrompt>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ApiThinking>,
}

#[derive(Debug, Serialize)]
struct ApiThinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiSystemPrompt {
    Simple(String),
    Blocks(Vec<ApiSystemBlock>),
}

#[derive(Debug, Serialize)]
struct ApiSystemBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: String,
    cache_control: ApiCacheControl,
}

#[derive(Debug, Serialize)]
struct ApiCacheControl {
    #[serde(rename = "type")]
    control_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ApiContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types — streamed response
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiStreamEvent {
    MessageStart {
        message: ApiMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: ApiBlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: ApiDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: ApiMessageDelta,
        #[serde(default)]
        usage: Option<ApiDeltaUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiStreamError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiMessageStart {
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlockStart {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiDeltaUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiStreamError {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE decoder
// ─────────────────────────────────────────────────────────────────────────────

/// Per-index state of an open content block.
enum Block {
    Text,
    Thinking,
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
}

/// Turns SSE lines into provider-agnostic [`StreamEvent`]s.
///
/// Tool-argument fragments (`input_json_delta`) are buffered per block and a
/// [`StreamEvent::ToolCall`] is emitted only at `content_block_stop`, so the
/// rest of the runtime only ever sees fully-materialized invocations.
#[derive(Default)]
struct StreamDecoder {
    blocks: HashMap<usize, Block>,
    finish: Option<FinishReason>,
    usage: Usage,
    finished: bool,
}

impl StreamDecoder {
    /// Feed one line of the SSE body.
    fn feed_line(&mut self, line: &str) -> Result<Vec<StreamEvent>, ModelError> {
        let trimmed = line.trim();

        // SSE streams interleave `event:`, `id:` and comment lines with the
        // `data:` payloads; only the payloads carry events.
        let json = if let Some(rest) = trimmed.strip_prefix("data: ") {
            rest
        } else if trimmed.starts_with('{') {
            trimmed
        } else {
            return Ok(Vec::new());
        };

        if json.is_empty() || json == "[DONE]" {
            return Ok(Vec::new());
        }

        let event: ApiStreamEvent = serde_json::from_str(json)
            .map_err(|e| ModelError::InvalidResponse(format!("bad stream event: {e}")))?;

        Ok(match event {
            ApiStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.usage.input_tokens += usage.input_tokens;
                    self.usage.output_tokens += usage.output_tokens;
                }
                Vec::new()
            }
            ApiStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ApiBlockStart::Text => {
                    self.blocks.insert(index, Block::Text);
                    Vec::new()
                }
                ApiBlockStart::Thinking => {
                    self.blocks.insert(index, Block::Thinking);
                    Vec::new()
                }
                ApiBlockStart::ToolUse { id, name } => {
                    let started = StreamEvent::ToolCallStarted {
                        id: id.clone(),
                        name: name.clone(),
                    };
                    self.blocks.insert(
                        index,
                        Block::ToolUse {
                            id,
                            name,
                            input_json: String::new(),
                        },
                    );
                    vec![started]
                }
                ApiBlockStart::Other => Vec::new(),
            },
            ApiStreamEvent::ContentBlockDelta { index, delta } => match delta {
                ApiDelta::TextDelta { text } => vec![StreamEvent::TextDelta(text)],
                ApiDelta::ThinkingDelta { thinking } => vec![StreamEvent::ThinkingDelta(thinking)],
                ApiDelta::InputJsonDelta { partial_json } => {
                    if let Some(Block::ToolUse { input_json, .. }) = self.blocks.get_mut(&index) {
                        input_json.push_str(&partial_json);
                    }
                    Vec::new()
                }
                ApiDelta::Other => Vec::new(),
            },
            ApiStreamEvent::ContentBlockStop { index } => match self.blocks.remove(&index) {
                Some(Block::ToolUse {
                    id,
                    name,
                    input_json,
                }) => vec![StreamEvent::ToolCall(materialize_call(
                    id, name, input_json,
                ))],
                _ => Vec::new(),
            },
            ApiStreamEvent::MessageDelta { delta, usage } => {
                if let Some(u) = usage {
                    self.usage.output_tokens = self.usage.output_tokens.max(u.output_tokens);
                }
                if let Some(reason) = delta.stop_reason {
                    self.finish = Some(map_stop_reason(&reason));
                }
                Vec::new()
            }
            ApiStreamEvent::MessageStop => {
                self.finished = true;
                vec![StreamEvent::Finished {
                    reason: self.finish.take().unwrap_or_default(),
                    usage: self.usage,
                }]
            }
            ApiStreamEvent::Error { error } => {
                return Err(ModelError::Api(error.message));
            }
            ApiStreamEvent::Ping | ApiStreamEvent::Unknown => Vec::new(),
        })
    }
}

fn materialize_call(id: String, name: String, input_json: String) -> ToolCall {
    // An unparseable argument buffer is passed through as a raw string so
    // schema validation rejects it downstream and the model sees the failure
    // as a result, instead of the whole stream erroring out.
    let input = if input_json.trim().is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(&input_json).unwrap_or(Value::String(input_json))
    };
    ToolCall { id, name, input }
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "tool_use" => FinishReason::ToolUse,
        "max_tokens" => FinishReason::Length,
        other => FinishReason::Unknown(other.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Anthropic backend.
#[derive(Debug, Clone)]
pub struct AnthropicBackendBuilder {
    auth: AnthropicAuth,
}

impl AnthropicBackendBuilder {
    pub fn new(auth: AnthropicAuth) -> Self {
        Self { auth }
    }

    pub fn build(self) -> AnthropicBackend {
        AnthropicBackend {
            client: reqwest::Client::new(),
            auth: self.auth,
        }
    }
}

/// Anthropic API backend.
///
/// Model selection and token budgets arrive with each [`ModelRequest`]; the
/// backend itself only owns transport concerns.
pub struct AnthropicBackend {
    client: reqwest::Client,
    auth: AnthropicAuth,
}

impl AnthropicBackend {
    pub fn builder(auth: AnthropicAuth) -> AnthropicBackendBuilder {
        AnthropicBackendBuilder::new(auth)
    }

    fn role_to_api(role: Role) -> &'static str {
        match role {
            Role::User | Role::System => "user",
            Role::Assistant => "assistant",
        }
    }

    fn message_to_api(msg: &Message) -> ApiMessage {
        let role = Self::role_to_api(msg.role);

        // Simple case: single text part
        if msg.parts.len() == 1
            && let Part::Text(text) = &msg.parts[0]
        {
            return ApiMessage {
                role,
                content: ApiContent::Text(text.clone()),
            };
        }

        // Complex case: multiple parts or non-text
        let blocks: Vec<ApiContentBlock> = msg
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => ApiContentBlock::Text { text: text.clone() },
                Part::ToolCall(call) => ApiContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                },
                Part::ToolResult(result) => ApiContentBlock::ToolResult {
                    tool_use_id: result.call_id.clone(),
                    content: result.payload.clone(),
                    is_error: result.status != ToolStatus::Ok,
                },
            })
            .collect();

        ApiMessage {
            role,
            content: ApiContent::Blocks(blocks),
        }
    }

    fn tool_to_api(spec: &ToolSpec) -> ApiTool {
        ApiTool {
            name: spec.name.clone(),
            description: spec.description.clone(),
            input_schema: spec.schema.clone(),
        }
    }

    fn build_request(&self, request: &ModelRequest<'_>) -> ApiRequest {
        let messages: Vec<ApiMessage> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(Self::message_to_api)
            .collect();

        let tools: Vec<ApiTool> = request.tools.iter().map(Self::tool_to_api).collect();

        ApiRequest {
            model: request.model.to_string(),
            max_tokens: request.max_tokens,
            stream: true,
            messages,
            system: self.auth.build_system(request.system),
            tools,
            thinking: request.thinking_budget.map(|budget_tokens| ApiThinking {
                kind: "enabled",
                budget_tokens,
            }),
        }
    }
}

impl std::fmt::Display for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "anthropic(auth={})", self.auth)
    }
}

/// State threaded through the unfolded event stream.
struct StreamState {
    bytes: Pin<Box<dyn futures::Stream<Item = reqwest::Result<Vec<u8>>> + Send>>,
    buf: Vec<u8>,
    decoder: StreamDecoder,
    pending: VecDeque<StreamEvent>,
    failed: bool,
}

impl Backend for AnthropicBackend {
    async fn open(&self, request: ModelRequest<'_>) -> Result<EventStream, ModelError> {
        let api_request = self.build_request(&request);

        let mut req = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .header("accept", "text/event-stream");

        if api_request.thinking.is_some() && matches!(self.auth, AnthropicAuth::ApiKey(_)) {
            req = req.header("anthropic-beta", THINKING_BETA_HEADER);
        }
        let req = self.auth.apply_headers(req);

        let response = req
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api(format!("{status}: {body}")));
        }

        let state = StreamState {
            bytes: Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec()))),
            buf: Vec::new(),
            decoder: StreamDecoder::default(),
            pending: VecDeque::new(),
            failed: false,
        };

        Ok(Box::pin(futures::stream::unfold(state, next_event)))
    }
}

async fn next_event(
    mut state: StreamState,
) -> Option<(Result<StreamEvent, ModelError>, StreamState)> {
    loop {
        if let Some(event) = state.pending.pop_front() {
            return Some((Ok(event), state));
        }
        if state.failed || state.decoder.finished {
            return None;
        }

        match state.bytes.next().await {
            Some(Ok(chunk)) => {
                state.buf.extend_from_slice(&chunk);
                while let Some(pos) = state.buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = state.buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    match state.decoder.feed_line(&line) {
                        Ok(events) => state.pending.extend(events),
                        Err(e) => {
                            state.failed = true;
                            return Some((Err(e), state));
                        }
                    }
                }
            }
            Some(Err(e)) => {
                state.failed = true;
                return Some((Err(ModelError::Network(e.to_string())), state));
            }
            None => {
                if !state.decoder.finished {
                    state.failed = true;
                    return Some((
                        Err(ModelError::InvalidResponse(
                            "stream ended before message_stop".into(),
                        )),
                        state,
                    ));
                }
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut StreamDecoder, line: &str) -> Vec<StreamEvent> {
        decoder.feed_line(line).unwrap()
    }

    #[test]
    fn auth_display() {
        let api = AnthropicAuth::ApiKey("test".into());
        let oauth = AnthropicAuth::ClaudeCodeOauth("test".into());
        assert_eq!(api.to_string(), "api_key");
        assert_eq!(oauth.to_string(), "claude_code_oauth");
    }

    #[test]
    fn text_delta_parsing() {
        let mut decoder = StreamDecoder::default();
        let events = feed(
            &mut decoder,
            r#"data: {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hello"}}"#,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::TextDelta(t) if t == "Hello"));
    }

    #[test]
    fn thinking_delta_parsing() {
        let mut decoder = StreamDecoder::default();
        feed(
            &mut decoder,
            r#"data: {"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}"#,
        );
        let events = feed(
            &mut decoder,
            r#"data: {"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "hmm"}}"#,
        );
        assert!(matches!(&events[0], StreamEvent::ThinkingDelta(t) if t == "hmm"));
    }

    #[test]
    fn tool_call_assembled_from_fragments() {
        let mut decoder = StreamDecoder::default();

        let events = feed(
            &mut decoder,
            r#"data: {"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "calculator"}}"#,
        );
        assert!(matches!(
            &events[0],
            StreamEvent::ToolCallStarted { id, name } if id == "toolu_1" && name == "calculator"
        ));

        // Arguments arrive split mid-token; nothing is emitted until the stop.
        assert!(feed(
            &mut decoder,
            r#"data: {"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"expre"}}"#,
        )
        .is_empty());
        assert!(feed(
            &mut decoder,
            r#"data: {"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "ssion\": \"2+2\"}"}}"#,
        )
        .is_empty());

        let events = feed(
            &mut decoder,
            r#"data: {"type": "content_block_stop", "index": 1}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolCall(call) => {
                assert_eq!(call.id, "toolu_1");
                assert_eq!(call.name, "calculator");
                assert_eq!(call.input["expression"], "2+2");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn empty_tool_input_becomes_empty_object() {
        let mut decoder = StreamDecoder::default();
        feed(
            &mut decoder,
            r#"data: {"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "t1", "name": "clock"}}"#,
        );
        let events = feed(
            &mut decoder,
            r#"data: {"type": "content_block_stop", "index": 0}"#,
        );
        match &events[0] {
            StreamEvent::ToolCall(call) => assert_eq!(call.input, serde_json::json!({})),
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn broken_tool_input_is_passed_through_as_string() {
        let mut decoder = StreamDecoder::default();
        feed(
            &mut decoder,
            r#"data: {"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "t1", "name": "clock"}}"#,
        );
        feed(
            &mut decoder,
            r#"data: {"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{not json"}}"#,
        );
        let events = feed(
            &mut decoder,
            r#"data: {"type": "content_block_stop", "index": 0}"#,
        );
        match &events[0] {
            StreamEvent::ToolCall(call) => {
                assert_eq!(call.input, Value::String("{not json".into()));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn stop_reason_and_usage_reported_at_message_stop() {
        let mut decoder = StreamDecoder::default();
        feed(
            &mut decoder,
            r#"data: {"type": "message_start", "message": {"usage": {"input_tokens": 10, "output_tokens": 1}}}"#,
        );
        feed(
            &mut decoder,
            r#"data: {"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 25}}"#,
        );
        let events = feed(&mut decoder, r#"data: {"type": "message_stop"}"#);
        match &events[0] {
            StreamEvent::Finished { reason, usage } => {
                assert_eq!(*reason, FinishReason::ToolUse);
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 25);
            }
            other => panic!("expected Finished, got {other:?}"),
        }
        assert!(decoder.finished);
    }

    #[test]
    fn non_data_lines_are_skipped() {
        let mut decoder = StreamDecoder::default();
        assert!(feed(&mut decoder, "event: content_block_delta").is_empty());
        assert!(feed(&mut decoder, "").is_empty());
        assert!(feed(&mut decoder, "data: [DONE]").is_empty());
        assert!(feed(&mut decoder, r#"data: {"type": "ping"}"#).is_empty());
    }

    #[test]
    fn api_error_event_fails_the_stream() {
        let mut decoder = StreamDecoder::default();
        let err = decoder
            .feed_line(r#"data: {"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}"#)
            .unwrap_err();
        assert!(matches!(err, ModelError::Api(m) if m == "Overloaded"));
    }

    #[test]
    fn tool_results_serialize_with_error_flag() {
        let msg = Message::tool_results(vec![
            crate::model::ToolResult::ok("t1", "4", std::time::Duration::from_millis(3)),
            crate::model::ToolResult::error("t2", "boom", std::time::Duration::from_millis(5)),
        ]);
        let api = AnthropicBackend::message_to_api(&msg);
        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["tool_use_id"], "t1");
        assert!(json["content"][0].get("is_error").is_none());
        assert_eq!(json["content"][1]["is_error"], true);
    }
}
