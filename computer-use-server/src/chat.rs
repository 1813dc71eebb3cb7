//! Native chat endpoint: UI messages in, line-framed data stream out.

use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderName},
    response::{IntoResponse, Response},
};
use computer_use_shared::{MessageRole, NativeChatRequest, ToolInvocationState, UiMessage, UiPart};
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::{sync::mpsc, time::timeout};
use tracing::info;
use uuid::Uuid;

use crate::error::{ApiError, NativeError};
use crate::llm::{
    AgentEvent, ChatCall, ContentBlock, GenerationParams, LlmMessage, LlmRole, TokenUsage,
};
use crate::prune::prune_messages;
use crate::sandbox::destroy_on_failure;
use crate::tools::ToolOutput;
use crate::AppState;

const DATA_STREAM_HEADER: HeaderName = HeaderName::from_static("x-vercel-ai-data-stream");

pub async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Response, NativeError> {
    let request: NativeChatRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::MalformedRequest(e.to_string()))?;
    if request.messages.is_empty() {
        return Err(ApiError::MalformedRequest("messages must not be empty".to_string()).into());
    }

    info!(
        "Chat request for sandbox {} with {} messages",
        request.sandbox_id,
        request.messages.len()
    );

    let (system, messages) = convert_ui_messages(prune_messages(request.messages));
    let call = ChatCall {
        system,
        messages,
        sandbox_id: request.sandbox_id.clone(),
        params: GenerationParams::default(),
    };

    let limit = state.request_timeout;
    let failure = match timeout(limit, state.provider.stream(call)).await {
        Ok(Ok(events)) => return Ok(data_stream_response(events)),
        Ok(Err(e)) => ApiError::Provider(e),
        Err(_) => ApiError::TimedOut(limit),
    };

    let outcome = destroy_on_failure(state.sandbox.as_ref(), &request.sandbox_id).await;
    info!("Cleanup of sandbox {}: {:?}", request.sandbox_id, outcome);
    Err(failure.into())
}

/// Convert UI history into provider messages. System turns become the
/// provider's system prompt; finished tool invocations become a `tool_use`
/// block answered by a `tool_result` in the following user turn.
pub fn convert_ui_messages(messages: Vec<UiMessage>) -> (Option<String>, Vec<LlmMessage>) {
    let mut system = Vec::new();
    let mut converted = Vec::new();

    for message in messages {
        match message.role {
            MessageRole::System => system.push(message_text(&message)),
            MessageRole::User => {
                let text = message_text(&message);
                if !text.is_empty() {
                    converted.push(LlmMessage::text(LlmRole::User, text));
                }
            }
            MessageRole::Assistant => convert_assistant(message, &mut converted),
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n"));
    (system, converted)
}

fn message_text(message: &UiMessage) -> String {
    let from_parts: String = message
        .parts
        .iter()
        .filter_map(|part| match part {
            UiPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if from_parts.is_empty() {
        message.content.clone()
    } else {
        from_parts
    }
}

/// Falls back to `content` when the parts carry no text or finished tool calls.
fn convert_assistant(message: UiMessage, out: &mut Vec<LlmMessage>) {
    let before = out.len();
    let mut blocks = Vec::new();
    let mut results = Vec::new();

    let content = message.content;
    for part in message.parts {
        match part {
            UiPart::Text { text } => {
                // Text after tool results starts a new step.
                if !results.is_empty() {
                    flush(&mut blocks, &mut results, out);
                }
                if !text.is_empty() {
                    blocks.push(ContentBlock::text(text));
                }
            }
            UiPart::ToolInvocation { tool_invocation } => {
                if tool_invocation.state != ToolInvocationState::Result {
                    continue;
                }
                let output = tool_invocation
                    .result
                    .as_ref()
                    .map(tool_output_from_ui)
                    .unwrap_or_else(|| ToolOutput::Text(String::new()));
                results.push(ContentBlock::tool_result(
                    tool_invocation.tool_call_id.clone(),
                    &output,
                    false,
                ));
                blocks.push(ContentBlock::tool_use(
                    tool_invocation.tool_call_id,
                    tool_invocation.tool_name,
                    tool_invocation.args,
                ));
            }
            UiPart::Other => {}
        }
    }
    flush(&mut blocks, &mut results, out);

    if out.len() == before && !content.is_empty() {
        out.push(LlmMessage::text(LlmRole::Assistant, content));
    }
}

fn flush(
    blocks: &mut Vec<ContentBlock>,
    results: &mut Vec<ContentBlock>,
    out: &mut Vec<LlmMessage>,
) {
    if !blocks.is_empty() {
        out.push(LlmMessage {
            role: LlmRole::Assistant,
            content: std::mem::take(blocks),
        });
    }
    if !results.is_empty() {
        out.push(LlmMessage {
            role: LlmRole::User,
            content: std::mem::take(results),
        });
    }
}

fn tool_output_from_ui(result: &Value) -> ToolOutput {
    match result {
        Value::String(text) => ToolOutput::Text(text.clone()),
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("image") => {
            match map.get("data").and_then(Value::as_str) {
                Some(data) => ToolOutput::Image {
                    data: data.to_string(),
                },
                None => ToolOutput::Text(result.to_string()),
            }
        }
        other => ToolOutput::Text(other.to_string()),
    }
}

fn usage_json(usage: &TokenUsage) -> Value {
    json!({
        "promptTokens": usage.input_tokens,
        "completionTokens": usage.output_tokens,
    })
}

/// One `TYPE:JSON` line of the data stream.
pub fn encode_event(event: &AgentEvent, message_id: &str) -> String {
    let (code, payload) = match event {
        AgentEvent::StepStart => ('f', json!({ "messageId": message_id })),
        AgentEvent::TextDelta(text) => ('0', Value::String(text.clone())),
        AgentEvent::ToolCall { id, name, input } => (
            '9',
            json!({ "toolCallId": id, "toolName": name, "args": input }),
        ),
        AgentEvent::ToolResult { id, output, .. } => (
            'a',
            json!({ "toolCallId": id, "result": output.to_ui_value() }),
        ),
        AgentEvent::StepFinish {
            finish_reason,
            usage,
            is_continued,
        } => (
            'e',
            json!({
                "finishReason": finish_reason.as_str(),
                "usage": usage_json(usage),
                "isContinued": is_continued,
            }),
        ),
        AgentEvent::Finish {
            finish_reason,
            usage,
        } => (
            'd',
            json!({ "finishReason": finish_reason.as_str(), "usage": usage_json(usage) }),
        ),
        // Raw provider error text goes to the client on purpose.
        AgentEvent::Error(message) => ('3', Value::String(message.clone())),
    };
    format!("{code}:{payload}\n")
}

fn data_stream_response(events: mpsc::UnboundedReceiver<AgentEvent>) -> Response {
    let message_id = format!("msg-{}", Uuid::new_v4().simple());
    let lines = stream::unfold(events, |mut events| async move {
        events.recv().await.map(|event| (event, events))
    })
    .map(move |event| Ok::<_, Infallible>(Bytes::from(encode_event(&event, &message_id))));

    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (DATA_STREAM_HEADER, "v1"),
        ],
        Body::from_stream(lines),
    )
        .into_response()
}
