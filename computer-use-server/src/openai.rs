//! OpenAI-compatible surface: `/api/v1/chat/completions` and `/api/v1/models`.

use async_stream::try_stream;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::Utc;
use computer_use_shared::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatMessage, CompletionChoice,
    MessageRole, ModelCard, ModelList, Usage,
};
use futures_util::Stream;
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{ApiError, LlmError, OpenAiError};
use crate::llm::{AgentEvent, ChatCall, Generation, GenerationParams, LlmMessage, LlmRole};
use crate::AppState;

/// How a completion is delivered, fixed once from the request's `stream` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    Streaming,
    Buffered,
}

impl ChatMode {
    pub fn from_stream_flag(stream: Option<bool>) -> Self {
        if stream.unwrap_or(false) {
            Self::Streaming
        } else {
            Self::Buffered
        }
    }
}

/// System messages have no provider-side slot on this path, so they travel
/// as user turns prefixed with `System: `.
pub fn convert_messages(messages: &[ChatMessage]) -> Vec<LlmMessage> {
    messages
        .iter()
        .map(|message| match message.role {
            MessageRole::System => {
                LlmMessage::text(LlmRole::User, format!("System: {}", message.content))
            }
            MessageRole::User => LlmMessage::text(LlmRole::User, message.content.clone()),
            MessageRole::Assistant => {
                LlmMessage::text(LlmRole::Assistant, message.content.clone())
            }
        })
        .collect()
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

pub fn buffered_completion(
    generation: &Generation,
    model: &str,
    id: &str,
    created: i64,
) -> ChatCompletion {
    let usage = Usage::new(
        generation.usage.input_tokens.unwrap_or(0),
        generation.usage.output_tokens.unwrap_or(0),
    );

    ChatCompletion {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            message: ChatMessage {
                role: MessageRole::Assistant,
                content: generation.text.clone(),
            },
            finish_reason: "stop".to_string(),
        }],
        usage,
    }
}

/// Turns agent events into `chat.completion.chunk` SSE events. Only text
/// deltas are forwarded; the stream ends with a stop chunk and `[DONE]`.
/// A provider error mid-stream aborts the body.
pub fn chunk_stream(
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    id: String,
    created: i64,
    model: String,
) -> impl Stream<Item = Result<Event, LlmError>> {
    try_stream! {
        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::TextDelta(text) => {
                    let chunk = ChatCompletionChunk::content(&id, created, &model, text);
                    yield Event::default().data(serde_json::to_string(&chunk)?);
                }
                AgentEvent::Error(message) => {
                    error!("Streaming completion {} failed: {}", id, message);
                    Err::<(), _>(LlmError::Stream(message))?;
                }
                _ => {}
            }
        }

        let stop = ChatCompletionChunk::stop(&id, created, &model);
        yield Event::default().data(serde_json::to_string(&stop)?);
        yield Event::default().data("[DONE]");
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, OpenAiError> {
    let limit = state.request_timeout;
    match timeout(limit, complete(state, body)).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::TimedOut(limit).into()),
    }
}

async fn complete(state: AppState, body: Bytes) -> Result<Response, OpenAiError> {
    let request: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::MalformedRequest(e.to_string()))?;
    let mode = ChatMode::from_stream_flag(request.stream);

    let sandbox = state
        .sandbox
        .connect(None)
        .await
        .map_err(ApiError::SandboxUnavailable)?;
    info!(
        "Completion request ({:?}) on sandbox {} with {} messages",
        mode,
        sandbox.id,
        request.messages.len()
    );

    let call = ChatCall {
        system: None,
        messages: convert_messages(&request.messages),
        sandbox_id: sandbox.id,
        params: GenerationParams {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
        },
    };
    let id = completion_id();
    let created = Utc::now().timestamp();

    match mode {
        ChatMode::Streaming => {
            let events = state.provider.stream(call).await?;
            Ok(Sse::new(chunk_stream(events, id, created, state.model.clone())).into_response())
        }
        ChatMode::Buffered => {
            let generation = state.provider.generate(call).await?;
            debug!("Completion {} finished: {:?}", id, generation.finish_reason);
            Ok(Json(buffered_completion(&generation, &state.model, &id, created)).into_response())
        }
    }
}

pub fn model_catalog(model: &str, created: i64) -> ModelList {
    ModelList {
        object: "list".to_string(),
        data: vec![ModelCard {
            id: model.to_string(),
            object: "model".to_string(),
            created,
            owned_by: "anthropic".to_string(),
            permission: Vec::new(),
            root: model.to_string(),
            parent: None,
        }],
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(model_catalog(&state.model, Utc::now().timestamp()))
}

/// CORS preflight. The headers come from the router layer.
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FinishReason, TokenUsage};

    fn message(role: MessageRole, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn stream_flag_selects_mode() {
        assert_eq!(ChatMode::from_stream_flag(Some(true)), ChatMode::Streaming);
        assert_eq!(ChatMode::from_stream_flag(Some(false)), ChatMode::Buffered);
        assert_eq!(ChatMode::from_stream_flag(None), ChatMode::Buffered);
    }

    #[test]
    fn system_messages_are_prefixed_user_turns() {
        let converted = convert_messages(&[
            message(MessageRole::System, "Be brief."),
            message(MessageRole::User, "Hi"),
            message(MessageRole::Assistant, "Hello"),
        ]);
        assert_eq!(
            converted,
            vec![
                LlmMessage::text(LlmRole::User, "System: Be brief."),
                LlmMessage::text(LlmRole::User, "Hi"),
                LlmMessage::text(LlmRole::Assistant, "Hello"),
            ]
        );
    }

    #[test]
    fn buffered_completion_sums_usage() {
        let generation = Generation {
            text: "Done.".to_string(),
            usage: TokenUsage {
                input_tokens: Some(12),
                output_tokens: Some(3),
            },
            finish_reason: FinishReason::Stop,
        };
        let completion = buffered_completion(&generation, "claude", "chatcmpl-1", 1_700_000_000);
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.choices[0].message.content, "Done.");
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert_eq!(completion.usage, Usage::new(12, 3));
        assert_eq!(completion.usage.total_tokens, 15);
    }

    #[test]
    fn missing_usage_counts_as_zero() {
        let generation = Generation {
            text: String::new(),
            usage: TokenUsage::default(),
            finish_reason: FinishReason::Unknown,
        };
        let completion = buffered_completion(&generation, "claude", "chatcmpl-2", 0);
        assert_eq!(completion.usage, Usage::new(0, 0));
    }

    #[test]
    fn catalog_lists_configured_model() {
        let list = model_catalog("claude-3-7-sonnet-20250219", 42);
        assert_eq!(list.object, "list");
        assert_eq!(list.data.len(), 1);
        let card = &list.data[0];
        assert_eq!(card.id, "claude-3-7-sonnet-20250219");
        assert_eq!(card.root, card.id);
        assert_eq!(card.owned_by, "anthropic");
        assert!(card.parent.is_none());
        assert!(card.permission.is_empty());
    }

    #[test]
    fn completion_ids_are_unique() {
        let a = completion_id();
        let b = completion_id();
        assert!(a.starts_with("chatcmpl-"));
        assert_ne!(a, b);
    }
}
