use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Body of `POST /api/v1/chat/completions`.
///
/// `frequency_penalty`, `presence_penalty` and `stop` are accepted so that
/// stock OpenAI clients deserialize cleanly, but the server does not forward
/// them to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// A chunk carrying one text fragment.
    pub fn content(id: &str, created: i64, model: &str, text: impl Into<String>) -> Self {
        Self::with_choice(
            id,
            created,
            model,
            ChunkChoice {
                index: 0,
                delta: Delta {
                    content: Some(text.into()),
                },
                finish_reason: None,
            },
        )
    }

    /// The terminal chunk: empty delta, `finish_reason: "stop"`.
    pub fn stop(id: &str, created: i64, model: &str) -> Self {
        Self::with_choice(
            id,
            created,
            model,
            ChunkChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some("stop".to_string()),
            },
        )
    }

    fn with_choice(id: &str, created: i64, model: &str, choice: ChunkChoice) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![choice],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub permission: Vec<serde_json::Value>,
    pub root: String,
    pub parent: Option<String>,
}

/// `{ "error": { "message": ..., "type": ... } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeChatRequest {
    pub messages: Vec<UiMessage>,
    #[serde(rename = "sandboxId")]
    pub sandbox_id: String,
}

/// A chat message as kept by the browser UI, including tool invocations the
/// assistant made in earlier turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<UiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiPart {
    Text {
        text: String,
    },
    ToolInvocation {
        #[serde(rename = "toolInvocation")]
        tool_invocation: ToolInvocation,
    },
    /// Reasoning, step markers, sources, files: not forwarded.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub state: ToolInvocationState,
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolInvocationState {
    PartialCall,
    Call,
    Result,
}

/// Body of `POST /api/desktop`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesktopRequest {
    #[serde(default, rename = "sandboxId", skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesktopSession {
    pub sandbox_id: String,
    pub stream_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stop_chunk_has_empty_delta() {
        let chunk = ChatCompletionChunk::stop("chatcmpl-1", 1_700_000_000, "m");
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"], json!({}));
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn content_chunk_has_null_finish_reason() {
        let chunk = ChatCompletionChunk::content("chatcmpl-1", 0, "m", "hello");
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["choices"][0]["delta"]["content"], "hello");
        assert!(value["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn completion_request_accepts_ignored_params() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "any",
            "messages": [{"role": "system", "content": "be brief"}],
            "frequency_penalty": 0.5,
            "presence_penalty": 0.1,
            "stop": ["\n\n", "END"]
        }))
        .unwrap();
        assert_eq!(request.stream, None);
        assert_eq!(request.messages[0].role, MessageRole::System);
        assert_eq!(
            request.stop,
            Some(StopSequences::Many(vec!["\n\n".into(), "END".into()]))
        );
    }

    #[test]
    fn ui_message_parses_tool_invocations_and_skips_unknown_parts() {
        let message: UiMessage = serde_json::from_value(json!({
            "id": "m1",
            "role": "assistant",
            "content": "",
            "parts": [
                {"type": "step-start"},
                {"type": "text", "text": "Taking a screenshot"},
                {"type": "tool-invocation", "toolInvocation": {
                    "state": "result",
                    "toolCallId": "toolu_1",
                    "toolName": "computer",
                    "args": {"action": "screenshot"},
                    "result": {"type": "image", "data": "AAAA"}
                }}
            ]
        }))
        .unwrap();

        assert_eq!(message.parts.len(), 3);
        assert!(matches!(message.parts[0], UiPart::Other));
        match &message.parts[2] {
            UiPart::ToolInvocation { tool_invocation } => {
                assert_eq!(tool_invocation.state, ToolInvocationState::Result);
                assert_eq!(tool_invocation.tool_name, "computer");
            }
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[test]
    fn usage_total_is_sum() {
        assert_eq!(Usage::new(12, 30).total_tokens, 42);
    }

    #[test]
    fn usage_total_saturates() {
        assert_eq!(Usage::new(u32::MAX, 5).total_tokens, u32::MAX);
    }
}
