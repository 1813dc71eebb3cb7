use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{CacheControlMode, LlmConfig};
use crate::error::LlmError;
use crate::sandbox::SandboxService;
use crate::tools::{ToolOutput, Toolset};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const COMPUTER_USE_BETA: &str = "computer-use-2025-01-24";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: Vec<ContentBlock>,
}

impl LlmMessage {
    pub fn text(role: LlmRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::text(text)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheControl {
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn png(data: impl Into<String>) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: "image/png".to_string(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: ImageSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    /// Block kinds this service never sends back (thinking, server tools).
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
            cache_control: None,
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        output: &ToolOutput,
        is_error: bool,
    ) -> Self {
        let content = match output {
            ToolOutput::Text(text) => vec![ContentBlock::text(text.clone())],
            ToolOutput::Image { data } => vec![ContentBlock::Image {
                source: ImageSource::png(data.clone()),
                cache_control: None,
            }],
        };
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error,
            cache_control: None,
        }
    }

    fn mark_cached(&mut self) {
        match self {
            Self::Text { cache_control, .. }
            | Self::Image { cache_control, .. }
            | Self::ToolUse { cache_control, .. }
            | Self::ToolResult { cache_control, .. } => {
                *cache_control = Some(CacheControl::Ephemeral)
            }
            Self::Unsupported => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// One provider invocation with both tools bound to `sandbox_id`.
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub system: Option<String>,
    pub messages: Vec<LlmMessage>,
    pub sandbox_id: String,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

impl TokenUsage {
    pub fn add(self, other: TokenUsage) -> TokenUsage {
        fn sum(a: Option<u32>, b: Option<u32>) -> Option<u32> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
            }
        }
        TokenUsage {
            input_tokens: sum(self.input_tokens, other.input_tokens),
            output_tokens: sum(self.output_tokens, other.output_tokens),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Unknown,
}

impl FinishReason {
    fn from_stop_reason(stop_reason: Option<&str>) -> Self {
        match stop_reason {
            Some("end_turn") | Some("stop_sequence") => Self::Stop,
            Some("max_tokens") => Self::Length,
            Some("tool_use") => Self::ToolCalls,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool-calls",
            Self::Unknown => "unknown",
        }
    }
}

/// Materialized result of a buffered call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// What a streaming call produces, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    StepStart,
    TextDelta(String),
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: ToolOutput,
        is_error: bool,
    },
    StepFinish {
        finish_reason: FinishReason,
        usage: TokenUsage,
        is_continued: bool,
    },
    Finish {
        finish_reason: FinishReason,
        usage: TokenUsage,
    },
    Error(String),
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn generate(&self, call: ChatCall) -> Result<Generation, LlmError>;

    /// Starts the call and returns its event feed. Failures before the first
    /// byte arrives are returned here; later ones arrive as [`AgentEvent::Error`].
    async fn stream(&self, call: ChatCall)
        -> Result<mpsc::UnboundedReceiver<AgentEvent>, LlmError>;
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<LlmMessage>,
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<ApiUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamErrorBody,
    },
    #[serde(other)]
    Other,
}

type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
struct PendingToolCall {
    id: String,
    name: String,
    input: Value,
}

/// One provider round-trip, fully received.
#[derive(Debug)]
struct Step {
    content: Vec<ContentBlock>,
    usage: TokenUsage,
    finish_reason: FinishReason,
}

impl Step {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn tool_calls(&self) -> Vec<PendingToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input, .. } => Some(PendingToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

impl From<MessagesResponse> for Step {
    fn from(response: MessagesResponse) -> Self {
        Self {
            content: response
                .content
                .into_iter()
                .filter(|block| !matches!(block, ContentBlock::Unsupported))
                .collect(),
            usage: TokenUsage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
            finish_reason: FinishReason::from_stop_reason(response.stop_reason.as_deref()),
        }
    }
}

enum PartialBlock {
    Text(String),
    ToolUse { id: String, name: String, json: String },
    Done(ContentBlock),
    Skipped,
}

/// Folds streamed events of one step into a [`Step`], handing back the
/// pieces the client should see as they complete.
#[derive(Default)]
struct StepAccumulator {
    blocks: Vec<PartialBlock>,
    usage: TokenUsage,
    stop_reason: Option<String>,
}

impl StepAccumulator {
    fn apply(&mut self, event: StreamEvent) -> Result<Option<AgentEvent>, LlmError> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.usage.input_tokens = message.usage.input_tokens;
                self.usage.output_tokens = message.usage.output_tokens;
                Ok(None)
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block {
                    ContentBlock::Text { text, .. } => PartialBlock::Text(text),
                    ContentBlock::ToolUse { id, name, .. } => PartialBlock::ToolUse {
                        id,
                        name,
                        json: String::new(),
                    },
                    _ => PartialBlock::Skipped,
                };
                while self.blocks.len() <= index {
                    self.blocks.push(PartialBlock::Skipped);
                }
                self.blocks[index] = block;
                let forwarded = match &self.blocks[index] {
                    PartialBlock::Text(text) if !text.is_empty() => {
                        Some(AgentEvent::TextDelta(text.clone()))
                    }
                    _ => None,
                };
                Ok(forwarded)
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                match (self.blocks.get_mut(index), delta) {
                    (Some(PartialBlock::Text(buf)), BlockDelta::TextDelta { text }) => {
                        buf.push_str(&text);
                        Ok(Some(AgentEvent::TextDelta(text)))
                    }
                    (
                        Some(PartialBlock::ToolUse { json, .. }),
                        BlockDelta::InputJsonDelta { partial_json },
                    ) => {
                        json.push_str(&partial_json);
                        Ok(None)
                    }
                    _ => Ok(None),
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                let Some(slot) = self.blocks.get_mut(index) else {
                    return Ok(None);
                };
                let PartialBlock::ToolUse { id, name, json } = slot else {
                    return Ok(None);
                };
                let input = if json.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(json)?
                };
                let event = AgentEvent::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                };
                *slot = PartialBlock::Done(ContentBlock::tool_use(id.clone(), name.clone(), input));
                Ok(Some(event))
            }
            StreamEvent::MessageDelta { delta, usage } => {
                self.stop_reason = delta.stop_reason;
                if let Some(usage) = usage {
                    if usage.output_tokens.is_some() {
                        self.usage.output_tokens = usage.output_tokens;
                    }
                }
                Ok(None)
            }
            StreamEvent::Error { error } => Err(LlmError::Stream(error.message)),
            StreamEvent::MessageStop | StreamEvent::Ping | StreamEvent::Other => Ok(None),
        }
    }

    fn finish(self) -> Step {
        let content = self
            .blocks
            .into_iter()
            .filter_map(|block| match block {
                PartialBlock::Text(text) if !text.is_empty() => Some(ContentBlock::text(text)),
                PartialBlock::Done(block) => Some(block),
                _ => None,
            })
            .collect();
        Step {
            content,
            usage: self.usage,
            finish_reason: FinishReason::from_stop_reason(self.stop_reason.as_deref()),
        }
    }
}

struct ToolRun {
    call: PendingToolCall,
    output: ToolOutput,
    is_error: bool,
}

#[derive(Clone)]
pub struct LlmService {
    client: Client,
    config: LlmConfig,
    sandbox: Arc<dyn SandboxService>,
}

impl LlmService {
    pub fn new(config: LlmConfig, sandbox: Arc<dyn SandboxService>) -> Self {
        info!("Initializing LLM service with model: {}", config.model);
        Self {
            client: Client::new(),
            config,
            sandbox,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn toolset(&self, sandbox_id: &str) -> Toolset {
        Toolset::for_sandbox(self.sandbox.clone(), sandbox_id, self.config.display)
    }

    fn request_body(
        &self,
        system: Option<&str>,
        messages: &[LlmMessage],
        toolset: &Toolset,
        params: &GenerationParams,
        stream: bool,
    ) -> Result<Value, LlmError> {
        let mut messages = messages.to_vec();
        let mut tools = toolset.definitions();

        if self.config.cache_control == CacheControlMode::Ephemeral {
            if let Some(block) = messages
                .last_mut()
                .and_then(|message| message.content.last_mut())
            {
                block.mark_cached();
            }
            if let Some(Value::Object(tool)) = tools.last_mut() {
                tool.insert(
                    "cache_control".to_string(),
                    serde_json::json!({ "type": "ephemeral" }),
                );
            }
        }

        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: params.max_tokens.unwrap_or(self.config.max_tokens),
            system,
            messages,
            tools,
            temperature: params.temperature,
            top_p: params.top_p,
            stream,
        };
        Ok(serde_json::to_value(&request)?)
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", COMPUTER_USE_BETA)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            error!("Provider returned {}: {}", status, message);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn complete_step(
        &self,
        call: &ChatCall,
        messages: &[LlmMessage],
        toolset: &Toolset,
    ) -> Result<Step, LlmError> {
        let body =
            self.request_body(call.system.as_deref(), messages, toolset, &call.params, false)?;
        let response: MessagesResponse = self.send(&body).await?.json().await?;
        Ok(Step::from(response))
    }

    async fn open_stream(
        &self,
        call: &ChatCall,
        messages: &[LlmMessage],
        toolset: &Toolset,
    ) -> Result<EventStream, LlmError> {
        let body =
            self.request_body(call.system.as_deref(), messages, toolset, &call.params, true)?;
        let response = self.send(&body).await?;
        let events = response
            .bytes_stream()
            .eventsource()
            .filter_map(|item| async move {
                match item {
                    Ok(event) if event.data.trim().is_empty() => None,
                    Ok(event) => Some(
                        serde_json::from_str::<StreamEvent>(&event.data).map_err(LlmError::from),
                    ),
                    Err(e) => Some(Err(LlmError::Stream(e.to_string()))),
                }
            });
        Ok(Box::pin(events))
    }

    async fn run_tool(&self, toolset: &Toolset, call: PendingToolCall) -> ToolRun {
        debug!("Executing tool {} ({})", call.name, call.id);
        let (output, is_error) = match toolset.execute(&call.name, call.input.clone()).await {
            Ok(output) => (output, false),
            Err(e) => {
                warn!("Tool {} failed: {}", call.name, e);
                (ToolOutput::Text(e.to_string()), true)
            }
        };
        ToolRun {
            call,
            output,
            is_error,
        }
    }

    /// Tools run one after another; desktop actions depend on order.
    async fn run_tools(&self, toolset: &Toolset, calls: Vec<PendingToolCall>) -> Vec<ToolRun> {
        let mut runs = Vec::with_capacity(calls.len());
        for call in calls {
            runs.push(self.run_tool(toolset, call).await);
        }
        runs
    }

    /// Streaming variant of [`Self::run_tools`]: reports each result as it
    /// lands and returns `None` without touching the sandbox again once the
    /// receiver is gone.
    async fn report_tools(
        &self,
        toolset: &Toolset,
        calls: Vec<PendingToolCall>,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Option<Vec<ToolRun>> {
        let mut runs = Vec::with_capacity(calls.len());
        for call in calls {
            if tx.is_closed() {
                debug!("Client stopped listening; skipping tool {}", call.name);
                return None;
            }
            let run = self.run_tool(toolset, call).await;
            tx.send(AgentEvent::ToolResult {
                id: run.call.id.clone(),
                name: run.call.name.clone(),
                output: run.output.clone(),
                is_error: run.is_error,
            })
            .ok()?;
            runs.push(run);
        }
        Some(runs)
    }

    /// Appends the assistant turn and the tool results that answer it.
    fn extend_conversation(messages: &mut Vec<LlmMessage>, step: Step, runs: &[ToolRun]) {
        messages.push(LlmMessage {
            role: LlmRole::Assistant,
            content: step.content,
        });
        messages.push(LlmMessage {
            role: LlmRole::User,
            content: runs
                .iter()
                .map(|run| {
                    ContentBlock::tool_result(run.call.id.clone(), &run.output, run.is_error)
                })
                .collect(),
        });
    }

    async fn drive_stream(
        self,
        call: ChatCall,
        toolset: Toolset,
        mut events: EventStream,
        tx: mpsc::UnboundedSender<AgentEvent>,
    ) {
        let mut messages = call.messages.clone();
        let mut total = TokenUsage::default();
        let mut turn = 1;

        loop {
            if tx.send(AgentEvent::StepStart).is_err() {
                return;
            }

            let mut acc = StepAccumulator::default();
            while let Some(item) = events.next().await {
                match item.and_then(|event| acc.apply(event)) {
                    Ok(Some(event)) => {
                        if tx.send(event).is_err() {
                            debug!("Client stopped listening; abandoning stream");
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("Provider stream error: {}", e);
                        let _ = tx.send(AgentEvent::Error(e.to_string()));
                        return;
                    }
                }
            }

            let step = acc.finish();
            total = total.add(step.usage);
            let finish_reason = step.finish_reason;
            let calls = step.tool_calls();

            let Some(runs) = self.report_tools(&toolset, calls, &tx).await else {
                return;
            };

            let is_continued = !runs.is_empty() && turn < self.config.max_tool_turns;
            let step_finish = AgentEvent::StepFinish {
                finish_reason,
                usage: step.usage,
                is_continued,
            };
            if tx.send(step_finish).is_err() {
                return;
            }
            if !is_continued {
                let _ = tx.send(AgentEvent::Finish {
                    finish_reason,
                    usage: total,
                });
                return;
            }

            Self::extend_conversation(&mut messages, step, &runs);
            turn += 1;
            if tx.is_closed() {
                debug!("Client stopped listening; not continuing after tool results");
                return;
            }
            events = match self.open_stream(&call, &messages, &toolset).await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to continue after tool results: {}", e);
                    let _ = tx.send(AgentEvent::Error(e.to_string()));
                    return;
                }
            };
        }
    }
}

#[async_trait]
impl ChatProvider for LlmService {
    async fn generate(&self, call: ChatCall) -> Result<Generation, LlmError> {
        let toolset = self.toolset(&call.sandbox_id);
        let mut messages = call.messages.clone();
        let mut text = String::new();
        let mut total = TokenUsage::default();

        for turn in 1..=self.config.max_tool_turns {
            let step = self.complete_step(&call, &messages, &toolset).await?;
            text.push_str(&step.text());
            total = total.add(step.usage);

            let calls = step.tool_calls();
            let runs = self.run_tools(&toolset, calls).await;
            if runs.is_empty() || turn == self.config.max_tool_turns {
                return Ok(Generation {
                    text,
                    usage: total,
                    finish_reason: step.finish_reason,
                });
            }
            Self::extend_conversation(&mut messages, step, &runs);
        }

        // max_tool_turns is validated to be at least 1, so the loop always returns.
        Ok(Generation {
            text,
            usage: total,
            finish_reason: FinishReason::Unknown,
        })
    }

    async fn stream(
        &self,
        call: ChatCall,
    ) -> Result<mpsc::UnboundedReceiver<AgentEvent>, LlmError> {
        let toolset = self.toolset(&call.sandbox_id);
        let events = self.open_stream(&call, &call.messages, &toolset).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().drive_stream(call, toolset, events, tx));
        Ok(rx)
    }
}
