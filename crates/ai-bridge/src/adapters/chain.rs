//! Bridge to an orchestration framework chat model.
//!
//! The framework object is already wired to its own backend; all this adapter
//! knows is the framework's message shapes and the [`ChatRunnable`] interface.
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::base::{Adapter, Capabilities, EventStream};
use super::utils::{convert_image, tools_to_openai_spec, ImageFormat};
use crate::config::AdapterConfig;
use crate::engine::policy::RetryPolicy;
use crate::errors::{BridgeError, BridgeResult};
use crate::models::content::MessageContent;
use crate::models::message::Message;
use crate::models::request::InvocationRequest;
use crate::models::response::{Completion, InvocationResult, StreamEvent, Usage};
use crate::models::role::Role;
use crate::models::tool::ToolCall;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// Streamed chunks report usage in parts; merging them sums the counts
impl std::ops::Add for UsageMetadata {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub args: Value,
}

/// Messages as the framework represents them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChainMessage {
    System {
        content: String,
    },
    Human {
        /// A string, or a list of content blocks when images are attached
        content: Value,
    },
    Ai {
        content: String,
        #[serde(default)]
        tool_calls: Vec<ChainToolCall>,
        #[serde(default)]
        usage_metadata: Option<UsageMetadata>,
        #[serde(default)]
        response_metadata: Map<String, Value>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallChunk {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Fragment of the JSON encoded arguments
    #[serde(default)]
    pub args: Option<String>,
}

/// One increment of a streamed framework reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiMessageChunk {
    pub content: String,
    #[serde(default)]
    pub tool_call_chunks: Vec<ToolCallChunk>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub response_metadata: Map<String, Value>,
}

/// Per call options handed to the framework object
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunnableConfig {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Tools in the function calling format the framework binds to its model
    pub tools: Vec<Value>,
    pub run_name: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    /// Failure reported by the model the framework wraps
    #[error("provider error ({status:?}): {message}")]
    Provider { status: Option<u16>, message: String },
}

impl From<ChainError> for BridgeError {
    fn from(err: ChainError) -> Self {
        let transient = match &err {
            ChainError::RateLimited(_) | ChainError::Connection(_) | ChainError::Timeout(_) => true,
            ChainError::InvalidInput(_) | ChainError::Unsupported(_) => false,
            ChainError::Provider { status, .. } => match status {
                Some(code) => *code == 408 || *code == 429 || *code >= 500,
                None => true,
            },
        };
        if transient {
            BridgeError::Adapter(err.to_string())
        } else {
            BridgeError::Protocol(err.to_string())
        }
    }
}

pub type AiChunkStream = BoxStream<'static, Result<AiMessageChunk, ChainError>>;

/// The slice of a framework chat model this crate relies on
#[async_trait]
pub trait ChatRunnable: Send + Sync {
    async fn invoke(
        &self,
        input: Vec<ChainMessage>,
        config: &RunnableConfig,
    ) -> Result<ChainMessage, ChainError>;

    async fn stream(
        &self,
        input: Vec<ChainMessage>,
        config: &RunnableConfig,
    ) -> Result<AiChunkStream, ChainError>;

    fn supports_tools(&self) -> bool {
        true
    }
}

/// Runs canonical requests through a [`ChatRunnable`]
pub struct ChainAdapter {
    runnable: Arc<dyn ChatRunnable>,
    config: AdapterConfig,
    name: String,
}

impl ChainAdapter {
    pub fn new(runnable: Arc<dyn ChatRunnable>, config: AdapterConfig) -> Self {
        Self {
            runnable,
            config,
            name: "chain".to_string(),
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    fn runnable_config(&self, request: &InvocationRequest) -> RunnableConfig {
        RunnableConfig {
            model: request.model.clone().or_else(|| self.config.model.clone()),
            temperature: request.sampling.temperature,
            max_tokens: request.sampling.max_tokens,
            tools: tools_to_openai_spec(&request.tools),
            run_name: self.name.clone(),
        }
    }
}

#[async_trait]
impl Adapter for ChainAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            tools: self.runnable.supports_tools(),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    async fn invoke(&self, request: &InvocationRequest) -> InvocationResult {
        let input = messages_to_chain(&request.messages);
        let config = self.runnable_config(request);
        let reply = self.runnable.invoke(input, &config).await?;
        chain_reply_to_completion(reply)
    }

    async fn stream(&self, request: &InvocationRequest) -> BridgeResult<EventStream> {
        let input = messages_to_chain(&request.messages);
        let config = self.runnable_config(request);
        let mut chunks = self.runnable.stream(input, &config).await?;

        let stream = async_stream::stream! {
            let mut state = ChunkState::default();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => {
                        if let Some(text) = state.apply(chunk) {
                            yield Ok(StreamEvent::Text(text));
                        }
                    }
                    Err(e) => {
                        yield Err(BridgeError::from(e));
                        return;
                    }
                }
            }
            match state.finish() {
                Ok(events) => {
                    for event in events {
                        yield Ok(event);
                    }
                }
                Err(e) => yield Err(e),
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Convert canonical messages to the framework's message list
pub fn messages_to_chain(messages: &[Message]) -> Vec<ChainMessage> {
    messages
        .iter()
        .map(|message| match message.role() {
            Role::System => ChainMessage::System {
                content: message.text(),
            },
            Role::User => ChainMessage::Human {
                content: human_content(message.content()),
            },
            Role::Assistant => ChainMessage::Ai {
                content: message.text(),
                tool_calls: message
                    .tool_calls()
                    .iter()
                    .map(|call| ChainToolCall {
                        id: Some(call.id.clone()),
                        name: call.name.clone(),
                        args: call.arguments.clone(),
                    })
                    .collect(),
                usage_metadata: None,
                response_metadata: Map::new(),
            },
            Role::Tool => ChainMessage::Tool {
                content: message.text(),
                tool_call_id: message.tool_call_id().unwrap_or_default().to_string(),
            },
        })
        .collect()
}

fn human_content(content: &[MessageContent]) -> Value {
    let has_images = content
        .iter()
        .any(|part| matches!(part, MessageContent::Image { .. }));
    if !has_images {
        let text: String = content.iter().filter_map(MessageContent::as_text).collect();
        return json!(text);
    }

    let blocks: Vec<Value> = content
        .iter()
        .filter(|part| !part.is_empty())
        .map(|part| match part {
            MessageContent::Text { text } => json!({"type": "text", "text": text}),
            MessageContent::Image { data, mime_type } => {
                convert_image(data, mime_type, ImageFormat::OpenAi)
            }
        })
        .collect();
    json!(blocks)
}

fn tool_call_id(id: Option<String>) -> String {
    id.filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()))
}

fn usage_from_metadata(metadata: Option<UsageMetadata>) -> Usage {
    metadata
        .map(|m| Usage::new(Some(m.input_tokens), Some(m.output_tokens), Some(m.total_tokens)))
        .unwrap_or_default()
}

fn finish_reason(metadata: &Map<String, Value>) -> Option<String> {
    metadata
        .get("finish_reason")
        .or_else(|| metadata.get("stop_reason"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Convert the framework's reply into a canonical completion
pub fn chain_reply_to_completion(reply: ChainMessage) -> InvocationResult {
    let (content, tool_calls, usage_metadata, response_metadata) = match reply {
        ChainMessage::Ai {
            content,
            tool_calls,
            usage_metadata,
            response_metadata,
        } => (content, tool_calls, usage_metadata, response_metadata),
        other => {
            return Err(BridgeError::Protocol(format!(
                "framework replied with a non-ai message: {:?}",
                other
            )))
        }
    };

    let mut builder = Message::builder().role(Role::Assistant);
    if !content.is_empty() {
        builder = builder.text(content);
    }
    for call in tool_calls {
        builder = builder.tool_call(ToolCall::new(tool_call_id(call.id), call.name, call.args));
    }
    let message = builder.build().map_err(|_| {
        BridgeError::Protocol("model returned neither text nor tool calls".to_string())
    })?;

    Ok(Completion {
        message,
        usage: usage_from_metadata(usage_metadata),
        finish_reason: finish_reason(&response_metadata),
    })
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    args: String,
}

#[derive(Debug, Default)]
struct ChunkState {
    calls: BTreeMap<u32, PartialCall>,
    usage: Option<UsageMetadata>,
    finish_reason: Option<String>,
}

impl ChunkState {
    /// Record a chunk, returning its text if it carries any
    fn apply(&mut self, chunk: AiMessageChunk) -> Option<String> {
        for fragment in chunk.tool_call_chunks {
            let partial = self.calls.entry(fragment.index).or_default();
            if fragment.id.is_some() {
                partial.id = fragment.id;
            }
            if let Some(name) = fragment.name {
                partial.name.push_str(&name);
            }
            if let Some(args) = fragment.args {
                partial.args.push_str(&args);
            }
        }
        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some(self.usage.map_or(usage, |seen| seen + usage));
        }
        if let Some(reason) = finish_reason(&chunk.response_metadata) {
            self.finish_reason = Some(reason);
        }
        (!chunk.content.is_empty()).then_some(chunk.content)
    }

    fn finish(self) -> BridgeResult<Vec<StreamEvent>> {
        let mut events = Vec::new();
        for (index, partial) in self.calls {
            if partial.name.is_empty() {
                return Err(BridgeError::Protocol(format!(
                    "streamed tool call {} has no name",
                    index
                )));
            }
            let args = if partial.args.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&partial.args).unwrap_or(Value::String(partial.args))
            };
            events.push(StreamEvent::ToolCall(ToolCall::new(
                tool_call_id(partial.id),
                partial.name,
                args,
            )));
        }
        events.push(StreamEvent::Finish {
            usage: self.usage.map(|m| usage_from_metadata(Some(m))),
            finish_reason: self.finish_reason,
        });
        Ok(events)
    }
}
