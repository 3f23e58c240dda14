use serde::{Deserialize, Serialize};

use super::message::Message;
use super::role::Role;
use super::tool::ToolCall;
use crate::errors::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
        total_tokens: Option<u32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

/// A finished assistant turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub message: Message,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl Completion {
    pub fn new(message: Message, usage: Usage) -> Self {
        Self {
            message,
            usage,
            finish_reason: None,
        }
    }

    pub fn with_finish_reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }
}

/// Either a completed message or exactly one terminal error
pub type InvocationResult = BridgeResult<Completion>;

/// What an adapter yields while streaming, before the engine numbers it
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    ToolCall(ToolCall),
    Finish {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkPayload {
    Text {
        text: String,
    },
    ToolCall {
        call: ToolCall,
    },
    /// End of stream marker
    End {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
    /// Terminal failure; anything delivered before it stays valid partial output
    Error {
        error: BridgeError,
    },
}

/// One ordered fragment of a streamed invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub index: u64,
    pub payload: ChunkPayload,
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            ChunkPayload::End { .. } | ChunkPayload::Error { .. }
        )
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            ChunkPayload::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Folds stream chunks back into the completion a non-streamed call would return
#[derive(Debug, Default)]
pub struct StreamCollector {
    text: String,
    tool_calls: Vec<ToolCall>,
    next_index: u64,
    outcome: Option<BridgeResult<(Usage, Option<String>)>>,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks must arrive in index order; anything after a terminal chunk is ignored
    pub fn push(&mut self, chunk: StreamChunk) -> BridgeResult<()> {
        if self.outcome.is_some() {
            return Ok(());
        }
        if chunk.index != self.next_index {
            return Err(BridgeError::Protocol(format!(
                "stream chunk {} arrived out of order, expected {}",
                chunk.index, self.next_index
            )));
        }
        self.next_index += 1;

        match chunk.payload {
            ChunkPayload::Text { text } => self.text.push_str(&text),
            ChunkPayload::ToolCall { call } => self.tool_calls.push(call),
            ChunkPayload::End {
                usage,
                finish_reason,
            } => self.outcome = Some(Ok((usage.unwrap_or_default(), finish_reason))),
            ChunkPayload::Error { error } => self.outcome = Some(Err(error)),
        }
        Ok(())
    }

    /// Text received so far, including partial output of a failed stream
    pub fn partial_text(&self) -> &str {
        &self.text
    }

    pub fn finish(self) -> InvocationResult {
        let (usage, finish_reason) = match self.outcome {
            Some(Ok(end)) => end,
            Some(Err(error)) => return Err(error),
            None => {
                return Err(BridgeError::Protocol(
                    "stream ended without an end marker".to_string(),
                ))
            }
        };

        let mut builder = Message::builder().role(Role::Assistant);
        if !self.text.is_empty() {
            builder = builder.text(self.text);
        }
        for call in self.tool_calls {
            builder = builder.tool_call(call);
        }
        let message = builder.build().map_err(|_| {
            BridgeError::Protocol("model returned neither text nor tool calls".to_string())
        })?;

        Ok(Completion {
            message,
            usage,
            finish_reason,
        })
    }
}
