use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::content::MessageContent;
use super::role::Role;
use super::tool::ToolCall;
use crate::errors::{BridgeError, BridgeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MessageBuilder")]
/// A message to or from a model. Immutable once built.
pub struct Message {
    role: Role,
    content: Vec<MessageContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn system<S: Into<String>>(text: S) -> BridgeResult<Self> {
        Self::builder().role(Role::System).text(text).build()
    }

    pub fn user<S: Into<String>>(text: S) -> BridgeResult<Self> {
        Self::builder().role(Role::User).text(text).build()
    }

    pub fn assistant<S: Into<String>>(text: S) -> BridgeResult<Self> {
        Self::builder().role(Role::Assistant).text(text).build()
    }

    /// The result of running the tool call `call_id`, fed back to the model
    pub fn tool_result<I: Into<String>, S: Into<String>>(call_id: I, text: S) -> BridgeResult<Self> {
        Self::builder()
            .role(Role::Tool)
            .tool_call_id(call_id)
            .text(text)
            .build()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &[MessageContent] {
        &self.content
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        self.tool_call_id.as_deref()
    }

    /// All text parts joined together, in order
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(MessageContent::as_text)
            .collect()
    }

    /// Serialization with a stable key order, so two equal messages always
    /// produce byte-identical JSON.
    pub fn to_canonical_json(&self) -> Value {
        // Serializing a plain data struct cannot fail
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        sort_keys(value)
    }
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Collects the parts of a [`Message`] and checks them on [`MessageBuilder::build`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageBuilder {
    role: Option<Role>,
    #[serde(default)]
    content: Vec<MessageContent>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
    #[serde(default)]
    tool_call_id: Option<String>,
}

impl MessageBuilder {
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    pub fn text<S: Into<String>>(self, text: S) -> Self {
        self.content(MessageContent::text(text))
    }

    pub fn image<S: Into<String>, T: Into<String>>(self, data: S, mime_type: T) -> Self {
        self.content(MessageContent::image(data, mime_type))
    }

    pub fn tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn tool_call_id<S: Into<String>>(mut self, id: S) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    pub fn build(self) -> BridgeResult<Message> {
        let role = self
            .role
            .ok_or_else(|| BridgeError::Validation("message role is not set".to_string()))?;

        let has_content = self.content.iter().any(|part| !part.is_empty());
        if !has_content && self.tool_calls.is_empty() && self.tool_call_id.is_none() {
            return Err(BridgeError::Validation(format!(
                "{} message has neither content nor a tool call reference",
                role
            )));
        }
        if role == Role::Tool && self.tool_call_id.is_none() {
            return Err(BridgeError::Validation(
                "tool message must reference the tool call it answers".to_string(),
            ));
        }
        if role != Role::Tool && self.tool_call_id.is_some() {
            return Err(BridgeError::Validation(format!(
                "{} message cannot carry a tool call reference",
                role
            )));
        }
        if role != Role::Assistant && !self.tool_calls.is_empty() {
            return Err(BridgeError::Validation(format!(
                "{} message cannot request tool calls",
                role
            )));
        }

        Ok(Message {
            role,
            content: self.content,
            tool_calls: self.tool_calls,
            tool_call_id: self.tool_call_id,
        })
    }
}

impl TryFrom<MessageBuilder> for Message {
    type Error = BridgeError;

    fn try_from(builder: MessageBuilder) -> BridgeResult<Self> {
        builder.build()
    }
}
