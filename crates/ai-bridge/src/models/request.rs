use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::message::Message;
use super::role::Role;
use super::tool::ToolSpec;
use crate::errors::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Everything needed for one model call, independent of the backend serving it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    /// Model identifier; adapters fall back to their configured model when unset
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub stream: bool,
}

impl InvocationRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            model: None,
            sampling: SamplingParams::default(),
            stream: false,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.sampling.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.sampling.max_tokens = Some(max_tokens);
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Check message ordering, tool specs and sampling parameters.
    ///
    /// The conversation must follow the chat convention every backend expects:
    /// an optional leading system message, a user turn first, user and assistant
    /// alternating, and tool messages answering the calls of the assistant turn
    /// right before them.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.messages.is_empty() {
            return Err(BridgeError::Validation(
                "request must contain at least one message".to_string(),
            ));
        }

        let mut previous: Option<Role> = None;
        let mut pending_calls: HashSet<&str> = HashSet::new();

        for (position, message) in self.messages.iter().enumerate() {
            let role = message.role();
            let invalid = |reason: &str| {
                Err(BridgeError::Validation(format!(
                    "message {} ({}): {}",
                    position, role, reason
                )))
            };

            match role {
                Role::System => {
                    if position != 0 {
                        return invalid("system message is only allowed first");
                    }
                }
                Role::Tool => {
                    if !matches!(previous, Some(Role::Assistant) | Some(Role::Tool)) {
                        return invalid("tool message must follow an assistant tool call");
                    }
                    let call_id = message.tool_call_id().unwrap_or_default();
                    if !pending_calls.remove(call_id) {
                        return invalid(&format!("no pending tool call with id '{}'", call_id));
                    }
                }
                Role::User | Role::Assistant => {
                    if !pending_calls.is_empty() {
                        return invalid("previous tool calls have not all been answered");
                    }
                    match previous {
                        None | Some(Role::System) if role == Role::Assistant => {
                            return invalid("conversation must start with a user message");
                        }
                        Some(prev) if prev == role => {
                            return invalid("user and assistant messages must alternate");
                        }
                        _ => {}
                    }
                    if role == Role::Assistant {
                        pending_calls = message.tool_calls().iter().map(|c| c.id.as_str()).collect();
                    }
                }
            }
            previous = Some(role);
        }

        if previous == Some(Role::System) {
            return Err(BridgeError::Validation(
                "request must contain a message after the system prompt".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for tool in &self.tools {
            tool.validate()?;
            if !names.insert(tool.name.as_str()) {
                return Err(BridgeError::Validation(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
        }

        if let Some(temperature) = self.sampling.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(BridgeError::Validation(format!(
                    "temperature {} is outside 0.0..=2.0",
                    temperature
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCall;
    use serde_json::json;

    fn assistant_calling(id: &str) -> Message {
        Message::builder()
            .role(Role::Assistant)
            .tool_call(ToolCall::new(id, "get_weather", json!({"city": "Paris"})))
            .build()
            .unwrap()
    }

    #[test]
    fn test_valid_conversation() {
        let request = InvocationRequest::new(vec![
            Message::system("You are a helpful assistant.").unwrap(),
            Message::user("What's the weather in Paris?").unwrap(),
            assistant_calling("call_1"),
            Message::tool_result("call_1", "Sunny").unwrap(),
            Message::assistant("It is sunny.").unwrap(),
            Message::user("Thanks").unwrap(),
        ]);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_empty_request_is_invalid() {
        let request = InvocationRequest::new(vec![]);
        assert!(matches!(request.validate(), Err(BridgeError::Validation(_))));
    }

    #[test]
    fn test_role_order_violations() {
        let cases = vec![
            vec![
                Message::user("a").unwrap(),
                Message::system("late system").unwrap(),
            ],
            vec![Message::assistant("hi").unwrap()],
            vec![Message::user("a").unwrap(), Message::user("b").unwrap()],
            vec![
                Message::user("a").unwrap(),
                Message::tool_result("call_1", "orphan").unwrap(),
            ],
            vec![
                Message::user("a").unwrap(),
                assistant_calling("call_1"),
                Message::user("skipped the tool").unwrap(),
            ],
            vec![
                Message::user("a").unwrap(),
                assistant_calling("call_1"),
                Message::tool_result("call_2", "wrong id").unwrap(),
            ],
            vec![Message::system("only a system prompt").unwrap()],
        ];

        for messages in cases {
            let request = InvocationRequest::new(messages.clone());
            assert!(
                matches!(request.validate(), Err(BridgeError::Validation(_))),
                "expected validation failure for {:?}",
                messages
            );
        }
    }

    #[test]
    fn test_duplicate_tools_rejected() {
        let tool = ToolSpec::new("lookup", "Looks up", json!({"type": "object"}));
        let request = InvocationRequest::new(vec![Message::user("hi").unwrap()])
            .with_tools(vec![tool.clone(), tool]);
        let err = request.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate tool name"));
    }

    #[test]
    fn test_temperature_range() {
        let request = InvocationRequest::new(vec![Message::user("hi").unwrap()]).with_temperature(3.5);
        assert!(request.validate().is_err());

        let request = InvocationRequest::new(vec![Message::user("hi").unwrap()]).with_temperature(0.7);
        assert!(request.validate().is_ok());
    }
}
