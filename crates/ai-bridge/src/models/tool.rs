use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BridgeError, BridgeResult};

lazy_static! {
    static ref TOOL_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").unwrap();
}

/// A tool advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    /// The name of the tool
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// JSON schema of the parameters the tool accepts
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new<N, D>(name: N, description: D, parameters: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        ToolSpec {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if !is_valid_tool_name(&self.name) {
            return Err(BridgeError::Validation(format!(
                "tool name '{}' must match [a-zA-Z0-9_-] and be at most 64 characters",
                self.name
            )));
        }
        if !self.parameters.is_object() {
            return Err(BridgeError::Validation(format!(
                "parameters of tool '{}' must be a JSON schema object",
                self.name
            )));
        }
        Ok(())
    }
}

/// A tool invocation requested by the assistant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Identifier the matching tool result refers back to
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new<I: Into<String>, S: Into<String>>(id: I, name: S, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

pub fn is_valid_tool_name(name: &str) -> bool {
    TOOL_NAME.is_match(name)
}
