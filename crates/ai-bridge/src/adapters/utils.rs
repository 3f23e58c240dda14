//! Translation to and from the OpenAI chat completions wire format, shared by
//! every backend that speaks it (OpenAI itself, Databricks serving endpoints).
use std::collections::BTreeMap;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::base::EventStream;
use crate::errors::{BridgeError, BridgeResult};
use crate::models::content::MessageContent;
use crate::models::message::Message;
use crate::models::request::InvocationRequest;
use crate::models::response::{Completion, InvocationResult, StreamEvent, Usage};
use crate::models::role::Role;
use crate::models::tool::{ToolCall, ToolSpec};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    OpenAi,
    Anthropic,
}

/// Convert canonical messages to OpenAI's API message specification
///   some openai compatible endpoints use the anthropic image spec at the content level
///   even though the message structure is otherwise following openai, the enum switches this
pub fn messages_to_openai_spec(messages: &[Message], image_format: ImageFormat) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let mut converted = Map::new();
            converted.insert("role".to_string(), json!(message.role()));

            if let Some(content) = content_to_openai_spec(message.content(), image_format) {
                converted.insert("content".to_string(), content);
            }

            if !message.tool_calls().is_empty() {
                let tool_calls: Vec<Value> = message
                    .tool_calls()
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": arguments_to_string(&call.arguments),
                            }
                        })
                    })
                    .collect();
                converted.insert("tool_calls".to_string(), json!(tool_calls));
            }

            if let Some(id) = message.tool_call_id() {
                converted.insert("tool_call_id".to_string(), json!(id));
            }

            Value::Object(converted)
        })
        .collect()
}

/// Plain text collapses to a string, anything with images becomes a part array
fn content_to_openai_spec(content: &[MessageContent], image_format: ImageFormat) -> Option<Value> {
    let parts: Vec<&MessageContent> = content.iter().filter(|part| !part.is_empty()).collect();
    if parts.is_empty() {
        return None;
    }

    if parts.iter().all(|part| part.as_text().is_some()) {
        let text: String = parts.iter().filter_map(|part| part.as_text()).collect();
        return Some(json!(text));
    }

    let converted: Vec<Value> = parts
        .iter()
        .map(|part| match part {
            MessageContent::Text { text } => json!({"type": "text", "text": text}),
            MessageContent::Image { data, mime_type } => {
                convert_image(data, mime_type, image_format)
            }
        })
        .collect();
    Some(json!(converted))
}

/// Convert an image content into an image json based on format
pub fn convert_image(data: &str, mime_type: &str, image_format: ImageFormat) -> Value {
    match image_format {
        ImageFormat::OpenAi => json!({
            "type": "image_url",
            "image_url": {
                "url": format!("data:{};base64,{}", mime_type, data)
            }
        }),
        ImageFormat::Anthropic => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": mime_type,
                "data": data,
            }
        }),
    }
}

fn arguments_to_string(arguments: &Value) -> String {
    match arguments {
        // Arguments the model produced as unparseable text go back verbatim
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Convert canonical tool specs to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect()
}

/// Build the chat completions body. `model` is omitted for endpoints that
/// encode the model in their url.
pub fn build_chat_payload(
    request: &InvocationRequest,
    model: Option<&str>,
    image_format: ImageFormat,
    stream: bool,
) -> Value {
    let mut payload = Map::new();
    if let Some(model) = model {
        payload.insert("model".to_string(), json!(model));
    }
    payload.insert(
        "messages".to_string(),
        json!(messages_to_openai_spec(&request.messages, image_format)),
    );
    if !request.tools.is_empty() {
        payload.insert("tools".to_string(), json!(tools_to_openai_spec(&request.tools)));
    }
    if let Some(temperature) = request.sampling.temperature {
        payload.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = request.sampling.max_tokens {
        payload.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if stream {
        payload.insert("stream".to_string(), json!(true));
    }
    Value::Object(payload)
}

/// Send a request, classifying transport failures and non-success statuses
pub async fn send(builder: RequestBuilder) -> BridgeResult<Response> {
    let response = builder.send().await.map_err(classify_transport_error)?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

pub async fn post_json(client: &Client, url: &str, auth: &str, payload: &Value) -> BridgeResult<Value> {
    let response = send(
        client
            .post(url)
            .header("Authorization", auth)
            .json(payload),
    )
    .await?;

    response.json().await.map_err(classify_transport_error)
}

/// 408, 429 and 5xx are worth retrying; every other failure status means the
/// request itself is wrong
pub fn classify_status(status: StatusCode, body: &str) -> BridgeError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        BridgeError::Adapter(format!("Server error: {}: {}", status, body))
    } else {
        BridgeError::Protocol(format!("Request failed: {}: {}", status, body))
    }
}

pub fn classify_transport_error(err: reqwest::Error) -> BridgeError {
    if err.is_decode() || err.is_builder() {
        BridgeError::Protocol(format!("Malformed exchange: {}", err))
    } else {
        BridgeError::Adapter(format!("Transport error: {}", err))
    }
}

/// Map an `error` object embedded in a response body
pub fn classify_error_body(error: &Value) -> BridgeError {
    if let Some(message) = check_context_length_error(error) {
        return BridgeError::Protocol(format!("Context length exceeded. Message: {}", message));
    }
    let code = error.get("code").and_then(Value::as_str).unwrap_or_default();
    let kind = error.get("type").and_then(Value::as_str).unwrap_or_default();
    if code == "rate_limit_exceeded" || kind == "server_error" || kind == "overloaded_error" {
        BridgeError::Adapter(format!("API error: {}", error))
    } else {
        BridgeError::Protocol(format!("API error: {}", error))
    }
}

fn check_context_length_error(error: &Value) -> Option<String> {
    let code = error.get("code").and_then(Value::as_str);
    if matches!(code, Some("context_length_exceeded") | Some("string_above_max_length")) {
        return Some(
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
        );
    }

    // Databricks external models (e.g. bedrock) nest the upstream message
    let external = error
        .get("external_model_message")?
        .get("message")?
        .as_str()?;
    if external.to_lowercase().contains("too long") {
        Some(external.to_string())
    } else {
        None
    }
}

pub fn get_usage(data: &Value) -> Usage {
    let usage = match data.get("usage") {
        Some(usage) if usage.is_object() => usage,
        _ => return Usage::default(),
    };
    let count = |key: &str| usage.get(key).and_then(Value::as_u64).map(|v| v as u32);

    let input_tokens = count("prompt_tokens");
    let output_tokens = count("completion_tokens");
    let total_tokens = count("total_tokens").or(match (input_tokens, output_tokens) {
        (Some(input), Some(output)) => Some(input + output),
        _ => None,
    });

    Usage::new(input_tokens, output_tokens, total_tokens)
}

/// Parse arguments as JSON, falling back to the raw text when the model
/// produced something that is not valid JSON
fn parse_arguments(id: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(tool_call_id = id, error = %e, "tool call arguments are not valid JSON");
        Value::String(raw.to_string())
    })
}

/// Convert an OpenAI chat completion response into a canonical completion
pub fn openai_response_to_completion(response: &Value) -> InvocationResult {
    if let Some(error) = response.get("error") {
        return Err(classify_error_body(error));
    }

    let choice = response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .ok_or_else(|| BridgeError::Protocol("response contains no choices".to_string()))?;
    let original = choice
        .get("message")
        .ok_or_else(|| BridgeError::Protocol("response choice has no message".to_string()))?;

    let mut builder = Message::builder().role(Role::Assistant);
    if let Some(text) = original.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            builder = builder.text(text);
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(Value::as_array) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str().unwrap_or_default();
            let name = tool_call["function"]["name"].as_str().unwrap_or_default();
            if name.is_empty() {
                return Err(BridgeError::Protocol(format!(
                    "tool call '{}' has no function name",
                    id
                )));
            }
            let arguments = tool_call["function"]["arguments"].as_str().unwrap_or_default();
            builder = builder.tool_call(ToolCall::new(id, name, parse_arguments(id, arguments)));
        }
    }

    let message = builder.build().map_err(|_| {
        BridgeError::Protocol("model returned neither text nor tool calls".to_string())
    })?;

    let mut completion = Completion::new(message, get_usage(response));
    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        completion = completion.with_finish_reason(reason);
    }
    Ok(completion)
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed chat completion chunks.
///
/// Text deltas are forwarded as they arrive. Tool call fragments are keyed by
/// their index and only emitted, whole, when the stream finishes.
#[derive(Debug, Default)]
pub struct ChatStreamState {
    tool_calls: BTreeMap<u64, PartialToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl ChatStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, chunk: &Value) -> BridgeResult<Vec<StreamEvent>> {
        if let Some(error) = chunk.get("error") {
            return Err(classify_error_body(error));
        }

        if chunk.get("usage").is_some_and(Value::is_object) {
            self.usage = Some(get_usage(chunk));
        }

        let mut events = Vec::new();
        let choices = chunk.get("choices").and_then(Value::as_array);
        for choice in choices.into_iter().flatten() {
            let delta = &choice["delta"];
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    events.push(StreamEvent::Text(text.to_string()));
                }
            }

            for fragment in delta
                .get("tool_calls")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                let partial = self.tool_calls.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    partial.id = id.to_string();
                }
                if let Some(name) = fragment["function"].get("name").and_then(Value::as_str) {
                    partial.name.push_str(name);
                }
                if let Some(arguments) = fragment["function"].get("arguments").and_then(Value::as_str) {
                    partial.arguments.push_str(arguments);
                }
            }

            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.finish_reason = Some(reason.to_string());
            }
        }

        Ok(events)
    }

    /// A finish reason arrived, so the reply is whole even without `[DONE]`
    pub fn has_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn finish(self) -> BridgeResult<Vec<StreamEvent>> {
        let mut events = Vec::new();
        for (index, partial) in self.tool_calls {
            if partial.name.is_empty() {
                return Err(BridgeError::Protocol(format!(
                    "streamed tool call {} has no function name",
                    index
                )));
            }
            let arguments = parse_arguments(&partial.id, &partial.arguments);
            events.push(StreamEvent::ToolCall(ToolCall::new(
                partial.id,
                partial.name,
                arguments,
            )));
        }
        events.push(StreamEvent::Finish {
            usage: self.usage,
            finish_reason: self.finish_reason,
        });
        Ok(events)
    }
}

/// Decode a server-sent event response body of chat completion chunks
pub fn chat_event_stream(response: Response) -> EventStream {
    let stream = async_stream::stream! {
        let mut events = response.bytes_stream().eventsource();
        let mut state = ChatStreamState::new();
        let mut done = false;

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield Err(BridgeError::Adapter(format!("stream interrupted: {}", e)));
                    return;
                }
            };

            let data = event.data.trim();
            if data == "[DONE]" {
                done = true;
                break;
            }
            if data.is_empty() {
                continue;
            }

            let chunk: Value = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(BridgeError::Protocol(format!("malformed stream chunk: {}", e)));
                    return;
                }
            };

            match state.apply(&chunk) {
                Ok(parsed) => {
                    for event in parsed {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if !done && !state.has_finished() {
            yield Err(BridgeError::Adapter("stream ended before completion".to_string()));
            return;
        }

        match state.finish() {
            Ok(parsed) => {
                for event in parsed {
                    yield Ok(event);
                }
            }
            Err(e) => yield Err(e),
        }
    };

    Box::pin(stream)
}
