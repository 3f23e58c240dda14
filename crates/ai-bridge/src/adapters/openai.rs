use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::base::{Adapter, EventStream};
use super::utils::{
    build_chat_payload, chat_event_stream, openai_response_to_completion, post_json, send,
    ImageFormat,
};
use crate::config::AdapterConfig;
use crate::engine::policy::RetryPolicy;
use crate::errors::{BridgeError, BridgeResult};
use crate::models::request::InvocationRequest;
use crate::models::response::InvocationResult;
use crate::retriever::Embedder;

pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const OPENAI_MODEL: &str = "gpt-4o";

/// Talks to the OpenAI chat completions API (or anything wire compatible)
pub struct OpenAiAdapter {
    client: Client,
    config: AdapterConfig,
}

impl OpenAiAdapter {
    pub fn new(config: AdapterConfig) -> BridgeResult<Self> {
        config.validate()?;
        if config.api_key.is_none() {
            return Err(BridgeError::Config(
                "OpenAI adapter requires an api key".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.attempt_timeout())
            .build()
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Build from `OPENAI_*` environment variables
    pub fn from_env() -> BridgeResult<Self> {
        Self::new(AdapterConfig::from_env("OPENAI")?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.base_url_or(OPENAI_HOST), path)
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.config.api_key.as_deref().unwrap_or_default())
    }

    fn model<'a>(&'a self, request: &'a InvocationRequest) -> &'a str {
        request
            .model
            .as_deref()
            .or(self.config.model.as_deref())
            .unwrap_or(OPENAI_MODEL)
    }
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    async fn invoke(&self, request: &InvocationRequest) -> InvocationResult {
        let payload = build_chat_payload(request, Some(self.model(request)), ImageFormat::OpenAi, false);
        let response = post_json(
            &self.client,
            &self.url("chat/completions"),
            &self.auth_header(),
            &payload,
        )
        .await?;
        openai_response_to_completion(&response)
    }

    async fn stream(&self, request: &InvocationRequest) -> BridgeResult<EventStream> {
        let mut payload =
            build_chat_payload(request, Some(self.model(request)), ImageFormat::OpenAi, true);
        payload["stream_options"] = json!({"include_usage": true});

        let response = send(
            self.client
                .post(self.url("chat/completions"))
                .header("Authorization", self.auth_header())
                .json(&payload),
        )
        .await?;
        Ok(chat_event_stream(response))
    }
}

#[async_trait]
impl Embedder for OpenAiAdapter {
    async fn embed(&self, model: &str, input: &str) -> BridgeResult<Vec<f32>> {
        let payload = json!({"model": model, "input": input});
        let response = post_json(
            &self.client,
            &self.url("embeddings"),
            &self.auth_header(),
            &payload,
        )
        .await?;

        let embedding = response["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| BridgeError::Protocol("embedding response has no data".to_string()))?;
        embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| BridgeError::Protocol(format!("non-numeric embedding value {}", v)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use crate::models::response::StreamEvent;
    use crate::models::tool::ToolSpec;
    use futures::StreamExt;
    use indoc::indoc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup_mock_server(response: ResponseTemplate) -> (MockServer, OpenAiAdapter) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test_api_key"))
            .respond_with(response)
            .mount(&mock_server)
            .await;

        let config = AdapterConfig::new()
            .with_base_url(mock_server.uri())
            .with_api_key("test_api_key")
            .with_model("gpt-3.5-turbo");

        let adapter = OpenAiAdapter::new(config).unwrap();
        (mock_server, adapter)
    }

    #[tokio::test]
    async fn test_invoke_basic() -> anyhow::Result<()> {
        let response_body = json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello! How can I assist you today?",
                    "tool_calls": null
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 12,
                "completion_tokens": 15,
                "total_tokens": 27
            }
        });

        let (_server, adapter) =
            setup_mock_server(ResponseTemplate::new(200).set_body_json(response_body)).await;

        let request = InvocationRequest::new(vec![Message::user("Hello?")?]);
        let completion = adapter.invoke(&request).await?;

        assert_eq!(completion.message.text(), "Hello! How can I assist you today?");
        assert_eq!(completion.usage.input_tokens, Some(12));
        assert_eq!(completion.usage.output_tokens, Some(15));
        assert_eq!(completion.usage.total_tokens, Some(27));

        Ok(())
    }

    #[tokio::test]
    async fn test_invoke_tool_request() -> anyhow::Result<()> {
        let response_body = json!({
            "id": "chatcmpl-tool",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_123",
                        "type": "function",
                        "function": {
                            "name": "get_weather",
                            "arguments": "{\"location\":\"San Francisco, CA\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {
                "prompt_tokens": 20,
                "completion_tokens": 15,
                "total_tokens": 35
            }
        });

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .expect(1)
            .mount(&mock_server)
            .await;

        let adapter = OpenAiAdapter::new(
            AdapterConfig::new()
                .with_base_url(mock_server.uri())
                .with_api_key("test_api_key"),
        )?;

        let tool = ToolSpec::new(
            "get_weather",
            "Gets the current weather for a location",
            json!({
                "type": "object",
                "properties": {
                    "location": {
                        "type": "string",
                        "description": "The city and state, e.g. New York, NY"
                    }
                },
                "required": ["location"]
            }),
        );
        let request = InvocationRequest::new(vec![Message::user(
            "What's the weather in San Francisco?",
        )?])
        .with_tools(vec![tool])
        .with_model("gpt-4o-mini");

        let completion = adapter.invoke(&request).await?;

        let call = &completion.message.tool_calls()[0];
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, json!({"location": "San Francisco, CA"}));
        assert_eq!(completion.usage.total_tokens, Some(35));

        Ok(())
    }

    #[tokio::test]
    async fn test_invoke_classifies_failures() -> anyhow::Result<()> {
        let request = InvocationRequest::new(vec![Message::user("Hello?")?]);

        let (_server, adapter) = setup_mock_server(ResponseTemplate::new(429)).await;
        assert!(matches!(
            adapter.invoke(&request).await,
            Err(BridgeError::Adapter(_))
        ));

        let (_server, adapter) = setup_mock_server(ResponseTemplate::new(503)).await;
        assert!(matches!(
            adapter.invoke(&request).await,
            Err(BridgeError::Adapter(_))
        ));

        let (_server, adapter) =
            setup_mock_server(ResponseTemplate::new(400).set_body_string("bad request")).await;
        let err = adapter.invoke(&request).await.unwrap_err();
        assert!(matches!(&err, BridgeError::Protocol(msg) if msg.contains("bad request")));

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_text() -> anyhow::Result<()> {
        let body = indoc! {r#"
            data: {"choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}

            data: {"choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}

            data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}

            data: [DONE]

        "#};
        let (_server, adapter) = setup_mock_server(
            ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
        )
        .await;

        let request = InvocationRequest::new(vec![Message::user("Say hello")?]).streaming(true);
        let events: Vec<_> = adapter.stream(&request).await?.collect().await;
        let events: Vec<StreamEvent> = events.into_iter().collect::<Result<_, _>>()?;

        assert_eq!(events[0], StreamEvent::Text("Hel".to_string()));
        assert_eq!(events[1], StreamEvent::Text("lo".to_string()));
        assert!(matches!(
            &events[2],
            StreamEvent::Finish { usage: Some(usage), finish_reason: Some(reason) }
                if usage.total_tokens == Some(5) && reason == "stop"
        ));
        assert_eq!(events.len(), 3);

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_cut_off_before_done_is_an_error() -> anyhow::Result<()> {
        let body = indoc! {r#"
            data: {"choices":[{"index":0,"delta":{"content":"Hel"}}]}

        "#};
        let (_server, adapter) = setup_mock_server(
            ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
        )
        .await;

        let request = InvocationRequest::new(vec![Message::user("Say hello")?]).streaming(true);
        let events: Vec<_> = adapter.stream(&request).await?.collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().ok(), Some(&StreamEvent::Text("Hel".to_string())));
        assert!(matches!(
            &events[1],
            Err(BridgeError::Adapter(msg)) if msg.contains("ended before completion")
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_finish_reason_without_done() -> anyhow::Result<()> {
        let body = indoc! {r#"
            data: {"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":"stop"}]}

        "#};
        let (_server, adapter) = setup_mock_server(
            ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
        )
        .await;

        let request = InvocationRequest::new(vec![Message::user("Say hi")?]).streaming(true);
        let events: Vec<_> = adapter.stream(&request).await?.collect().await;
        let events: Vec<StreamEvent> = events.into_iter().collect::<Result<_, _>>()?;

        assert_eq!(events[0], StreamEvent::Text("Hi".to_string()));
        assert!(matches!(
            &events[1],
            StreamEvent::Finish { finish_reason: Some(reason), .. } if reason == "stop"
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_embed() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(body_partial_json(json!({"model": "text-embedding-3-small"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.5, -0.25, 1.0]}]
            })))
            .mount(&mock_server)
            .await;

        let adapter = OpenAiAdapter::new(
            AdapterConfig::new()
                .with_base_url(mock_server.uri())
                .with_api_key("test_api_key"),
        )?;
        let embedding = adapter.embed("text-embedding-3-small", "spark").await?;
        assert_eq!(embedding, vec![0.5, -0.25, 1.0]);

        Ok(())
    }

    #[test]
    fn test_requires_api_key() {
        assert!(matches!(
            OpenAiAdapter::new(AdapterConfig::new()),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_retry_policy_follows_config() {
        let adapter = OpenAiAdapter::new(
            AdapterConfig::new()
                .with_api_key("k")
                .with_max_retries(7)
                .with_backoff_base_ms(20),
        )
        .unwrap();
        let policy = adapter.retry_policy();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.backoff_base, std::time::Duration::from_millis(20));
    }
}
