use async_trait::async_trait;
use reqwest::Client;

use super::base::{Adapter, EventStream};
use super::utils::{
    build_chat_payload, chat_event_stream, openai_response_to_completion, post_json, send,
    ImageFormat,
};
use crate::config::{get_env, AdapterConfig};
use crate::engine::policy::RetryPolicy;
use crate::errors::{BridgeError, BridgeResult};
use crate::models::request::InvocationRequest;
use crate::models::response::InvocationResult;

/// Calls a Databricks model serving endpoint. The endpoint name is the model;
/// the body follows the OpenAI chat format without a `model` field.
pub struct DatabricksAdapter {
    client: Client,
    config: AdapterConfig,
    host: String,
    image_format: ImageFormat,
}

impl DatabricksAdapter {
    pub fn new(config: AdapterConfig) -> BridgeResult<Self> {
        config.validate()?;
        let host = config
            .base_url
            .as_deref()
            .map(|host| host.trim_end_matches('/').to_string())
            .ok_or_else(|| BridgeError::Config("Databricks host must be set".to_string()))?;
        if config.api_key.is_none() {
            return Err(BridgeError::Config(
                "Authentication not configured: set a Databricks token".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.attempt_timeout())
            .build()
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        Ok(Self {
            client,
            config,
            host,
            // Most serving endpoints front anthropic models behind the openai shape
            image_format: ImageFormat::Anthropic,
        })
    }

    pub fn with_image_format(mut self, image_format: ImageFormat) -> Self {
        self.image_format = image_format;
        self
    }

    /// Build from `DATABRICKS_*` variables; the workspace conventions
    /// `DATABRICKS_HOST` and `DATABRICKS_TOKEN` are accepted as well
    pub fn from_env() -> BridgeResult<Self> {
        let mut config = AdapterConfig::from_env("DATABRICKS")?;
        if config.base_url.is_none() {
            config.base_url = get_env("DATABRICKS_HOST")?;
        }
        if config.api_key.is_none() {
            config.api_key = get_env("DATABRICKS_TOKEN")?;
        }
        Self::new(config)
    }

    fn endpoint_url(&self, request: &InvocationRequest) -> BridgeResult<String> {
        let endpoint = request
            .model
            .as_deref()
            .or(self.config.model.as_deref())
            .ok_or_else(|| {
                BridgeError::Protocol("no serving endpoint given for Databricks".to_string())
            })?;
        Ok(format!(
            "{}/serving-endpoints/{}/invocations",
            self.host, endpoint
        ))
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.config.api_key.as_deref().unwrap_or_default())
    }
}

#[async_trait]
impl Adapter for DatabricksAdapter {
    fn name(&self) -> &str {
        "databricks"
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    async fn invoke(&self, request: &InvocationRequest) -> InvocationResult {
        let url = self.endpoint_url(request)?;
        let payload = build_chat_payload(request, None, self.image_format, false);
        let response = post_json(&self.client, &url, &self.auth_header(), &payload).await?;
        openai_response_to_completion(&response)
    }

    async fn stream(&self, request: &InvocationRequest) -> BridgeResult<EventStream> {
        let url = self.endpoint_url(request)?;
        let payload = build_chat_payload(request, None, self.image_format, true);
        let response = send(
            self.client
                .post(&url)
                .header("Authorization", self.auth_header())
                .json(&payload),
        )
        .await?;
        Ok(chat_event_stream(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(host: String) -> AdapterConfig {
        AdapterConfig::new()
            .with_base_url(host)
            .with_api_key("test_token")
            .with_model("my-databricks-model")
    }

    #[tokio::test]
    async fn test_databricks_completion_with_token() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;

        let mock_response = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Hello!"
                }
            }],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 25,
                "total_tokens": 35
            }
        });

        let system = "You are a helpful assistant.";
        let expected_request_body = json!({
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": "Hello"}
            ]
        });

        Mock::given(method("POST"))
            .and(path("/serving-endpoints/my-databricks-model/invocations"))
            .and(header("Authorization", "Bearer test_token"))
            .and(body_json(expected_request_body))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_response))
            .expect(1)
            .mount(&mock_server)
            .await;

        let adapter = DatabricksAdapter::new(config(mock_server.uri()))?;
        let request =
            InvocationRequest::new(vec![Message::system(system)?, Message::user("Hello")?]);

        let completion = adapter.invoke(&request).await?;
        assert_eq!(completion.message.text(), "Hello!");
        assert_eq!(completion.usage.total_tokens, Some(35));

        Ok(())
    }

    #[tokio::test]
    async fn test_request_model_selects_endpoint() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/serving-endpoints/databricks-meta-llama/invocations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "4"}}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let adapter = DatabricksAdapter::new(config(mock_server.uri()))?;
        let request = InvocationRequest::new(vec![Message::user("2+2?")?])
            .with_model("databricks-meta-llama");
        assert_eq!(adapter.invoke(&request).await?.message.text(), "4");

        Ok(())
    }

    #[tokio::test]
    async fn test_context_length_error_is_permanent() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": {
                    "error": "Received error from amazon-bedrock",
                    "external_model_message": {"message": "Input is too long for requested model."}
                }
            })))
            .mount(&mock_server)
            .await;

        let adapter = DatabricksAdapter::new(config(mock_server.uri()))?;
        let request = InvocationRequest::new(vec![Message::user("long")?]);
        let err = adapter.invoke(&request).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(msg) if msg.starts_with("Context length exceeded")));

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_interrupted_by_server_error() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let adapter = DatabricksAdapter::new(config(mock_server.uri()))?;
        let request = InvocationRequest::new(vec![Message::user("Hello")?]);
        assert!(matches!(
            adapter.stream(&request).await.map(|_| ()),
            Err(BridgeError::Adapter(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_tool_call() -> anyhow::Result<()> {
        let body = [
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"lookup","arguments":"{\"q\":"}}]}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"spark\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            "data: [DONE]",
        ]
        .join("\n\n")
            + "\n\n";

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&mock_server)
            .await;

        let adapter = DatabricksAdapter::new(config(mock_server.uri()))?;
        let request = InvocationRequest::new(vec![Message::user("Search")?]);
        let events: Vec<_> = adapter.stream(&request).await?.collect().await;

        assert_eq!(events.len(), 2);
        match &events[0] {
            Ok(crate::models::response::StreamEvent::ToolCall(call)) => {
                assert_eq!(call.id, "call_9");
                assert_eq!(call.arguments, json!({"q": "spark"}));
            }
            other => panic!("Expected tool call, got {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn test_requires_host_and_token() {
        assert!(DatabricksAdapter::new(AdapterConfig::new().with_api_key("t")).is_err());
        assert!(DatabricksAdapter::new(AdapterConfig::new().with_base_url("https://x.cloud.databricks.com")).is_err());
    }
}
