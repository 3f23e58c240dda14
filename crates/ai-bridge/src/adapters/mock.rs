use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use super::base::{Adapter, Capabilities, EventStream};
use crate::engine::policy::RetryPolicy;
use crate::errors::{BridgeError, BridgeResult};
use crate::models::message::Message;
use crate::models::request::InvocationRequest;
use crate::models::response::{Completion, InvocationResult, StreamEvent, Usage};

/// One scripted reaction of the mock to a dispatch
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Reply with this text; streamed as two halves plus a finish event
    Reply(String),
    /// Fail the dispatch before anything is produced
    Fail(BridgeError),
    /// Stream exactly these events
    Events(Vec<BridgeResult<StreamEvent>>),
    /// Never answer
    Hang,
}

/// A mock adapter that plays back pre-configured outcomes for testing
pub struct MockAdapter {
    outcomes: Mutex<VecDeque<MockOutcome>>,
    attempts: AtomicU32,
    policy: RetryPolicy,
    capabilities: Capabilities,
}

impl MockAdapter {
    pub fn new(outcomes: Vec<MockOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            attempts: AtomicU32::new(0),
            policy: RetryPolicy::default(),
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Number of dispatches seen so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> MockOutcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockOutcome::Fail(BridgeError::Protocol("mock exhausted".into())))
    }
}

fn split_reply(text: &str) -> Vec<BridgeResult<StreamEvent>> {
    let mid = text
        .char_indices()
        .map(|(i, _)| i)
        .nth(text.chars().count() / 2)
        .unwrap_or(text.len());
    let (head, tail) = text.split_at(mid);
    let mut events: Vec<BridgeResult<StreamEvent>> = [head, tail]
        .into_iter()
        .filter(|part| !part.is_empty())
        .map(|part| Ok(StreamEvent::Text(part.to_string())))
        .collect();
    events.push(Ok(StreamEvent::Finish {
        usage: None,
        finish_reason: Some("stop".to_string()),
    }));
    events
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn invoke(&self, _request: &InvocationRequest) -> InvocationResult {
        match self.next_outcome() {
            MockOutcome::Reply(text) => Ok(Completion::new(Message::assistant(text)?, Usage::default())
                .with_finish_reason("stop")),
            MockOutcome::Fail(error) => Err(error),
            MockOutcome::Events(_) => Err(BridgeError::Protocol(
                "scripted events can only be streamed".to_string(),
            )),
            MockOutcome::Hang => std::future::pending().await,
        }
    }

    async fn stream(&self, _request: &InvocationRequest) -> BridgeResult<EventStream> {
        let events = match self.next_outcome() {
            MockOutcome::Reply(text) => split_reply(&text),
            MockOutcome::Fail(error) => return Err(error),
            MockOutcome::Events(events) => events,
            MockOutcome::Hang => std::future::pending().await,
        };
        Ok(Box::pin(futures::stream::iter(events)))
    }
}
