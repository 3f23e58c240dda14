use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::engine::policy::RetryPolicy;
use crate::errors::BridgeResult;
use crate::models::request::InvocationRequest;
use crate::models::response::{InvocationResult, StreamEvent};

/// Lazy, finite, non-restartable sequence of events from one streamed call
pub type EventStream = BoxStream<'static, BridgeResult<StreamEvent>>;

/// What a backend can do, checked by the engine before dispatching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub streaming: bool,
    pub tools: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            tools: true,
        }
    }
}

/// Base trait for backends (direct APIs, framework integrations).
///
/// Implementations own all translation between the canonical model and their
/// backend, and classify every backend failure as either
/// [`BridgeError::Adapter`](crate::errors::BridgeError::Adapter) (transient) or
/// [`BridgeError::Protocol`](crate::errors::BridgeError::Protocol) (permanent)
/// before returning it.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Retry behaviour the engine applies to calls against this adapter
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Run the request to completion
    async fn invoke(&self, request: &InvocationRequest) -> InvocationResult;

    /// Open a stream of events for the request
    async fn stream(&self, request: &InvocationRequest) -> BridgeResult<EventStream>;
}
