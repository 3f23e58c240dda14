//! Runs one invocation against a registered adapter: validation, capability
//! checks, retry with exponential backoff, per-attempt and total timeouts,
//! cancellation, and streaming normalization.
pub mod policy;
pub mod stream;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::adapters::base::Adapter;
use crate::adapters::factory::build_registry;
use crate::errors::{BridgeError, BridgeResult, ErrorKind};
use crate::models::request::InvocationRequest;
use crate::models::response::InvocationResult;
use crate::registry::AdapterRegistry;
use crate::settings::BridgeSettings;
use policy::RetryPolicy;
pub use stream::ChunkStream;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bound on the total wall time of one invocation, across attempts and backoff
    pub invocation_timeout: Option<Duration>,
}

impl EngineConfig {
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self
    }
}

/// Lifecycle of a single invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Dispatched { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Succeeded,
    Failed { kind: ErrorKind },
}

/// Everything that happened during one invocation
#[derive(Debug, Clone)]
pub struct InvocationReport {
    /// Number of dispatches to the adapter
    pub attempts: u32,
    pub transitions: Vec<InvocationState>,
    pub elapsed: Duration,
    pub result: InvocationResult,
}

impl InvocationReport {
    pub fn final_state(&self) -> Option<InvocationState> {
        self.transitions.last().copied()
    }
}

/// Drives dispatch attempts under a retry policy, an optional deadline and a
/// cancellation token, recording state transitions as it goes.
pub(crate) struct AttemptRunner {
    policy: RetryPolicy,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    started: Instant,
    attempts: u32,
    transitions: Vec<InvocationState>,
}

impl AttemptRunner {
    pub(crate) fn new(
        policy: RetryPolicy,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        let started = Instant::now();
        Self {
            policy,
            cancel,
            timeout,
            deadline: timeout.map(|timeout| started + timeout),
            started,
            attempts: 0,
            transitions: vec![InvocationState::Pending],
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start the clock, and the invocation deadline with it, from now
    pub(crate) fn restart(&mut self) {
        self.started = Instant::now();
        self.deadline = self.timeout.map(|timeout| self.started + timeout);
    }

    fn timeout_error(&self) -> BridgeError {
        BridgeError::Timeout {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Await `fut` unless the invocation is cancelled or its deadline passes first
    pub(crate) async fn guard<T, F>(&self, fut: F) -> BridgeResult<T>
    where
        F: Future<Output = BridgeResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BridgeError::Cancelled),
            _ = deadline => Err(self.timeout_error()),
            result = fut => result,
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> BridgeResult<T>
    where
        F: Future<Output = BridgeResult<T>>,
    {
        match self.policy.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                Err(BridgeError::Adapter(format!(
                    "attempt timed out after {}ms",
                    limit.as_millis()
                )))
            }),
            None => fut.await,
        }
    }

    /// Dispatch until success, a permanent error, exhaustion of the retry
    /// budget, cancellation or the deadline
    pub(crate) async fn run<T, F, Fut>(&mut self, mut dispatch: F) -> BridgeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        loop {
            self.attempts += 1;
            let attempt = self.attempts;
            self.transitions.push(InvocationState::Dispatched { attempt });
            tracing::debug!(attempt, "dispatching");

            let error = match self.guard(self.bounded(dispatch())).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !error.is_retryable() || attempt >= self.policy.max_attempts() {
                return Err(error);
            }

            let delay = self.policy.backoff(attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );
            self.transitions
                .push(InvocationState::Retrying { attempt, delay });
            self.guard(async {
                tokio::time::sleep(delay).await;
                Ok::<_, BridgeError>(())
            })
            .await?;
        }
    }

    /// Record the terminal state for `result`
    pub(crate) fn finish<T>(&mut self, result: &BridgeResult<T>) {
        match result {
            Ok(_) => {
                tracing::debug!(attempts = self.attempts, "invocation succeeded");
                self.transitions.push(InvocationState::Succeeded);
            }
            Err(error) => {
                tracing::error!(attempts = self.attempts, error = %error, "invocation failed");
                self.transitions
                    .push(InvocationState::Failed { kind: error.kind() });
            }
        }
    }

    pub(crate) fn into_report(self, result: InvocationResult) -> InvocationReport {
        InvocationReport {
            attempts: self.attempts,
            transitions: self.transitions,
            elapsed: self.started.elapsed(),
            result,
        }
    }
}

/// Orchestrates calls against the adapters of a registry
#[derive(Debug, Clone)]
pub struct InvocationEngine {
    registry: Arc<AdapterRegistry>,
    config: EngineConfig,
}

impl InvocationEngine {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: Arc<AdapterRegistry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    /// Build the registry and engine described by `settings`
    pub fn from_settings(settings: &BridgeSettings) -> BridgeResult<Self> {
        let registry = build_registry(settings)?;
        Ok(Self::with_config(
            Arc::new(registry),
            EngineConfig {
                invocation_timeout: settings.engine.invocation_timeout(),
            },
        ))
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `request` against `provider_id`, returning a completion or exactly one error
    pub async fn invoke(&self, provider_id: &str, request: &InvocationRequest) -> InvocationResult {
        self.invoke_with_cancel(provider_id, request, CancellationToken::new())
            .await
    }

    pub async fn invoke_with_cancel(
        &self,
        provider_id: &str,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> InvocationResult {
        self.execute(provider_id, request, cancel).await.result
    }

    /// Like [`invoke_with_cancel`](Self::invoke_with_cancel), also reporting
    /// attempts and state transitions
    pub async fn execute(
        &self,
        provider_id: &str,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> InvocationReport {
        let span = tracing::info_span!(
            "invocation",
            provider = %provider_id,
            id = %Uuid::new_v4(),
            stream = request.stream
        );
        self.execute_in_span(provider_id, request, cancel)
            .instrument(span)
            .await
    }

    async fn execute_in_span(
        &self,
        provider_id: &str,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> InvocationReport {
        let timeout = self.config.invocation_timeout;
        let adapter = match self.prepare(provider_id, request, request.stream) {
            Ok(adapter) => adapter,
            Err(error) => {
                let mut runner = AttemptRunner::new(RetryPolicy::none(), cancel, timeout);
                let result = Err(error);
                runner.finish(&result);
                return runner.into_report(result);
            }
        };
        let mut runner = AttemptRunner::new(adapter.retry_policy(), cancel, timeout);

        if request.stream {
            let mut cursor =
                ChunkStream::new(adapter, request.clone(), runner, tracing::Span::current());
            let result = cursor.drain().await;
            let mut runner = cursor.into_runner();
            // A stream can end cleanly yet still fold into an empty message
            if result.is_err() && runner.transitions.last() == Some(&InvocationState::Succeeded) {
                runner.transitions.pop();
                runner.finish(&result);
            }
            return runner.into_report(result);
        }

        let result = runner.run(|| adapter.invoke(request)).await;
        runner.finish(&result);
        runner.into_report(result)
    }

    /// Open a chunk cursor for `request`; nothing is dispatched until the first pull.
    ///
    /// The invocation timeout is measured from that first pull, not from here.
    pub async fn stream(
        &self,
        provider_id: &str,
        request: &InvocationRequest,
    ) -> BridgeResult<ChunkStream> {
        self.stream_with_cancel(provider_id, request, CancellationToken::new())
            .await
    }

    pub async fn stream_with_cancel(
        &self,
        provider_id: &str,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> BridgeResult<ChunkStream> {
        let span = tracing::info_span!(
            "invocation",
            provider = %provider_id,
            id = %Uuid::new_v4(),
            stream = true
        );
        let adapter = span.in_scope(|| {
            self.prepare(provider_id, request, true).map_err(|error| {
                tracing::error!(error = %error, "invocation rejected");
                error
            })
        })?;
        let runner = AttemptRunner::new(
            adapter.retry_policy(),
            cancel,
            self.config.invocation_timeout,
        );
        Ok(ChunkStream::new(adapter, request.clone(), runner, span))
    }

    fn prepare(
        &self,
        provider_id: &str,
        request: &InvocationRequest,
        streaming: bool,
    ) -> BridgeResult<Arc<dyn Adapter>> {
        request.validate()?;
        let adapter = self.registry.resolve(provider_id)?;

        let capabilities = adapter.capabilities();
        if !request.tools.is_empty() && !capabilities.tools {
            return Err(BridgeError::Protocol(format!(
                "provider '{}' does not support tools",
                provider_id
            )));
        }
        if streaming && !capabilities.streaming {
            return Err(BridgeError::Protocol(format!(
                "provider '{}' does not support streaming",
                provider_id
            )));
        }
        Ok(adapter)
    }
}
