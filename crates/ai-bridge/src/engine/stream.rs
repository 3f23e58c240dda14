use std::mem;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{Instrument, Span};

use super::AttemptRunner;
use crate::adapters::base::{Adapter, EventStream};
use crate::errors::BridgeError;
use crate::models::request::InvocationRequest;
use crate::models::response::{
    ChunkPayload, InvocationResult, StreamChunk, StreamCollector, StreamEvent, Usage,
};

enum CursorState {
    /// Not dispatched yet
    Opening,
    Open(EventStream),
    Finished,
}

/// Pull cursor over the chunks of one streamed invocation.
///
/// The first pull dispatches to the adapter. Failures before the first chunk
/// are retried under the adapter's policy; after it, a failure ends the
/// stream with an `Error` chunk. The last chunk is always `End` or `Error`,
/// after which [`next_chunk`](Self::next_chunk) returns `None`.
pub struct ChunkStream {
    adapter: Arc<dyn Adapter>,
    request: Arc<InvocationRequest>,
    runner: AttemptRunner,
    state: CursorState,
    next_index: u64,
    span: Span,
}

impl ChunkStream {
    pub(crate) fn new(
        adapter: Arc<dyn Adapter>,
        request: InvocationRequest,
        runner: AttemptRunner,
        span: Span,
    ) -> Self {
        Self {
            adapter,
            request: Arc::new(request),
            runner,
            state: CursorState::Opening,
            next_index: 0,
            span,
        }
    }

    /// Dispatches made so far
    pub fn attempts(&self) -> u32 {
        self.runner.attempts()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, CursorState::Finished)
    }

    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        let span = self.span.clone();
        self.advance().instrument(span).await
    }

    /// Drain the cursor into the completion a non-streamed call would return
    pub async fn collect(mut self) -> InvocationResult {
        self.drain().await
    }

    pub fn into_stream(self) -> BoxStream<'static, StreamChunk> {
        futures::stream::unfold(self, |mut cursor| async move {
            cursor.next_chunk().await.map(|chunk| (chunk, cursor))
        })
        .boxed()
    }

    pub(crate) async fn drain(&mut self) -> InvocationResult {
        let mut collector = StreamCollector::new();
        while let Some(chunk) = self.next_chunk().await {
            collector.push(chunk)?;
        }
        collector.finish()
    }

    pub(crate) fn into_runner(self) -> AttemptRunner {
        self.runner
    }

    async fn advance(&mut self) -> Option<StreamChunk> {
        match mem::replace(&mut self.state, CursorState::Finished) {
            CursorState::Finished => None,
            CursorState::Opening => {
                self.runner.restart();
                let adapter = self.adapter.clone();
                let request = self.request.clone();
                let opened = self
                    .runner
                    .run(|| {
                        let adapter = adapter.clone();
                        let request = request.clone();
                        async move {
                            let mut events = adapter.stream(&request).await?;
                            match events.next().await {
                                Some(Ok(first)) => Ok((Some(first), events)),
                                Some(Err(error)) => Err(error),
                                None => Ok((None, events)),
                            }
                        }
                    })
                    .await;

                Some(match opened {
                    Ok((Some(first), events)) => self.emit(first, events),
                    Ok((None, _)) => self.end(None, None),
                    Err(error) => self.fail(error),
                })
            }
            CursorState::Open(mut events) => {
                let next = self
                    .runner
                    .guard(async { Ok::<_, BridgeError>(events.next().await) })
                    .await;
                Some(match next {
                    Ok(Some(Ok(event))) => self.emit(event, events),
                    Ok(Some(Err(error))) | Err(error) => self.fail(error),
                    Ok(None) => self.end(None, None),
                })
            }
        }
    }

    fn chunk(&mut self, payload: ChunkPayload) -> StreamChunk {
        let chunk = StreamChunk {
            index: self.next_index,
            payload,
        };
        self.next_index += 1;
        chunk
    }

    fn emit(&mut self, event: StreamEvent, events: EventStream) -> StreamChunk {
        let payload = match event {
            StreamEvent::Text(text) => ChunkPayload::Text { text },
            StreamEvent::ToolCall(call) => ChunkPayload::ToolCall { call },
            StreamEvent::Finish {
                usage,
                finish_reason,
            } => return self.end(usage, finish_reason),
        };
        self.state = CursorState::Open(events);
        self.chunk(payload)
    }

    fn end(&mut self, usage: Option<Usage>, finish_reason: Option<String>) -> StreamChunk {
        self.runner.finish(&Ok::<(), BridgeError>(()));
        self.chunk(ChunkPayload::End {
            usage,
            finish_reason,
        })
    }

    fn fail(&mut self, error: BridgeError) -> StreamChunk {
        self.runner.finish(&Err::<(), _>(error.clone()));
        self.chunk(ChunkPayload::Error { error })
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("adapter", &self.adapter.name())
            .field("next_index", &self.next_index)
            .field("finished", &self.is_finished())
            .finish()
    }
}
