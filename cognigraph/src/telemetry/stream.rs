//! Caller-facing event stream

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::event::StreamEvent;
use super::reporter::Reporter;
use super::trace::TraceRecord;
use crate::error::EngineError;

/// Ordered events of one request, ending with a terminal event.
///
/// Dropping the stream before it ends cancels the request.
pub struct EventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    handle: JoinHandle<TraceRecord>,
    guard: DropGuard,
}

impl EventStream {
    /// Run `body` on a background task with a reporter wired to this stream
    pub(crate) fn spawn<F, Fut>(
        request_id: String,
        graph_id: String,
        cancel: CancellationToken,
        body: F,
    ) -> Self
    where
        F: FnOnce(Reporter) -> Fut,
        Fut: Future<Output = TraceRecord> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Reporter::new(request_id, graph_id, tx);
        let handle = tokio::spawn(body(reporter));
        Self {
            events: rx,
            handle,
            guard: cancel.drop_guard(),
        }
    }

    /// Drain the remaining events and wait for the sealed trace
    pub async fn finish(self) -> Result<(Vec<StreamEvent>, TraceRecord), EngineError> {
        let Self {
            mut events,
            handle,
            guard,
        } = self;

        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            collected.push(event);
        }
        let trace = handle
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))?;
        guard.disarm();
        Ok((collected, trace))
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}
