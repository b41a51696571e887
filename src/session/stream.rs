//! # Stream pipeline
//!
//! Bridges an engine's synchronous fragment callback onto an async channel.
//!
//! One pipeline serves one chat request: a blocking worker owns the
//! session lock guard, drives [`Runner::predict`](crate::engine::Runner::predict)
//! and republishes every fragment through a [`FragmentPublisher`]. The caller
//! reads them from a [`ChatStream`]. The guard is dropped when the worker
//! returns, whatever the outcome, which is what makes the session available
//! to the next request.

use futures::Stream;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use super::error::SessionError;
use super::handle::ModelHandle;
use crate::engine::{PredictRequest, PredictResult};

/// One item of a chat stream. An `Err` is always the last item.
pub type ChatChunk = Result<PredictResult, SessionError>;

/// Publishes items from a blocking thread onto a bounded channel, racing
/// every hand-off against cancellation.
///
/// After the token fires or the receiver goes away, every further item is
/// dropped without blocking.
pub struct FragmentPublisher<T> {
    runtime: Handle,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
    open: bool,
    delivered: usize,
}

impl<T: Send> FragmentPublisher<T> {
    pub fn new(runtime: Handle, tx: mpsc::Sender<T>, cancel: CancellationToken) -> Self {
        Self {
            runtime,
            tx,
            cancel,
            open: true,
            delivered: 0,
        }
    }

    /// Blocks until `item` is handed over, the token fires or the receiver
    /// is dropped. Returns whether the item was delivered.
    ///
    /// Must not be called from inside an async task.
    pub fn publish(&mut self, item: T) -> bool {
        if !self.open || self.cancel.is_cancelled() {
            self.open = false;
            return false;
        }
        let tx = &self.tx;
        let cancel = &self.cancel;
        let delivered = self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = tx.send(item) => sent.is_ok(),
            }
        });
        if delivered {
            self.delivered += 1;
        } else {
            self.open = false;
        }
        delivered
    }

    /// Items handed over so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Whether items are still being accepted.
    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// Receiving end of a chat request.
///
/// Yields fragments in the order the engine produced them and ends when the
/// generation finishes, fails (after yielding the error) or the request's
/// token is cancelled.
#[derive(Debug)]
pub struct ChatStream {
    rx: mpsc::Receiver<ChatChunk>,
    cancel: CancellationToken,
}

impl ChatStream {
    pub(crate) fn new(rx: mpsc::Receiver<ChatChunk>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Next fragment, or `None` once the stream is finished or cancelled.
    pub async fn recv(&mut self) -> Option<ChatChunk> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.rx.close();
                None
            }
            item = self.rx.recv() => item,
        }
    }

    /// Drains the stream, concatenating all fragments.
    pub async fn collect_text(mut self) -> Result<String, SessionError> {
        let mut text = String::new();
        while let Some(chunk) = self.recv().await {
            text.push_str(&chunk?.content);
        }
        Ok(text)
    }
}

impl Stream for ChatStream {
    type Item = ChatChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            self.rx.close();
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

/// Starts the worker for an already validated request and returns the
/// stream feeding the caller.
///
/// `guard` must hold a loaded model; it is released when the worker ends.
pub(crate) fn spawn(
    guard: OwnedMutexGuard<Option<ModelHandle>>,
    request: PredictRequest,
    cancel: CancellationToken,
    span: Span,
) -> ChatStream {
    // A single slot: the worker can run at most one fragment ahead of the caller.
    let (tx, rx) = mpsc::channel(1);
    let runtime = Handle::current();
    let worker_cancel = cancel.clone();

    tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        drive(guard, runtime, tx, worker_cancel, request);
    });

    ChatStream::new(rx, cancel)
}

fn drive(
    guard: OwnedMutexGuard<Option<ModelHandle>>,
    runtime: Handle,
    tx: mpsc::Sender<ChatChunk>,
    cancel: CancellationToken,
    request: PredictRequest,
) {
    let mut publisher = FragmentPublisher::new(runtime, tx, cancel.clone());

    match guard.as_ref() {
        Some(handle) => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                handle.runner().predict(&cancel, &request, &mut |fragment| {
                    publisher.publish(Ok(fragment));
                })
            }));
            match outcome {
                Ok(Ok(())) => info!(
                    fragments = publisher.delivered(),
                    cancelled = cancel.is_cancelled(),
                    "generation finished"
                ),
                Ok(Err(e)) => {
                    warn!("generation failed: {}", e);
                    publisher.publish(Err(SessionError::Stream(e)));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(
                        fragments = publisher.delivered(),
                        "engine panicked during generation: {}", message
                    );
                    let failure = SessionError::Worker(format!("engine panicked: {}", message));
                    publisher.publish(Err(failure));
                }
            }
        }
        None => {
            publisher.publish(Err(SessionError::NoModelLoaded));
        }
    }

    // Close the channel before handing the session to the next caller.
    drop(publisher);
    drop(guard);
    debug!("session lock released");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
