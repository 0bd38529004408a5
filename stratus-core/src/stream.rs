//! Cancellable result streams.
//!
//! A call's responses are delivered through a [`CallStream`]: the producer
//! side (the transport adapter) pushes `value | error | complete` events
//! into a [`CallSink`], the consumer pulls them as a `futures::Stream`.
//! Dropping the stream before the terminal event cancels the call and
//! releases producer-side resources exactly once.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::StratusError;

/// One event in a call's result stream.
#[derive(Debug)]
pub enum CallEvent {
    /// One response value; more may follow.
    Value(Value),
    /// Terminal error.
    Error(StratusError),
    /// Terminal completion.
    Complete,
}

/// Producer side of a call's result stream.
///
/// All sends are best-effort: a consumer that has cancelled (dropped its
/// stream) simply stops receiving, which is not an error.
#[derive(Debug, Clone)]
pub struct CallSink {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl CallSink {
    /// Deliver one response value.
    pub fn value(&self, value: Value) {
        let _ = self.tx.send(CallEvent::Value(value));
    }

    /// Terminate the stream with an error.
    pub fn error(&self, error: StratusError) {
        let _ = self.tx.send(CallEvent::Error(error));
    }

    /// Terminate the stream normally.
    pub fn complete(&self) {
        let _ = self.tx.send(CallEvent::Complete);
    }
}

/// Hook released exactly once when a call's routing entry goes away.
pub type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Consumer side of a call's result stream.
///
/// Yields `Ok(value)` for each response and ends after the terminal event.
/// Dropping the stream before the terminal event runs the release hook,
/// which unregisters the call and frees any subscription tied to it.
pub struct CallStream {
    rx: mpsc::UnboundedReceiver<CallEvent>,
    release: Option<ReleaseHook>,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
    finished: bool,
}

/// Create a connected sink/stream pair.
///
/// `release` runs exactly once: on cancellation, on the terminal event, or
/// when the producer goes away.
#[must_use]
pub fn call_channel(release: Option<ReleaseHook>) -> (CallSink, CallStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CallSink { tx },
        CallStream {
            rx,
            release,
            timeout: None,
            deadline: None,
            finished: false,
        },
    )
}

impl CallStream {
    /// Fail the call if no terminal event arrives within `timeout`.
    ///
    /// The window starts at the first poll, so an unconsumed stream does
    /// not tick.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cancel the call explicitly.
    ///
    /// Equivalent to dropping the stream; cancellation is a normal, silent
    /// termination, not an error.
    pub fn cancel(mut self) {
        self.release_now();
        self.finished = true;
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.release_now();
    }
}

impl Stream for CallStream {
    type Item = Result<Value, StratusError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if this.deadline.is_none() {
            if let Some(timeout) = this.timeout {
                this.deadline = Some(Box::pin(tokio::time::sleep(timeout)));
            }
        }
        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.finish();
                return Poll::Ready(Some(Err(StratusError::Timeout(
                    this.timeout.unwrap_or_default(),
                ))));
            }
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(CallEvent::Value(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(CallEvent::Error(error))) => {
                this.finish();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(Some(CallEvent::Complete)) | Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        if !self.finished {
            self.release_now();
        }
    }
}

impl std::fmt::Debug for CallStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
