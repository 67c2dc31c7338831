use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::topic::{InvocationToken, Topic};

/// One call into the backend.
#[derive(Clone, Debug)]
pub struct InvokeRequest {
    pub command: String,
    pub params: Value,
    pub invocation: InvocationToken,
}

impl InvokeRequest {
    pub fn new(command: impl Into<String>, params: Value) -> Self {
        Self {
            command: command.into(),
            params,
            invocation: InvocationToken::new(),
        }
    }
}

/// The native backend as seen from a front-end: request/response calls plus
/// named event channels in both directions.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Runs a command and waits for it to settle.
    async fn invoke(&self, request: InvokeRequest) -> Result<Value, BackendError>;

    /// Attaches to a channel. Only events emitted after this returns are
    /// delivered.
    async fn listen(&self, topic: &Topic) -> Result<Subscription, BackendError>;

    /// Asks the backend to abort an in-flight invocation. Returns whether the
    /// invocation was known. Does not wait for it to stop.
    async fn cancel(&self, invocation: InvocationToken) -> Result<bool, BackendError>;

    /// Sends a front-end event (2FA code, login cancelled, ...) to the backend.
    async fn emit(&self, topic: &Topic, payload: Value) -> Result<(), BackendError>;
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Live attachment to one channel.
///
/// Payloads arrive in emission order. Releasing is idempotent and also
/// happens on drop; after release no further payloads are yielded, even ones
/// already buffered.
pub struct Subscription {
    topic: Topic,
    rx: mpsc::UnboundedReceiver<Value>,
    release: Option<ReleaseFn>,
}

impl Subscription {
    pub fn new(
        topic: Topic,
        rx: mpsc::UnboundedReceiver<Value>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic,
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Next payload, or `None` once released or once the source has closed.
    pub async fn recv(&mut self) -> Option<Value> {
        if !self.is_active() {
            return None;
        }
        self.rx.recv().await
    }

    /// Next already-delivered payload without waiting.
    pub fn try_recv(&mut self) -> Option<Value> {
        if !self.is_active() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            self.rx.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        let this = self.get_mut();
        if !this.is_active() {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}
