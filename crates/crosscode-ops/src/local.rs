use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use crate::bridge::{Backend, InvokeRequest, Subscription};
use crate::cancel::CancelToken;
use crate::error::BackendError;
use crate::events::EventBus;
use crate::registry::Operation;
use crate::state::OperationUpdate;
use crate::topic::{InvocationToken, Topic};

/// What a handler settles with. `Err` carries the message shown to the caller.
pub type HandlerResult = Result<Value, String>;

/// Everything a handler gets for one invocation.
#[derive(Clone)]
pub struct CommandContext {
    pub command: String,
    pub params: Value,
    pub invocation: InvocationToken,
    pub cancel: CancelToken,
    events: EventBus,
}

impl CommandContext {
    pub fn emit(&self, topic: &Topic, payload: Value) -> usize {
        self.events.emit(topic, payload)
    }

    pub fn listen(&self, topic: Topic) -> Subscription {
        self.events.subscribe(topic)
    }

    /// Writes one line to the shared `build-output` console.
    pub fn console(&self, line: impl Into<String>) {
        self.events.emit(&Topic::BuildOutput, Value::String(line.into()));
    }

    pub fn steps(&self, operation: &'static Operation) -> StepReporter {
        StepReporter {
            operation,
            topic: Topic::operation(operation.id, self.invocation),
            events: self.events.clone(),
        }
    }
}

/// Publishes step updates for one operation invocation.
#[derive(Clone)]
pub struct StepReporter {
    operation: &'static Operation,
    topic: Topic,
    events: EventBus,
}

impl StepReporter {
    pub fn started(&self, step_id: &str) {
        self.publish(OperationUpdate::started(step_id));
    }

    pub fn finished(&self, step_id: &str) {
        self.publish(OperationUpdate::finished(step_id));
    }

    pub fn failed(&self, step_id: &str, details: impl Into<String>) {
        self.publish(OperationUpdate::failed(step_id, details));
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    fn publish(&self, update: OperationUpdate) {
        if !self.operation.has_step(&update.step_id) {
            warn!(
                operation = self.operation.id,
                step = %update.step_id,
                "reporting a step the operation does not declare"
            );
        }
        let delivered = self.events.emit(&self.topic, update.to_payload());
        debug!(
            topic = %self.topic,
            step = %update.step_id,
            update = update.update_type.as_str(),
            delivered,
            "step update"
        );
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, ctx: CommandContext) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(CommandContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: CommandContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

/// In-process backend: named handlers plus an [`EventBus`].
///
/// `invoke` runs the handler on the caller's task, so dropping the returned
/// future drops the handler too.
#[derive(Clone, Default)]
pub struct LocalBackend {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn CommandHandler>>>>,
    in_flight: Arc<Mutex<HashMap<InvocationToken, CancelToken>>>,
    events: EventBus,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn register(&self, name: &str, handler: Arc<dyn CommandHandler>) {
        if self
            .handlers
            .write()
            .insert(name.to_string(), handler)
            .is_some()
        {
            warn!(command = name, "replacing command handler");
        }
    }

    pub fn register_fn<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(handler)));
    }

    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

struct InFlightEntry<'a> {
    table: &'a Mutex<HashMap<InvocationToken, CancelToken>>,
    token: InvocationToken,
}

impl Drop for InFlightEntry<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.token);
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn invoke(&self, request: InvokeRequest) -> Result<Value, BackendError> {
        let handler = self
            .handlers
            .read()
            .get(&request.command)
            .cloned()
            .ok_or_else(|| BackendError::UnknownCommand(request.command.clone()))?;

        let cancel = CancelToken::new();
        self.in_flight.lock().insert(request.invocation, cancel.clone());
        let _entry = InFlightEntry {
            table: &self.in_flight,
            token: request.invocation,
        };

        let command = request.command;
        debug!(%command, invocation = %request.invocation, "invoking handler");
        let ctx = CommandContext {
            command: command.clone(),
            params: request.params,
            invocation: request.invocation,
            cancel,
            events: self.events.clone(),
        };
        handler
            .call(ctx)
            .await
            .map_err(|message| BackendError::Call { command, message })
    }

    async fn listen(&self, topic: &Topic) -> Result<Subscription, BackendError> {
        Ok(self.events.subscribe(topic.clone()))
    }

    async fn cancel(&self, invocation: InvocationToken) -> Result<bool, BackendError> {
        let cancel = self.in_flight.lock().get(&invocation).cloned();
        match cancel {
            Some(cancel) => {
                debug!(%invocation, "cancelling invocation");
                cancel.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn emit(&self, topic: &Topic, payload: Value) -> Result<(), BackendError> {
        self.events.emit(topic, payload);
        Ok(())
    }
}
