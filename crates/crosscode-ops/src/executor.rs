use std::sync::Arc;

use crosscode_telemetry as telemetry;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bridge::{Backend, InvokeRequest, Subscription};
use crate::cancel::CancelToken;
use crate::error::{BackendError, OperationError};
use crate::params::OperationParams;
use crate::registry::Operation;
use crate::state::{OperationState, OperationUpdate};
use crate::topic::{InvocationToken, Topic};

/// What `start_operation` does when another invocation is still running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Fail the new call with [`OperationError::AlreadyRunning`].
    #[default]
    Reject,
    /// Cancel the running invocation and start the new one.
    Replace,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    Succeeded,
    Failed { message: String },
    Cancelled,
}

impl RunPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, RunPhase::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunPhase::Running => "running",
            RunPhase::Succeeded => "succeeded",
            RunPhase::Failed { .. } => "failed",
            RunPhase::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct OperationSnapshot {
    pub token: InvocationToken,
    pub state: OperationState,
    pub phase: RunPhase,
}

struct Slot {
    snapshot: OperationSnapshot,
    cancel: CancelToken,
}

/// Live view of the executor's current operation.
pub struct StateWatcher {
    rx: watch::Receiver<Option<Slot>>,
}

impl StateWatcher {
    pub fn snapshot(&self) -> Option<OperationSnapshot> {
        self.rx.borrow().as_ref().map(|slot| slot.snapshot.clone())
    }

    /// Waits for the next change. Returns `false` once the executor is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Runs multi-step backend operations and folds their step events into an
/// [`OperationState`].
///
/// Holds at most one state at a time: `Idle` (none), `Running`, or settled
/// (kept for display until [`clear`](Self::clear)).
pub struct OperationExecutor {
    backend: Arc<dyn Backend>,
    policy: ConcurrencyPolicy,
    slot: watch::Sender<Option<Slot>>,
}

enum Outcome {
    Settled(Result<Value, BackendError>),
    Cancelled,
}

impl OperationExecutor {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_policy(backend, ConcurrencyPolicy::default())
    }

    pub fn with_policy(backend: Arc<dyn Backend>, policy: ConcurrencyPolicy) -> Self {
        let (slot, _rx) = watch::channel(None);
        Self {
            backend,
            policy,
            slot,
        }
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    pub fn snapshot(&self) -> Option<OperationSnapshot> {
        self.slot.borrow().as_ref().map(|slot| slot.snapshot.clone())
    }

    pub fn state(&self) -> Option<OperationState> {
        self.slot
            .borrow()
            .as_ref()
            .map(|slot| slot.snapshot.state.clone())
    }

    pub fn is_running(&self) -> bool {
        self.slot
            .borrow()
            .as_ref()
            .map(|slot| slot.snapshot.phase.is_running())
            .unwrap_or(false)
    }

    pub fn watch(&self) -> StateWatcher {
        StateWatcher {
            rx: self.slot.subscribe(),
        }
    }

    /// Cancels the running invocation, if any.
    pub fn cancel(&self) -> bool {
        match self.slot.borrow().as_ref() {
            Some(slot) if slot.snapshot.phase.is_running() => {
                slot.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Discards a settled state. A running state is kept and `false` is
    /// returned; cancel it first.
    pub fn clear(&self) -> bool {
        let mut cleared = true;
        self.slot.send_if_modified(|slot| match slot {
            Some(current) if current.snapshot.phase.is_running() => {
                cleared = false;
                false
            }
            Some(_) => {
                *slot = None;
                true
            }
            None => false,
        });
        cleared
    }

    /// Runs `params`' operation to completion.
    ///
    /// A fresh state is installed before the backend is contacted. Step
    /// updates arriving on the invocation's topic are folded in until the
    /// backend call settles; the subscription is released on every path,
    /// including this future being dropped.
    pub async fn start_operation(&self, params: OperationParams) -> Result<(), OperationError> {
        let operation = params.operation();
        params.validate()?;
        let payload = params.to_payload()?;

        let token = InvocationToken::new();
        let cancel = CancelToken::new();
        self.install(operation, token, cancel.clone())?;
        let guard = RunGuard {
            executor: self,
            token,
            cancel: cancel.clone(),
            armed: true,
        };

        info!(operation = operation.id, %token, "starting operation");
        telemetry::event("operation.start", &[("operation", operation.id)]);

        let topic = Topic::operation(operation.id, token);
        let listened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            listened = self.backend.listen(&topic) => Some(listened),
        };
        let mut subscription = None;
        let outcome = match listened {
            None => Outcome::Cancelled,
            Some(listened) => {
                subscription = match listened {
                    Ok(subscription) => Some(subscription),
                    Err(err) => {
                        warn!(
                            operation = operation.id,
                            "step updates unavailable, running without progress: {err}"
                        );
                        None
                    }
                };
                let request = InvokeRequest {
                    command: operation.entry_point(),
                    params: payload,
                    invocation: token,
                };
                self.drive(token, &cancel, &mut subscription, request).await
            }
        };

        if let Some(mut subscription) = subscription.take() {
            if matches!(outcome, Outcome::Settled(_)) {
                while let Some(payload) = subscription.try_recv() {
                    self.fold(token, payload);
                }
            }
            subscription.unsubscribe();
        }

        let (phase, result) = match outcome {
            Outcome::Settled(Ok(_)) => (RunPhase::Succeeded, Ok(())),
            Outcome::Settled(Err(source)) => (
                RunPhase::Failed {
                    message: source.to_string(),
                },
                Err(OperationError::Failed {
                    operation: operation.id,
                    source,
                }),
            ),
            Outcome::Cancelled => {
                self.signal_backend_cancel(token);
                (
                    RunPhase::Cancelled,
                    Err(OperationError::Cancelled {
                        operation: operation.id,
                    }),
                )
            }
        };

        info!(operation = operation.id, %token, phase = phase.label(), "operation settled");
        telemetry::event(
            "operation.settled",
            &[("operation", operation.id), ("phase", phase.label())],
        );
        guard.settle(phase);
        result
    }

    /// Folds step updates until the backend call settles or `cancel` fires.
    async fn drive(
        &self,
        token: InvocationToken,
        cancel: &CancelToken,
        subscription: &mut Option<Subscription>,
        request: InvokeRequest,
    ) -> Outcome {
        let mut call = self.backend.invoke(request);
        let mut listening = subscription.is_some();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Outcome::Cancelled,
                update = next_payload(&mut *subscription), if listening => match update {
                    Some(payload) => self.fold(token, payload),
                    None => listening = false,
                },
                result = &mut call => break Outcome::Settled(result),
            }
        }
    }

    fn install(
        &self,
        operation: &'static Operation,
        token: InvocationToken,
        cancel: CancelToken,
    ) -> Result<(), OperationError> {
        let mut rejected = None;
        self.slot.send_if_modified(|slot| {
            if let Some(current) = slot.as_ref() {
                if current.snapshot.phase.is_running() {
                    let running = current.snapshot.state.current().id;
                    match self.policy {
                        ConcurrencyPolicy::Reject => {
                            rejected = Some(running);
                            return false;
                        }
                        ConcurrencyPolicy::Replace => {
                            info!(replaced = running, by = operation.id, "replacing running operation");
                            current.cancel.cancel();
                        }
                    }
                }
            }
            *slot = Some(Slot {
                snapshot: OperationSnapshot {
                    token,
                    state: OperationState::new(operation),
                    phase: RunPhase::Running,
                },
                cancel,
            });
            true
        });
        match rejected {
            Some(running) => Err(OperationError::AlreadyRunning { running }),
            None => Ok(()),
        }
    }

    fn fold(&self, token: InvocationToken, payload: Value) {
        let update: OperationUpdate = match serde_json::from_value(payload) {
            Ok(update) => update,
            Err(err) => {
                warn!(%token, "ignoring malformed step update: {err}");
                return;
            }
        };
        self.slot.send_if_modified(|slot| match slot {
            Some(current) if current.snapshot.token == token => {
                current.snapshot.state.apply(&update)
            }
            _ => false,
        });
    }

    fn set_phase(&self, token: InvocationToken, phase: RunPhase) {
        self.slot.send_if_modified(|slot| match slot {
            Some(current) if current.snapshot.token == token => {
                current.snapshot.phase = phase;
                true
            }
            _ => false,
        });
    }

    fn signal_backend_cancel(&self, token: InvocationToken) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%token, "no runtime to signal cancellation");
            return;
        };
        let backend = Arc::clone(&self.backend);
        handle.spawn(async move {
            if let Err(err) = backend.cancel(token).await {
                warn!(%token, "backend cancel failed: {err}");
            }
        });
    }
}

async fn next_payload(subscription: &mut Option<Subscription>) -> Option<Value> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Marks the run cancelled if `start_operation` is dropped before settling.
struct RunGuard<'a> {
    executor: &'a OperationExecutor,
    token: InvocationToken,
    cancel: CancelToken,
    armed: bool,
}

impl RunGuard<'_> {
    fn settle(mut self, phase: RunPhase) {
        self.armed = false;
        self.executor.set_phase(self.token, phase);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        self.executor.set_phase(self.token, RunPhase::Cancelled);
        self.executor.signal_backend_cancel(self.token);
    }
}
