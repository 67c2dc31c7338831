use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bridge::{Backend, InvokeRequest};
use crate::cancel::CancelToken;
use crate::error::CommandError;
use crate::topic::InvocationToken;

struct InFlight {
    name: String,
    token: InvocationToken,
    cancel: CancelToken,
}

/// Runs plain backend commands one at a time.
pub struct CommandRunner {
    backend: Arc<dyn Backend>,
    current: Mutex<Option<InFlight>>,
}

impl CommandRunner {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            current: Mutex::new(None),
        }
    }

    pub fn is_running_command(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn current_command(&self) -> Option<String> {
        self.current.lock().as_ref().map(|cmd| cmd.name.clone())
    }

    /// Runs `name` unless another command is in flight.
    pub async fn run_command(&self, name: &str, params: Value) -> Result<Value, CommandError> {
        let request = InvokeRequest::new(name, params);
        let token = request.invocation;
        let cancel = CancelToken::new();
        {
            let mut current = self.current.lock();
            if let Some(in_flight) = current.as_ref() {
                return Err(CommandError::Busy {
                    current: in_flight.name.clone(),
                });
            }
            *current = Some(InFlight {
                name: name.to_string(),
                token,
                cancel: cancel.clone(),
            });
        }
        let _in_flight = InFlightGuard {
            runner: self,
            token,
        };

        debug!(command = name, %token, "running command");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CommandError::Cancelled {
                command: name.to_string(),
            }),
            result = self.backend.invoke(request) => result.map_err(CommandError::from),
        }
    }

    /// Aborts the in-flight command. The runner is free again as soon as this
    /// returns; the backend is told to stop but not waited on.
    pub fn cancel_command(&self) -> bool {
        let Some(in_flight) = self.current.lock().take() else {
            return false;
        };
        info!(command = %in_flight.name, "cancelling command");
        in_flight.cancel.cancel();

        let token = in_flight.token;
        let backend = Arc::clone(&self.backend);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = backend.cancel(token).await {
                        warn!(%token, "backend cancel failed: {err}");
                    }
                });
            }
            Err(_) => warn!(%token, "no runtime to signal cancellation"),
        }
        true
    }
}

struct InFlightGuard<'a> {
    runner: &'a CommandRunner,
    token: InvocationToken,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut current = self.runner.current.lock();
        if current.as_ref().map(|cmd| cmd.token) == Some(self.token) {
            *current = None;
        }
    }
}
