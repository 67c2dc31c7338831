use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::registry::Operation;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Started,
    Finished,
    Failed,
    /// Any type this client does not know; ignored when folded.
    #[serde(other)]
    Unknown,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Started => "started",
            UpdateType::Finished => "finished",
            UpdateType::Failed => "failed",
            UpdateType::Unknown => "unknown",
        }
    }
}

/// One step event as the backend publishes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationUpdate {
    pub step_id: String,
    pub update_type: UpdateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_details: Option<String>,
}

impl OperationUpdate {
    pub fn started(step_id: &str) -> Self {
        Self::new(step_id, UpdateType::Started, None)
    }

    pub fn finished(step_id: &str) -> Self {
        Self::new(step_id, UpdateType::Finished, None)
    }

    pub fn failed(step_id: &str, details: impl Into<String>) -> Self {
        Self::new(step_id, UpdateType::Failed, Some(details.into()))
    }

    fn new(step_id: &str, update_type: UpdateType, extra_details: Option<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            update_type,
            extra_details,
        }
    }

    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "stepId": self.step_id,
            "updateType": self.update_type.as_str(),
        });
        if let Some(details) = &self.extra_details {
            payload["extraDetails"] = Value::String(details.clone());
        }
        payload
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStep {
    pub step_id: String,
    pub extra_details: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed(String),
}

/// Progress of one operation invocation.
///
/// The three sequences only ever grow, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    current: &'static Operation,
    started: Vec<String>,
    completed: Vec<String>,
    failed: Vec<FailedStep>,
}

impl OperationState {
    pub fn new(current: &'static Operation) -> Self {
        Self {
            current,
            started: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn current(&self) -> &'static Operation {
        self.current
    }

    pub fn started(&self) -> &[String] {
        &self.started
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    pub fn failed(&self) -> &[FailedStep] {
        &self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.completed.is_empty() && self.failed.is_empty()
    }

    /// Folds one update in. Returns whether the state changed.
    pub fn apply(&mut self, update: &OperationUpdate) -> bool {
        if update.update_type == UpdateType::Unknown {
            debug!(step = %update.step_id, "ignoring update of unknown type");
            return false;
        }
        if !self.current.has_step(&update.step_id) {
            warn!(
                operation = self.current.id,
                step = %update.step_id,
                "ignoring update for unregistered step"
            );
            return false;
        }
        match update.update_type {
            UpdateType::Started => {
                if self.started.contains(&update.step_id) {
                    warn!(
                        operation = self.current.id,
                        step = %update.step_id,
                        "step reported started more than once"
                    );
                }
                self.started.push(update.step_id.clone());
            }
            UpdateType::Finished => self.completed.push(update.step_id.clone()),
            UpdateType::Failed => self.failed.push(FailedStep {
                step_id: update.step_id.clone(),
                extra_details: update.extra_details.clone().unwrap_or_default(),
            }),
            UpdateType::Unknown => return false,
        }
        true
    }

    pub fn step_status(&self, step_id: &str) -> StepStatus {
        if let Some(failed) = self.failed.iter().find(|f| f.step_id == step_id) {
            return StepStatus::Failed(failed.extra_details.clone());
        }
        if self.completed.iter().any(|id| id == step_id) {
            return StepStatus::Done;
        }
        if self.started.iter().any(|id| id == step_id) {
            return StepStatus::Running;
        }
        StepStatus::Pending
    }
}
