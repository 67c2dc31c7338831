use std::collections::HashMap;

use crosscode_ops::{OperationSnapshot, RunPhase, StepStatus};
use serde_json::{Map, Value};

/// Turns successive snapshots into one line per step transition.
#[derive(Default)]
pub(crate) struct ProgressPrinter {
    seen: HashMap<&'static str, StepStatus>,
    phase: Option<RunPhase>,
}

impl ProgressPrinter {
    pub(crate) fn update(&mut self, snapshot: &OperationSnapshot) -> Vec<String> {
        let operation = snapshot.state.current();
        let mut lines = Vec::new();
        for (idx, step) in operation.steps.iter().enumerate() {
            let status = snapshot.state.step_status(step.id);
            if self.seen.get(step.id) == Some(&status) {
                continue;
            }
            let position = format!("[{}/{}]", idx + 1, operation.steps.len());
            match &status {
                StepStatus::Pending => {}
                StepStatus::Running => lines.push(format!("{position} {}...", step.label)),
                StepStatus::Done => lines.push(format!("{position} {} done", step.label)),
                StepStatus::Failed(details) if details.is_empty() => {
                    lines.push(format!("{position} {} failed", step.label))
                }
                StepStatus::Failed(details) => {
                    lines.push(format!("{position} {} failed: {details}", step.label))
                }
            }
            self.seen.insert(step.id, status);
        }
        if self.phase.as_ref() != Some(&snapshot.phase) {
            if !snapshot.phase.is_running() {
                lines.push(match &snapshot.phase {
                    RunPhase::Failed { message } => format!("{} failed: {message}", operation.title),
                    phase => format!("{} {}", operation.title, phase.label()),
                });
            }
            self.phase = Some(snapshot.phase.clone());
        }
        lines
    }
}

/// Parses `key=value` pairs into a parameter object. Values that parse as JSON
/// keep their type; anything else is a string.
pub(crate) fn parse_params(pairs: &[String]) -> Result<Value, String> {
    let mut params = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got {pair:?}"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty key in {pair:?}"));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(Value::Object(params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosscode_ops::registry::DEPLOY;
    use crosscode_ops::{InvocationToken, OperationState, OperationUpdate};
    use serde_json::json;

    fn snapshot(state: &OperationState, phase: RunPhase) -> OperationSnapshot {
        OperationSnapshot {
            token: InvocationToken::new(),
            state: state.clone(),
            phase,
        }
    }

    #[test]
    fn prints_each_transition_once() {
        let mut printer = ProgressPrinter::default();
        let mut state = OperationState::new(&DEPLOY);
        assert!(printer.update(&snapshot(&state, RunPhase::Running)).is_empty());

        state.apply(&OperationUpdate::started("build"));
        assert_eq!(
            printer.update(&snapshot(&state, RunPhase::Running)),
            ["[1/4] Building app..."]
        );
        assert!(printer.update(&snapshot(&state, RunPhase::Running)).is_empty());

        state.apply(&OperationUpdate::finished("build"));
        state.apply(&OperationUpdate::started("sign"));
        state.apply(&OperationUpdate::failed("sign", "no team"));
        assert_eq!(
            printer.update(&snapshot(
                &state,
                RunPhase::Failed {
                    message: "Signing app failed".into()
                }
            )),
            [
                "[1/4] Building app done",
                "[2/4] Signing app failed: no team",
                "Deploy app failed: Signing app failed",
            ]
        );
    }

    #[test]
    fn params_keep_json_types() {
        let params = parse_params(&[
            "folder=/src/app".to_string(),
            "debug=true".to_string(),
            "retries=3".to_string(),
            "label=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(
            params,
            json!({"folder": "/src/app", "debug": true, "retries": 3, "label": "a=b"})
        );
        assert!(parse_params(&["novalue".to_string()]).is_err());
        assert!(parse_params(&["=x".to_string()]).is_err());
        assert_eq!(parse_params(&[]).unwrap(), json!({}));
    }
}
