use std::fmt;

use crate::executor::{OperationSnapshot, RunPhase};
use crate::state::StepStatus;

/// Plain-text rendering of an operation's progress against its step list.
pub struct OperationView<'a> {
    snapshot: &'a OperationSnapshot,
}

impl<'a> OperationView<'a> {
    pub fn new(snapshot: &'a OperationSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn lines(&self) -> Vec<String> {
        let state = &self.snapshot.state;
        let operation = state.current();
        let mut lines = Vec::with_capacity(operation.steps.len() + 2);

        let header = match &self.snapshot.phase {
            RunPhase::Failed { message } => format!("{} [failed: {message}]", operation.title),
            phase => format!("{} [{}]", operation.title, phase.label()),
        };
        lines.push(header);

        let mut done = 0;
        for step in operation.steps {
            let line = match state.step_status(step.id) {
                StepStatus::Pending => format!("  [pending] {}", step.label),
                StepStatus::Running => format!("  [running] {}", step.label),
                StepStatus::Done => {
                    done += 1;
                    format!("  [done]    {}", step.label)
                }
                StepStatus::Failed(details) if details.is_empty() => {
                    format!("  [failed]  {}", step.label)
                }
                StepStatus::Failed(details) => format!("  [failed]  {}: {details}", step.label),
            };
            lines.push(line);
        }
        lines.push(format!("{done}/{} steps complete", operation.steps.len()));
        lines
    }
}

impl fmt::Display for OperationView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::INSTALL_SDK;
    use crate::state::{OperationState, OperationUpdate};
    use crate::topic::InvocationToken;

    #[test]
    fn renders_each_step_status() {
        let mut state = OperationState::new(&INSTALL_SDK);
        state.apply(&OperationUpdate::started("create_stage"));
        state.apply(&OperationUpdate::finished("create_stage"));
        state.apply(&OperationUpdate::started("extract_xip"));
        state.apply(&OperationUpdate::failed("extract_xip", "disk full"));
        let snapshot = OperationSnapshot {
            token: InvocationToken::new(),
            state,
            phase: RunPhase::Failed {
                message: "disk full".into(),
            },
        };

        let lines = OperationView::new(&snapshot).lines();
        assert_eq!(
            lines,
            [
                "Install Darwin SDK [failed: disk full]",
                "  [done]    Creating stage directory",
                "  [failed]  Extracting Xcode: disk full",
                "  [pending] Copying SDK files",
                "  [pending] Installing SDK",
                "  [pending] Cleaning up",
                "1/5 steps complete",
            ]
        );
    }
}
