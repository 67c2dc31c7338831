use std::collections::VecDeque;

use serde_json::Value;

use crate::bridge::Subscription;

pub const DEFAULT_CONSOLE_LINES: usize = 10_000;

const DONE_MARKER: &str = "command.done.";
/// Exit code the backend reports when a command failed before producing one.
const FAILED_EXIT_CODE: i32 = 999;

/// One `build-output` payload, classified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleEvent {
    Line(String),
    Finished { exit_code: i32 },
    Failed,
}

impl ConsoleEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConsoleEvent::Line(_))
    }

    pub fn render(&self) -> String {
        match self {
            ConsoleEvent::Line(line) => line.clone(),
            ConsoleEvent::Finished { exit_code } => {
                format!("Command finished with exit code: {exit_code}")
            }
            ConsoleEvent::Failed => "Command failed".to_string(),
        }
    }
}

pub fn parse_console_payload(payload: &str) -> ConsoleEvent {
    if let Some(idx) = payload.find(DONE_MARKER) {
        let code = payload[idx + DONE_MARKER.len()..]
            .split(|c: char| !(c.is_ascii_digit() || c == '-'))
            .next()
            .unwrap_or_default();
        match code.parse::<i32>() {
            Ok(FAILED_EXIT_CODE) => return ConsoleEvent::Failed,
            Ok(exit_code) => return ConsoleEvent::Finished { exit_code },
            Err(_) => {}
        }
    }
    ConsoleEvent::Line(payload.to_string())
}

/// Bounded scrollback for command output.
#[derive(Clone, Debug)]
pub struct CommandConsole {
    lines: VecDeque<String>,
    max_lines: usize,
}

impl CommandConsole {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines: max_lines.max(1),
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Appends one payload and returns how it was classified. Non-string
    /// payloads are shown as JSON.
    pub fn push_payload(&mut self, payload: &Value) -> ConsoleEvent {
        let event = match payload {
            Value::String(text) => parse_console_payload(text),
            other => ConsoleEvent::Line(other.to_string()),
        };
        if self.lines.len() >= self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(event.render());
        event
    }

    /// Reads payloads into the console until a done marker arrives or the
    /// subscription ends. `on_line` sees each rendered line as it lands.
    pub async fn follow(
        &mut self,
        subscription: &mut Subscription,
        mut on_line: impl FnMut(&str),
    ) -> Option<ConsoleEvent> {
        while let Some(payload) = subscription.recv().await {
            let event = self.push_payload(&payload);
            if let Some(line) = self.lines.back() {
                on_line(line);
            }
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}

impl Default for CommandConsole {
    fn default() -> Self {
        Self::new(DEFAULT_CONSOLE_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::topic::Topic;

    #[test]
    fn done_markers_are_classified() {
        assert_eq!(parse_console_payload("command.done.0"), ConsoleEvent::Finished { exit_code: 0 });
        assert_eq!(parse_console_payload("command.done.2"), ConsoleEvent::Finished { exit_code: 2 });
        assert_eq!(parse_console_payload("command.done.999"), ConsoleEvent::Failed);
        assert_eq!(
            parse_console_payload("Compiling MyApp"),
            ConsoleEvent::Line("Compiling MyApp".into())
        );
        assert_eq!(
            parse_console_payload("command.done.soon"),
            ConsoleEvent::Line("command.done.soon".into())
        );
    }

    #[test]
    fn renders_and_bounds_scrollback() {
        let mut console = CommandConsole::new(2);
        console.push_payload(&Value::from("a"));
        console.push_payload(&Value::from("b"));
        console.push_payload(&Value::from("command.done.999"));
        assert_eq!(console.lines().collect::<Vec<_>>(), ["b", "Command failed"]);

        console.push_payload(&Value::from("command.done.1"));
        assert_eq!(
            console.lines().last(),
            Some("Command finished with exit code: 1")
        );
    }

    #[tokio::test]
    async fn follow_stops_at_done_marker() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Topic::BuildOutput);
        for line in ["Building", "Linking", "command.done.0", "after"] {
            bus.emit(&Topic::BuildOutput, Value::from(line));
        }

        let mut console = CommandConsole::default();
        let mut seen = Vec::new();
        let done = console
            .follow(&mut sub, |line| seen.push(line.to_string()))
            .await;

        assert_eq!(done, Some(ConsoleEvent::Finished { exit_code: 0 }));
        assert_eq!(seen, ["Building", "Linking", "Command finished with exit code: 0"]);
        assert_eq!(console.len(), 3);
    }
}
