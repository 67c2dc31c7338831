use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const OPERATION_PREFIX: &str = "operation_";

/// Identifies one backend call. Operation progress for that call is published
/// on a topic keyed by the operation id plus this token, so two runs of the
/// same operation never share a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationToken(Uuid);

impl InvocationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl Default for InvocationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named event channel between the backend and its front-ends.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Step updates for one invocation of an operation.
    Operation {
        operation_id: String,
        token: InvocationToken,
    },
    BuildOutput,
    Devices,
    TwoFactorRequired,
    AppleIdRequired,
    DdiMountProgress,
    Syslog,
    Stdout,
    TwoFactorReceived,
    AppleIdReceived,
    LoginCancelled,
    Named(String),
}

impl Topic {
    pub fn operation(operation_id: &str, token: InvocationToken) -> Self {
        Topic::Operation {
            operation_id: operation_id.to_string(),
            token,
        }
    }

    pub fn channel_name(&self) -> String {
        match self {
            Topic::Operation {
                operation_id,
                token,
            } => format!("{OPERATION_PREFIX}{operation_id}/{token}"),
            Topic::Named(name) => name.clone(),
            fixed => fixed.fixed_name().unwrap_or_default().to_string(),
        }
    }

    /// Maps a wire channel name back to a topic. Names that match no known
    /// channel become [`Topic::Named`].
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        if let Some(rest) = name.strip_prefix(OPERATION_PREFIX) {
            if let Some((operation_id, token)) = rest.split_once('/') {
                if let Some(token) = InvocationToken::parse(token) {
                    if !operation_id.is_empty() {
                        return Topic::operation(operation_id, token);
                    }
                }
            }
        }
        match name {
            "build-output" => Topic::BuildOutput,
            "idevices" => Topic::Devices,
            "2fa-required" => Topic::TwoFactorRequired,
            "apple-id-required" => Topic::AppleIdRequired,
            "ddi-mount-progress" => Topic::DdiMountProgress,
            "syslog-message" => Topic::Syslog,
            "stdout-message" => Topic::Stdout,
            "2fa-recieved" => Topic::TwoFactorReceived,
            "apple-id-recieved" => Topic::AppleIdReceived,
            "login-cancelled" => Topic::LoginCancelled,
            other => Topic::Named(other.to_string()),
        }
    }

    fn fixed_name(&self) -> Option<&'static str> {
        // The "recieved" spelling is what deployed backends listen for.
        let name = match self {
            Topic::BuildOutput => "build-output",
            Topic::Devices => "idevices",
            Topic::TwoFactorRequired => "2fa-required",
            Topic::AppleIdRequired => "apple-id-required",
            Topic::DdiMountProgress => "ddi-mount-progress",
            Topic::Syslog => "syslog-message",
            Topic::Stdout => "stdout-message",
            Topic::TwoFactorReceived => "2fa-recieved",
            Topic::AppleIdReceived => "apple-id-recieved",
            Topic::LoginCancelled => "login-cancelled",
            Topic::Operation { .. } | Topic::Named(_) => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_topics_are_keyed_by_token() {
        let a = Topic::operation("install_sdk", InvocationToken::new());
        let b = Topic::operation("install_sdk", InvocationToken::new());
        assert_ne!(a, b);
        assert_ne!(a.channel_name(), b.channel_name());
        assert!(a.channel_name().starts_with("operation_install_sdk/"));
    }

    #[test]
    fn channel_names_parse_back() {
        let token = InvocationToken::new();
        let topics = [
            Topic::operation("deploy", token),
            Topic::BuildOutput,
            Topic::Devices,
            Topic::TwoFactorReceived,
            Topic::Named("custom-channel".into()),
        ];
        for topic in topics {
            assert_eq!(Topic::parse(&topic.channel_name()), topic);
        }
    }

    #[test]
    fn malformed_operation_names_stay_named() {
        assert_eq!(
            Topic::parse("operation_install_sdk"),
            Topic::Named("operation_install_sdk".into())
        );
        assert_eq!(
            Topic::parse("operation_install_sdk/not-a-token"),
            Topic::Named("operation_install_sdk/not-a-token".into())
        );
    }
}
