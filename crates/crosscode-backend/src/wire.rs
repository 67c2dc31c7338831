//! JSON-in-string payloads and error mapping for the bridge service.

use crosscode_ops::BackendError;
use serde_json::Value;
use tonic::{Code, Status};

pub fn encode_json(value: &Value) -> String {
    value.to_string()
}

/// Empty strings decode to `null`.
pub fn decode_json(raw: &str) -> Result<Value, BackendError> {
    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw).map_err(|err| BackendError::Payload(err.to_string()))
}

pub fn status_from_backend(err: BackendError) -> Status {
    match err {
        BackendError::Call { message, .. } => Status::aborted(message),
        BackendError::UnknownCommand(command) => {
            Status::not_found(format!("unknown command: {command}"))
        }
        BackendError::Unavailable(message) => Status::unavailable(message),
        BackendError::Subscribe { topic, message } => {
            Status::failed_precondition(format!("subscribe to {topic} failed: {message}"))
        }
        BackendError::Payload(message) => Status::invalid_argument(message),
    }
}

/// Maps a status from `command`'s call back to the error the backend raised.
pub fn backend_from_status(command: &str, status: Status) -> BackendError {
    let message = status.message().to_string();
    match status.code() {
        Code::Aborted => BackendError::Call {
            command: command.to_string(),
            message,
        },
        Code::NotFound => BackendError::UnknownCommand(command.to_string()),
        Code::InvalidArgument => BackendError::Payload(message),
        Code::Unavailable | Code::Unknown | Code::DeadlineExceeded | Code::Cancelled => {
            BackendError::Unavailable(if message.is_empty() {
                status.code().description().to_string()
            } else {
                message
            })
        }
        _ => BackendError::Call {
            command: command.to_string(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_payload_is_null() {
        assert_eq!(decode_json("").unwrap(), Value::Null);
        assert_eq!(decode_json(" {\"a\":1} ").unwrap(), json!({"a": 1}));
        assert!(matches!(decode_json("{"), Err(BackendError::Payload(_))));
    }

    #[test]
    fn call_errors_survive_the_round_trip() {
        let original = BackendError::Call {
            command: "install_sdk_operation".into(),
            message: "Extracting Xcode failed".into(),
        };
        let back = backend_from_status("install_sdk_operation", status_from_backend(original.clone()));
        assert_eq!(back, original);

        let unknown = BackendError::UnknownCommand("nope".into());
        assert_eq!(
            backend_from_status("nope", status_from_backend(unknown.clone())),
            unknown
        );
    }

    #[test]
    fn transport_failures_are_unavailable() {
        let err = backend_from_status("is_windows", Status::unavailable("connection refused"));
        assert_eq!(err, BackendError::Unavailable("connection refused".into()));
    }
}
