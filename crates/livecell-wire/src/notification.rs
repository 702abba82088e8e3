//! Streamed iopub traffic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::WireMessage;
use crate::reply::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
    Other(String),
}

impl ExecutionState {
    fn parse(state: &str) -> Self {
        match state {
            "busy" => ExecutionState::Busy,
            "idle" => ExecutionState::Idle,
            "starting" => ExecutionState::Starting,
            other => ExecutionState::Other(other.to_string()),
        }
    }
}

/// An iopub message, validated per `msg_type`.
///
/// Unknown message types are kept as [`Notification::Other`] so that
/// backend-specific info messages still reach the cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Stream {
        name: StreamName,
        text: String,
    },
    DisplayData {
        data: Map<String, Value>,
        metadata: Map<String, Value>,
    },
    ExecuteResult {
        execution_count: Option<u64>,
        data: Map<String, Value>,
        metadata: Map<String, Value>,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    ClearOutput {
        wait: bool,
    },
    Status {
        execution_state: ExecutionState,
    },
    ExecuteInput {
        code: String,
        execution_count: Option<u64>,
    },
    Other {
        msg_type: String,
        content: Value,
    },
}

impl Notification {
    pub fn from_message(message: &WireMessage) -> Result<Self, ProtocolError> {
        Self::from_parts(message.msg_type(), &message.content)
    }

    pub fn from_parts(msg_type: &str, content: &Value) -> Result<Self, ProtocolError> {
        let known = matches!(
            msg_type,
            "stream" | "display_data" | "update_display_data" | "execute_result" | "error"
                | "clear_output" | "status" | "execute_input"
        );
        if !known {
            return Ok(Notification::Other {
                msg_type: msg_type.to_string(),
                content: content.clone(),
            });
        }

        let map = content.as_object().ok_or_else(|| ProtocolError::NotAnObject {
            msg_type: msg_type.to_string(),
        })?;
        let field = |name: &'static str| -> Result<&Value, ProtocolError> {
            map.get(name).ok_or_else(|| ProtocolError::MissingField {
                msg_type: msg_type.to_string(),
                field: name,
            })
        };
        let string = |name: &'static str| -> Result<String, ProtocolError> {
            field(name)?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::InvalidField {
                    msg_type: msg_type.to_string(),
                    field: name,
                    reason: "expected a string".to_string(),
                })
        };
        let bundle = |name: &'static str| -> Map<String, Value> {
            map.get(name)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };

        let notification = match msg_type {
            "stream" => {
                let name = match string("name")?.as_str() {
                    "stdout" => StreamName::Stdout,
                    "stderr" => StreamName::Stderr,
                    other => {
                        return Err(ProtocolError::InvalidField {
                            msg_type: msg_type.to_string(),
                            field: "name",
                            reason: format!("unknown stream {other:?}"),
                        })
                    }
                };
                Notification::Stream {
                    name,
                    text: string("text")?,
                }
            }
            "display_data" | "update_display_data" => Notification::DisplayData {
                data: bundle("data"),
                metadata: bundle("metadata"),
            },
            "execute_result" => Notification::ExecuteResult {
                execution_count: map.get("execution_count").and_then(Value::as_u64),
                data: bundle("data"),
                metadata: bundle("metadata"),
            },
            "error" => Notification::Error {
                ename: string("ename")?,
                evalue: string("evalue")?,
                traceback: map
                    .get("traceback")
                    .and_then(Value::as_array)
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "clear_output" => Notification::ClearOutput {
                wait: map.get("wait").and_then(Value::as_bool).unwrap_or(false),
            },
            "status" => Notification::Status {
                execution_state: ExecutionState::parse(&string("execution_state")?),
            },
            _ => Notification::ExecuteInput {
                code: string("code")?,
                execution_count: map.get("execution_count").and_then(Value::as_u64),
            },
        };
        Ok(notification)
    }

    /// True for the `idle` status that closes a request's iopub traffic.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            Notification::Status {
                execution_state: ExecutionState::Idle
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream() {
        let n = Notification::from_parts("stream", &json!({"name": "stderr", "text": "oops"})).unwrap();
        assert_eq!(
            n,
            Notification::Stream {
                name: StreamName::Stderr,
                text: "oops".into()
            }
        );
    }

    #[test]
    fn test_display_and_result() {
        let n = Notification::from_parts(
            "execute_result",
            &json!({"execution_count": 3, "data": {"text/plain": "42"}, "metadata": {}}),
        )
        .unwrap();
        match n {
            Notification::ExecuteResult {
                execution_count,
                data,
                ..
            } => {
                assert_eq!(execution_count, Some(3));
                assert_eq!(data["text/plain"], "42");
            }
            other => panic!("unexpected {other:?}"),
        }

        let n = Notification::from_parts("display_data", &json!({"data": {"text/html": "<b/>"}})).unwrap();
        assert!(matches!(n, Notification::DisplayData { .. }));
    }

    #[test]
    fn test_status_idle() {
        let n = Notification::from_parts("status", &json!({"execution_state": "idle"})).unwrap();
        assert!(n.is_idle());
        let n = Notification::from_parts("status", &json!({"execution_state": "restarting"})).unwrap();
        assert!(!n.is_idle());
        assert_eq!(
            n,
            Notification::Status {
                execution_state: ExecutionState::Other("restarting".into())
            }
        );
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let n = Notification::from_parts("agda_info", &json!({"text": "Checking..."})).unwrap();
        assert_eq!(
            n,
            Notification::Other {
                msg_type: "agda_info".into(),
                content: json!({"text": "Checking..."})
            }
        );
    }

    #[test]
    fn test_malformed_known_types() {
        assert!(matches!(
            Notification::from_parts("stream", &json!({"name": "stdout"})),
            Err(ProtocolError::MissingField { field: "text", .. })
        ));
        assert!(matches!(
            Notification::from_parts("stream", &json!({"name": "stdin", "text": ""})),
            Err(ProtocolError::InvalidField { field: "name", .. })
        ));
        assert!(matches!(
            Notification::from_parts("status", &json!([])),
            Err(ProtocolError::NotAnObject { .. })
        ));
    }
}
