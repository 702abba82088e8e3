//! Typed shell replies, validated from raw message content.

use serde_json::{Map, Value};

/// Malformed or unexpected kernel traffic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("{msg_type} content is not a JSON object")]
    NotAnObject { msg_type: String },

    #[error("{msg_type} is missing required field `{field}`")]
    MissingField {
        msg_type: String,
        field: &'static str,
    },

    #[error("{msg_type} field `{field}` is malformed: {reason}")]
    InvalidField {
        msg_type: String,
        field: &'static str,
        reason: String,
    },

    #[error("expected {expected}, got {actual}")]
    UnexpectedType { expected: String, actual: String },
}

/// Reply status shared by every shell reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

impl ReplyStatus {
    fn parse(content: &Map<String, Value>, msg_type: &str) -> Result<Self, ProtocolError> {
        let status = content
            .get("status")
            .ok_or_else(|| missing(msg_type, "status"))?
            .as_str()
            .ok_or_else(|| invalid(msg_type, "status", "expected a string"))?;
        match status {
            "ok" => Ok(ReplyStatus::Ok),
            "error" => Ok(ReplyStatus::Error),
            "aborted" | "abort" => Ok(ReplyStatus::Aborted),
            other => Err(invalid(msg_type, "status", format!("unknown status {other:?}"))),
        }
    }
}

/// The `user_expressions` grab-bag of an execute reply.
///
/// Proof-assistant kernels use it to hand back a rewritten source (`code`),
/// a textual report (`result`) and the lines of unresolved holes (`holes`).
/// Anything else is kept in `other`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserExpressions {
    pub code: Option<String>,
    pub result: Option<String>,
    pub holes: Vec<usize>,
    pub other: Map<String, Value>,
}

impl UserExpressions {
    fn parse(value: Option<&Value>, msg_type: &str) -> Result<Self, ProtocolError> {
        let map = match value {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(invalid(msg_type, "user_expressions", "expected an object")),
        };

        let mut expressions = UserExpressions::default();
        for (key, value) in map {
            match key.as_str() {
                "code" => {
                    let code = value
                        .as_str()
                        .ok_or_else(|| invalid(msg_type, "user_expressions.code", "expected a string"))?;
                    expressions.code = Some(code.to_string());
                }
                "result" => expressions.result = text_of(value),
                "holes" => expressions.holes = parse_holes(value, msg_type)?,
                _ => {
                    expressions.other.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(expressions)
    }
}

fn parse_holes(value: &Value, msg_type: &str) -> Result<Vec<usize>, ProtocolError> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid(msg_type, "user_expressions.holes", "expected an array"))?;
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .map(|line| line as usize)
                .ok_or_else(|| {
                    invalid(
                        msg_type,
                        "user_expressions.holes",
                        format!("expected a line number, got {item}"),
                    )
                })
        })
        .collect()
}

/// Plain text out of either a bare string or a mime bundle
/// (`{"data": {"text/plain": ...}}`).
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("data")
            .and_then(|data| data.get("text/plain"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// `execute_reply`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    pub execution_count: Option<u64>,
    pub user_expressions: UserExpressions,
    pub ename: Option<String>,
    pub evalue: Option<String>,
    pub traceback: Vec<String>,
}

impl ExecuteReply {
    pub const MSG_TYPE: &'static str = "execute_reply";

    pub fn from_content(content: &Value) -> Result<Self, ProtocolError> {
        let map = object(content, Self::MSG_TYPE)?;
        Ok(ExecuteReply {
            status: ReplyStatus::parse(map, Self::MSG_TYPE)?,
            execution_count: map.get("execution_count").and_then(Value::as_u64),
            user_expressions: UserExpressions::parse(map.get("user_expressions"), Self::MSG_TYPE)?,
            ename: optional_str(map, "ename"),
            evalue: optional_str(map, "evalue"),
            traceback: string_list(map, "traceback"),
        })
    }

    /// Text describing a failure: the backend report if present, else `evalue`.
    pub fn report(&self) -> Option<&str> {
        self.user_expressions
            .result
            .as_deref()
            .or(self.evalue.as_deref())
    }
}

/// `complete_reply`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteReply {
    pub status: ReplyStatus,
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
}

impl CompleteReply {
    pub const MSG_TYPE: &'static str = "complete_reply";

    pub fn from_content(content: &Value) -> Result<Self, ProtocolError> {
        let map = object(content, Self::MSG_TYPE)?;
        let status = ReplyStatus::parse(map, Self::MSG_TYPE)?;

        let matches = match map.get("matches") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        invalid(Self::MSG_TYPE, "matches", "expected an array of strings")
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None | Some(Value::Null) if status != ReplyStatus::Ok => Vec::new(),
            None => return Err(missing(Self::MSG_TYPE, "matches")),
            Some(_) => return Err(invalid(Self::MSG_TYPE, "matches", "expected an array")),
        };

        let cursor = |field: &'static str| -> Result<usize, ProtocolError> {
            match map.get(field) {
                Some(value) => value
                    .as_u64()
                    .map(|v| v as usize)
                    .ok_or_else(|| invalid(Self::MSG_TYPE, field, "expected an offset")),
                None if status != ReplyStatus::Ok => Ok(0),
                None => Err(missing(Self::MSG_TYPE, field)),
            }
        };

        Ok(CompleteReply {
            status,
            matches,
            cursor_start: cursor("cursor_start")?,
            cursor_end: cursor("cursor_end")?,
        })
    }
}

/// `inspect_reply`.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectReply {
    pub status: ReplyStatus,
    pub found: bool,
    /// The `text/plain` entry of the returned bundle.
    pub text: Option<String>,
    pub evalue: Option<String>,
}

impl InspectReply {
    pub const MSG_TYPE: &'static str = "inspect_reply";

    pub fn from_content(content: &Value) -> Result<Self, ProtocolError> {
        let map = object(content, Self::MSG_TYPE)?;
        let status = ReplyStatus::parse(map, Self::MSG_TYPE)?;
        let text = match map.get("data") {
            None | Some(Value::Null) => None,
            Some(Value::Object(data)) => data.get("text/plain").and_then(Value::as_str).map(str::to_string),
            Some(_) => return Err(invalid(Self::MSG_TYPE, "data", "expected a mime bundle")),
        };
        Ok(InspectReply {
            status,
            // Some kernels omit `found`; a text payload implies it.
            found: map
                .get("found")
                .and_then(Value::as_bool)
                .unwrap_or(text.is_some()),
            text,
            evalue: optional_str(map, "evalue"),
        })
    }
}

fn object<'a>(content: &'a Value, msg_type: &str) -> Result<&'a Map<String, Value>, ProtocolError> {
    content.as_object().ok_or_else(|| ProtocolError::NotAnObject {
        msg_type: msg_type.to_string(),
    })
}

fn optional_str(map: &Map<String, Value>, field: &str) -> Option<String> {
    map.get(field).and_then(Value::as_str).map(str::to_string)
}

fn string_list(map: &Map<String, Value>, field: &str) -> Vec<String> {
    map.get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn missing(msg_type: &str, field: &'static str) -> ProtocolError {
    ProtocolError::MissingField {
        msg_type: msg_type.to_string(),
        field,
    }
}

fn invalid(msg_type: &str, field: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidField {
        msg_type: msg_type.to_string(),
        field,
        reason: reason.into(),
    }
}
