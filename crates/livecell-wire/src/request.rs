//! Outgoing shell requests.

use jupyter_protocol::Channel;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::message::WireMessage;

/// `execute_request` content.
///
/// `user_expressions` doubles as a side channel for backend parameters
/// (persistence flags, credentials). Its values are forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: Map<String, Value>,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: Map::new(),
            allow_stdin: false,
            stop_on_error: true,
        }
    }

    pub fn with_user_expressions(mut self, user_expressions: Map<String, Value>) -> Self {
        self.user_expressions = user_expressions;
        self
    }

    pub fn into_message(self, session: &str) -> WireMessage {
        WireMessage::new("execute_request", to_content(&self), session, Channel::Shell)
    }
}

/// `complete_request` content. `cursor_pos` counts unicode code points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompleteRequest {
    pub code: String,
    pub cursor_pos: usize,
}

impl CompleteRequest {
    pub fn into_message(self, session: &str) -> WireMessage {
        WireMessage::new("complete_request", to_content(&self), session, Channel::Shell)
    }
}

/// `inspect_request` content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectRequest {
    pub code: String,
    pub cursor_pos: usize,
    pub detail_level: u8,
}

impl InspectRequest {
    pub fn into_message(self, session: &str) -> WireMessage {
        WireMessage::new("inspect_request", to_content(&self), session, Channel::Shell)
    }
}

// Plain structs of strings, numbers and maps always serialize.
fn to_content<T: Serialize>(content: &T) -> Value {
    serde_json::to_value(content).unwrap_or_else(|_| Value::Object(Map::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_request_carries_side_channel() {
        let mut expressions = Map::new();
        expressions.insert("persistent".into(), json!("yes"));
        expressions.insert("username".into(), Value::Null);

        let msg = ExecuteRequest::new("f x = x")
            .with_user_expressions(expressions)
            .into_message("s-1");

        assert_eq!(msg.msg_type(), "execute_request");
        assert!(matches!(msg.channel, Some(Channel::Shell)));
        assert_eq!(msg.content["code"], "f x = x");
        assert_eq!(msg.content["user_expressions"]["persistent"], "yes");
        assert!(msg.content["user_expressions"]["username"].is_null());
        assert_eq!(msg.content["store_history"], true);
    }

    #[test]
    fn test_complete_and_inspect_requests() {
        let complete = CompleteRequest {
            code: "map".into(),
            cursor_pos: 3,
        }
        .into_message("s-1");
        assert_eq!(complete.msg_type(), "complete_request");
        assert_eq!(complete.content, json!({"code": "map", "cursor_pos": 3}));

        let inspect = InspectRequest {
            code: "map".into(),
            cursor_pos: 1,
            detail_level: 0,
        }
        .into_message("s-1");
        assert_eq!(inspect.msg_type(), "inspect_request");
        assert_eq!(inspect.content["detail_level"], 0);
    }
}
