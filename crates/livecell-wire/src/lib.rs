//! Wire types for talking to a remote execution kernel.
//!
//! The kernel is reached through a Jupyter server's kernel WebSocket, which
//! carries JSON-encoded messages. This crate provides:
//!
//! - The [`WireMessage`] envelope
//! - Outgoing request builders ([`ExecuteRequest`], [`CompleteRequest`], [`InspectRequest`])
//! - Typed, validated replies ([`ExecuteReply`], [`CompleteReply`], [`InspectReply`])
//! - Streamed iopub [`Notification`]s
//!
//! Reply content is validated at the boundary: a malformed shape becomes a
//! [`ProtocolError`] instead of a silently missing field.

mod message;
mod notification;
mod reply;
mod request;

pub use message::{WireMessage, DEFAULT_USERNAME, PROTOCOL_VERSION};
pub use notification::{ExecutionState, Notification, StreamName};
pub use reply::{
    CompleteReply, ExecuteReply, InspectReply, ProtocolError, ReplyStatus, UserExpressions,
};
pub use request::{CompleteRequest, ExecuteRequest, InspectRequest};

pub use jupyter_protocol::{Channel, Header};
