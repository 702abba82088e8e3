//! Message envelope for the kernel WebSocket.

use chrono::Utc;
use jupyter_protocol::{Channel, Header};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// Messaging protocol version stamped on outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Username stamped on outgoing headers.
pub const DEFAULT_USERNAME: &str = "livecell";

/// One message on the kernel socket.
///
/// Content stays raw JSON here; the typed views in [`crate::ExecuteReply`],
/// [`crate::CompleteReply`], [`crate::InspectReply`] and
/// [`crate::Notification`] validate it per `msg_type`.
///
/// - `parent_header` may arrive as `{}`, `null`, or a full header
/// - `buffers` are carried through untouched; `null` reads as empty
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: Header,

    #[serde(
        default,
        serialize_with = "serialize_parent_header",
        deserialize_with = "jupyter_protocol::deserialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default)]
    pub metadata: Value,

    #[serde(default)]
    pub content: Value,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub buffers: Vec<Value>,

    #[serde(default)]
    pub channel: Option<Channel>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Kernels expect an empty object rather than `null` for a missing parent.
fn serialize_parent_header<S>(header: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match header {
        Some(header) => header.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

impl WireMessage {
    /// Build a fresh message with a new msg_id.
    pub fn new(msg_type: &str, content: Value, session: &str, channel: Channel) -> Self {
        WireMessage {
            header: Header {
                msg_id: Uuid::new_v4().to_string(),
                username: DEFAULT_USERNAME.to_string(),
                session: session.to_string(),
                date: Utc::now(),
                msg_type: msg_type.to_string(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: None,
            metadata: Value::Object(Default::default()),
            content,
            buffers: Vec::new(),
            channel: Some(channel),
        }
    }

    /// Build a message whose parent is `parent`, as a kernel does for
    /// replies and iopub traffic.
    pub fn child_of(parent: &WireMessage, msg_type: &str, content: Value, channel: Channel) -> Self {
        let mut message = WireMessage::new(msg_type, content, &parent.header.session, channel);
        message.parent_header = Some(parent.header.clone());
        message
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The msg_id of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }
}
