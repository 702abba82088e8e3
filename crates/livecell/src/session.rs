//! One live kernel connection.
//!
//! Requests go out through the transport's outbound queue; every inbound
//! message is routed back to its request by `parent_header.msg_id`, never by
//! arrival order, so executes, completions and inspections from different
//! cells can be in flight together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use livecell_wire::{
    CompleteReply, CompleteRequest, ExecuteReply, ExecuteRequest, InspectReply, InspectRequest,
    Notification, ProtocolError, ReplyStatus, WireMessage,
};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

/// How long a completion or inspection may wait for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A message queued for the transport, with its delivery acknowledgement.
#[derive(Debug)]
pub struct Outbound {
    pub message: WireMessage,
    pub delivered: oneshot::Sender<Result<()>>,
}

/// The two halves of a kernel transport.
///
/// `inbound` closing means the connection is gone.
#[derive(Debug)]
pub struct KernelChannels {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<WireMessage>,
}

/// Out-of-band kernel lifecycle operations (REST on a Jupyter server).
#[async_trait]
pub trait KernelControl: Send + Sync {
    async fn restart(&self) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
}

/// Parameters forwarded verbatim to the backend in `user_expressions`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideChannel {
    pub persistent: bool,
    pub load_from_store: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Backend-specific command, if any.
    pub command: Option<Value>,
}

fn yes_no(flag: bool) -> Value {
    Value::String(if flag { "yes" } else { "no" }.to_string())
}

impl SideChannel {
    pub fn to_user_expressions(&self) -> Map<String, Value> {
        let mut expressions = Map::new();
        expressions.insert("persistent".into(), yes_no(self.persistent));
        expressions.insert("unicodeComplete".into(), yes_no(false));
        expressions.insert("loadFromStore".into(), yes_no(self.load_from_store));
        expressions.insert(
            "username".into(),
            self.username.clone().map(Value::String).unwrap_or(Value::Null),
        );
        expressions.insert(
            "password".into(),
            self.password.clone().map(Value::String).unwrap_or(Value::Null),
        );
        if let Some(command) = &self.command {
            expressions.insert("command".into(), command.clone());
        }
        expressions
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub code: String,
    pub side_channel: SideChannel,
}

/// What an execution reports back, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Notification(Notification),
    /// The terminal reply; delivered at most once.
    Reply(std::result::Result<ExecuteReply, ProtocolError>),
    /// The request was abandoned (restart or disconnect). Nothing follows.
    Interrupted(Error),
}

/// Handle on one in-flight execute request.
#[derive(Debug)]
pub struct ExecutionHandle {
    msg_id: String,
    delivered: Option<oneshot::Receiver<Result<()>>>,
    events: mpsc::UnboundedReceiver<ExecutionEvent>,
}

impl ExecutionHandle {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Resolves once the transport has put the request on the wire,
    /// independently of the reply.
    pub async fn done(&mut self) -> Result<()> {
        match self.delivered.take() {
            Some(rx) => rx.await.unwrap_or(Err(Error::Disconnected)),
            None => Ok(()),
        }
    }

    /// Next event, or `None` once the request is finished.
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    /// Drive the request to completion, calling `on_notification` for every
    /// streamed item and `on_reply` exactly once with the terminal reply.
    pub async fn run<N, R>(mut self, mut on_notification: N, on_reply: R) -> Result<()>
    where
        N: FnMut(Notification),
        R: FnOnce(ExecuteReply),
    {
        let mut on_reply = Some(on_reply);
        while let Some(event) = self.events.recv().await {
            match event {
                ExecutionEvent::Notification(notification) => on_notification(notification),
                ExecutionEvent::Reply(Ok(reply)) => {
                    if let Some(on_reply) = on_reply.take() {
                        on_reply(reply);
                    }
                }
                ExecutionEvent::Reply(Err(e)) => return Err(e.into()),
                ExecutionEvent::Interrupted(e) => return Err(e),
            }
        }
        match on_reply {
            Some(_) => Err(Error::Disconnected),
            None => Ok(()),
        }
    }
}

/// Completion candidates for `[replace_start, replace_end)` (character offsets).
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub status: ReplyStatus,
    pub matches: Vec<String>,
    pub replace_start: usize,
    pub replace_end: usize,
}

/// What the caller should do with a [`CompletionResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome<'a> {
    NoMatches,
    Single(&'a str),
    Choice(&'a [String]),
}

impl CompletionResult {
    pub fn outcome(&self) -> CompletionOutcome<'_> {
        match self.matches.as_slice() {
            [] => CompletionOutcome::NoMatches,
            [single] => CompletionOutcome::Single(single),
            many => CompletionOutcome::Choice(many),
        }
    }
}

enum Pending {
    Execute {
        events: mpsc::UnboundedSender<ExecutionEvent>,
        replied: bool,
        idle: bool,
    },
    Complete(oneshot::Sender<Result<WireMessage>>),
    Inspect(oneshot::Sender<Result<WireMessage>>),
}

impl Pending {
    fn abandon(self, error: Error) {
        match self {
            Pending::Execute { events, .. } => {
                let _ = events.send(ExecutionEvent::Interrupted(error));
            }
            Pending::Complete(tx) | Pending::Inspect(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct Inner {
    kernel_id: String,
    session_id: String,
    outbound: mpsc::Sender<Outbound>,
    pending: Mutex<HashMap<String, Pending>>,
    control: Arc<dyn KernelControl>,
    request_timeout: Duration,
    disconnected: AtomicBool,
    closed: CancellationToken,
}

/// A live kernel connection, shared by every bound cell.
#[derive(Clone)]
pub struct KernelSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSession")
            .field("kernel_id", &self.inner.kernel_id)
            .field("session_id", &self.inner.session_id)
            .finish()
    }
}

impl KernelSession {
    pub fn new(
        kernel_id: impl Into<String>,
        channels: KernelChannels,
        control: Arc<dyn KernelControl>,
    ) -> Self {
        Self::with_timeout(kernel_id, channels, control, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        kernel_id: impl Into<String>,
        channels: KernelChannels,
        control: Arc<dyn KernelControl>,
        request_timeout: Duration,
    ) -> Self {
        Self::connect(
            kernel_id,
            Uuid::new_v4().to_string(),
            channels,
            control,
            request_timeout,
        )
    }

    /// Wrap an established transport. `session_id` is stamped on every
    /// outgoing header and should match the one the transport was opened with.
    pub fn connect(
        kernel_id: impl Into<String>,
        session_id: String,
        channels: KernelChannels,
        control: Arc<dyn KernelControl>,
        request_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            kernel_id: kernel_id.into(),
            session_id,
            outbound: channels.outbound,
            pending: Mutex::new(HashMap::new()),
            control,
            request_timeout,
            disconnected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });
        tokio::spawn(route_inbound(Arc::downgrade(&inner), channels.inbound));
        info!("[session] Connected to kernel {}", inner.kernel_id);
        Self { inner }
    }

    pub fn kernel_id(&self) -> &str {
        &self.inner.kernel_id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.disconnected.load(Ordering::SeqCst)
    }

    /// Resolves once the transport has closed and every pending request
    /// has been failed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Number of requests still waiting on the kernel.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn ptr_eq(&self, other: &KernelSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Send an execute request. The returned handle streams notifications
    /// and the terminal reply.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionHandle> {
        let message = ExecuteRequest::new(request.code)
            .with_user_expressions(request.side_channel.to_user_expressions())
            .into_message(&self.inner.session_id);
        let msg_id = message.msg_id().to_string();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inner.pending().insert(
            msg_id.clone(),
            Pending::Execute {
                events: events_tx,
                replied: false,
                idle: false,
            },
        );

        let delivered = self.send(message).await?;
        debug!("[session] Sent execute_request {}", msg_id);
        Ok(ExecutionHandle {
            msg_id,
            delivered: Some(delivered),
            events: events_rx,
        })
    }

    /// Ask for completions at `cursor_offset` (in characters).
    pub async fn request_completion(&self, code: &str, cursor_offset: usize) -> Result<CompletionResult> {
        let message = CompleteRequest {
            code: code.to_string(),
            cursor_pos: cursor_offset,
        }
        .into_message(&self.inner.session_id);
        let reply = self
            .round_trip(message, Pending::Complete, CompleteReply::MSG_TYPE)
            .await?;
        let reply = CompleteReply::from_content(&reply.content)?;

        if reply.status != ReplyStatus::Ok {
            let message = reply
                .matches
                .first()
                .cloned()
                .unwrap_or_else(|| "the kernel reported an error".to_string());
            return Err(Error::Completion(message));
        }
        Ok(CompletionResult {
            status: reply.status,
            matches: reply.matches,
            replace_start: reply.cursor_start,
            replace_end: reply.cursor_end,
        })
    }

    /// Plain-text description of the symbol at `cursor_offset`.
    pub async fn request_inspection(&self, code: &str, cursor_offset: usize) -> Result<String> {
        let message = InspectRequest {
            code: code.to_string(),
            cursor_pos: cursor_offset,
            detail_level: 0,
        }
        .into_message(&self.inner.session_id);
        let reply = self
            .round_trip(message, Pending::Inspect, InspectReply::MSG_TYPE)
            .await?;
        let reply = InspectReply::from_content(&reply.content)?;

        match (reply.status, reply.found, reply.text) {
            (ReplyStatus::Ok, true, Some(text)) => Ok(text),
            (ReplyStatus::Ok, _, _) => Err(Error::Inspection("no information found".to_string())),
            (_, _, _) => Err(Error::Inspection(
                reply
                    .evalue
                    .unwrap_or_else(|| "the kernel reported an error".to_string()),
            )),
        }
    }

    /// Restart the kernel in place. Requests issued before the restart are
    /// abandoned and deliver nothing further.
    pub async fn restart(&self) -> Result<()> {
        let abandoned = self.inner.drain(Error::Restarted);
        info!(
            "[session] Restarting kernel {} ({} requests abandoned)",
            self.inner.kernel_id, abandoned
        );
        self.inner.control.restart().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.inner.drain(Error::Disconnected);
        info!("[session] Shutting down kernel {}", self.inner.kernel_id);
        self.inner.control.shutdown().await
    }

    async fn send(&self, message: WireMessage) -> Result<oneshot::Receiver<Result<()>>> {
        let msg_id = message.msg_id().to_string();
        if !self.is_connected() {
            self.inner.pending().remove(&msg_id);
            return Err(Error::Disconnected);
        }
        let (delivered_tx, delivered_rx) = oneshot::channel();
        let outbound = Outbound {
            message,
            delivered: delivered_tx,
        };
        if self.inner.outbound.send(outbound).await.is_err() {
            self.inner.pending().remove(&msg_id);
            return Err(Error::Transport("kernel connection is closed".to_string()));
        }
        Ok(delivered_rx)
    }

    async fn round_trip(
        &self,
        message: WireMessage,
        pending: fn(oneshot::Sender<Result<WireMessage>>) -> Pending,
        reply_type: &str,
    ) -> Result<WireMessage> {
        let msg_id = message.msg_id().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(msg_id.clone(), pending(tx));

        let delivered = self.send(message).await?;
        debug!("[session] Sent {} for {}", message_kind(reply_type), msg_id);

        let wait = async {
            // A failed write means no reply is coming
            if let Ok(Err(e)) = delivered.await {
                return Err(e);
            }
            rx.await.unwrap_or(Err(Error::Disconnected))
        };
        match tokio::time::timeout(self.inner.request_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.pending().remove(&msg_id);
                Err(Error::Timeout(reply_type.to_string()))
            }
        }
    }
}

fn message_kind(reply_type: &str) -> &str {
    match reply_type {
        "complete_reply" => "complete_request",
        "inspect_reply" => "inspect_request",
        other => other,
    }
}

impl Inner {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn drain(&self, error: Error) -> usize {
        let drained: Vec<Pending> = self.pending().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            pending.abandon(error.clone());
        }
        count
    }

    fn dispatch(&self, message: WireMessage) {
        let Some(parent_id) = message.parent_msg_id().map(str::to_string) else {
            debug!("[session] Ignoring unparented {}", message.msg_type());
            return;
        };

        let mut pending = self.pending();
        let Some(entry) = pending.get_mut(&parent_id) else {
            debug!(
                "[session] No pending request {} for {}",
                parent_id,
                message.msg_type()
            );
            return;
        };

        match entry {
            Pending::Execute {
                events,
                replied,
                idle,
            } => {
                if message.msg_type() == ExecuteReply::MSG_TYPE {
                    if *replied {
                        warn!("[session] Duplicate execute_reply for {}", parent_id);
                        return;
                    }
                    *replied = true;
                    let _ = events.send(ExecutionEvent::Reply(ExecuteReply::from_content(
                        &message.content,
                    )));
                } else {
                    match Notification::from_message(&message) {
                        Ok(notification) => {
                            if notification.is_idle() {
                                *idle = true;
                            }
                            let _ = events.send(ExecutionEvent::Notification(notification));
                        }
                        Err(e) => warn!("[session] Dropping malformed {}: {}", message.msg_type(), e),
                    }
                }
                if *replied && *idle {
                    pending.remove(&parent_id);
                }
            }
            Pending::Complete(_) if message.msg_type() == CompleteReply::MSG_TYPE => {
                if let Some(Pending::Complete(tx)) = pending.remove(&parent_id) {
                    let _ = tx.send(Ok(message));
                }
            }
            Pending::Inspect(_) if message.msg_type() == InspectReply::MSG_TYPE => {
                if let Some(Pending::Inspect(tx)) = pending.remove(&parent_id) {
                    let _ = tx.send(Ok(message));
                }
            }
            Pending::Complete(_) | Pending::Inspect(_) => {
                debug!("[session] Ignoring {} for {}", message.msg_type(), parent_id);
            }
        }
    }
}

async fn route_inbound(inner: Weak<Inner>, mut inbound: mpsc::Receiver<WireMessage>) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(message);
    }

    if let Some(inner) = inner.upgrade() {
        inner.disconnected.store(true, Ordering::SeqCst);
        let abandoned = inner.drain(Error::Disconnected);
        warn!(
            "[session] Connection to kernel {} closed ({} requests abandoned)",
            inner.kernel_id, abandoned
        );
        inner.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecell_wire::{Channel, StreamName};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingControl {
        restarts: AtomicUsize,
    }

    #[async_trait]
    impl KernelControl for CountingControl {
        async fn restart(&self) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Wire {
        requests: mpsc::Receiver<Outbound>,
        replies: mpsc::Sender<WireMessage>,
    }

    impl Wire {
        async fn next_request(&mut self) -> WireMessage {
            let outbound = self.requests.recv().await.unwrap();
            let _ = outbound.delivered.send(Ok(()));
            outbound.message
        }

        async fn reply(&self, parent: &WireMessage, msg_type: &str, content: Value, channel: Channel) {
            self.replies
                .send(WireMessage::child_of(parent, msg_type, content, channel))
                .await
                .unwrap();
        }
    }

    fn connect(timeout: Duration) -> (KernelSession, Wire, Arc<CountingControl>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let control = Arc::new(CountingControl::default());
        let session = KernelSession::with_timeout(
            "k-1",
            KernelChannels {
                outbound: out_tx,
                inbound: in_rx,
            },
            control.clone(),
            timeout,
        );
        (
            session,
            Wire {
                requests: out_rx,
                replies: in_tx,
            },
            control,
        )
    }

    fn request(code: &str) -> ExecutionRequest {
        ExecutionRequest {
            code: code.to_string(),
            side_channel: SideChannel::default(),
        }
    }

    #[test]
    fn test_side_channel_user_expressions() {
        let side = SideChannel {
            persistent: true,
            load_from_store: false,
            username: Some("ada".into()),
            password: None,
            command: Some(json!("typecheck")),
        };
        let expressions = Value::Object(side.to_user_expressions());
        assert_eq!(
            expressions,
            json!({
                "persistent": "yes",
                "unicodeComplete": "no",
                "loadFromStore": "no",
                "username": "ada",
                "password": null,
                "command": "typecheck"
            })
        );
    }

    #[test]
    fn test_completion_outcome() {
        let mut result = CompletionResult {
            status: ReplyStatus::Ok,
            matches: vec![],
            replace_start: 0,
            replace_end: 0,
        };
        assert_eq!(result.outcome(), CompletionOutcome::NoMatches);
        result.matches = vec!["map".into()];
        assert_eq!(result.outcome(), CompletionOutcome::Single("map"));
        result.matches.push("mapM".into());
        assert!(matches!(result.outcome(), CompletionOutcome::Choice(m) if m.len() == 2));
    }

    #[tokio::test]
    async fn test_execute_streams_then_replies() {
        let (session, mut wire, _) = connect(DEFAULT_REQUEST_TIMEOUT);
        let mut handle = session.execute(request("print(1)")).await.unwrap();

        let sent = wire.next_request().await;
        assert_eq!(sent.msg_type(), "execute_request");
        assert_eq!(sent.content["code"], "print(1)");
        assert_eq!(sent.content["user_expressions"]["unicodeComplete"], "no");
        handle.done().await.unwrap();

        wire.reply(&sent, "stream", json!({"name": "stdout", "text": "1\n"}), Channel::IOPub).await;
        wire.reply(&sent, "execute_reply", json!({"status": "ok", "user_expressions": {}}), Channel::Shell).await;
        wire.reply(&sent, "status", json!({"execution_state": "idle"}), Channel::IOPub).await;

        let mut outputs = Vec::new();
        let mut replies = Vec::new();
        handle
            .run(|n| outputs.push(n), |r| replies.push(r))
            .await
            .unwrap();

        assert_eq!(
            outputs[0],
            Notification::Stream {
                name: StreamName::Stdout,
                text: "1\n".into()
            }
        );
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status, ReplyStatus::Ok);
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_replies_are_matched_by_parent_not_order() {
        let (session, mut wire, _) = connect(DEFAULT_REQUEST_TIMEOUT);

        let complete = {
            let session = session.clone();
            tokio::spawn(async move { session.request_completion("ma", 2).await })
        };
        let first = wire.next_request().await;
        let inspect = {
            let session = session.clone();
            tokio::spawn(async move { session.request_inspection("map", 1).await })
        };
        let second = wire.next_request().await;
        assert_eq!(first.msg_type(), "complete_request");
        assert_eq!(second.msg_type(), "inspect_request");
        assert_eq!(second.content["detail_level"], 0);

        // Answer the later request first
        wire.reply(
            &second,
            "inspect_reply",
            json!({"status": "ok", "found": true, "data": {"text/plain": "map : ..."}}),
            Channel::Shell,
        )
        .await;
        wire.reply(
            &first,
            "complete_reply",
            json!({"status": "ok", "matches": ["map", "mapM"], "cursor_start": 0, "cursor_end": 2}),
            Channel::Shell,
        )
        .await;

        assert_eq!(inspect.await.unwrap().unwrap(), "map : ...");
        let completion = complete.await.unwrap().unwrap();
        assert_eq!(completion.matches, vec!["map", "mapM"]);
        assert_eq!((completion.replace_start, completion.replace_end), (0, 2));
    }

    #[tokio::test]
    async fn test_completion_error_surfaces_first_match() {
        let (session, mut wire, _) = connect(DEFAULT_REQUEST_TIMEOUT);
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.request_completion("x", 1).await })
        };
        let sent = wire.next_request().await;
        wire.reply(
            &sent,
            "complete_reply",
            json!({"status": "error", "matches": ["Not in scope: x"]}),
            Channel::Shell,
        )
        .await;
        assert_eq!(
            task.await.unwrap(),
            Err(Error::Completion("Not in scope: x".into()))
        );
    }

    #[tokio::test]
    async fn test_inspection_without_result_fails() {
        let (session, mut wire, _) = connect(DEFAULT_REQUEST_TIMEOUT);
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.request_inspection("x", 1).await })
        };
        let sent = wire.next_request().await;
        wire.reply(&sent, "inspect_reply", json!({"status": "ok", "found": false, "data": {}}), Channel::Shell)
            .await;
        assert!(matches!(task.await.unwrap(), Err(Error::Inspection(_))));
    }

    #[tokio::test]
    async fn test_malformed_reply_is_protocol_error() {
        let (session, mut wire, _) = connect(DEFAULT_REQUEST_TIMEOUT);
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.request_completion("x", 1).await })
        };
        let sent = wire.next_request().await;
        wire.reply(&sent, "complete_reply", json!({"status": "ok"}), Channel::Shell).await;
        assert!(matches!(task.await.unwrap(), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (session, mut wire, _) = connect(Duration::from_millis(50));
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.request_completion("x", 1).await })
        };
        let _ = wire.next_request().await;
        assert_eq!(task.await.unwrap(), Err(Error::Timeout("complete_reply".into())));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_abandons_in_flight_executions() {
        let (session, mut wire, control) = connect(DEFAULT_REQUEST_TIMEOUT);
        let handle = session.execute(request("loop")).await.unwrap();
        let sent = wire.next_request().await;

        session.restart().await.unwrap();
        assert_eq!(control.restarts.load(Ordering::SeqCst), 1);

        // Late traffic for the old request goes nowhere
        wire.reply(&sent, "stream", json!({"name": "stdout", "text": "late"}), Channel::IOPub).await;

        let mut outputs = Vec::new();
        let result = handle.run(|n| outputs.push(n), |_| {}).await;
        assert_eq!(result, Err(Error::Restarted));
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_later_requests() {
        let (session, mut wire, _) = connect(DEFAULT_REQUEST_TIMEOUT);
        let handle = session.execute(request("x")).await.unwrap();
        let _ = wire.next_request().await;

        drop(wire);
        assert_eq!(handle.run(|_| {}, |_| {}).await, Err(Error::Disconnected));
        assert!(!session.is_connected());
        assert!(session.execute(request("y")).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_resolves_when_transport_drops() {
        let (session, wire, _) = connect(DEFAULT_REQUEST_TIMEOUT);
        let watcher = session.clone();
        let closed = tokio::spawn(async move { watcher.closed().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closed.is_finished());

        drop(wire);
        tokio::time::timeout(Duration::from_secs(1), closed)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.is_connected());
    }
}
