//! Shared fakes for the integration tests: an in-process kernel speaking the
//! wire protocol over channels, a scripted backend and an in-memory page.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use livecell::backend::{Backend, KernelModel};
use livecell::build::{BuildEvent, BuildStream, BuildStreamSender};
use livecell::config::KernelOptions;
use livecell::session::{KernelChannels, KernelControl, Outbound};
use livecell::{
    CellMarkup, EditorSurface, Error, KernelSession, MemoryEditor, MemoryOutput, OutputSink,
    PageEvent, PageSurface, Result, ServerSettings,
};
use livecell_wire::{Channel, WireMessage};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

/// Decides what the fake kernel answers to one request.
pub type Responder = Arc<dyn Fn(&WireMessage) -> Vec<WireMessage> + Send + Sync>;

pub fn reply(parent: &WireMessage, msg_type: &str, content: Value) -> WireMessage {
    let channel = if msg_type.ends_with("_reply") {
        Channel::Shell
    } else {
        Channel::IOPub
    };
    WireMessage::child_of(parent, msg_type, content, channel)
}

pub fn code_of(request: &WireMessage) -> String {
    request.content["code"].as_str().unwrap_or_default().to_string()
}

/// A full execute round: busy, stdout echo, reply, idle.
pub fn execute_round(parent: &WireMessage, status: &str, user_expressions: Value) -> Vec<WireMessage> {
    vec![
        reply(parent, "status", json!({"execution_state": "busy"})),
        reply(
            parent,
            "stream",
            json!({"name": "stdout", "text": format!("ran: {}", code_of(parent))}),
        ),
        reply(
            parent,
            "execute_reply",
            json!({"status": status, "execution_count": 1, "user_expressions": user_expressions}),
        ),
        reply(parent, "status", json!({"execution_state": "idle"})),
    ]
}

/// Replies `ok` to every execute, no completions, no inspection results.
pub fn default_responder() -> Responder {
    Arc::new(|request: &WireMessage| match request.msg_type() {
        "execute_request" => execute_round(request, "ok", json!({})),
        "complete_request" => vec![reply(
            request,
            "complete_reply",
            json!({"status": "ok", "matches": [], "cursor_start": 0, "cursor_end": 0}),
        )],
        "inspect_request" => vec![reply(
            request,
            "inspect_reply",
            json!({"status": "ok", "found": false, "data": {}}),
        )],
        _ => vec![],
    })
}

#[derive(Default)]
pub struct CountingControl {
    pub restarts: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

#[async_trait]
impl KernelControl for CountingControl {
    async fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An in-process kernel answering through a [`Responder`].
pub struct FakeKernel {
    pub requests: Arc<Mutex<Vec<WireMessage>>>,
    pub control: Arc<CountingControl>,
}

impl FakeKernel {
    pub fn start(kernel_id: &str, responder: Responder) -> (KernelSession, FakeKernel) {
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);
        let (in_tx, in_rx) = mpsc::channel(256);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let control = Arc::new(CountingControl::default());

        let seen = requests.clone();
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                let _ = outbound.delivered.send(Ok(()));
                seen.lock().unwrap().push(outbound.message.clone());
                for message in responder(&outbound.message) {
                    if in_tx.send(message).await.is_err() {
                        return;
                    }
                }
            }
        });

        let session = KernelSession::new(
            kernel_id,
            KernelChannels {
                outbound: out_tx,
                inbound: in_rx,
            },
            control.clone(),
        );
        (session, FakeKernel { requests, control })
    }

    pub fn requests_of(&self, msg_type: &str) -> Vec<WireMessage> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.msg_type() == msg_type)
            .cloned()
            .collect()
    }
}

/// A kernel the test answers by hand.
pub struct ManualWire {
    requests: mpsc::Receiver<Outbound>,
    replies: mpsc::Sender<WireMessage>,
}

impl ManualWire {
    pub fn connect() -> (KernelSession, ManualWire, Arc<CountingControl>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(64);
        let control = Arc::new(CountingControl::default());
        let session = KernelSession::new(
            "manual",
            KernelChannels {
                outbound: out_tx,
                inbound: in_rx,
            },
            control.clone(),
        );
        (
            session,
            ManualWire {
                requests: out_rx,
                replies: in_tx,
            },
            control,
        )
    }

    pub async fn next_request(&mut self) -> WireMessage {
        let outbound = tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("no request within 5s")
            .expect("session dropped");
        let _ = outbound.delivered.send(Ok(()));
        outbound.message
    }

    pub async fn send_all(&self, messages: Vec<WireMessage>) {
        for message in messages {
            self.replies.send(message).await.unwrap();
        }
    }
}

/// Backend with scripted build streams and liveness probes.
pub struct FakeBackend {
    pub responder: Responder,
    pub build_events: Mutex<Vec<BuildEvent>>,
    /// Close the build stream after the scripted events instead of idling.
    pub hang_up_after_events: bool,
    pub probe_ok: bool,
    pub fail_start: Mutex<bool>,
    /// Base URL whose kernel starts are refused even though it answers probes.
    pub refuse_server: Option<String>,
    pub start_delay: Duration,
    pub starts: Mutex<Vec<ServerSettings>>,
    pub probes: AtomicUsize,
    pub builds: AtomicUsize,
    pub build_senders: Mutex<Vec<BuildStreamSender>>,
    pub kernels: Mutex<Vec<Arc<Mutex<Vec<WireMessage>>>>>,
    pub controls: Mutex<Vec<Arc<CountingControl>>>,
    /// Hand out hand-driven sessions, kept in `wires`, instead of fake kernels.
    pub manual: bool,
    pub wires: Mutex<Vec<ManualWire>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            responder: default_responder(),
            build_events: Mutex::new(Vec::new()),
            hang_up_after_events: false,
            probe_ok: true,
            fail_start: Mutex::new(false),
            refuse_server: None,
            start_delay: Duration::ZERO,
            starts: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
            build_senders: Mutex::new(Vec::new()),
            kernels: Mutex::new(Vec::new()),
            controls: Mutex::new(Vec::new()),
            manual: false,
            wires: Mutex::new(Vec::new()),
        }
    }
}

impl FakeBackend {
    pub fn with_responder(responder: Responder) -> Self {
        Self {
            responder,
            ..Default::default()
        }
    }

    pub fn with_build(events: Vec<BuildEvent>) -> Self {
        Self {
            build_events: Mutex::new(events),
            ..Default::default()
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn last_server(&self) -> Option<ServerSettings> {
        self.starts.lock().unwrap().last().cloned()
    }

    pub fn all_build_streams_closed(&self) -> bool {
        self.build_senders
            .lock()
            .unwrap()
            .iter()
            .all(|tx| tx.is_closed())
    }

    /// Every request sent to every kernel this backend started.
    pub fn requests_of(&self, msg_type: &str) -> Vec<WireMessage> {
        self.kernels
            .lock()
            .unwrap()
            .iter()
            .flat_map(|k| k.lock().unwrap().clone())
            .filter(|m| m.msg_type() == msg_type)
            .collect()
    }

    pub fn restarts(&self) -> usize {
        self.controls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.restarts.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn start_session(&self, server: &ServerSettings, _kernel: &KernelOptions) -> Result<KernelSession> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        self.starts.lock().unwrap().push(server.clone());
        if *self.fail_start.lock().unwrap() || self.refuse_server.as_deref() == Some(server.base_url.as_str()) {
            return Err(Error::Connection(format!("{} refused", server.base_url)));
        }
        if self.manual {
            let (session, wire, control) = ManualWire::connect();
            self.wires.lock().unwrap().push(wire);
            self.controls.lock().unwrap().push(control);
            return Ok(session);
        }
        let id = format!("kernel-{}", self.start_count());
        let (session, kernel) = FakeKernel::start(&id, self.responder.clone());
        self.kernels.lock().unwrap().push(kernel.requests);
        self.controls.lock().unwrap().push(kernel.control);
        Ok(session)
    }

    async fn list_running(&self, server: &ServerSettings) -> Result<Vec<KernelModel>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_ok {
            Ok(vec![])
        } else {
            Err(Error::Connection(format!("{} is gone", server.base_url)))
        }
    }

    async fn open_build_stream(&self, _build_url: &str) -> Result<BuildStream> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let (tx, stream) = BuildStream::channel(64);
        let hang_up = self.hang_up_after_events;
        if !hang_up {
            // A retained sender would keep the stream open
            self.build_senders.lock().unwrap().push(tx.clone());
        }
        let events = self.build_events.lock().unwrap().clone();
        tokio::spawn(async move {
            for event in events {
                if !tx.send(Ok(event)).await {
                    return;
                }
            }
            if !hang_up {
                tx.closed().await;
            }
        });
        Ok(stream)
    }
}

/// Wait until `predicate` holds, polling every 10ms for up to 5s.
pub async fn eventually<F: FnMut() -> bool>(mut predicate: F) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

/// Drain every event currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<PageEvent>) -> Vec<PageEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// One executable block on a [`MemoryPage`].
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub id: Option<String>,
    pub source: String,
    pub language: Option<String>,
    pub read_only: bool,
    pub output: Option<String>,
}

impl Block {
    pub fn code(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }
}

/// An in-memory page. Every block matches every selector.
#[derive(Default)]
pub struct MemoryPage {
    pub config: Vec<String>,
    pub blocks: Vec<Block>,
    pub editors: HashMap<String, MemoryEditor>,
    pub outputs: HashMap<String, MemoryOutput>,
}

impl MemoryPage {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config.push(config.to_string());
        self
    }

    pub fn editor(&self, id: &str) -> MemoryEditor {
        self.editors[id].clone()
    }

    pub fn output(&self, id: &str) -> MemoryOutput {
        self.outputs[id].clone()
    }
}

impl PageSurface for MemoryPage {
    fn config_blocks(&self) -> Vec<String> {
        self.config.clone()
    }

    fn block_sources(&self, _selector: &str) -> Vec<String> {
        self.blocks.iter().map(|b| b.source.clone()).collect()
    }

    fn replace_block(&mut self, _selector: &str, index: usize, sources: Vec<String>) {
        let template = self.blocks.remove(index);
        for (offset, source) in sources.into_iter().enumerate() {
            let mut block = template.clone();
            block.id = None;
            block.source = source;
            self.blocks.insert(index + offset, block);
        }
    }

    fn cells(&self, _selector: &str, _output_selector: &str) -> Vec<CellMarkup> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(index, block)| CellMarkup {
                id: block.id.clone().unwrap_or_else(|| format!("cell-{index}")),
                source: block.source.clone(),
                language: block.language.clone().unwrap_or_else(|| "python".to_string()),
                read_only: block.read_only,
                predefined_output: block.output.clone(),
            })
            .collect()
    }

    fn mount(&mut self, cell: &CellMarkup) -> (Box<dyn EditorSurface>, Box<dyn OutputSink>) {
        let mut editor = MemoryEditor::new(&cell.source);
        if cell.read_only {
            editor = editor.read_only();
        }
        let output = MemoryOutput::new();
        self.editors.insert(cell.id.clone(), editor.clone());
        self.outputs.insert(cell.id.clone(), output.clone());
        (Box::new(editor), Box::new(output))
    }
}
