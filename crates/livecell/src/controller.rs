//! The per-cell state machine.
//!
//! Each cell runs as its own task that owns the editor, the output area and
//! every piece of mutable cell state. Commands from the page and results
//! from the kernel are processed one at a time, in arrival order.
//!
//! Actions issued before the page has a kernel are queued and replayed in
//! submission order once the cell's [`KernelBinding`] resolves. Every run and
//! every completion/inspection carries a generation number; results of a
//! superseded request are dropped instead of overwriting newer state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use livecell_wire::{ExecuteReply, Notification, ReplyStatus};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use crate::binding::KernelBinding;
use crate::error::{Error, Result};
use crate::keymap::{CellAction, ChordState, Key};
use crate::output::{OutputItem, OutputSink};
use crate::page::PageSession;
use crate::session::{
    CompletionOutcome, CompletionResult, ExecutionEvent, ExecutionRequest, KernelSession,
    SideChannel,
};
use crate::store::keys;
use crate::surface::{EditorSurface, HighlightKind};

/// Source edits are written to the store once typing pauses this long.
pub const SOURCE_WRITE_DELAY: Duration = Duration::from_millis(300);

pub const WAITING_FOR_KERNEL: &str = "Waiting for kernel...";
pub const NO_MATCHES: &str = "no matches";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    Unknown,
    Running,
    Ok,
    Error,
    /// Ran, but the kernel reported unresolved holes.
    Holes,
}

/// What a cell is made of when the page mounts it.
pub struct CellParts {
    pub id: String,
    pub editor: Box<dyn EditorSurface>,
    pub output: Box<dyn OutputSink>,
    /// Pre-rendered HTML shown until the first run.
    pub predefined_output: Option<String>,
}

type Waiter = oneshot::Sender<CellStatus>;

enum Command {
    Perform {
        action: CellAction,
        waiter: Option<Waiter>,
    },
    Key(Key),
    SourceChanged,
    FlushSource(oneshot::Sender<()>),
    SetOutputText(String),
}

enum Internal {
    Notification {
        generation: u64,
        notification: Notification,
    },
    Reply {
        generation: u64,
        reply: ExecuteReply,
    },
    ExecuteFailed {
        generation: u64,
        error: Error,
    },
    Completed {
        generation: u64,
        result: Result<CompletionResult>,
    },
    Inspected {
        generation: u64,
        result: Result<String>,
    },
}

/// Cheap, cloneable handle on a running cell.
#[derive(Clone)]
pub struct CellHandle {
    id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<CellStatus>,
    binding: KernelBinding,
}

impl std::fmt::Debug for CellHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellHandle")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl CellHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> CellStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<CellStatus> {
        self.status.clone()
    }

    pub fn binding(&self) -> &KernelBinding {
        &self.binding
    }

    /// Queue `action` without waiting for it.
    pub fn submit(&self, action: CellAction) {
        self.send(Command::Perform {
            action,
            waiter: None,
        });
    }

    /// Queue `action` now; the receiver fires with the cell status once the
    /// action has played out.
    pub fn dispatch(&self, action: CellAction) -> oneshot::Receiver<CellStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Perform {
            action,
            waiter: Some(tx),
        });
        rx
    }

    /// Run the cell and wait for its reply to be applied.
    pub async fn run(&self) -> Result<CellStatus> {
        settled(self.dispatch(CellAction::Run)).await
    }

    /// Complete at the cursor. A single match is applied and re-runs the
    /// cell; this waits for that run too.
    pub async fn complete(&self) -> Result<CellStatus> {
        settled(self.dispatch(CellAction::Complete)).await
    }

    pub async fn inspect(&self) -> Result<CellStatus> {
        settled(self.dispatch(CellAction::Inspect)).await
    }

    pub fn press_key(&self, key: Key) {
        self.send(Command::Key(key));
    }

    /// The editor content changed; persist it once edits settle.
    pub fn source_changed(&self) {
        self.send(Command::SourceChanged);
    }

    /// Write a pending source edit now.
    pub async fn flush_source(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::FlushSource(tx));
        rx.await.map_err(|_| Error::Disconnected)
    }

    pub fn set_output_text(&self, text: &str) {
        self.send(Command::SetOutputText(text.to_string()));
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("[cell:{}] Cell is shut down, dropping command", self.id);
        }
    }
}

async fn settled(rx: oneshot::Receiver<CellStatus>) -> Result<CellStatus> {
    rx.await.map_err(|_| Error::Disconnected)
}

pub struct CellController {
    id: String,
    editor: Box<dyn EditorSurface>,
    output: Box<dyn OutputSink>,
    page: Arc<PageSession>,
    binding: KernelBinding,
    session: Option<KernelSession>,
    status: watch::Sender<CellStatus>,
    results: mpsc::UnboundedSender<Internal>,
    queued: VecDeque<(CellAction, Option<Waiter>)>,

    first_execution: bool,
    last_run_succeeded: bool,
    exec_generation: u64,
    query_generation: u64,
    run_waiters: Vec<Waiter>,
    query_waiters: Vec<Waiter>,
    produced_output: bool,
    clear_on_next_output: bool,

    chord: ChordState,
    info_deadline: Option<Instant>,
    source_deadline: Option<Instant>,
}

impl CellController {
    /// Mount a cell on `page` and start its task.
    pub fn spawn(parts: CellParts, page: Arc<PageSession>) -> CellHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CellStatus::Unknown);
        let binding = KernelBinding::new();

        let mut controller = CellController {
            id: parts.id,
            editor: parts.editor,
            output: parts.output,
            page,
            binding: binding.clone(),
            session: None,
            status: status_tx,
            results: results_tx,
            queued: VecDeque::new(),
            first_execution: true,
            last_run_succeeded: false,
            exec_generation: 0,
            query_generation: 0,
            run_waiters: Vec::new(),
            query_waiters: Vec::new(),
            produced_output: false,
            clear_on_next_output: false,
            chord: ChordState::default(),
            info_deadline: None,
            source_deadline: None,
        };
        controller.restore_source();
        if controller.page.options.predefined_output {
            if let Some(html) = parts.predefined_output {
                controller.output.append(OutputItem::html(html));
            }
        }

        let handle = CellHandle {
            id: Arc::from(controller.id.as_str()),
            commands: commands_tx,
            status: status_rx,
            binding,
        };
        tokio::spawn(controller.run(commands_rx, results_rx));
        handle
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut results: mpsc::UnboundedReceiver<Internal>,
    ) {
        let shutdown = self.page.shutdown_token();
        debug!("[cell:{}] Started", self.id);

        loop {
            let binding = self.binding.clone();
            let unbound = self.session.is_none();
            let source_deadline = self.source_deadline;
            let info_deadline = self.info_deadline;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(result) = results.recv() => self.handle_result(result),
                session = binding.wait(), if unbound => self.bind(session),
                _ = sleep_until(source_deadline.unwrap_or_else(Instant::now)), if source_deadline.is_some() => {
                    self.write_source();
                }
                _ = sleep_until(info_deadline.unwrap_or_else(Instant::now)), if info_deadline.is_some() => {
                    self.clear_info();
                }
            }
        }

        if self.source_deadline.is_some() {
            self.write_source();
        }
        debug!("[cell:{}] Stopped", self.id);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Perform { action, waiter } => self.perform(action, waiter),
            Command::Key(key) => self.press_key(key),
            Command::SourceChanged => self.schedule_source_write(),
            Command::FlushSource(done) => {
                if self.source_deadline.is_some() {
                    self.write_source();
                }
                let _ = done.send(());
            }
            Command::SetOutputText(text) => self.output.set_text(&text),
        }
    }

    fn handle_result(&mut self, result: Internal) {
        match result {
            Internal::Notification {
                generation,
                notification,
            } if generation == self.exec_generation => self.show_notification(notification),
            Internal::Reply { generation, reply } if generation == self.exec_generation => {
                self.apply_reply(reply)
            }
            Internal::ExecuteFailed { generation, error } if generation == self.exec_generation => {
                self.execution_failed(error)
            }
            Internal::Completed { generation, result } if generation == self.query_generation => {
                self.apply_completion(result)
            }
            Internal::Inspected { generation, result } if generation == self.query_generation => {
                self.apply_inspection(result)
            }
            _ => debug!("[cell:{}] Discarding result of a superseded request", self.id),
        }
    }

    fn perform(&mut self, action: CellAction, waiter: Option<Waiter>) {
        let Some(session) = self.session.clone() else {
            self.defer(action, waiter);
            return;
        };
        match action {
            CellAction::Run => self.execute(session, waiter.into_iter().collect()),
            CellAction::Complete => self.complete(session, waiter),
            CellAction::Inspect => self.inspect(session, waiter),
        }
    }

    fn defer(&mut self, action: CellAction, waiter: Option<Waiter>) {
        debug!("[cell:{}] No kernel connected, queueing {:?}", self.id, action);
        if action == CellAction::Run {
            self.editor.clear_highlights();
            self.set_status(CellStatus::Running);
        }
        self.output.set_text(WAITING_FOR_KERNEL);
        self.page.events.request_kernel();
        self.queued.push_back((action, waiter));
    }

    fn bind(&mut self, session: KernelSession) {
        info!(
            "[cell:{}] Bound to kernel {} ({} queued actions)",
            self.id,
            session.kernel_id(),
            self.queued.len()
        );
        self.session = Some(session);
        for (action, waiter) in std::mem::take(&mut self.queued) {
            self.perform(action, waiter);
        }
    }

    fn execute(&mut self, session: KernelSession, waiters: Vec<Waiter>) {
        self.exec_generation += 1;
        let generation = self.exec_generation;
        // A superseded run settles with the run that replaced it
        self.run_waiters.extend(waiters);

        self.editor.clear_highlights();
        self.set_status(CellStatus::Running);
        self.output.clear();
        self.produced_output = false;
        self.clear_on_next_output = false;

        let kernel = &self.page.options.kernel_options;
        let side_channel = SideChannel {
            persistent: kernel.persistent,
            load_from_store: self.first_execution && kernel.load_from_store,
            username: self.page.preference(keys::USERNAME),
            password: self.page.preference(keys::PASSWORD),
            command: None,
        };
        debug!(
            "[cell:{}] Executing (generation {}, persistent={}, loadFromStore={})",
            self.id, generation, side_channel.persistent, side_channel.load_from_store
        );
        let request = ExecutionRequest {
            code: self.editor.text(),
            side_channel,
        };
        tokio::spawn(forward_execution(
            session,
            request,
            generation,
            self.results.clone(),
        ));
    }

    fn show_notification(&mut self, notification: Notification) {
        if let Notification::ClearOutput { wait } = notification {
            if wait {
                self.clear_on_next_output = true;
            } else {
                self.output.clear();
            }
            return;
        }
        if let Some(item) = OutputItem::from_notification(notification) {
            if std::mem::take(&mut self.clear_on_next_output) {
                self.output.clear();
            }
            self.output.append(item);
            self.produced_output = true;
        }
    }

    fn apply_reply(&mut self, reply: ExecuteReply) {
        let expressions = &reply.user_expressions;

        if self.first_execution {
            if let Some(code) = expressions.code.as_deref() {
                if self.editor.is_read_only() {
                    debug!("[cell:{}] Read-only, ignoring suggested source", self.id);
                } else {
                    info!("[cell:{}] Replacing source with the kernel's version", self.id);
                    self.editor.set_text(code);
                    self.editor.fold_initial();
                    self.schedule_source_write();
                }
                self.first_execution = false;
            }
        }

        let status = match reply.status {
            ReplyStatus::Ok => {
                self.first_execution = false;
                if expressions.holes.is_empty() {
                    self.record_success();
                    CellStatus::Ok
                } else {
                    debug!("[cell:{}] Holes at lines {:?}", self.id, expressions.holes);
                    for &line in &expressions.holes {
                        self.editor.highlight_lines(line, line, HighlightKind::Hole);
                    }
                    self.retract_success();
                    CellStatus::Holes
                }
            }
            ReplyStatus::Error | ReplyStatus::Aborted => {
                self.retract_success();
                let report = reply.report().unwrap_or_default();
                for diagnostic in self.page.diagnostics.parse(report) {
                    debug!(
                        "[cell:{}] Highlighting {} lines {}-{}",
                        self.id, diagnostic.file, diagnostic.line_from, diagnostic.line_to
                    );
                    self.editor.highlight_lines(
                        diagnostic.line_from.saturating_sub(1),
                        diagnostic.line_to.saturating_sub(1),
                        HighlightKind::Error,
                    );
                }
                if !self.produced_output && !report.is_empty() {
                    self.output.append(OutputItem::stderr(report));
                }
                CellStatus::Error
            }
        };

        self.set_status(status);
        self.settle_runs(status);
    }

    fn execution_failed(&mut self, error: Error) {
        if error == Error::Restarted {
            info!("[cell:{}] Kernel restarted before the reply arrived", self.id);
            self.set_status(CellStatus::Unknown);
            self.settle_runs(CellStatus::Unknown);
            return;
        }

        warn!("[cell:{}] Failed to execute: {}", self.id, error);
        self.output.clear();
        self.output.append(OutputItem::stderr(format!(
            "Failed to execute. {error} Please refresh the page."
        )));
        self.retract_success();
        self.set_status(CellStatus::Error);
        self.settle_runs(CellStatus::Error);
    }

    fn next_query(&mut self, waiter: Option<Waiter>) -> (u64, String, usize) {
        self.query_generation += 1;
        self.query_waiters.extend(waiter);
        (
            self.query_generation,
            self.editor.text(),
            self.editor.cursor_offset(),
        )
    }

    fn complete(&mut self, session: KernelSession, waiter: Option<Waiter>) {
        let (generation, code, cursor) = self.next_query(waiter);
        debug!("[cell:{}] Completing at offset {}", self.id, cursor);
        let results = self.results.clone();
        tokio::spawn(async move {
            let result = session.request_completion(&code, cursor).await;
            let _ = results.send(Internal::Completed { generation, result });
        });
    }

    fn inspect(&mut self, session: KernelSession, waiter: Option<Waiter>) {
        let (generation, code, cursor) = self.next_query(waiter);
        debug!("[cell:{}] Inspecting at offset {}", self.id, cursor);
        let results = self.results.clone();
        tokio::spawn(async move {
            let result = session.request_inspection(&code, cursor).await;
            let _ = results.send(Internal::Inspected { generation, result });
        });
    }

    fn apply_completion(&mut self, result: Result<CompletionResult>) {
        let waiters = std::mem::take(&mut self.query_waiters);
        let completion = match result {
            Ok(completion) => completion,
            Err(e) => {
                self.output.set_text(&query_error_text(e));
                self.settle(waiters);
                return;
            }
        };

        let rerun = match completion.outcome() {
            CompletionOutcome::NoMatches => {
                self.output.set_text(NO_MATCHES);
                false
            }
            CompletionOutcome::Single(replacement) if !self.editor.is_read_only() => {
                debug!("[cell:{}] Single match {:?}", self.id, replacement);
                self.editor.replace_range(
                    completion.replace_start,
                    completion.replace_end,
                    replacement,
                );
                self.schedule_source_write();
                true
            }
            CompletionOutcome::Single(_) | CompletionOutcome::Choice(_) => {
                self.editor.show_choices(
                    &completion.matches,
                    completion.replace_start,
                    completion.replace_end,
                );
                false
            }
        };

        match self.session.clone() {
            Some(session) if rerun => self.execute(session, waiters),
            _ => self.settle(waiters),
        }
    }

    fn apply_inspection(&mut self, result: Result<String>) {
        let waiters = std::mem::take(&mut self.query_waiters);
        match result {
            Ok(text) => self.output.set_text(&text),
            Err(e) => self.output.set_text(&query_error_text(e)),
        }
        self.settle(waiters);
    }

    fn press_key(&mut self, key: Key) {
        let now = Instant::now();
        let outcome = self.chord.press(key, now);
        if let Some(info) = outcome.info {
            self.editor.set_info(&info);
            self.info_deadline = Some(now + self.chord.window());
        }
        if let Some(action) = outcome.action {
            self.perform(action, None);
        }
    }

    fn clear_info(&mut self) {
        self.info_deadline = None;
        self.chord.expire(Instant::now());
        self.editor.set_info("");
    }

    fn restore_source(&mut self) {
        let key = keys::cell_source(&self.id);
        match self.page.store.get(&key) {
            Ok(Some(stored)) if !stored.is_empty() => {
                info!("[cell:{}] Restoring stored source", self.id);
                self.editor.set_text(&stored);
            }
            Ok(_) => {
                if let Err(e) = self.page.store.set(&key, &self.editor.text()) {
                    warn!("[store] Failed to save source of cell {}: {}", self.id, e);
                }
            }
            Err(e) => warn!("[store] Failed to read source of cell {}: {}", self.id, e),
        }
    }

    fn schedule_source_write(&mut self) {
        self.source_deadline = Some(Instant::now() + SOURCE_WRITE_DELAY);
    }

    fn write_source(&mut self) {
        self.source_deadline = None;
        let key = keys::cell_source(&self.id);
        if let Err(e) = self.page.store.set(&key, &self.editor.text()) {
            warn!("[store] Failed to save source of cell {}: {}", self.id, e);
        }
    }

    fn record_success(&mut self) {
        if !self.last_run_succeeded {
            self.last_run_succeeded = true;
            self.page.record_success();
        }
    }

    fn retract_success(&mut self) {
        if self.last_run_succeeded {
            self.last_run_succeeded = false;
            self.page.retract_success();
        }
    }

    fn set_status(&self, status: CellStatus) {
        debug!("[cell:{}] Status {:?}", self.id, status);
        self.status.send_replace(status);
    }

    fn settle_runs(&mut self, status: CellStatus) {
        for waiter in self.run_waiters.drain(..) {
            let _ = waiter.send(status);
        }
    }

    fn settle(&self, waiters: Vec<Waiter>) {
        let status = *self.status.borrow();
        for waiter in waiters {
            let _ = waiter.send(status);
        }
    }
}

fn query_error_text(error: Error) -> String {
    match error {
        Error::Completion(message) | Error::Inspection(message) => message,
        other => other.to_string(),
    }
}

async fn forward_execution(
    session: KernelSession,
    request: ExecutionRequest,
    generation: u64,
    results: mpsc::UnboundedSender<Internal>,
) {
    let mut handle = match session.execute(request).await {
        Ok(handle) => handle,
        Err(error) => {
            let _ = results.send(Internal::ExecuteFailed { generation, error });
            return;
        }
    };
    if let Err(error) = handle.done().await {
        let _ = results.send(Internal::ExecuteFailed { generation, error });
        return;
    }

    while let Some(event) = handle.next_event().await {
        let result = match event {
            ExecutionEvent::Notification(notification) => Internal::Notification {
                generation,
                notification,
            },
            ExecutionEvent::Reply(Ok(reply)) => Internal::Reply { generation, reply },
            ExecutionEvent::Reply(Err(e)) => Internal::ExecuteFailed {
                generation,
                error: e.into(),
            },
            ExecutionEvent::Interrupted(error) => Internal::ExecuteFailed { generation, error },
        };
        if results.send(result).is_err() {
            return;
        }
    }
}
