//! Page bootstrap: options, cell discovery, lazy kernel connection and
//! page-wide actions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::broker::SessionBroker;
use crate::config::{merge_options, page_config_from_blocks, Options};
use crate::controller::{CellController, CellHandle, CellParts, CellStatus, WAITING_FOR_KERNEL};
use crate::diagnostics::DiagnosticParser;
use crate::error::{Error, Result};
use crate::events::{EventBus, KernelStatus, PageEvent};
use crate::keymap::CellAction;
use crate::output::OutputSink;
use crate::prompts::{split_input_prompts, split_output_prompts};
use crate::session::KernelSession;
use crate::store::KeyValueStore;
use crate::surface::EditorSurface;

pub const DEFAULT_LANGUAGE: &str = "python";

/// One cell as found in the page markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellMarkup {
    pub id: String,
    pub source: String,
    pub language: String,
    pub read_only: bool,
    /// Pre-rendered output found right after the cell.
    pub predefined_output: Option<String>,
}

/// The document hosting the cells.
pub trait PageSurface {
    /// Contents of every embedded configuration block, in page order.
    fn config_blocks(&self) -> Vec<String>;

    /// Text of every block matching `selector`, in page order.
    fn block_sources(&self, selector: &str) -> Vec<String>;

    /// Replace the `index`-th block matching `selector` with one block per
    /// source, keeping the block's other attributes.
    fn replace_block(&mut self, selector: &str, index: usize, sources: Vec<String>);

    fn cells(&self, selector: &str, output_selector: &str) -> Vec<CellMarkup>;

    /// Create the editing surface and output area of `cell`.
    fn mount(&mut self, cell: &CellMarkup) -> (Box<dyn EditorSurface>, Box<dyn OutputSink>);
}

/// State shared by every cell of one page.
pub struct PageSession {
    pub options: Options,
    pub store: Arc<dyn KeyValueStore>,
    pub events: EventBus,
    pub diagnostics: DiagnosticParser,
    success_count: AtomicUsize,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

impl PageSession {
    pub fn new(options: Options, store: Arc<dyn KeyValueStore>, events: EventBus) -> Self {
        Self {
            options,
            store,
            events,
            diagnostics: DiagnosticParser::default(),
            success_count: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticParser) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Number of cells whose latest run succeeded.
    pub fn success_count(&self) -> usize {
        self.success_count.load(Ordering::SeqCst)
    }

    pub fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn retract_success(&self) {
        let _ = self
            .success_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// State of the page's kernel indicator.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) != connected {
            info!(
                "[page] Kernel {}",
                if connected { "connected" } else { "disconnected" }
            );
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A stored user preference; read failures count as unset.
    pub fn preference(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("[store] Failed to read {}: {}", key, e);
                None
            }
        }
    }
}

/// Builds a [`Page`] from a [`PageSurface`].
pub struct PageBuilder {
    backend: Arc<dyn Backend>,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    overrides: Option<Value>,
    diagnostics: DiagnosticParser,
}

impl PageBuilder {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            store,
            events: EventBus::default(),
            overrides: None,
            diagnostics: DiagnosticParser::default(),
        }
    }

    /// Use `events` so subscribers attached before bootstrap see everything.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Call-site option overrides, the topmost configuration layer.
    pub fn overrides(mut self, overrides: Value) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn diagnostics(mut self, diagnostics: DiagnosticParser) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Load options, split prompts, mount every cell, and connect right away
    /// when `requestKernel` is set (otherwise on the first cell action).
    pub fn bootstrap(self, surface: &mut dyn PageSurface) -> Result<Page> {
        let blocks = surface.config_blocks();
        let page_config = page_config_from_blocks(blocks.iter().map(String::as_str));
        let options = merge_options(&page_config, self.overrides.as_ref(), self.store.as_ref())?;
        debug!("[page] Options {:?}", options);

        strip_prompts(surface, &options);

        let session = Arc::new(
            PageSession::new(options, self.store.clone(), self.events.clone())
                .with_diagnostics(self.diagnostics),
        );

        let markup = surface.cells(&session.options.selector, &session.options.output_selector);
        info!("[page] Found {} cells", markup.len());
        let cells = markup
            .iter()
            .map(|cell| {
                let (editor, output) = surface.mount(cell);
                CellController::spawn(
                    CellParts {
                        id: cell.id.clone(),
                        editor,
                        output,
                        predefined_output: cell.predefined_output.clone(),
                    },
                    session.clone(),
                )
            })
            .collect();

        let inner = Arc::new(PageInner {
            broker: SessionBroker::new(self.backend, self.store, self.events),
            session,
            cells,
            kernel: OnceCell::new(),
        });
        tokio::spawn(watch_events(inner.clone(), inner.session.events.subscribe()));

        if inner.session.options.request_kernel {
            let connecting = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = connecting.connect().await {
                    warn!("[page] Kernel connection failed: {}", e);
                }
            });
        }

        Ok(Page { inner })
    }
}

fn strip_prompts(surface: &mut dyn PageSurface, options: &Options) {
    if let Some(prompts) = &options.strip_prompts {
        let selector = prompts.selector.as_deref().unwrap_or(options.selector.as_str());
        let sources = surface.block_sources(selector);
        for (index, source) in sources.iter().enumerate().rev() {
            if let Some(pieces) = split_input_prompts(
                source,
                &prompts.in_prompt,
                prompts.continuation_prompt.as_deref(),
            ) {
                debug!("[page] Split block {} into {} cells", index, pieces.len());
                surface.replace_block(selector, index, pieces);
            }
        }
    }
    if let Some(prompts) = &options.strip_output_prompts {
        let selector = prompts.selector.as_deref().unwrap_or(options.selector.as_str());
        let sources = surface.block_sources(selector);
        for (index, source) in sources.iter().enumerate().rev() {
            if let Some(pieces) = split_output_prompts(source, &prompts.out_prompt) {
                debug!("[page] Dropped output prompts from block {}", index);
                surface.replace_block(selector, index, pieces);
            }
        }
    }
}

struct PageInner {
    session: Arc<PageSession>,
    broker: SessionBroker,
    cells: Vec<CellHandle>,
    kernel: OnceCell<KernelSession>,
}

impl PageInner {
    async fn connect(&self) -> Result<KernelSession> {
        let kernel = self
            .kernel
            .get_or_try_init(|| async {
                let kernel = self.broker.acquire_session(&self.session.options).await?;
                self.hook_up(&kernel);
                Ok::<_, Error>(kernel)
            })
            .await?;
        Ok(kernel.clone())
    }

    fn hook_up(&self, kernel: &KernelSession) {
        self.session.set_connected(true);
        tokio::spawn(watch_connection(self.session.clone(), kernel.clone()));
        for cell in &self.cells {
            if let Err(e) = cell.binding().resolve(kernel.clone()) {
                debug!("[page] Cell {} already bound: {}", cell.id(), e);
            }
        }
        if self.session.options.run_all_cells {
            info!("[page] Running all cells");
            for cell in &self.cells {
                cell.submit(CellAction::Run);
            }
        }
    }
}

/// Flips the kernel indicator when the transport goes away.
async fn watch_connection(session: Arc<PageSession>, kernel: KernelSession) {
    let shutdown = session.shutdown_token();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = kernel.closed() => {
            warn!("[page] Lost kernel {}", kernel.kernel_id());
            session.set_connected(false);
            session
                .events
                .status(KernelStatus::Failed, "kernel connection closed");
        }
    }
}

/// Connects on the first `request-kernel` and keeps the kernel indicator in
/// step with status events.
async fn watch_events(inner: Arc<PageInner>, mut events: broadcast::Receiver<PageEvent>) {
    let shutdown = inner.session.shutdown_token();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(PageEvent::RequestKernel) => {
                if inner.kernel.initialized() || inner.broker.is_in_flight() {
                    continue;
                }
                let connecting = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = connecting.connect().await {
                        warn!("[page] Kernel connection failed: {}", e);
                    }
                });
            }
            Ok(PageEvent::Status {
                status: KernelStatus::Failed,
                ..
            }) => inner.session.set_connected(false),
            Ok(PageEvent::Status {
                status: KernelStatus::Ready,
                ..
            }) => inner.session.set_connected(true),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!("[page] Event watcher skipped {} events", skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// A bootstrapped page of cells.
pub struct Page {
    inner: Arc<PageInner>,
}

impl Page {
    pub fn builder(backend: Arc<dyn Backend>, store: Arc<dyn KeyValueStore>) -> PageBuilder {
        PageBuilder::new(backend, store)
    }

    pub fn session(&self) -> &Arc<PageSession> {
        &self.inner.session
    }

    pub fn options(&self) -> &Options {
        &self.inner.session.options
    }

    pub fn cells(&self) -> &[CellHandle] {
        &self.inner.cells
    }

    pub fn cell(&self, id: &str) -> Option<&CellHandle> {
        self.inner.cells.iter().find(|cell| cell.id() == id)
    }

    pub fn kernel(&self) -> Option<KernelSession> {
        self.inner.kernel.get().cloned()
    }

    pub fn success_count(&self) -> usize {
        self.inner.session.success_count()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    /// Connect now (or join the connection in progress) and bind every cell.
    pub async fn connect(&self) -> Result<KernelSession> {
        self.inner.connect().await
    }

    /// Run every cell in page order and wait for all of them.
    pub async fn run_all(&self) -> Vec<Result<CellStatus>> {
        let pending: Vec<_> = self
            .inner
            .cells
            .iter()
            .map(|cell| cell.dispatch(CellAction::Run))
            .collect();
        join_all(
            pending
                .into_iter()
                .map(|rx| async move { rx.await.map_err(|_| Error::Disconnected) }),
        )
        .await
    }

    /// Restart the kernel in place. Does nothing before a kernel is bound.
    pub async fn restart(&self) -> Result<()> {
        match self.inner.kernel.get() {
            Some(kernel) => kernel.restart().await,
            None => Ok(()),
        }
    }

    pub async fn restart_and_run_all(&self) -> Result<Vec<Result<CellStatus>>> {
        for cell in &self.inner.cells {
            cell.set_output_text(WAITING_FOR_KERNEL);
        }
        if self.inner.kernel.get().is_none() {
            return Ok(Vec::new());
        }
        self.restart().await?;
        Ok(self.run_all().await)
    }

    /// Persist pending edits and stop every cell task.
    pub async fn shutdown(&self) {
        for cell in &self.inner.cells {
            if let Err(e) = cell.flush_source().await {
                debug!("[page] Cell {} did not flush: {}", cell.id(), e);
            }
        }
        self.inner.session.shutdown_token().cancel();
        info!("[page] Shut down");
    }
}
