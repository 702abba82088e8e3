//! Page-wide event bus.

use std::fmt;

use log::debug;
use serde::{Serialize, Serializer};
use tokio::sync::broadcast;

/// Kernel/connection status as shown by the page indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelStatus {
    Starting,
    Ready,
    Building,
    Reusing,
    /// The build service reported `ready`; a kernel has not been started yet.
    ServerReady,
    Failed,
    /// Any other build phase, lowercased (`fetching`, `pushing`, `launching`, ...).
    Phase(String),
}

impl KernelStatus {
    /// Map a build-stream phase onto a status.
    pub fn from_phase(phase: &str) -> Self {
        match phase.to_ascii_lowercase().as_str() {
            "ready" => KernelStatus::ServerReady,
            "failed" => KernelStatus::Failed,
            "building" => KernelStatus::Building,
            other => KernelStatus::Phase(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            KernelStatus::Starting => "starting",
            KernelStatus::Ready => "ready",
            KernelStatus::Building => "building",
            KernelStatus::Reusing => "reusing",
            KernelStatus::ServerReady => "server-ready",
            KernelStatus::Failed => "failed",
            KernelStatus::Phase(phase) => phase,
        }
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for KernelStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PageEvent {
    Status { status: KernelStatus, message: String },
    /// Ask the page to connect a kernel now (lazy connection).
    RequestKernel,
    /// A human-readable line for the kernel message log.
    KernelMessage { message: String },
}

/// Broadcast bus shared by the page, the broker and every cell.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PageEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PageEvent) {
        debug!("[page] event {:?}", event);
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn status(&self, status: KernelStatus, message: impl Into<String>) {
        self.emit(PageEvent::Status {
            status,
            message: message.into(),
        });
    }

    pub fn kernel_message(&self, message: impl Into<String>) {
        self.emit(PageEvent::KernelMessage {
            message: message.into(),
        });
    }

    pub fn request_kernel(&self) {
        self.emit(PageEvent::RequestKernel);
    }
}
