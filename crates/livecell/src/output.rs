//! The output area of a cell, as seen by the controller.

use std::sync::{Arc, Mutex};

use livecell_wire::{Notification, StreamName};
use serde::Serialize;
use serde_json::{Map, Value};

/// One rendered output item. Rich bundles are passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputItem {
    Stream {
        name: StreamName,
        text: String,
    },
    DisplayData {
        data: Map<String, Value>,
    },
    ExecuteResult {
        execution_count: Option<u64>,
        data: Map<String, Value>,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// A backend-specific message type the sink may render or ignore.
    Info {
        msg_type: String,
        content: Value,
    },
}

impl OutputItem {
    pub fn stdout(text: impl Into<String>) -> Self {
        OutputItem::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        OutputItem::Stream {
            name: StreamName::Stderr,
            text: text.into(),
        }
    }

    pub fn html(html: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("text/html".into(), Value::String(html.into()));
        OutputItem::DisplayData { data }
    }

    /// The renderable part of a notification. Status, input echo and
    /// clear requests carry nothing to show.
    pub fn from_notification(notification: Notification) -> Option<Self> {
        match notification {
            Notification::Stream { name, text } => Some(OutputItem::Stream { name, text }),
            Notification::DisplayData { data, .. } => Some(OutputItem::DisplayData { data }),
            Notification::ExecuteResult {
                execution_count,
                data,
                ..
            } => Some(OutputItem::ExecuteResult {
                execution_count,
                data,
            }),
            Notification::Error {
                ename,
                evalue,
                traceback,
            } => Some(OutputItem::Error {
                ename,
                evalue,
                traceback,
            }),
            Notification::Other { msg_type, content } => {
                Some(OutputItem::Info { msg_type, content })
            }
            Notification::ClearOutput { .. }
            | Notification::Status { .. }
            | Notification::ExecuteInput { .. } => None,
        }
    }

    /// Plain-text rendering, for terminals and tests.
    pub fn text(&self) -> String {
        fn plain(data: &Map<String, Value>) -> String {
            data.get("text/plain")
                .or_else(|| data.get("text/html"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        }
        match self {
            OutputItem::Stream { text, .. } => text.clone(),
            OutputItem::DisplayData { data } => plain(data),
            OutputItem::ExecuteResult { data, .. } => plain(data),
            OutputItem::Error { ename, evalue, .. } => format!("{ename}: {evalue}"),
            OutputItem::Info { content, .. } => content
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

pub trait OutputSink: Send {
    fn clear(&mut self);
    fn append(&mut self, item: OutputItem);

    /// Replace everything with a single stdout line.
    fn set_text(&mut self, text: &str) {
        self.clear();
        self.append(OutputItem::stdout(text));
    }
}

/// Output sink recording into shared memory. Clones share the same items.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    items: Arc<Mutex<Vec<OutputItem>>>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<OutputItem> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// All items rendered as text and concatenated.
    pub fn text(&self) -> String {
        self.items().iter().map(OutputItem::text).collect()
    }
}

impl OutputSink for MemoryOutput {
    fn clear(&mut self) {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn append(&mut self, item: OutputItem) {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).push(item);
    }
}
