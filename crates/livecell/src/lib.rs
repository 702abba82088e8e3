//! livecell - kernel-connected interactive code cells.
//!
//! A page of static code blocks becomes a set of cells, each an editor plus
//! an output area wired to a remote execution kernel. The crate covers the
//! hard parts of that:
//!
//! - Acquiring a kernel, either directly from a Jupyter server or from an
//!   ephemeral build, reusing a previously built server while it is alive
//! - One multiplexed kernel session carrying execute, complete and inspect
//!   requests, with replies matched by request id
//! - The per-cell state machine (queue while unbound, run, classify replies,
//!   highlight diagnostics and holes, persist source)
//! - Page bootstrap: layered options, prompt stripping, lazy connection and
//!   page-wide actions
//!
//! Rendering and editing are left to the host through the [`EditorSurface`],
//! [`OutputSink`] and [`PageSurface`] traits.

pub mod backend;
pub mod binding;
pub mod broker;
pub mod build;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod jupyter;
pub mod keymap;
pub mod output;
pub mod page;
pub mod prompts;
pub mod server;
pub mod session;
pub mod store;
pub mod surface;

pub use backend::{Backend, KernelModel};
pub use binding::KernelBinding;
pub use broker::SessionBroker;
pub use config::{merge_options, Options};
pub use controller::{CellController, CellHandle, CellParts, CellStatus};
pub use diagnostics::{Diagnostic, DiagnosticParser};
pub use error::{Error, Result};
pub use events::{EventBus, KernelStatus, PageEvent};
pub use jupyter::JupyterBackend;
pub use keymap::{CellAction, Key};
pub use output::{MemoryOutput, OutputItem, OutputSink};
pub use page::{CellMarkup, Page, PageBuilder, PageSession, PageSurface};
pub use server::ServerSettings;
pub use session::{ExecutionRequest, KernelSession, SideChannel};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use surface::{EditorSurface, MemoryEditor};
