use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::session::KernelSession;

/// A once-settable slot for the page's kernel session.
///
/// Cells hold clones and wait on it; the page resolves it once a session is
/// connected. Resolving a second time is refused.
#[derive(Debug, Clone)]
pub struct KernelBinding {
    tx: Arc<watch::Sender<Option<KernelSession>>>,
}

impl Default for KernelBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBinding {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn resolve(&self, session: KernelSession) -> Result<()> {
        let mut session = Some(session);
        let resolved = self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = session.take();
            true
        });
        if resolved {
            Ok(())
        } else {
            Err(Error::AlreadyBound)
        }
    }

    pub fn get(&self) -> Option<KernelSession> {
        self.tx.borrow().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the binding is resolved.
    pub async fn wait(&self) -> KernelSession {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(session) = rx.borrow_and_update().clone() {
                return session;
            }
            // Unreachable while `self` owns the sender
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
