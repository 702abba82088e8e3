use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::build::BuildStream;
use crate::config::KernelOptions;
use crate::error::Result;
use crate::server::ServerSettings;
use crate::session::KernelSession;

/// A running kernel as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub execution_state: Option<String>,
    #[serde(default)]
    pub last_activity: Option<String>,
    #[serde(default)]
    pub connections: Option<u64>,
}

/// Everything the broker needs from the outside world.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Start a kernel on `server` and open its channels.
    async fn start_session(&self, server: &ServerSettings, kernel: &KernelOptions) -> Result<KernelSession>;

    /// List running kernels; doubles as the liveness probe of a server.
    async fn list_running(&self, server: &ServerSettings) -> Result<Vec<KernelModel>>;

    /// Open the progress stream of an ephemeral build.
    async fn open_build_stream(&self, build_url: &str) -> Result<BuildStream>;
}
