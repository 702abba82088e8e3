//! Jupyter server backend: REST for kernel lifecycle, one WebSocket per
//! kernel for the channels, and the build service's event stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use livecell_wire::WireMessage;
use log::{debug, info, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use crate::backend::{Backend, KernelModel};
use crate::build::{BuildStream, SseParser};
use crate::config::KernelOptions;
use crate::error::{Error, Result};
use crate::server::ServerSettings;
use crate::session::{KernelChannels, KernelControl, KernelSession, Outbound, DEFAULT_REQUEST_TIMEOUT};

const USER_AGENT: &str = concat!("livecell/", env!("CARGO_PKG_VERSION"));

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the liveness probe of a saved server.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct JupyterBackend {
    http: reqwest::Client,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl JupyterBackend {
    pub fn new() -> Result<Self> {
        // No overall timeout: build streams stay open for minutes
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

fn authorized(builder: reqwest::RequestBuilder, server: &ServerSettings) -> reqwest::RequestBuilder {
    match server.authorization() {
        Some(auth) => builder.header(AUTHORIZATION, auth),
        None => builder,
    }
}

#[async_trait]
impl Backend for JupyterBackend {
    async fn start_session(&self, server: &ServerSettings, kernel: &KernelOptions) -> Result<KernelSession> {
        let url = server.rest_url("api/kernels")?;
        let mut body = json!({ "path": kernel.path });
        if let Some(name) = &kernel.name {
            body["name"] = json!(name);
        }

        let model: KernelModel = authorized(self.http.post(url.clone()), server)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Connection(format!("starting kernel at {url}: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Connection(format!("unexpected kernel model from {url}: {e}")))?;
        info!("[broker] Started kernel {} ({})", model.id, model.name);

        let session_id = Uuid::new_v4().to_string();
        let ws_url = server.kernel_channels_url(&model.id, &session_id)?;
        let channels = connect_channels(&ws_url, server.authorization().as_deref()).await?;
        let control = JupyterKernelControl {
            http: self.http.clone(),
            server: server.clone(),
            kernel_id: model.id.clone(),
        };
        Ok(KernelSession::connect(
            model.id,
            session_id,
            channels,
            Arc::new(control),
            self.request_timeout,
        ))
    }

    async fn list_running(&self, server: &ServerSettings) -> Result<Vec<KernelModel>> {
        let url = server.rest_url("api/kernels")?;
        authorized(self.http.get(url.clone()), server)
            .timeout(self.probe_timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Connection(format!("listing kernels at {url}: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Connection(format!("unexpected kernel list from {url}: {e}")))
    }

    async fn open_build_stream(&self, build_url: &str) -> Result<BuildStream> {
        let response = self
            .http
            .get(build_url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Build(format!("requesting build {build_url}: {e}")))?;

        let (tx, stream) = BuildStream::channel(32);
        let build_url = build_url.to_string();
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut parser = SseParser::default();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    chunk = bytes.next() => match chunk {
                        Some(Ok(chunk)) => {
                            for event in parser.feed(&chunk) {
                                if !tx.send(Ok(event)).await {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx
                                .send(Err(Error::Build(format!("Lost connection to {build_url}: {e}"))))
                                .await;
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!("[broker] Build stream for {} closed", build_url);
        });
        Ok(stream)
    }
}

/// Restart and shutdown through the server's REST API.
struct JupyterKernelControl {
    http: reqwest::Client,
    server: ServerSettings,
    kernel_id: String,
}

#[async_trait]
impl KernelControl for JupyterKernelControl {
    async fn restart(&self) -> Result<()> {
        let url = self
            .server
            .rest_url(&format!("api/kernels/{}/restart", self.kernel_id))?;
        authorized(self.http.post(url), &self.server)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Transport(format!("restarting kernel {}: {e}", self.kernel_id)))?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let url = self.server.rest_url(&format!("api/kernels/{}", self.kernel_id))?;
        authorized(self.http.delete(url), &self.server)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Transport(format!("shutting down kernel {}: {e}", self.kernel_id)))?;
        Ok(())
    }
}

/// Open the kernel channel socket and bridge it onto [`KernelChannels`].
///
/// A writer task acknowledges each outbound message once it is on the wire;
/// a reader task decodes inbound frames. Either side failing ends the
/// connection, which closes `inbound`.
pub async fn connect_channels(url: &Url, authorization: Option<&str>) -> Result<KernelChannels> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Connection(format!("{url}: {e}")))?;
    if let Some(auth) = authorization {
        let value = HeaderValue::from_str(auth)
            .map_err(|e| Error::Config(format!("invalid token: {e}")))?;
        request.headers_mut().insert("Authorization", value);
    }

    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::Connection(format!("kernel socket {}: {e}", url.path())))?;
    let (mut sink, mut stream) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);
    let (inbound_tx, inbound_rx) = mpsc::channel::<WireMessage>(256);

    tokio::spawn(async move {
        while let Some(Outbound { message, delivered }) = outbound_rx.recv().await {
            let frame = match serde_json::to_string(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    let _ = delivered.send(Err(Error::Transport(e.to_string())));
                    continue;
                }
            };
            match sink.send(Message::Text(frame)).await {
                Ok(()) => {
                    let _ = delivered.send(Ok(()));
                }
                Err(e) => {
                    warn!("[session] Kernel socket write failed: {}", e);
                    let _ = delivered.send(Err(Error::Transport(e.to_string())));
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<WireMessage>(&text) {
                    Ok(message) => {
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("[session] Undecodable kernel frame: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("[session] Kernel socket read failed: {}", e);
                    break;
                }
            }
        }
        debug!("[session] Kernel socket reader finished");
    });

    Ok(KernelChannels {
        outbound: outbound_tx,
        inbound: inbound_rx,
    })
}
